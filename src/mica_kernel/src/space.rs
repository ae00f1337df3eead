//! Per-task capability name spaces.
//!
//! A [`Space`] maps names to entries through a hybrid dictionary: a
//! growable slot array indexed directly by the name's index bits, plus an
//! overflow ordered tree for names whose index falls outside the current
//! table bound. Every live name is in exactly one of the two. A table slot
//! whose index is shared with tree-resident entries carries a collision
//! marker so lookups know to fall through.
//!
//! Freed slots go on an explicit LIFO free list held outside the array, so
//! a recently freed slot is reused (with a bumped generation) before older
//! ones, which maximizes the window before a generation counter wraps and
//! a stale name could go undetected.
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use crate::entry::{
    next_generation, Entry, Generation, Name, NotifyRequest, Object, Right, MAX_INDEX,
};
use crate::error::{AllocateError, AllocateNameError, DeallocateError};
use crate::klock::{Rank, RankedMutex};
use crate::message::{Disposition, Message, MsgBits, MsgHeader};
use crate::port::{Port, PortSet};

/// Fixed growth steps for the slot table. Beyond the last step the table
/// doubles until the index bits run out.
const TABLE_SIZES: &[usize] = &[16, 64, 256, 1024, 4096, 16384];

/// Table size the next growth would reach, or `None` at the maximum.
fn next_table_size(len: usize) -> Option<usize> {
    let max = MAX_INDEX as usize + 1;
    if len >= max {
        return None;
    }
    for &step in TABLE_SIZES {
        if step > len {
            return Some(step);
        }
    }
    Some((len * 2).min(max))
}

// Per-entry byte costs used by the grow-vs-tree decision. The tree cost is
// the map's key/value pair plus amortized node overhead.
const SLOT_COST: usize = mem::size_of::<Slot>();
const NODE_COST: usize =
    mem::size_of::<((u32, Generation), Entry)>() + 2 * mem::size_of::<usize>();

enum Slot {
    /// On the free list. Remembers the last generation so reuse bumps it.
    Free {
        generation: Generation,
        next_free: Option<u32>,
    },
    Used {
        generation: Generation,
        entry: Entry,
    },
}

struct SpaceInner {
    table: Vec<Slot>,
    free_head: Option<u32>,
    /// Overflow entries, keyed by (index, generation) so exact-name lookup
    /// and in-order range migration are both single map operations.
    tree: BTreeMap<(u32, Generation), Entry>,
    /// Tree entries whose index would fit after the next growth step.
    tree_small: usize,
    /// Object identity → send-right name, for collapsing duplicate send
    /// rights.
    reverse: HashMap<usize, Name>,
    alive: bool,
}

/// A per-task capability name space.
pub struct Space {
    inner: RankedMutex<SpaceInner>,
    /// Single-flight growth gate: `true` while one thread grows the table;
    /// competitors sleep on the condvar and then retry their allocation.
    growing: Mutex<bool>,
    grown: Condvar,
}

impl Space {
    pub fn new() -> Self {
        Self::with_table_size(TABLE_SIZES[0])
    }

    /// Create a space with an explicit initial table size.
    pub fn with_table_size(len: usize) -> Self {
        assert!(len >= 2 && len <= MAX_INDEX as usize + 1);
        let table = (0..len)
            .map(|i| Slot::Free {
                generation: 0,
                next_free: if i + 1 < len { Some(i as u32 + 1) } else { None },
            })
            .collect();
        Self {
            inner: RankedMutex::new(
                Rank::Space,
                SpaceInner {
                    table,
                    free_head: Some(0),
                    tree: BTreeMap::new(),
                    tree_small: 0,
                    reverse: HashMap::new(),
                    alive: true,
                },
            ),
            growing: Mutex::new(false),
            grown: Condvar::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    /// Current slot-table size.
    pub fn table_len(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Number of overflow-tree entries.
    pub fn tree_total(&self) -> usize {
        self.inner.lock().tree.len()
    }

    /// Total number of live entries, table and tree combined.
    pub fn live_entries(&self) -> usize {
        let inner = self.inner.lock();
        let used = inner
            .table
            .iter()
            .filter(|s| matches!(s, Slot::Used { .. }))
            .count();
        used + inner.tree.len()
    }

    /// Resolve a name to a copy of its entry. Fails (returns `None`) on a
    /// stale generation, a free slot, or an unknown tree name. Never
    /// allocates and never blocks.
    pub fn lookup(&self, name: Name) -> Option<Entry> {
        let inner = self.inner.lock();
        let index = name.index();
        let generation = name.generation();
        if (index as usize) < inner.table.len() {
            match &inner.table[index as usize] {
                Slot::Used {
                    generation: slot_generation,
                    entry,
                } if *slot_generation == generation => Some(entry.clone()),
                Slot::Used { entry, .. } if entry.collision => {
                    inner.tree.get(&(index, generation)).cloned()
                }
                _ => None,
            }
        } else {
            inner.tree.get(&(index, generation)).cloned()
        }
    }

    /// Allocate a fresh name for `entry`, growing the table when the free
    /// list is empty.
    pub fn allocate(&self, entry: Entry) -> Result<Name, AllocateError> {
        loop {
            match self.try_allocate(&entry) {
                Ok(name) => {
                    log::trace!("allocated {:?}", name);
                    return Ok(name);
                }
                Err(AllocateError::Exhausted) => self.grow_table()?,
                Err(e) => return Err(e),
            }
        }
    }

    /// One allocation attempt: pop the free-list head, bump the slot's
    /// generation, and claim it.
    fn try_allocate(&self, entry: &Entry) -> Result<Name, AllocateError> {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return Err(AllocateError::SpaceDead);
        }
        let index = inner.free_head.ok_or(AllocateError::Exhausted)?;
        let (generation, next_free) = match &inner.table[index as usize] {
            Slot::Free {
                generation,
                next_free,
            } => (next_generation(*generation), *next_free),
            Slot::Used { .. } => panic!("free list points into a used slot"),
        };
        let mut fresh = entry.clone();
        // A reused slot must not inherit a stale notification registration.
        fresh.request = None;
        fresh.collision = false;
        inner.table[index as usize] = Slot::Used {
            generation,
            entry: fresh,
        };
        inner.free_head = next_free;
        Ok(Name::from_parts(index, generation))
    }

    /// Claim a caller-chosen name for `entry`.
    ///
    /// Idempotent: if a live entry already exists under exactly `name`, the
    /// call succeeds without replacing it. An out-of-bound index goes to
    /// the overflow tree unless growing the table to cover it would cost no
    /// more memory than the tree nodes it absorbs.
    pub fn allocate_name(&self, name: Name, entry: Entry) -> Result<(), AllocateNameError> {
        debug_assert!(name != Name::NULL && name != Name::DEAD);
        debug_assert_ne!(name.generation(), 0);
        loop {
            if self.try_allocate_name(name, &entry)? {
                return Ok(());
            }
            // Growing was judged cheaper than another tree node.
            match self.grow_table() {
                Ok(()) => {}
                Err(AllocateError::SpaceDead) => return Err(AllocateNameError::SpaceDead),
                // At the maximum size the tree is the only option left;
                // the retry will take the tree path.
                Err(_) => {}
            }
        }
    }

    /// One attempt at `allocate_name`. `Ok(false)` requests a table growth
    /// followed by a retry.
    fn try_allocate_name(
        &self,
        name: Name,
        entry: &Entry,
    ) -> Result<bool, AllocateNameError> {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return Err(AllocateNameError::SpaceDead);
        }
        let index = name.index();
        let generation = name.generation();
        let len = inner.table.len();
        let target = next_table_size(len);

        let mut planted = entry.clone();
        planted.collision = false;

        if (index as usize) < len {
            let inner = &mut *inner;
            // Classify the slot first; acting on it needs the other fields.
            enum SlotKind {
                Exact,
                Occupied,
                Free,
            }
            let kind = match &inner.table[index as usize] {
                Slot::Used {
                    generation: slot_generation,
                    ..
                } if *slot_generation == generation => SlotKind::Exact,
                Slot::Used { .. } => SlotKind::Occupied,
                Slot::Free { .. } => SlotKind::Free,
            };
            match kind {
                SlotKind::Exact => {}
                SlotKind::Occupied => {
                    // Same index, different generation: the new entry lives
                    // in the tree and the slot is marked.
                    if !inner.tree.contains_key(&(index, generation)) {
                        inner.tree.insert((index, generation), planted);
                        if let Slot::Used { entry: occupant, .. } =
                            &mut inner.table[index as usize]
                        {
                            occupant.collision = true;
                        }
                        if fits(index, target) {
                            inner.tree_small += 1;
                        }
                    }
                }
                SlotKind::Free => {
                    unfree_slot(inner, index);
                    inner.table[index as usize] = Slot::Used {
                        generation,
                        entry: planted,
                    };
                }
            }
            Ok(true)
        } else if inner.tree.contains_key(&(index, generation)) {
            Ok(true)
        } else {
            // Grow-vs-tree memory comparison: prefer the table only when
            // the added slots cost no more than the nodes they'd absorb.
            if let Some(target) = target {
                let added = (target - len) * SLOT_COST;
                let absorbed = (inner.tree_small + 1) * NODE_COST;
                if (index as usize) < target && added <= absorbed {
                    return Ok(false);
                }
            }
            inner.tree.insert((index, generation), planted);
            if fits(index, target) {
                inner.tree_small += 1;
            }
            Ok(true)
        }
    }

    /// Return `name`'s entry to the free state.
    ///
    /// The entry must already be stripped of its object reference and
    /// pending notification; violating that is a structural fault, not a
    /// client error, and aborts.
    pub fn deallocate(&self, name: Name) -> Result<(), DeallocateError> {
        let mut inner = self.inner.lock();
        deallocate_in(&mut inner, name)
    }

    /// Take the object reference and pending notification out of a live
    /// entry, returning what was held. The entry itself stays allocated.
    pub fn clear_entry(&self, name: Name) -> Result<Entry, DeallocateError> {
        let mut inner = self.inner.lock();
        clear_in(&mut inner, name)
    }

    /// Strip and deallocate `name` in one step, returning the stripped
    /// parts so the caller can release the references outside the space
    /// lock.
    pub fn destroy_entry(&self, name: Name) -> Result<Entry, DeallocateError> {
        let mut inner = self.inner.lock();
        let stripped = clear_in(&mut inner, name)?;
        deallocate_in(&mut inner, name)?;
        log::trace!("destroyed {:?}", name);
        Ok(stripped)
    }

    /// Create a fresh port and allocate its receive right in this space.
    pub fn allocate_receive(&self, qlimit: usize) -> Result<(Name, Arc<Port>), AllocateError> {
        let port = Port::new(qlimit);
        let name = self.allocate(Entry::receive(Arc::clone(&port)))?;
        Ok((name, port))
    }

    /// Create a fresh port set and allocate its port-set right in this
    /// space.
    pub fn allocate_port_set(&self) -> Result<(Name, Arc<PortSet>), AllocateError> {
        let set = PortSet::new();
        let name = self.allocate(Entry::port_set(Arc::clone(&set)))?;
        Ok((name, set))
    }

    /// Get a send-right name for `port`, collapsing onto an existing one
    /// when this space already holds a send right for it.
    pub fn make_send_right(&self, port: &Arc<Port>) -> Result<Name, AllocateError> {
        let id = Arc::as_ptr(port) as usize;
        {
            let inner = self.inner.lock();
            if !inner.alive {
                return Err(AllocateError::SpaceDead);
            }
            if let Some(&name) = inner.reverse.get(&id) {
                return Ok(name);
            }
        }
        let name = self.allocate(Entry::send(Arc::clone(port)))?;
        let mut inner = self.inner.lock();
        if !inner.alive {
            drop(inner);
            let _ = self.destroy_entry(name);
            return Err(AllocateError::SpaceDead);
        }
        if let Some(&existing) = inner.reverse.get(&id) {
            // Lost the race to a concurrent caller; fold onto its name.
            drop(inner);
            let _ = self.destroy_entry(name);
            return Ok(existing);
        }
        inner.reverse.insert(id, name);
        Ok(name)
    }

    /// Turn the named right into a dead name, dropping the object
    /// reference and firing the entry's dead-name notification if one was
    /// registered. Called when the entry's port is destroyed.
    pub fn make_dead(&self, name: Name) -> Result<(), DeallocateError> {
        let mut inner = self.inner.lock();
        let entry = entry_mut(&mut inner, name).ok_or(DeallocateError::InvalidName)?;
        entry.right = Right::DeadName;
        let object = entry.object.take();
        let request = entry.request.take();
        if let Some(object) = &object {
            inner.reverse.remove(&object.id());
        }
        drop(inner);
        drop(object);
        if let Some(request) = request {
            notify_dead_name(request, name);
        }
        Ok(())
    }

    /// Register a dead-name notification port on the named entry.
    pub fn request_notify(
        &self,
        name: Name,
        notify: Arc<Port>,
    ) -> Result<(), DeallocateError> {
        let mut inner = self.inner.lock();
        let entry = entry_mut(&mut inner, name).ok_or(DeallocateError::InvalidName)?;
        entry.request = Some(NotifyRequest { notify });
        Ok(())
    }

    /// Grow the slot table by one step, migrating newly covered tree
    /// entries into it.
    ///
    /// Single-flight: one thread grows, competitors sleep until it
    /// finishes and then retry their allocation. If the space dies in the
    /// middle, growth unwinds and reports success; the caller's retry
    /// observes the death.
    pub fn grow_table(&self) -> Result<(), AllocateError> {
        let mut growing = self.growing.lock().unwrap();
        if *growing {
            while *growing {
                growing = self.grown.wait(growing).unwrap();
            }
            // The grower did the work on our behalf.
            return Ok(());
        }
        *growing = true;
        drop(growing);

        let result = self.grow_once();

        let mut growing = self.growing.lock().unwrap();
        *growing = false;
        self.grown.notify_all();
        result
    }

    fn grow_once(&self) -> Result<(), AllocateError> {
        let old_len = {
            let inner = self.inner.lock();
            if !inner.alive {
                return Ok(());
            }
            inner.table.len()
        };
        let new_len = next_table_size(old_len).ok_or(AllocateError::Exhausted)?;

        // Reserve the larger backing with the space unlocked; the critical
        // section below only moves slots into it.
        let fresh: Vec<Slot> = Vec::with_capacity(new_len);

        let mut inner = self.inner.lock();
        if !inner.alive || inner.table.len() != old_len {
            return Ok(());
        }
        let old = mem::replace(&mut inner.table, fresh);
        inner.table.extend(old);
        for _ in old_len..new_len {
            inner.table.push(Slot::Free {
                generation: 0,
                next_free: None,
            });
        }

        let inner = &mut *inner;
        // Migrate tree entries the table now covers, resolving collisions
        // the same way insertion does. Ascending key order means the
        // lowest generation at each index claims the slot.
        let keys: Vec<(u32, Generation)> = inner
            .tree
            .range((old_len as u32, 0)..(new_len as u32, 0))
            .map(|(k, _)| *k)
            .collect();
        let mut migrated = 0usize;
        for key in keys {
            let (index, generation) = key;
            match &mut inner.table[index as usize] {
                slot @ Slot::Free { .. } => {
                    let mut entry = match inner.tree.remove(&key) {
                        Some(entry) => entry,
                        None => unreachable!(),
                    };
                    entry.collision = false;
                    *slot = Slot::Used { generation, entry };
                    migrated += 1;
                }
                Slot::Used { entry, .. } => {
                    entry.collision = true;
                }
            }
        }

        // Link the slots that stayed free into the free list, lowest index
        // at the head.
        for index in (old_len..new_len).rev() {
            if let Slot::Free { next_free, .. } = &mut inner.table[index] {
                *next_free = inner.free_head;
                inner.free_head = Some(index as u32);
            }
        }

        let target = next_table_size(new_len);
        inner.tree_small = match target {
            Some(target) => inner.tree.range((0, 0)..(target as u32, 0)).count(),
            None => 0,
        };
        log::debug!(
            "table grown {} -> {} slots, {} tree entries migrated",
            old_len,
            new_len,
            migrated,
        );
        Ok(())
    }

    /// Terminate the space. All entries are drained and returned so the
    /// caller can release their object references outside the lock;
    /// subsequent operations fail with a dead-space code.
    pub fn terminate(&self) -> Vec<Entry> {
        let mut inner = self.inner.lock();
        if !inner.alive {
            return Vec::new();
        }
        inner.alive = false;
        inner.free_head = None;
        inner.tree_small = 0;
        inner.reverse.clear();
        let mut entries: Vec<Entry> = mem::take(&mut inner.table)
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Used { entry, .. } => Some(entry),
                Slot::Free { .. } => None,
            })
            .collect();
        entries.extend(mem::take(&mut inner.tree).into_values());
        log::debug!("space terminated, {} entries drained", entries.len());
        entries
    }

    /// Destroy every port and port set this space holds a receive or
    /// port-set right for, then terminate it. Task-teardown hook.
    pub fn terminate_and_destroy(&self) {
        let entries = self.terminate();
        for entry in entries {
            match (entry.right, entry.object) {
                (Right::Receive, Some(Object::Port(port))) => port.destroy(),
                (Right::PortSet, Some(Object::Set(set))) => set.destroy(),
                _ => {}
            }
        }
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

fn fits(index: u32, target: Option<usize>) -> bool {
    target.map_or(false, |t| (index as usize) < t)
}

/// Deliver a dead-name notification carrying the dead name as its id. The
/// notification is exempt from the notify port's queue limit; a dead
/// notify port drops it.
fn notify_dead_name(request: NotifyRequest, name: Name) {
    log::trace!("dead-name notification for {:?}", name);
    let note = Message::new(
        request.notify,
        Disposition::SendOnce,
        MsgHeader {
            bits: MsgBits::empty(),
            id: name.as_raw(),
        },
        Vec::new(),
    );
    let port = Arc::clone(note.dest());
    if let Err((note, _)) = port.try_deliver(note, true) {
        note.destroy();
    }
}

/// Locate a live entry for in-place mutation.
fn entry_mut(inner: &mut SpaceInner, name: Name) -> Option<&mut Entry> {
    let index = name.index();
    let generation = name.generation();
    // Classify first, then take the one mutable borrow the location needs.
    enum Location {
        Table,
        Tree,
        Nowhere,
    }
    let location = if (index as usize) < inner.table.len() {
        match &inner.table[index as usize] {
            Slot::Used {
                generation: slot_generation,
                ..
            } if *slot_generation == generation => Location::Table,
            Slot::Used { entry, .. } if entry.collision => Location::Tree,
            _ => Location::Nowhere,
        }
    } else {
        Location::Tree
    };
    match location {
        Location::Table => match &mut inner.table[index as usize] {
            Slot::Used { entry, .. } => Some(entry),
            Slot::Free { .. } => unreachable!(),
        },
        Location::Tree => inner.tree.get_mut(&(index, generation)),
        Location::Nowhere => None,
    }
}

/// Splice an in-table free slot out of the free list ahead of claiming it.
fn unfree_slot(inner: &mut SpaceInner, index: u32) {
    fn next_of(table: &[Slot], index: u32) -> Option<u32> {
        match &table[index as usize] {
            Slot::Free { next_free, .. } => *next_free,
            Slot::Used { .. } => panic!("free list points into a used slot"),
        }
    }
    if inner.free_head == Some(index) {
        inner.free_head = next_of(&inner.table, index);
        return;
    }
    let mut cursor = inner.free_head;
    while let Some(current) = cursor {
        let next = next_of(&inner.table, current);
        if next == Some(index) {
            let skipped = next_of(&inner.table, index);
            match &mut inner.table[current as usize] {
                Slot::Free { next_free, .. } => *next_free = skipped,
                Slot::Used { .. } => unreachable!(),
            }
            return;
        }
        cursor = next;
    }
    panic!("free slot is not on the free list");
}

fn clear_in(inner: &mut SpaceInner, name: Name) -> Result<Entry, DeallocateError> {
    let entry = entry_mut(inner, name).ok_or(DeallocateError::InvalidName)?;
    let stripped = Entry {
        right: entry.right,
        object: entry.object.take(),
        request: entry.request.take(),
        collision: false,
    };
    if let Some(object) = &stripped.object {
        if inner.reverse.get(&object.id()) == Some(&name) {
            inner.reverse.remove(&object.id());
        }
    }
    Ok(stripped)
}

fn deallocate_in(inner: &mut SpaceInner, name: Name) -> Result<(), DeallocateError> {
    let index = name.index();
    let generation = name.generation();
    let len = inner.table.len();
    let target = next_table_size(len);

    if (index as usize) < len {
        // Classify the slot first; acting on it needs the other fields.
        enum SlotKind {
            Exact { collision: bool },
            Collided,
            Other,
        }
        let kind = match &inner.table[index as usize] {
            Slot::Used {
                generation: slot_generation,
                entry,
            } if *slot_generation == generation => {
                assert!(
                    entry.is_stripped(),
                    "deallocating an entry that still holds references"
                );
                SlotKind::Exact {
                    collision: entry.collision,
                }
            }
            Slot::Used { entry, .. } if entry.collision => SlotKind::Collided,
            _ => SlotKind::Other,
        };
        match kind {
            SlotKind::Exact { collision: true } => {
                // The vacated slot absorbs one same-index tree entry,
                // keeping the collision marker honest.
                let key = inner
                    .tree
                    .range((index, 0)..=(index, Generation::MAX))
                    .map(|(k, _)| *k)
                    .next();
                let key = match key {
                    Some(key) => key,
                    None => panic!("collision marker with no tree entry"),
                };
                let mut migrant = match inner.tree.remove(&key) {
                    Some(entry) => entry,
                    None => unreachable!(),
                };
                if fits(index, target) {
                    inner.tree_small -= 1;
                }
                migrant.collision = inner
                    .tree
                    .range((index, 0)..=(index, Generation::MAX))
                    .next()
                    .is_some();
                inner.table[index as usize] = Slot::Used {
                    generation: key.1,
                    entry: migrant,
                };
                Ok(())
            }
            SlotKind::Exact { collision: false } => {
                inner.table[index as usize] = Slot::Free {
                    generation,
                    next_free: inner.free_head,
                };
                inner.free_head = Some(index);
                Ok(())
            }
            SlotKind::Collided => {
                // Tree-resident under a collided index.
                match inner.tree.remove(&(index, generation)) {
                    Some(removed) => {
                        assert!(
                            removed.is_stripped(),
                            "deallocating an entry that still holds references"
                        );
                        if fits(index, target) {
                            inner.tree_small -= 1;
                        }
                        let remaining = inner
                            .tree
                            .range((index, 0)..=(index, Generation::MAX))
                            .next()
                            .is_some();
                        if let Slot::Used { entry, .. } =
                            &mut inner.table[index as usize]
                        {
                            entry.collision = remaining;
                        }
                        Ok(())
                    }
                    None => Err(DeallocateError::InvalidName),
                }
            }
            SlotKind::Other => Err(DeallocateError::InvalidName),
        }
    } else {
        match inner.tree.remove(&(index, generation)) {
            Some(removed) => {
                assert!(
                    removed.is_stripped(),
                    "deallocating an entry that still holds references"
                );
                if fits(index, target) {
                    inner.tree_small -= 1;
                }
                Ok(())
            }
            None => Err(DeallocateError::InvalidName),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn lookup_round_trip() {
        let space = Space::new();
        let name = space.allocate(Entry::dead()).unwrap();
        let entry = space.lookup(name).unwrap();
        assert!(matches!(entry.right, Right::DeadName));
    }

    #[test]
    fn stale_generation_misses() {
        let space = Space::new();
        let name = space.allocate(Entry::dead()).unwrap();
        space.deallocate(name).unwrap();
        assert!(space.lookup(name).is_none());
        let reused = space.allocate(Entry::dead()).unwrap();
        // LIFO free list: same slot, bumped generation.
        assert_eq!(reused.index(), name.index());
        assert_eq!(reused.generation(), next_generation(name.generation()));
        assert!(space.lookup(name).is_none());
        assert!(space.lookup(reused).is_some());
    }

    #[test]
    fn table_fills_then_grows() {
        let space = Space::with_table_size(4);
        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(space.allocate(Entry::dead()).unwrap());
        }
        assert_eq!(space.table_len(), 4);
        // The fifth allocation forces a growth step.
        names.push(space.allocate(Entry::dead()).unwrap());
        assert!(space.table_len() > 4);
        for name in &names {
            assert!(space.lookup(*name).is_some());
        }
        // Freeing and reallocating reuses the slot with a new generation.
        let b = names[1];
        space.deallocate(b).unwrap();
        let f = space.allocate(Entry::dead()).unwrap();
        assert_eq!(f.index(), b.index());
        assert_eq!(f.generation(), next_generation(b.generation()));
        assert!(space.lookup(b).is_none());
    }

    #[test]
    fn allocate_name_is_idempotent() {
        let space = Space::new();
        let name = Name::from_parts(3, 9);
        space.allocate_name(name, Entry::dead()).unwrap();
        let count = space.live_entries();
        space.allocate_name(name, Entry::dead()).unwrap();
        assert_eq!(space.live_entries(), count);
        assert!(space.lookup(name).is_some());
    }

    #[test]
    fn out_of_bound_name_goes_to_tree() {
        let space = Space::with_table_size(4);
        let name = Name::from_parts(10_000, 2);
        space.allocate_name(name, Entry::dead()).unwrap();
        assert_eq!(space.tree_total(), 1);
        assert!(space.lookup(name).is_some());
    }

    #[test]
    fn growth_migrates_tree_entries() {
        let space = Space::with_table_size(4);
        let tree_name = Name::from_parts(6, 2);
        space.allocate_name(tree_name, Entry::dead()).unwrap();
        assert_eq!(space.tree_total(), 1);
        space.grow_table().unwrap();
        assert!(space.table_len() > 6);
        assert_eq!(space.tree_total(), 0);
        assert!(space.lookup(tree_name).is_some());
        space.deallocate(tree_name).unwrap();
        assert!(space.lookup(tree_name).is_none());
    }

    #[test]
    fn collision_slot_falls_through_to_tree() {
        let space = Space::with_table_size(4);
        let a = space.allocate(Entry::dead()).unwrap();
        // Same index, different generation: lands in the tree and marks
        // the slot.
        let shadow = Name::from_parts(a.index(), next_generation(a.generation()));
        space.allocate_name(shadow, Entry::dead()).unwrap();
        assert_eq!(space.tree_total(), 1);
        assert!(space.lookup(a).is_some());
        assert!(space.lookup(shadow).is_some());
        // Freeing the slot migrates the tree entry into it.
        space.deallocate(a).unwrap();
        assert_eq!(space.tree_total(), 0);
        assert!(space.lookup(shadow).is_some());
        assert!(space.lookup(a).is_none());
    }

    #[test]
    fn dead_space_refuses_allocation() {
        let space = Space::new();
        let name = space.allocate(Entry::dead()).unwrap();
        let drained = space.terminate();
        assert_eq!(drained.len(), 1);
        assert!(space.lookup(name).is_none());
        assert!(matches!(
            space.allocate(Entry::dead()),
            Err(AllocateError::SpaceDead)
        ));
        assert!(matches!(
            space.allocate_name(Name::from_parts(1, 1), Entry::dead()),
            Err(AllocateNameError::SpaceDead)
        ));
    }

    #[test]
    fn make_dead_reaches_a_tree_resident_entry() {
        let space = Space::with_table_size(4);
        let port = Port::new(4);
        let a = space.allocate(Entry::dead()).unwrap();
        // Same index, different generation: the entry lives in the tree.
        let shadow = Name::from_parts(a.index(), next_generation(a.generation()));
        space.allocate_name(shadow, Entry::send(port)).unwrap();
        space.make_dead(shadow).unwrap();
        let entry = space.lookup(shadow).unwrap();
        assert!(matches!(entry.right, Right::DeadName));
        assert!(entry.object.is_none());
        // The table-resident entry is untouched.
        assert!(space.lookup(a).is_some());
    }

    #[test]
    fn concurrent_make_send_right_collapses_to_one_name() {
        let space = Arc::new(Space::new());
        let port = Port::new(4);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let space = Arc::clone(&space);
                let port = Arc::clone(&port);
                std::thread::spawn(move || space.make_send_right(&port).unwrap())
            })
            .collect();
        let names: Vec<Name> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Losers of the insert race fold onto the winner's name and give
        // their fresh entry back.
        assert!(names.iter().all(|n| *n == names[0]));
        assert_eq!(space.live_entries(), 1);
    }

    #[test]
    fn make_dead_fires_the_registered_notification() {
        let space = Space::new();
        let port = Port::new(4);
        let notify = Port::new(4);
        let name = space.allocate(Entry::send(Arc::clone(&port))).unwrap();
        space.request_notify(name, Arc::clone(&notify)).unwrap();
        space.make_dead(name).unwrap();
        let entry = space.lookup(name).unwrap();
        assert!(matches!(entry.right, Right::DeadName));
        assert!(entry.object.is_none());
        assert_eq!(notify.in_flight(), 1);
    }

    #[test]
    fn allocate_receive_creates_a_live_port() {
        let space = Space::new();
        let (name, port) = space.allocate_receive(4).unwrap();
        assert!(port.is_alive());
        assert!(matches!(space.lookup(name).unwrap().right, Right::Receive));
        space.terminate_and_destroy();
        assert!(!port.is_alive());
    }

    #[test]
    fn make_send_right_collapses_duplicates() {
        let space = Space::new();
        let port = Port::new(4);
        let a = space.make_send_right(&port).unwrap();
        let b = space.make_send_right(&port).unwrap();
        assert_eq!(a, b);
        assert_eq!(space.live_entries(), 1);
    }

    #[test]
    #[should_panic(expected = "still holds references")]
    fn deallocating_an_unstripped_entry_aborts() {
        let space = Space::new();
        let port = Port::new(4);
        let name = space.allocate(Entry::send(port)).unwrap();
        let _ = space.deallocate(name);
    }

    #[quickcheck]
    fn names_never_collide(script: Vec<bool>) -> bool {
        let space = Space::with_table_size(4);
        let mut live: Vec<Name> = Vec::new();
        let mut retired: Vec<Name> = Vec::new();
        for grow in script {
            if grow || live.is_empty() {
                let name = match space.allocate(Entry::dead()) {
                    Ok(name) => name,
                    Err(_) => return false,
                };
                if live.contains(&name) || retired.contains(&name) {
                    return false;
                }
                live.push(name);
            } else {
                let name = live.remove(live.len() / 2);
                if space.deallocate(name).is_err() {
                    return false;
                }
                retired.push(name);
            }
        }
        live.iter().all(|n| space.lookup(*n).is_some())
            && retired.iter().all(|n| space.lookup(*n).is_none())
    }

    #[quickcheck]
    fn growth_preserves_resolution(indices: Vec<u16>) -> bool {
        let space = Space::with_table_size(4);
        let mut names = std::collections::BTreeSet::new();
        for index in indices {
            // All at the same generation with distinct indices, so no
            // collisions: every covered tree entry must migrate on growth.
            let name = Name::from_parts(index as u32 + 4, 3);
            if space.allocate_name(name, Entry::dead()).is_err() {
                return false;
            }
            names.insert(name);
        }
        let len_before = space.table_len();
        let tree_before = space.tree_total();
        if space.grow_table().is_err() {
            return false;
        }
        let len_after = space.table_len();
        let migrated = names
            .iter()
            .filter(|n| {
                (n.index() as usize) >= len_before && (n.index() as usize) < len_after
            })
            .count();
        space.tree_total() == tree_before - migrated
            && names.iter().all(|n| space.lookup(*n).is_some())
    }
}
