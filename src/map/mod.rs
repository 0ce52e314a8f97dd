// ── Robin-hood open addressing over u32 keys ────────────────────────
//
// Backs every name→value association in the system: the function
// table, the debug symbol table, and each scope level. Keys are raw
// crushed names; callers own hashing, so lookups never compare
// strings. Linear probing with per-entry distance-from-ideal; inserts
// displace richer entries, deletes backshift to keep probe chains
// dense.

const INITIAL_CAPACITY: usize = 8;
const GROW_LOAD_NUM: usize = 1; // grow above 1/2 load
const GROW_LOAD_DEN: usize = 2;
const SHRINK_LOAD_DEN: usize = 8; // shrink below 1/8 load

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("duplicate key {key:#010x}")]
    DuplicateKey { key: u32 },
}

#[derive(Debug, Clone)]
struct Slot<V> {
    key: u32,
    dist: u32,
    value: V,
}

#[derive(Debug, Clone)]
pub struct CrushMap<V> {
    slots: Vec<Option<Slot<V>>>,
    len: usize,
}

impl<V> Default for CrushMap<V> {
    fn default() -> Self {
        CrushMap::new()
    }
}

impl<V> CrushMap<V> {
    pub fn new() -> Self {
        CrushMap {
            slots: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn ideal(&self, key: u32) -> usize {
        // capacity is a power of two
        key as usize & (self.slots.len() - 1)
    }

    /// Insert a new key. Errors on duplicates; use `replace` to
    /// overwrite.
    pub fn add(&mut self, key: u32, value: V) -> Result<(), MapError> {
        if self.contains_key(key) {
            return Err(MapError::DuplicateKey { key });
        }
        self.grow_if_needed();
        self.insert_displacing(key, value);
        self.len += 1;
        Ok(())
    }

    /// Insert or overwrite. Returns the previous value if present.
    pub fn replace(&mut self, key: u32, value: V) -> Option<V> {
        if let Some(idx) = self.find(key) {
            let slot = self.slots[idx].as_mut().unwrap();
            return Some(std::mem::replace(&mut slot.value, value));
        }
        self.grow_if_needed();
        self.insert_displacing(key, value);
        self.len += 1;
        None
    }

    pub fn try_get(&self, key: u32) -> Option<&V> {
        self.find(key).map(|idx| &self.slots[idx].as_ref().unwrap().value)
    }

    pub fn try_get_mut(&mut self, key: u32) -> Option<&mut V> {
        let idx = self.find(key)?;
        Some(&mut self.slots[idx].as_mut().unwrap().value)
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.find(key).is_some()
    }

    pub fn remove(&mut self, key: u32) -> Option<V> {
        let idx = self.find(key)?;
        let slot = self.slots[idx].take().unwrap();
        self.len -= 1;
        self.backshift(idx);
        self.shrink_if_needed();
        Some(slot.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().flatten().map(|s| s.key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.iter().flatten().map(|s| &s.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.slots.iter().flatten().map(|s| (s.key, &s.value))
    }

    fn find(&self, key: u32) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut idx = self.ideal(key);
        let mut dist = 0u32;
        loop {
            match &self.slots[idx] {
                None => return None,
                Some(slot) => {
                    if slot.key == key {
                        return Some(idx);
                    }
                    // a resident entry closer to home than our probe
                    // distance proves the key is absent
                    if slot.dist < dist {
                        return None;
                    }
                }
            }
            idx = (idx + 1) & mask;
            dist += 1;
        }
    }

    fn insert_displacing(&mut self, key: u32, value: V) {
        let mask = self.slots.len() - 1;
        let mut idx = self.ideal(key);
        let mut carrying = Slot { key, dist: 0, value };
        loop {
            match &mut self.slots[idx] {
                empty @ None => {
                    *empty = Some(carrying);
                    return;
                }
                Some(resident) => {
                    if resident.dist < carrying.dist {
                        std::mem::swap(resident, &mut carrying);
                    }
                }
            }
            idx = (idx + 1) & mask;
            carrying.dist += 1;
        }
    }

    /// After removing at `hole`, walk forward shifting every displaced
    /// entry one slot closer to home until a hole or an at-home entry.
    fn backshift(&mut self, hole: usize) {
        let mask = self.slots.len() - 1;
        let mut hole = hole;
        loop {
            let next = (hole + 1) & mask;
            match &mut self.slots[next] {
                None => return,
                Some(slot) if slot.dist == 0 => return,
                Some(slot) => {
                    slot.dist -= 1;
                    self.slots[hole] = self.slots[next].take();
                    hole = next;
                }
            }
        }
    }

    fn grow_if_needed(&mut self) {
        if (self.len + 1) * GROW_LOAD_DEN > self.slots.len() * GROW_LOAD_NUM {
            let new_cap = (self.slots.len() * 2).max(INITIAL_CAPACITY);
            self.rehash(new_cap);
        }
    }

    fn shrink_if_needed(&mut self) {
        let cap = self.slots.len();
        if cap > INITIAL_CAPACITY && self.len * SHRINK_LOAD_DEN < cap {
            self.rehash(cap / 2);
        }
    }

    fn rehash(&mut self, new_cap: usize) {
        let old: Vec<Option<Slot<V>>> =
            std::mem::replace(&mut self.slots, (0..new_cap).map(|_| None).collect());
        for slot in old.into_iter().flatten() {
            self.insert_displacing(slot.key, slot.value);
        }
    }
}
