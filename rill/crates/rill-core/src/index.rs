//! The Index: a shared key→locator map.
//!
//! Records do not own their key layout; they share an `Index` that
//! maps arbitrary value keys to **locators** — dense non-negative
//! integers used as offsets into each record's value array.  Records
//! created from the same constructor share one index, so their
//! fields occupy the same slots and the per-record cost of a field
//! is one array cell.
//!
//! Lookup is open addressing with linear probing, bounded by a
//! `step_limit`: the largest distance a key may sit from its ideal
//! slot, and therefore the largest number of extra slots a probe
//! will check.  Insertion may raise the limit up to a
//! capacity-dependent ceiling; growing the table resets it to the
//! `step_target`, so the limit always tends back toward the target.
//! The target trades probe cost against table density and grows
//! slowly with capacity, keeping the common small indices fast.
//!
//! Each locator carries a reference count — the number of record
//! slots bound to it.  When the count reaches zero the map slot is
//! marked dead and the locator is threaded onto a free list kept
//! inside the refcount array itself, ready for reuse.  `next_loc`
//! never decreases.

use rill_util::SymbolTable;

use crate::value::{hash_value, vals_equal, Value};

const INIT_CAP: usize = 8;
const NO_FREE: u32 = u32::MAX;

enum MapSlot {
    /// Never occupied.  A probe may stop early here.
    Empty,
    /// Previously occupied; probes must continue past it.
    Dead,
    Used { key: Value, loc: u32 },
}

/// A shared key→locator map.  See the module docs.
pub struct Index {
    next_loc: u32,
    step_target: u32,
    step_limit: u32,
    slots: Vec<MapSlot>,
    /// Per-locator reference counts.  Freed locators reuse their
    /// cell as the next-free link of an intrusive free list.
    refs: Vec<u32>,
    free_head: u32,
    used: usize,
}

fn step_target_for(cap: usize) -> u32 {
    2 + (cap.max(2).ilog2())
}

impl Index {
    pub fn new() -> Self {
        Self {
            next_loc: 0,
            step_target: step_target_for(INIT_CAP),
            step_limit: step_target_for(INIT_CAP),
            slots: (0..INIT_CAP).map(|_| MapSlot::Empty).collect(),
            refs: Vec::new(),
            free_head: NO_FREE,
            used: 0,
        }
    }

    /// The next locator that would be freshly allocated.  Records
    /// size their value arrays by this.
    pub fn next_loc(&self) -> u32 {
        self.next_loc
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[cfg(test)]
    pub(crate) fn step_limit(&self) -> u32 {
        self.step_limit
    }

    /// Look up a key's locator without touching reference counts.
    pub fn get_by_key(&self, syms: &SymbolTable, key: &Value) -> Option<u32> {
        let cap = self.slots.len();
        if cap == 0 {
            return None;
        }
        let home = hash_value(syms, key) as usize % cap;
        let window = (self.step_limit as usize + 1).min(cap);

        for i in 0..window {
            match &self.slots[(home + i) % cap] {
                MapSlot::Empty => return None,
                MapSlot::Dead => {}
                MapSlot::Used { key: k, loc } => {
                    if vals_equal(k, key) {
                        return Some(*loc);
                    }
                }
            }
        }
        None
    }

    /// Bind a key, allocating a locator if it is new, and take one
    /// reference to it.  Every record slot bound to the key takes
    /// its own reference.
    pub fn add_by_key(&mut self, syms: &SymbolTable, key: &Value) -> u32 {
        debug_assert!(!key.is_udf(), "udf is never a valid index key");
        loop {
            let cap = self.slots.len();
            let home = hash_value(syms, key) as usize % cap;
            let window = (self.step_limit as usize + 1).min(cap);

            let mut first_free = None;
            for i in 0..window {
                let pos = (home + i) % cap;
                match &self.slots[pos] {
                    MapSlot::Empty => {
                        if first_free.is_none() {
                            first_free = Some(pos);
                        }
                        break;
                    }
                    MapSlot::Dead => {
                        if first_free.is_none() {
                            first_free = Some(pos);
                        }
                    }
                    MapSlot::Used { key: k, loc } => {
                        if vals_equal(k, key) {
                            let loc = *loc;
                            self.refs[loc as usize] += 1;
                            return loc;
                        }
                    }
                }
            }

            if let Some(pos) = first_free {
                let loc = self.alloc_loc();
                self.refs[loc as usize] = 1;
                self.slots[pos] = MapSlot::Used {
                    key: key.clone(),
                    loc,
                };
                self.used += 1;
                return loc;
            }

            // Probe window exhausted: widen it toward the ceiling,
            // then grow and rehash.
            if self.step_limit < 2 * self.step_target {
                self.step_limit += 1;
            } else {
                self.rehash(syms, cap * 2);
            }
        }
    }

    /// Take an additional reference to an existing locator.
    pub fn add_by_loc(&mut self, loc: u32) {
        if let Some(r) = self.refs.get_mut(loc as usize) {
            *r += 1;
        }
    }

    /// Release one reference to a locator.  At zero the map slot
    /// dies and the locator becomes reusable.  Tolerant of stale
    /// locators so records can release against an index the sweep
    /// already cleared.
    pub fn rem_by_loc(&mut self, loc: u32) {
        let Some(r) = self.refs.get_mut(loc as usize) else {
            return;
        };
        if *r == 0 {
            return;
        }
        *r -= 1;
        if *r > 0 {
            return;
        }

        for slot in self.slots.iter_mut() {
            if let MapSlot::Used { loc: l, .. } = slot {
                if *l == loc {
                    *slot = MapSlot::Dead;
                    self.used -= 1;
                    break;
                }
            }
        }

        self.refs[loc as usize] = self.free_head;
        self.free_head = loc;
    }

    /// Clone the mapping for a record going its own way: keys whose
    /// locator satisfies `keep` carry over with the *same* locator
    /// and one reference; everything else (and every unused locator
    /// below `next_loc`) starts free.
    pub fn sub(&self, syms: &SymbolTable, keep: impl Fn(u32) -> bool) -> Index {
        let mut out = Index::new();
        out.next_loc = self.next_loc;
        out.refs = vec![0; self.next_loc as usize];

        for (key, loc) in self.iter() {
            if keep(loc) {
                out.place(syms, key.clone(), loc);
                out.refs[loc as usize] = 1;
            }
        }

        // Thread the unused locators onto the free list.
        for loc in (0..self.next_loc).rev() {
            if out.refs[loc as usize] == 0 {
                out.refs[loc as usize] = out.free_head;
                out.free_head = loc;
            }
        }
        out
    }

    /// Iterate live `(key, locator)` pairs in slot order.  Stable as
    /// long as the index is not mutated.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, u32)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            MapSlot::Used { key, loc } => Some((key, *loc)),
            _ => None,
        })
    }

    /// Drop everything.  Used by the sweep on unreachable indices to
    /// unravel reference cycles through keys.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.refs.clear();
        self.used = 0;
        self.free_head = NO_FREE;
    }

    fn alloc_loc(&mut self) -> u32 {
        if self.free_head != NO_FREE {
            let loc = self.free_head;
            self.free_head = self.refs[loc as usize];
            self.refs[loc as usize] = 0;
            loc
        } else {
            let loc = self.next_loc;
            self.next_loc += 1;
            self.refs.push(0);
            loc
        }
    }

    /// Place a key with a preassigned locator; used by rehash and
    /// [`Index::sub`].  Reference counts are managed by the caller.
    fn place(&mut self, syms: &SymbolTable, key: Value, loc: u32) {
        loop {
            let cap = self.slots.len();
            let home = hash_value(syms, &key) as usize % cap;
            let window = (self.step_limit as usize + 1).min(cap);

            let mut placed = false;
            for i in 0..window {
                let pos = (home + i) % cap;
                if matches!(self.slots[pos], MapSlot::Empty | MapSlot::Dead) {
                    self.slots[pos] = MapSlot::Used {
                        key: key.clone(),
                        loc,
                    };
                    self.used += 1;
                    placed = true;
                    break;
                }
            }
            if placed {
                return;
            }
            if self.step_limit < 2 * self.step_target {
                self.step_limit += 1;
            } else {
                let cap = self.slots.len();
                self.rehash(syms, cap * 2);
            }
        }
    }

    fn rehash(&mut self, syms: &SymbolTable, new_cap: usize) {
        let old = std::mem::replace(
            &mut self.slots,
            (0..new_cap).map(|_| MapSlot::Empty).collect(),
        );
        self.step_target = step_target_for(new_cap);
        self.step_limit = self.step_target;
        self.used = 0;

        for slot in old {
            if let MapSlot::Used { key, loc } = slot {
                self.place(syms, key, loc);
            }
        }
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms() -> SymbolTable {
        SymbolTable::new()
    }

    #[test]
    fn add_then_get() {
        let s = syms();
        let mut idx = Index::new();
        let a = idx.add_by_key(&s, &Value::Int(1));
        let b = idx.add_by_key(&s, &Value::Int(2));

        assert_ne!(a, b);
        assert_eq!(idx.get_by_key(&s, &Value::Int(1)), Some(a));
        assert_eq!(idx.get_by_key(&s, &Value::Int(2)), Some(b));
        assert_eq!(idx.get_by_key(&s, &Value::Int(3)), None);
    }

    #[test]
    fn locators_are_dense_from_zero() {
        let s = syms();
        let mut idx = Index::new();
        for i in 0..10 {
            let loc = idx.add_by_key(&s, &Value::Int(i));
            assert_eq!(loc, i as u32);
        }
        assert_eq!(idx.next_loc(), 10);
    }

    #[test]
    fn repeat_add_shares_the_locator() {
        let s = syms();
        let mut idx = Index::new();
        let a = idx.add_by_key(&s, &Value::Int(7));
        let b = idx.add_by_key(&s, &Value::Int(7));
        assert_eq!(a, b);
        assert_eq!(idx.len(), 1);

        // Two references; the key survives one release.
        idx.rem_by_loc(a);
        assert_eq!(idx.get_by_key(&s, &Value::Int(7)), Some(a));
        idx.rem_by_loc(a);
        assert_eq!(idx.get_by_key(&s, &Value::Int(7)), None);
    }

    #[test]
    fn released_locators_recycle() {
        let s = syms();
        let mut idx = Index::new();
        let a = idx.add_by_key(&s, &Value::Int(1));
        let _b = idx.add_by_key(&s, &Value::Int(2));
        idx.rem_by_loc(a);

        // The freed locator is reused before a fresh one.
        let c = idx.add_by_key(&s, &Value::Int(3));
        assert_eq!(c, a);
        assert_eq!(idx.next_loc(), 2);
    }

    #[test]
    fn next_loc_is_monotone() {
        let s = syms();
        let mut idx = Index::new();
        let mut high = 0;
        for i in 0..100 {
            let loc = idx.add_by_key(&s, &Value::Int(i));
            high = high.max(loc + 1);
            assert_eq!(idx.next_loc(), high);
            if i % 3 == 0 {
                idx.rem_by_loc(loc);
            }
            assert_eq!(idx.next_loc(), high);
        }
    }

    #[test]
    fn growth_resets_step_limit() {
        let s = syms();
        let mut idx = Index::new();
        for i in 0..200 {
            idx.add_by_key(&s, &Value::Int(i));
        }
        assert_eq!(idx.len(), 200);
        assert!(idx.step_limit() <= 2 * step_target_for(idx.slots.len()));
        for i in 0..200 {
            assert!(idx.get_by_key(&s, &Value::Int(i)).is_some());
        }
    }

    #[test]
    fn symbol_keys_find_by_content() {
        let mut s = syms();
        let a1 = s.intern(b"alpha");
        let a2 = s.intern(b"alpha");

        let mut idx = Index::new();
        let loc = idx.add_by_key(&s, &Value::Sym(a1));
        assert_eq!(idx.get_by_key(&s, &Value::Sym(a2)), Some(loc));
    }

    #[test]
    fn mixed_key_types_coexist() {
        let mut s = syms();
        let sym = s.intern(b"k");
        let mut idx = Index::new();

        let a = idx.add_by_key(&s, &Value::Int(0));
        let b = idx.add_by_key(&s, &Value::Sym(sym));
        let c = idx.add_by_key(&s, &Value::Log(true));
        assert_eq!(idx.len(), 3);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn sub_preserves_kept_locators() {
        let s = syms();
        let mut idx = Index::new();
        let a = idx.add_by_key(&s, &Value::Int(10));
        let b = idx.add_by_key(&s, &Value::Int(20));
        let c = idx.add_by_key(&s, &Value::Int(30));

        let sub = idx.sub(&s, |loc| loc == a || loc == c);
        assert_eq!(sub.get_by_key(&s, &Value::Int(10)), Some(a));
        assert_eq!(sub.get_by_key(&s, &Value::Int(20)), None);
        assert_eq!(sub.get_by_key(&s, &Value::Int(30)), Some(c));
        assert_eq!(sub.next_loc(), idx.next_loc());

        // The original mapping is untouched.
        assert_eq!(idx.get_by_key(&s, &Value::Int(20)), Some(b));
    }

    #[test]
    fn sub_recycles_dropped_locators() {
        let s = syms();
        let mut idx = Index::new();
        let _a = idx.add_by_key(&s, &Value::Int(1));
        let b = idx.add_by_key(&s, &Value::Int(2));

        let mut sub = idx.sub(&s, |loc| loc == b);
        // Locator 0 was not kept, so it is the next to be recycled.
        let fresh = sub.add_by_key(&s, &Value::Int(99));
        assert_eq!(fresh, 0);
    }

    #[test]
    fn iter_is_stable_without_mutation() {
        let s = syms();
        let mut idx = Index::new();
        for i in 0..8 {
            idx.add_by_key(&s, &Value::Int(i));
        }
        let once: Vec<_> = idx.iter().map(|(k, l)| (k.clone(), l)).collect();
        let twice: Vec<_> = idx.iter().map(|(k, l)| (k.clone(), l)).collect();
        assert_eq!(once, twice);
        assert_eq!(once.len(), 8);
    }
}
