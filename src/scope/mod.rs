use std::collections::HashSet;

use crate::map::CrushMap;
use crate::word::{DataType, Word, crush};

// ── Scope chain ─────────────────────────────────────────────────────
//
// A bounded stack of crushed-name → word maps. Level 0 is global;
// function entry pushes a level pre-populated with the positional
// parameter bindings `__p0…`, return pops it. Lookup walks innermost
// to outermost.
//
// Assignment intentionally does the same walk: if the name is already
// bound at any enclosing level it is updated in place there, and only
// a name bound nowhere is created at the innermost level. An inner
// function can therefore mutate an outer variable of the same name.
// That is observable language behavior, covered by tests — not a bug.

/// Recursion-depth ceiling. Exceeding it is a fatal error, never
/// silent corruption.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("scope depth exceeded ({MAX_DEPTH} levels) — runaway recursion")]
    DepthExceeded,
    #[error("unresolved name #{hash:08x} — the compiler should have guaranteed it exists")]
    Unresolved { hash: u32 },
}

#[derive(Debug, Default)]
pub struct ScopeChain {
    levels: Vec<CrushMap<Word>>,
    /// Allocated words whose binding scope was dropped or overwritten.
    /// Root input for a future collector; nothing in this core ever
    /// removes entries.
    garbage: HashSet<u64>,
}

impl ScopeChain {
    pub fn new() -> Self {
        ScopeChain {
            levels: vec![CrushMap::new()],
            garbage: HashSet::new(),
        }
    }

    /// Snapshot construction for a nested evaluator: every binding
    /// visible from the parent collapses into a single fresh global
    /// level. The child sees the caller's variables but not its call
    /// stack.
    pub fn from_parent(parent: &ScopeChain) -> Self {
        let mut global = CrushMap::new();
        // outermost first so inner bindings shadow outer ones
        for level in &parent.levels {
            for (key, &word) in level.iter() {
                global.replace(key, word);
            }
        }
        ScopeChain {
            levels: vec![global],
            garbage: HashSet::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Push a function scope, binding each parameter to `__p0…` in
    /// positional order.
    pub fn push_scope(&mut self, params: &[Word]) -> Result<(), ScopeError> {
        if self.levels.len() >= MAX_DEPTH {
            return Err(ScopeError::DepthExceeded);
        }
        let mut level = CrushMap::new();
        for (i, &param) in params.iter().enumerate() {
            level.replace(crush(&format!("__p{i}")), param);
        }
        self.levels.push(level);
        Ok(())
    }

    /// Pop the innermost scope, transferring its allocated values into
    /// the potential-garbage set. The global level is never dropped.
    pub fn drop_scope(&mut self) {
        if self.levels.len() <= 1 {
            return;
        }
        let level = self.levels.pop().unwrap();
        for &word in level.values() {
            if word.is_allocated() {
                self.garbage.insert(word.bits());
            }
        }
    }

    pub fn resolve(&self, hash: u32) -> Result<Word, ScopeError> {
        for level in self.levels.iter().rev() {
            if let Some(&word) = level.try_get(hash) {
                return Ok(word);
            }
        }
        Err(ScopeError::Unresolved { hash })
    }

    pub fn can_resolve(&self, hash: u32) -> bool {
        self.levels.iter().rev().any(|level| level.contains_key(hash))
    }

    /// Update the existing binding wherever it lives in the chain;
    /// create at the innermost level only if the name is bound nowhere.
    pub fn set_value(&mut self, hash: u32, word: Word) {
        for level in self.levels.iter_mut().rev() {
            if let Some(slot) = level.try_get_mut(hash) {
                let old = *slot;
                *slot = word;
                if old.is_allocated() && old != word {
                    self.garbage.insert(old.bits());
                }
                return;
            }
        }
        self.levels.last_mut().unwrap().replace(hash, word);
    }

    /// Bind at the innermost level unconditionally, without the
    /// update-anywhere walk of `set_value`. Shadows any outer binding.
    pub fn bind_local(&mut self, hash: u32, word: Word) {
        self.levels.last_mut().unwrap().replace(hash, word);
    }

    /// Remove the innermost binding for `hash`, if any.
    pub fn remove(&mut self, hash: u32) -> bool {
        for level in self.levels.iter_mut().rev() {
            if let Some(old) = level.remove(hash) {
                if old.is_allocated() {
                    self.garbage.insert(old.bits());
                }
                return true;
            }
        }
        false
    }

    /// In-place numeric increment, skipping the get/set round trip.
    /// Backs the compiler's increment opcode.
    pub fn mutate_number(&mut self, hash: u32, delta: i8) -> Result<(), ScopeError> {
        for level in self.levels.iter_mut().rev() {
            if let Some(slot) = level.try_get_mut(hash) {
                // non-numeric bindings cast to NaN, matching what the
                // unfolded get/add/set sequence would produce
                let current = match slot.data_type() {
                    Ok(DataType::Number) => slot.as_number(),
                    Ok(DataType::Int) => f64::from(slot.as_int()),
                    Ok(DataType::Uint) => f64::from(slot.as_uint()),
                    _ => f64::NAN,
                };
                *slot = Word::number(current + f64::from(delta));
                return Ok(());
            }
        }
        Err(ScopeError::Unresolved { hash })
    }

    pub fn potential_garbage(&self) -> &HashSet<u64> {
        &self.garbage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_walks_inward_to_outward() {
        let mut chain = ScopeChain::new();
        let x = crush("x");
        chain.set_value(x, Word::number(1.0));
        chain.push_scope(&[]).unwrap();
        assert_eq!(chain.resolve(x).unwrap(), Word::number(1.0));
    }

    #[test]
    fn params_bind_positionally() {
        let mut chain = ScopeChain::new();
        chain
            .push_scope(&[Word::number(2.0), Word::number(3.0)])
            .unwrap();
        assert_eq!(chain.resolve(crush("__p0")).unwrap(), Word::number(2.0));
        assert_eq!(chain.resolve(crush("__p1")).unwrap(), Word::number(3.0));
        assert!(!chain.can_resolve(crush("__p2")));
    }

    #[test]
    fn set_updates_enclosing_binding_in_place() {
        let mut chain = ScopeChain::new();
        let x = crush("x");
        chain.set_value(x, Word::number(1.0));
        chain.push_scope(&[]).unwrap();
        // the documented quirk: assignment finds x in the outer level
        chain.set_value(x, Word::number(9.0));
        chain.drop_scope();
        assert_eq!(chain.resolve(x).unwrap(), Word::number(9.0));
    }

    #[test]
    fn unbound_name_creates_innermost() {
        let mut chain = ScopeChain::new();
        let y = crush("y");
        chain.push_scope(&[]).unwrap();
        chain.set_value(y, Word::number(5.0));
        assert!(chain.can_resolve(y));
        chain.drop_scope();
        assert!(!chain.can_resolve(y));
    }

    #[test]
    fn depth_ceiling_is_fatal() {
        let mut chain = ScopeChain::new();
        for _ in 0..MAX_DEPTH - 1 {
            chain.push_scope(&[]).unwrap();
        }
        assert!(matches!(chain.push_scope(&[]), Err(ScopeError::DepthExceeded)));
    }

    #[test]
    fn dropped_allocated_values_become_garbage() {
        let mut chain = ScopeChain::new();
        let s = crush("s");
        chain.push_scope(&[]).unwrap();
        let reference = Word::str_ref(40);
        chain.set_value(s, reference);
        chain.drop_scope();
        assert!(chain.potential_garbage().contains(&reference.bits()));
        // value types are never tracked
        assert_eq!(chain.potential_garbage().len(), 1);
    }

    #[test]
    fn overwritten_allocated_value_becomes_garbage() {
        let mut chain = ScopeChain::new();
        let s = crush("s");
        let old = Word::str_ref(8);
        chain.set_value(s, old);
        chain.set_value(s, Word::number(1.0));
        assert!(chain.potential_garbage().contains(&old.bits()));
    }

    #[test]
    fn from_parent_flattens_visible_bindings() {
        let mut parent = ScopeChain::new();
        let a = crush("a");
        let b = crush("b");
        parent.set_value(a, Word::number(1.0));
        parent.push_scope(&[]).unwrap();
        parent.set_value(b, Word::number(2.0));
        // shadow a at the inner level by creating it there directly
        parent.levels.last_mut().unwrap().replace(a, Word::number(7.0));

        let child = ScopeChain::from_parent(&parent);
        assert_eq!(child.depth(), 1);
        assert_eq!(child.resolve(a).unwrap(), Word::number(7.0));
        assert_eq!(child.resolve(b).unwrap(), Word::number(2.0));
    }

    #[test]
    fn mutate_number_in_place() {
        let mut chain = ScopeChain::new();
        let i = crush("i");
        chain.set_value(i, Word::number(10.0));
        chain.mutate_number(i, -3).unwrap();
        assert_eq!(chain.resolve(i).unwrap(), Word::number(7.0));
        assert!(chain.mutate_number(crush("missing"), 1).is_err());
    }

    #[test]
    fn mutate_number_on_non_numeric_yields_nan() {
        let mut chain = ScopeChain::new();
        let s = crush("s");
        chain.set_value(s, Word::short_str("abc").unwrap());
        chain.mutate_number(s, 1).unwrap();
        let after = chain.resolve(s).unwrap();
        assert!(after.is_number());
        assert!(after.as_number().is_nan());
    }

    #[test]
    fn remove_drops_binding() {
        let mut chain = ScopeChain::new();
        let x = crush("x");
        chain.set_value(x, Word::number(1.0));
        assert!(chain.remove(x));
        assert!(!chain.can_resolve(x));
        assert!(!chain.remove(x));
    }
}
