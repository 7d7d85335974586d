//! Jump-Forward Cache (`spec.md` §4.3/§4.6, component 6): a per-grammar
//! precomputed map of state -> forced suffix, memoized so repeated calls to
//! `find_jump_forward_string` during a long deterministic run (e.g. closing
//! JSON punctuation) don't re-walk the DFA from scratch every decode step.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use regex_automata::util::primitives::StateID;

use crate::grammar::GrammarMatcher;

/// Keyed internally by DFA state id; owned per compiled grammar (one
/// `JumpForwardMap` per entry in the `GrammarStateCache`).
#[derive(Debug, Default)]
pub struct JumpForwardMap {
    memo: RefCell<HashMap<StateID, Arc<Option<Vec<u8>>>>>,
}

impl JumpForwardMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the forced suffix from `matcher`'s current state, computing
    /// and memoizing it on first use.
    pub fn forced_suffix(&self, matcher: &GrammarMatcher) -> Arc<Option<Vec<u8>>> {
        let state = matcher.state_id();
        if let Some(hit) = self.memo.borrow().get(&state) {
            return hit.clone();
        }
        let computed = Arc::new(matcher.find_jump_forward_string());
        self.memo.borrow_mut().insert(state, computed.clone());
        computed
    }

    pub fn len(&self) -> usize {
        self.memo.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.borrow().is_empty()
    }
}

/// Per-grammar-spec cache of `JumpForwardMap`s, keyed the same way the
/// `GrammarStateCache` keys compiled grammars (on the computed regex
/// string), per `spec.md` §4.3's "sibling `JumpForwardCache`".
#[derive(Debug, Default)]
pub struct JumpForwardCache {
    maps: HashMap<String, Arc<JumpForwardMap>>,
}

impl JumpForwardCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, regex_key: &str) -> Arc<JumpForwardMap> {
        self.maps
            .entry(regex_key.to_string())
            .or_insert_with(|| Arc::new(JumpForwardMap::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{GrammarKind, GrammarStateCache};

    #[test]
    fn forced_suffix_is_memoized_per_state() {
        let mut cache = GrammarStateCache::new();
        let matcher = cache.query(GrammarKind::Regex, "fixed").unwrap();
        let jf = JumpForwardMap::new();
        let first = jf.forced_suffix(&matcher);
        assert_eq!(first.as_deref(), Some(b"fixed".as_slice()));
        assert_eq!(jf.len(), 1);
        let second = jf.forced_suffix(&matcher);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn jump_forward_cache_deduplicates_by_key() {
        let mut cache = JumpForwardCache::new();
        let a = cache.get_or_create("foo");
        let b = cache.get_or_create("foo");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
