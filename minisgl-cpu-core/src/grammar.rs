//! Grammar State Cache (`spec.md` §4.3): memoized compiled grammars keyed by
//! `(kind, spec)`, each yielding cheap per-request matcher cursors.
//!
//! `constrained/xgrammar_backend.py` in the original was filtered down to
//! just its license header, so the compiled-grammar internals here are not
//! a port of anything — they implement the capability set `spec.md` §9
//! asks for (`accept_token`, `rollback`, `find_jump_forward_string`,
//! `fill_next_token_bitmask`, `apply_token_bitmask_inplace`) on top of
//! `regex-automata`'s byte-level DFA, which is the closest idiomatic-Rust
//! analogue of a compiled grammar with deterministic stepping and rollback.

use std::collections::HashMap;
use std::sync::Arc;

use regex_automata::dfa::{dense, Automaton};
use regex_automata::util::primitives::StateID;
use regex_automata::{Anchored, Input};
use serde_json::Value;
use thiserror::Error;

/// `spec.md` §3 Grammar Matcher: rollback is bounded so the scheduler never
/// has to retain unbounded per-token history.
pub const MAX_ROLLBACK_TOKENS: usize = 10;

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("invalid regex: {0}")]
    BadRegex(String),
    #[error("unsupported json schema: {0}")]
    UnsupportedJsonSchema(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrammarKind {
    Json,
    Regex,
}

pub type GrammarKey = (GrammarKind, String);

/// A compiled grammar shared (via `Arc`) across every request that needs
/// the same `(kind, spec)`.
#[derive(Debug)]
pub struct CompiledGrammar {
    pattern: String,
    dfa: dense::DFA<Vec<u32>>,
    start: StateID,
}

impl CompiledGrammar {
    fn compile(pattern: String) -> Result<Self, GrammarError> {
        let dfa = dense::DFA::new(&pattern).map_err(|e| GrammarError::BadRegex(e.to_string()))?;
        let input = Input::new(b"").anchored(Anchored::Yes);
        let start = dfa
            .start_state_forward(&input)
            .map_err(|e| GrammarError::BadRegex(e.to_string()))?;
        Ok(Self {
            pattern,
            dfa,
            start,
        })
    }

    fn step(&self, state: StateID, byte: u8) -> StateID {
        self.dfa.next_state(state, byte)
    }

    fn is_dead(&self, state: StateID) -> bool {
        self.dfa.is_dead_state(state) || self.dfa.is_quit_state(state)
    }

    fn is_match(&self, state: StateID) -> bool {
        let eoi = self.dfa.next_eoi_state(state);
        self.dfa.is_match_state(eoi)
    }
}

/// Lowers a (subset of) JSON Schema to a regex string, the same two-step
/// strategy the original's `FSMCache` uses for `kind == "json"`. Supported:
/// top-level `string`/`number`/`integer`/`boolean`/`enum`, `object` with
/// `properties` (all required, in sorted-key order), and `array` of an
/// `items` schema drawn from the same subset.
pub fn json_schema_to_regex(schema_json: &str) -> Result<String, GrammarError> {
    let value: Value = serde_json::from_str(schema_json)
        .map_err(|e| GrammarError::UnsupportedJsonSchema(e.to_string()))?;
    schema_value_to_regex(&value)
}

fn schema_value_to_regex(value: &Value) -> Result<String, GrammarError> {
    if let Some(variants) = value.get("enum").and_then(Value::as_array) {
        let alts: Result<Vec<String>, GrammarError> = variants
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(format!("\"{}\"", regex_escape_literal(s))),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(GrammarError::UnsupportedJsonSchema(format!(
                    "unsupported enum member: {other}"
                ))),
            })
            .collect();
        return Ok(format!("({})", alts?.join("|")));
    }

    let ty = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GrammarError::UnsupportedJsonSchema("missing 'type'".to_string()))?;

    match ty {
        "string" => Ok(r#""([^"\\]|\\.)*""#.to_string()),
        "number" | "integer" => Ok(r"-?[0-9]+(\.[0-9]+)?".to_string()),
        "boolean" => Ok("(true|false)".to_string()),
        "array" => {
            let items = value.get("items").ok_or_else(|| {
                GrammarError::UnsupportedJsonSchema("array schema missing 'items'".to_string())
            })?;
            let item_re = schema_value_to_regex(items)?;
            Ok(format!(r"\[\s*({item_re}(\s*,\s*{item_re})*)?\s*\]"))
        }
        "object" => {
            let props = value
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    GrammarError::UnsupportedJsonSchema(
                        "object schema missing 'properties'".to_string(),
                    )
                })?;
            let mut keys: Vec<&String> = props.keys().collect();
            keys.sort();
            let mut field_res = Vec::with_capacity(keys.len());
            for key in keys {
                let field_schema = &props[key];
                let value_re = schema_value_to_regex(field_schema)?;
                field_res.push(format!(
                    r#""{}"\s*:\s*{value_re}"#,
                    regex_escape_literal(key)
                ));
            }
            Ok(format!(r"\{{\s*{}\s*\}}", field_res.join(r"\s*,\s*")))
        }
        other => Err(GrammarError::UnsupportedJsonSchema(format!(
            "unsupported type: {other}"
        ))),
    }
}

fn regex_escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A value-typed cursor over a `CompiledGrammar` (`spec.md` §3). Cheap to
/// clone per request since it only holds a shared DFA reference and a small
/// state-stack checkpoint trail.
#[derive(Debug, Clone)]
pub struct GrammarMatcher {
    grammar: Arc<CompiledGrammar>,
    state: StateID,
    /// One entry per accepted token: the state immediately before that
    /// token was accepted, so `rollback(k)` can restore it in O(k).
    checkpoints: Vec<StateID>,
}

impl GrammarMatcher {
    fn new(grammar: Arc<CompiledGrammar>) -> Self {
        let state = grammar.start;
        Self {
            grammar,
            state,
            checkpoints: Vec::new(),
        }
    }

    /// Feeds `token_bytes` through the DFA one byte at a time. Returns
    /// `false` (and leaves state unchanged) if the token would not be
    /// accepted by the grammar from the current state.
    pub fn accept_token(&mut self, token_bytes: &[u8]) -> bool {
        let mut cursor = self.state;
        for &b in token_bytes {
            cursor = self.grammar.step(cursor, b);
            if self.grammar.is_dead(cursor) {
                return false;
            }
        }
        self.checkpoints.push(self.state);
        if self.checkpoints.len() > MAX_ROLLBACK_TOKENS {
            self.checkpoints.remove(0);
        }
        self.state = cursor;
        true
    }

    /// Undoes the last `k` accepted tokens, `k <= MAX_ROLLBACK_TOKENS`
    /// (`spec.md` §3, property 5 in §8).
    pub fn rollback(&mut self, k: usize) {
        let k = k.min(MAX_ROLLBACK_TOKENS).min(self.checkpoints.len());
        for _ in 0..k {
            if let Some(prev) = self.checkpoints.pop() {
                self.state = prev;
            }
        }
    }

    /// Current DFA state id, exposed so `JumpForwardMap` can memoize on it
    /// without owning a second copy of the DFA.
    pub fn state_id(&self) -> StateID {
        self.state
    }

    /// Peeks the deterministic byte suffix forced by the grammar from the
    /// current state: as long as exactly one live byte continuation
    /// exists, the next character is not really a choice.
    pub fn find_jump_forward_string(&self) -> Option<Vec<u8>> {
        let mut forced = Vec::new();
        let mut cursor = self.state;
        loop {
            if self.grammar.is_match(cursor) {
                break;
            }
            let mut live: Option<(u8, StateID)> = None;
            let mut branch_count = 0u32;
            for byte in 0u8..=255 {
                let next = self.grammar.step(cursor, byte);
                if !self.grammar.is_dead(next) {
                    branch_count += 1;
                    if branch_count > 1 {
                        break;
                    }
                    live = Some((byte, next));
                }
            }
            if branch_count != 1 {
                break;
            }
            let (byte, next) = live.expect("branch_count == 1 implies live is set");
            forced.push(byte);
            cursor = next;
            if forced.len() > 4096 {
                break; // runaway guard; no realistic grammar forces this far in one hop
            }
        }
        if forced.is_empty() {
            None
        } else {
            Some(forced)
        }
    }

    /// Applies the jump-forward bytes found above: advances the matcher as
    /// if each had been accepted as its own token. Used by the scheduler
    /// after re-tokenizing the forced string.
    pub fn apply_forced_bytes(&mut self, forced: &[u8]) {
        self.checkpoints.push(self.state);
        if self.checkpoints.len() > MAX_ROLLBACK_TOKENS {
            self.checkpoints.remove(0);
        }
        let mut cursor = self.state;
        for &b in forced {
            cursor = self.grammar.step(cursor, b);
        }
        self.state = cursor;
    }

    /// Sets bit `token_id` in `mask` (packed 32 bits per word, matching the
    /// layout `apply_token_bitmask_inplace` expects) iff `token_bytes`
    /// would be legal to accept from the current state.
    pub fn fill_next_token_bitmask(&self, mask: &mut [u32], vocab: &[Vec<u8>]) {
        for (token_id, token_bytes) in vocab.iter().enumerate() {
            let mut cursor = self.state;
            let mut alive = true;
            for &b in token_bytes {
                cursor = self.grammar.step(cursor, b);
                if self.grammar.is_dead(cursor) {
                    alive = false;
                    break;
                }
            }
            if alive {
                let word = token_id / 32;
                let bit = token_id % 32;
                if word < mask.len() {
                    mask[word] |= 1u32 << bit;
                }
            }
        }
    }

    /// Masks illegal tokens to `-inf` in place, per the bitmask
    /// `fill_next_token_bitmask` produced.
    pub fn apply_token_bitmask_inplace(logits: &mut [f32], mask: &[u32]) {
        for (token_id, logit) in logits.iter_mut().enumerate() {
            let word = token_id / 32;
            let bit = token_id % 32;
            let allowed = mask.get(word).is_some_and(|w| w & (1u32 << bit) != 0);
            if !allowed {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

/// Memoized compiled grammars keyed by `(kind, spec)`.
#[derive(Debug, Default)]
pub struct GrammarStateCache {
    compiled: HashMap<GrammarKey, Arc<CompiledGrammar>>,
}

impl GrammarStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// On a cache miss, compiles the grammar; on success, inserts and
    /// returns a fresh matcher. `kind == Regex` is always supported;
    /// `kind == Json` is limited to the subset `json_schema_to_regex`
    /// handles — anything wider is a compile error, which the caller
    /// (scheduler) turns into an unconstrained fallback plus a warning, per
    /// `spec.md` §7.
    pub fn query(&mut self, kind: GrammarKind, spec: &str) -> Result<GrammarMatcher, GrammarError> {
        let key = (kind, spec.to_string());
        if let Some(grammar) = self.compiled.get(&key) {
            return Ok(GrammarMatcher::new(grammar.clone()));
        }

        let pattern = match kind {
            GrammarKind::Regex => spec.to_string(),
            GrammarKind::Json => json_schema_to_regex(spec)?,
        };
        let compiled = Arc::new(CompiledGrammar::compile(pattern)?);
        self.compiled.insert(key, compiled.clone());
        Ok(GrammarMatcher::new(compiled))
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_token_rejects_mismatched_byte() {
        let mut cache = GrammarStateCache::new();
        let mut matcher = cache.query(GrammarKind::Regex, "ab").unwrap();
        assert!(matcher.accept_token(b"a"));
        assert!(!matcher.accept_token(b"x"));
    }

    #[test]
    fn rollback_is_exact_inverse_of_accept() {
        let mut cache = GrammarStateCache::new();
        let mut matcher = cache.query(GrammarKind::Regex, "abc").unwrap();
        let before = matcher.clone();
        assert!(matcher.accept_token(b"a"));
        assert!(matcher.accept_token(b"b"));
        assert!(matcher.accept_token(b"c"));
        matcher.rollback(3);
        assert_eq!(matcher.state, before.state);
        assert_eq!(matcher.checkpoints, before.checkpoints);
    }

    #[test]
    fn find_jump_forward_detects_forced_suffix() {
        let mut cache = GrammarStateCache::new();
        let matcher = cache.query(GrammarKind::Regex, "hello world").unwrap();
        let forced = matcher.find_jump_forward_string().unwrap();
        assert_eq!(forced, b"hello world");
    }

    #[test]
    fn json_object_schema_lowers_and_compiles() {
        let schema = r#"{"type":"object","properties":{"a":{"type":"string"},"b":{"type":"number"}}}"#;
        let mut cache = GrammarStateCache::new();
        let mut matcher = cache.query(GrammarKind::Json, schema).unwrap();
        assert!(matcher.accept_token(b"{\"a\""));
    }

    #[test]
    fn bitmask_round_trip_masks_illegal_tokens() {
        let mut cache = GrammarStateCache::new();
        let matcher = cache.query(GrammarKind::Regex, "a").unwrap();
        let vocab = vec![b"a".to_vec(), b"b".to_vec()];
        let mut mask = vec![0u32; 1];
        matcher.fill_next_token_bitmask(&mut mask, &vocab);
        let mut logits = vec![1.0f32, 1.0f32];
        GrammarMatcher::apply_token_bitmask_inplace(&mut logits, &mask);
        assert!(logits[0].is_finite());
        assert!(logits[1].is_infinite());
    }
}
