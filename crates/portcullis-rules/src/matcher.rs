//! Longest-match rule lookup shared by the redirect and path-block tables
//!
//! Rules live in a [`RuleIndex`], a `DashMap` of immutable `Arc` entries.
//! Lookups never take a table-wide lock and only ever observe fully built
//! entries, so request tasks can match while an administrative caller adds
//! or removes rules. A full rebuild is built aside and published with one
//! pointer swap, so readers see either the old table or the new one.

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use portcullis_core::{Error, Result};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// A rule that can be matched against a request path
pub trait MatchRule: Send + Sync {
    /// Pattern compared against the candidate path
    fn key(&self) -> &str;

    /// Require equality (one trailing slash tolerated) instead of a prefix
    fn exact_match(&self) -> bool;

    /// Compare without case folding
    fn case_sensitive(&self) -> bool;

    /// Disabled rules never match
    fn enabled(&self) -> bool;
}

/// How rule keys are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Exact or prefix comparison, per rule
    #[default]
    Literal,
    /// Keys are regular expressions tested against the candidate
    Regex,
}

/// A rule together with its registration order and compiled pattern
#[derive(Debug)]
pub struct Indexed<R> {
    seq: u64,
    rule: Arc<R>,
    regex: OnceCell<Option<Regex>>,
}

impl<R: MatchRule> Indexed<R> {
    /// The indexed rule
    pub fn rule(&self) -> &Arc<R> {
        &self.rule
    }

    /// Registration sequence, lower is older
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Compiled key, `None` when the key is not a valid expression
    fn regex(&self) -> Option<&Regex> {
        self.regex
            .get_or_init(|| match compile(self.rule.as_ref()) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(
                        category = "rules",
                        key = %self.rule.key(),
                        error = %e,
                        "Unable to compile rule pattern, rule will never match"
                    );
                    None
                }
            })
            .as_ref()
    }

    /// Test this rule against `candidate`.
    ///
    /// Returns the byte offset where the unmatched remainder starts.
    pub fn matches(&self, candidate: &str, mode: MatchMode) -> Option<usize> {
        let rule = self.rule.as_ref();
        if !rule.enabled() {
            return None;
        }

        match mode {
            MatchMode::Regex => self.regex()?.find(candidate).map(|m| m.end()),
            MatchMode::Literal => literal_match(rule, candidate),
        }
    }
}

fn compile<R: MatchRule + ?Sized>(rule: &R) -> Result<Regex> {
    RegexBuilder::new(rule.key())
        .case_insensitive(!rule.case_sensitive())
        .build()
        .map_err(|e| Error::InvalidRegex {
            pattern: rule.key().to_string(),
            message: e.to_string(),
        })
}

/// Exact or prefix comparison of a single rule.
///
/// Returns the byte offset in `candidate` right after the matched key.
pub fn literal_match<R: MatchRule + ?Sized>(rule: &R, candidate: &str) -> Option<usize> {
    let key = rule.key();
    let (candidate_cmp, key_cmp) = if rule.case_sensitive() {
        (candidate.to_string(), key.to_string())
    } else {
        (candidate.to_lowercase(), key.to_lowercase())
    };

    if rule.exact_match() {
        if candidate_cmp == key_cmp {
            return Some(candidate.len());
        }
        // Tolerate exactly one trailing slash
        if candidate_cmp.len() == key_cmp.len() + 1
            && candidate_cmp.starts_with(&key_cmp)
            && candidate_cmp.ends_with('/')
        {
            return Some(key.len());
        }
        return None;
    }

    candidate_cmp
        .starts_with(&key_cmp)
        .then_some(key.len().min(candidate.len()))
}

/// Ranking used to pick a winner: longer key first, then older rule
fn rank<R: MatchRule>(a: &Indexed<R>, b: &Indexed<R>) -> Ordering {
    b.rule
        .key()
        .len()
        .cmp(&a.rule.key().len())
        .then(a.seq.cmp(&b.seq))
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct RuleMatch<R> {
    /// Winning rule
    pub rule: Arc<R>,

    /// Byte offset in the candidate where the unmatched remainder starts
    pub remainder_at: usize,
}

type Entries<R> = DashMap<String, Arc<Indexed<R>>>;

/// Concurrent keyed rule set
#[derive(Debug)]
pub struct RuleIndex<R> {
    entries: ArcSwap<Entries<R>>,
    next_seq: AtomicU64,
    mode: MatchMode,
}

impl<R: MatchRule> RuleIndex<R> {
    /// Create an empty index
    pub fn new(mode: MatchMode) -> Self {
        Self {
            entries: ArcSwap::from_pointee(DashMap::new()),
            next_seq: AtomicU64::new(0),
            mode,
        }
    }

    /// Matching mode of this index
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    fn wrap(&self, rule: Arc<R>) -> Arc<Indexed<R>> {
        Arc::new(Indexed {
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            rule,
            regex: OnceCell::new(),
        })
    }

    /// Insert a rule under `id`, replacing any previous one
    pub fn insert(&self, id: impl Into<String>, rule: R) -> Option<Arc<R>> {
        let entry = self.wrap(Arc::new(rule));
        self.entries
            .load()
            .insert(id.into(), entry)
            .map(|old| Arc::clone(&old.rule))
    }

    /// Insert a rule only if `id` is free
    pub fn try_insert(&self, id: impl Into<String>, rule: R) -> Result<Arc<R>> {
        let id = id.into();
        let entries = self.entries.load();
        let inserted = match entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateRule(id)),
            Entry::Vacant(slot) => {
                let entry = self.wrap(Arc::new(rule));
                let rule = Arc::clone(&entry.rule);
                slot.insert(entry);
                Ok(rule)
            }
        };
        inserted
    }

    /// Replace the whole rule set at once.
    ///
    /// Rules keep the order they are yielded in. Returns the new rule count.
    pub fn replace_all<I>(&self, rules: I) -> usize
    where
        I: IntoIterator<Item = (String, R)>,
    {
        let fresh = DashMap::new();
        for (id, rule) in rules {
            fresh.insert(id, self.wrap(Arc::new(rule)));
        }
        let len = fresh.len();
        self.entries.store(Arc::new(fresh));
        len
    }

    /// Remove the rule stored under `id`
    pub fn remove(&self, id: &str) -> Option<Arc<R>> {
        self.entries
            .load()
            .remove(id)
            .map(|(_, entry)| Arc::clone(&entry.rule))
    }

    /// Get the rule stored under `id`
    pub fn get(&self, id: &str) -> Option<Arc<R>> {
        self.entries
            .load()
            .get(id)
            .map(|entry| Arc::clone(&entry.rule))
    }

    /// Whether `id` is present
    pub fn contains(&self, id: &str) -> bool {
        self.entries.load().contains_key(id)
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// All rules in registration order
    pub fn snapshot(&self) -> Vec<Arc<R>> {
        let mut entries: Vec<_> = self
            .entries
            .load()
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| Arc::clone(&e.rule)).collect()
    }

    /// Find the best rule.
    ///
    /// `candidate` yields the string a rule is tested against, or `None` to
    /// exclude the rule. Longest key wins, equal lengths go to the rule that
    /// was registered first.
    pub fn best_match<'c, F>(&self, candidate: F) -> Option<RuleMatch<R>>
    where
        F: Fn(&R) -> Option<&'c str>,
    {
        let mut best: Option<(Arc<Indexed<R>>, usize)> = None;
        let entries = self.entries.load();

        for entry in entries.iter() {
            let indexed = entry.value();
            let Some(input) = candidate(indexed.rule.as_ref()) else {
                continue;
            };
            let Some(remainder_at) = indexed.matches(input, self.mode) else {
                continue;
            };

            let better = match &best {
                None => true,
                Some((current, _)) => rank(indexed, current) == Ordering::Less,
            };
            if better {
                best = Some((Arc::clone(indexed), remainder_at));
            }
        }

        best.map(|(entry, remainder_at)| RuleMatch {
            rule: Arc::clone(&entry.rule),
            remainder_at,
        })
    }

    /// Best rule for a single candidate string
    pub fn best_match_path(&self, path: &str) -> Option<RuleMatch<R>> {
        self.best_match(|_| Some(path))
    }

    /// Every matching rule in registration order
    pub fn all_matches(&self, path: &str) -> Vec<Arc<R>> {
        let mut matched: Vec<_> = self
            .entries
            .load()
            .iter()
            .filter(|entry| entry.value().matches(path, self.mode).is_some())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        matched.sort_by_key(|e| e.seq);
        matched.into_iter().map(|e| Arc::clone(&e.rule)).collect()
    }
}

impl<R: MatchRule> Default for RuleIndex<R> {
    fn default() -> Self {
        Self::new(MatchMode::default())
    }
}
