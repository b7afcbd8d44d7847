//! Path blocking rules
//!
//! Rules are identified by a random UUID which is also their record name on
//! disk, so two rules never collide in storage even while an operator
//! temporarily holds overlapping paths. Matching strips one trailing slash on
//! both sides and then applies an exact or plain string prefix comparison:
//! `/secret` blocks `/secretx` as well.

use crate::matcher::{MatchMode, MatchRule, RuleIndex};
use crate::store::RecordStore;
use bytes::Bytes;
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use portcullis_core::{full, Body, Error, Response, ResponseBuilder, Result, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn default_true() -> bool {
    true
}

fn default_status() -> u16 {
    StatusCode::FORBIDDEN.as_u16()
}

/// A path blocking rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingRule {
    /// Public handle and storage key
    pub uuid: String,

    /// Path the rule applies to
    pub matching_path: String,

    /// Require equality instead of a prefix
    #[serde(default)]
    pub exact_match: bool,

    /// Status code of the block response
    #[serde(default = "default_status")]
    pub status_code: u16,

    /// Response headers, in order, repeats allowed
    #[serde(default)]
    pub custom_headers: Vec<(String, String)>,

    /// Response body
    #[serde(default, with = "base64_body")]
    pub custom_body: Vec<u8>,

    /// Disabled rules never match
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Compare without case folding
    #[serde(default)]
    pub case_sensitive: bool,
}

impl BlockingRule {
    /// New enabled, case-insensitive rule with a fresh UUID
    pub fn new(matching_path: impl Into<String>, exact_match: bool, status_code: u16) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            matching_path: matching_path.into(),
            exact_match,
            status_code,
            custom_headers: Vec::new(),
            custom_body: Vec::new(),
            enabled: true,
            case_sensitive: false,
        }
    }

    /// Append a response header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push((name.into(), value.into()));
        self
    }

    /// Set the response body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.custom_body = body.into();
        self
    }

    /// Enable or disable the rule
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set case sensitivity
    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    fn normalized_path(&self) -> &str {
        trim_one_slash(&self.matching_path)
    }

    /// The block response: status, headers and body verbatim
    pub fn to_response(&self) -> Result<Response<Body>> {
        let status = StatusCode::from_u16(self.status_code)
            .map_err(|e| Error::config(format!("block status {}: {e}", self.status_code)))?;

        let mut builder = ResponseBuilder::new(status);
        for (name, value) in &self.custom_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("block header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("block header value '{value}': {e}")))?;
            builder = builder.header(name, value);
        }

        builder.body(full(Bytes::from(self.custom_body.clone())))
    }

    fn validate(&self) -> Result<()> {
        // The UUID names the record file
        Uuid::parse_str(&self.uuid)
            .map_err(|e| Error::config(format!("block rule uuid '{}': {e}", self.uuid)))?;
        StatusCode::from_u16(self.status_code)
            .map(|_| ())
            .map_err(|_| Error::config(format!("invalid block status {}", self.status_code)))
    }
}

impl MatchRule for BlockingRule {
    fn key(&self) -> &str {
        self.normalized_path()
    }

    fn exact_match(&self) -> bool {
        self.exact_match
    }

    fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

fn trim_one_slash(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}

/// Result of [`PathBlockTable::get_matching_blockers`]
#[derive(Debug, Clone, Default)]
pub struct BlockMatches {
    /// Every enabled matching rule, in registration order
    pub all: Vec<Arc<BlockingRule>>,

    /// The longest matching rule
    pub longest: Option<Arc<BlockingRule>>,
}

/// Persisted path-block table
#[derive(Debug)]
pub struct PathBlockTable {
    store: RecordStore,
    index: RuleIndex<BlockingRule>,
    admin: Mutex<()>,
}

impl PathBlockTable {
    /// Open a table backed by `dir`, loading every stored rule
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let table = Self {
            store: RecordStore::open(dir)?,
            index: RuleIndex::new(MatchMode::Literal),
            admin: Mutex::new(()),
        };
        table.reload()?;
        Ok(table)
    }

    /// Rebuild the index from disk.
    ///
    /// The new rule set replaces the old one in a single step.
    pub fn reload(&self) -> Result<usize> {
        let _guard = self.admin.lock();
        let records: Vec<(String, BlockingRule)> = self.store.load_all()?;

        let rules = records.into_iter().filter_map(|(file, rule)| {
            if let Err(e) = rule.validate() {
                tracing::warn!(category = "pathblock", file = %file, error = %e, "Ignoring invalid block rule");
                return None;
            }
            if rule.uuid != file {
                tracing::warn!(
                    category = "pathblock",
                    file = %file,
                    uuid = %rule.uuid,
                    "Ignoring block rule stored under a foreign record name"
                );
                return None;
            }
            Some((rule.uuid.clone(), rule))
        });

        let count = self.index.replace_all(rules);
        tracing::info!(category = "pathblock", rules = count, "Path block rules loaded");
        Ok(count)
    }

    /// Add a rule.
    ///
    /// Fails when a rule with the same matching path (ignoring one trailing
    /// slash) already exists.
    pub fn add_blocking_path(&self, rule: BlockingRule) -> Result<Arc<BlockingRule>> {
        rule.validate()?;
        let _guard = self.admin.lock();

        if self.find_by_matching_path(&rule.matching_path).is_some() {
            return Err(Error::DuplicateRule(rule.matching_path));
        }
        if self.index.contains(&rule.uuid) || self.store.exists(&rule.uuid) {
            return Err(Error::DuplicateRule(format!(
                "{} (record '{}' already exists)",
                rule.matching_path, rule.uuid
            )));
        }

        let uuid = rule.uuid.clone();
        self.store.write(&uuid, &rule)?;
        let added = match self.index.try_insert(uuid.clone(), rule) {
            Ok(added) => added,
            Err(e) => {
                self.store.remove(&uuid)?;
                return Err(e);
            }
        };

        tracing::info!(
            category = "pathblock",
            uuid = %added.uuid,
            path = %added.matching_path,
            status = added.status_code,
            "Path block rule added"
        );
        Ok(added)
    }

    /// Remove the rule with the given UUID
    pub fn remove_blocking_path_by_uuid(&self, uuid: &str) -> Result<Arc<BlockingRule>> {
        let _guard = self.admin.lock();

        let removed = self
            .index
            .remove(uuid)
            .ok_or_else(|| Error::RuleNotFound(uuid.to_string()))?;
        self.store.remove(uuid)?;

        tracing::info!(category = "pathblock", uuid = %uuid, "Path block rule removed");
        Ok(removed)
    }

    /// Rule with the given UUID
    pub fn get_by_uuid(&self, uuid: &str) -> Option<Arc<BlockingRule>> {
        self.index.get(uuid)
    }

    /// Rule whose matching path equals `path`, ignoring one trailing slash
    pub fn find_by_matching_path(&self, path: &str) -> Option<Arc<BlockingRule>> {
        let wanted = trim_one_slash(path);
        self.index
            .snapshot()
            .into_iter()
            .find(|rule| rule.matching_path == path || rule.normalized_path() == wanted)
    }

    /// All rules in registration order
    pub fn list_blocking_paths(&self) -> Vec<Arc<BlockingRule>> {
        self.index.snapshot()
    }

    /// Every matching rule plus the longest one
    pub fn get_matching_blockers(&self, url_path: &str) -> BlockMatches {
        let path = trim_one_slash(url_path);
        BlockMatches {
            all: self.index.all_matches(path),
            longest: self.index.best_match_path(path).map(|m| m.rule),
        }
    }

    /// Block response for `url_path`, if any rule applies
    pub fn check(&self, url_path: &str) -> Option<Arc<BlockingRule>> {
        self.index
            .best_match_path(trim_one_slash(url_path))
            .map(|m| m.rule)
    }
}
