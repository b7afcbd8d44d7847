//! Persisted redirect rules
//!
//! Every rule is stored as `<escaped key>.json` in the table directory and
//! indexed in a [`RuleIndex`]. Keys beginning with `/` are matched against
//! the request path; any other key is matched against `host + path`, which
//! allows per-domain redirects such as `old.example.com/blog`.

use crate::matcher::{MatchMode, MatchRule, RuleIndex};
use crate::store::{escape_filename, RecordStore};
use parking_lot::Mutex;
use portcullis_core::response::responses;
use portcullis_core::{Body, Error, Request, Response, Result, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Substrings that mark a user agent as a mobile device
const MOBILE_INDICATORS: &[&str] = &[
    "mobile",
    "android",
    "iphone",
    "ipad",
    "ipod",
    "blackberry",
    "windows phone",
    "opera mini",
    "iemobile",
    "webos",
];

/// Device class a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredDevice {
    /// Any caller
    #[default]
    All,
    /// Only callers whose user agent looks mobile
    Mobile,
    /// Only callers whose user agent does not look mobile
    Desktop,
}

impl RequiredDevice {
    /// Whether a caller with the given user agent qualifies
    pub fn admits(&self, user_agent: Option<&str>) -> bool {
        match self {
            RequiredDevice::All => true,
            RequiredDevice::Mobile => is_mobile(user_agent),
            RequiredDevice::Desktop => !is_mobile(user_agent),
        }
    }
}

/// Classify a user agent string
pub fn is_mobile(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else {
        return false;
    };
    let ua = ua.to_lowercase();
    MOBILE_INDICATORS.iter().any(|needle| ua.contains(needle))
}

fn default_true() -> bool {
    true
}

fn default_status() -> u16 {
    StatusCode::TEMPORARY_REDIRECT.as_u16()
}

/// A single redirect rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Matching key
    pub redirect_url: String,

    /// Destination
    pub target_url: String,

    /// Append the unmatched remainder and query string to the target
    #[serde(default)]
    pub forward_child_path: bool,

    /// 3xx status sent to the client
    #[serde(default = "default_status")]
    pub status_code: u16,

    /// Require equality instead of a prefix
    #[serde(default)]
    pub exact_match: bool,

    /// Compare without case folding
    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    /// Disabled rules are kept on disk but never match
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device scoping
    #[serde(default)]
    pub required_device: RequiredDevice,
}

impl RedirectRule {
    /// Create a rule with the default flags
    pub fn new(
        redirect_url: impl Into<String>,
        target_url: impl Into<String>,
        forward_child_path: bool,
        status_code: u16,
        exact_match: bool,
    ) -> Self {
        Self {
            redirect_url: redirect_url.into(),
            target_url: target_url.into(),
            forward_child_path,
            status_code,
            exact_match,
            case_sensitive: true,
            enabled: true,
            required_device: RequiredDevice::All,
        }
    }

    /// Set case sensitivity
    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Enable or disable the rule
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Restrict the rule to a device class
    pub fn with_required_device(mut self, device: RequiredDevice) -> Self {
        self.required_device = device;
        self
    }

    /// Whether the key is matched against the path alone
    pub fn is_path_only(&self) -> bool {
        self.redirect_url.starts_with('/') || self.redirect_url.starts_with("^/")
    }

    fn validate(&self) -> Result<StatusCode> {
        if self.redirect_url.is_empty() {
            return Err(Error::config("redirect key must not be empty"));
        }
        if self.target_url.is_empty() {
            return Err(Error::config(format!(
                "redirect target for '{}' must not be empty",
                self.redirect_url
            )));
        }
        StatusCode::from_u16(self.status_code)
            .ok()
            .filter(StatusCode::is_redirection)
            .ok_or_else(|| {
                Error::config(format!(
                    "redirect status {} for '{}' is not a 3xx code",
                    self.status_code, self.redirect_url
                ))
            })
    }
}

impl MatchRule for RedirectRule {
    fn key(&self) -> &str {
        &self.redirect_url
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

/// A resolved redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Absolute `Location` value
    pub location: String,

    /// Status code to send
    pub status: StatusCode,
}

/// Persisted redirect rule table
#[derive(Debug)]
pub struct RedirectTable {
    store: RecordStore,
    index: RuleIndex<RedirectRule>,
    admin: Mutex<()>,
}

impl RedirectTable {
    /// Open a table backed by `dir`, loading every stored rule
    pub fn open(dir: impl Into<PathBuf>, allow_regex: bool) -> Result<Self> {
        let mode = if allow_regex {
            MatchMode::Regex
        } else {
            MatchMode::Literal
        };
        let table = Self {
            store: RecordStore::open(dir)?,
            index: RuleIndex::new(mode),
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
        let records: Vec<(String, RedirectRule)> = self.store.load_all()?;

        let rules = records.into_iter().filter_map(|(file, rule)| {
            if let Err(e) = rule.validate() {
                tracing::warn!(
                    category = "redirect",
                    file = %file,
                    error = %e,
                    "Ignoring invalid redirect rule"
                );
                return None;
            }
            if escape_filename(&rule.redirect_url) != file {
                tracing::warn!(
                    category = "redirect",
                    file = %file,
                    key = %rule.redirect_url,
                    "Ignoring redirect rule stored under a foreign record name"
                );
                return None;
            }
            tracing::debug!(
                category = "redirect",
                from = %rule.redirect_url,
                to = %rule.target_url,
                "Redirection rule loaded"
            );
            Some((rule.redirect_url.clone(), rule))
        });

        let count = self.index.replace_all(rules);
        tracing::info!(category = "redirect", rules = count, "Redirection rules loaded");
        Ok(count)
    }

    /// Add a rule with the default flags
    pub fn add_rule(
        &self,
        key: &str,
        target_url: &str,
        forward_child_path: bool,
        status_code: u16,
        exact_match: bool,
    ) -> Result<Arc<RedirectRule>> {
        self.insert(RedirectRule::new(
            key,
            target_url,
            forward_child_path,
            status_code,
            exact_match,
        ))
    }

    /// Persist and index a fully specified rule
    pub fn insert(&self, rule: RedirectRule) -> Result<Arc<RedirectRule>> {
        let _guard = self.admin.lock();
        self.insert_locked(rule)
    }

    /// Replace `old_key` with `rule`.
    ///
    /// The old rule is removed first. If adding the new one fails the old
    /// rule stays removed.
    pub fn edit_rule(&self, old_key: &str, rule: RedirectRule) -> Result<Arc<RedirectRule>> {
        let _guard = self.admin.lock();
        self.delete_locked(old_key)?;
        self.insert_locked(rule)
    }

    /// Delete a rule. Deleting an absent rule succeeds.
    pub fn delete_rule(&self, key: &str) -> Result<()> {
        let _guard = self.admin.lock();
        self.delete_locked(key)
    }

    fn insert_locked(&self, rule: RedirectRule) -> Result<Arc<RedirectRule>> {
        rule.validate()?;
        let key = rule.redirect_url.clone();
        if self.index.contains(&key) {
            return Err(Error::DuplicateRule(key));
        }

        // Distinct keys can escape to the same record name
        let name = escape_filename(&key);
        if self.store.exists(&name) {
            return Err(Error::DuplicateRule(format!(
                "{key} (record '{name}' already exists)"
            )));
        }

        self.store.write(&name, &rule)?;
        let added = match self.index.try_insert(key, rule) {
            Ok(added) => added,
            Err(e) => {
                self.store.remove(&name)?;
                return Err(e);
            }
        };

        tracing::info!(
            category = "redirect",
            from = %added.redirect_url,
            to = %added.target_url,
            status = added.status_code,
            "Redirection rule added"
        );
        Ok(added)
    }

    fn delete_locked(&self, key: &str) -> Result<()> {
        let name = escape_filename(key);
        let owned = self
            .store
            .read::<RedirectRule>(&name)?
            .map_or(false, |stored| stored.redirect_url == key);

        if owned {
            self.store.remove(&name)?;
        }
        if self.index.remove(key).is_some() || owned {
            tracing::info!(category = "redirect", key = %key, "Redirection rule removed");
        }
        Ok(())
    }

    /// Rule stored under `key`
    pub fn get_rule(&self, key: &str) -> Option<Arc<RedirectRule>> {
        self.index.get(key)
    }

    /// All rules in registration order
    pub fn get_all_rules(&self) -> Vec<Arc<RedirectRule>> {
        self.index.snapshot()
    }

    /// Whether any rule applies to `req`
    pub fn is_redirectable<B>(&self, req: &Request<B>) -> bool {
        self.lookup(req).is_some()
    }

    /// Compute the redirect for `req`
    pub fn resolve<B>(&self, req: &Request<B>) -> Result<Redirect> {
        let (rule, remainder) = self
            .lookup(req)
            .ok_or_else(|| Error::NoMatchingRule(req.uri().to_string()))?;

        let mut location = rule.target_url.clone();
        if rule.forward_child_path {
            if location.ends_with('/') {
                location.push_str(remainder.trim_start_matches('/'));
            } else {
                location.push_str(&remainder);
            }
            if let Some(query) = req.uri().query().filter(|q| !q.is_empty()) {
                location.push('?');
                location.push_str(query);
            }
        }

        if !location.starts_with("http://") && !location.starts_with("https://") {
            location = format!("http://{location}");
        }

        let status = StatusCode::from_u16(rule.status_code)
            .map_err(|e| Error::Internal(format!("stored redirect status: {e}")))?;

        Ok(Redirect { location, status })
    }

    /// Build the redirect response for `req`.
    ///
    /// Callers must check [`is_redirectable`](Self::is_redirectable) first;
    /// an unmatched request gets a 500.
    pub fn handle_redirect<B>(&self, req: &Request<B>) -> Result<Response<Body>> {
        match self.resolve(req) {
            Ok(redirect) => responses::redirect(redirect.status, &redirect.location),
            Err(e @ Error::NoMatchingRule(_)) => {
                tracing::error!(
                    category = "redirect",
                    uri = %req.uri(),
                    error = %e,
                    "Redirect handling invoked for a request without a matching rule"
                );
                responses::internal_error("500 - Internal Server Error")
            }
            Err(e) => Err(e),
        }
    }

    fn lookup<B>(&self, req: &Request<B>) -> Option<(Arc<RedirectRule>, String)> {
        let path = req.uri().path();
        let host = request_host(req);
        let host_path = format!("{host}{path}");
        let user_agent = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok());

        let matched = self.index.best_match(|rule| {
            if !rule.required_device.admits(user_agent) {
                return None;
            }
            if rule.is_path_only() {
                Some(path)
            } else {
                Some(host_path.as_str())
            }
        })?;

        let candidate = if matched.rule.is_path_only() {
            path
        } else {
            host_path.as_str()
        };
        let remainder = candidate
            .get(matched.remainder_at..)
            .unwrap_or_default()
            .to_string();
        Some((matched.rule, remainder))
    }
}

/// Host of a request, from the URI authority or the `Host` header, without port
fn request_host<B>(req: &Request<B>) -> String {
    let host = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string())
        })
        .unwrap_or_default();
    host.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;
    use tempfile::TempDir;

    fn request(uri: &str) -> Request<()> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "gateway.local")
            .body(())
            .unwrap()
    }

    fn table(temp: &TempDir) -> RedirectTable {
        RedirectTable::open(temp.path().join("redirect"), false).unwrap()
    }

    #[test]
    fn test_forward_child_path_with_query() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .add_rule("/old", "https://new.example", true, 302, false)
            .unwrap();

        let req = request("/old/page?x=1");
        assert!(table.is_redirectable(&req));
        let redirect = table.resolve(&req).unwrap();
        assert_eq!(redirect.location, "https://new.example/page?x=1");
        assert_eq!(redirect.status, StatusCode::FOUND);
    }

    #[test]
    fn test_target_trailing_slash_is_not_doubled() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .add_rule("/docs", "https://docs.example/", true, 301, false)
            .unwrap();

        let redirect = table.resolve(&request("/docs/intro")).unwrap();
        assert_eq!(redirect.location, "https://docs.example/intro");
    }

    #[test]
    fn test_scheme_is_added_and_query_dropped_without_child_path() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .add_rule("/go", "elsewhere.example/landing", false, 307, false)
            .unwrap();

        let redirect = table.resolve(&request("/go/deeper?a=b")).unwrap();
        assert_eq!(redirect.location, "http://elsewhere.example/landing");
        assert_eq!(redirect.status, StatusCode::TEMPORARY_REDIRECT);
    }

    #[test]
    fn test_host_scoped_key() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .add_rule("gateway.local/blog", "https://blog.example", true, 302, false)
            .unwrap();

        let redirect = table.resolve(&request("/blog/post-1")).unwrap();
        assert_eq!(redirect.location, "https://blog.example/post-1");

        let other = Request::builder()
            .uri("/blog/post-1")
            .header(header::HOST, "other.local:8080")
            .body(())
            .unwrap();
        assert!(!table.is_redirectable(&other));
    }

    #[test]
    fn test_longest_key_wins() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table.add_rule("/a", "https://short", false, 302, false).unwrap();
        table
            .add_rule("/a/b", "https://long", false, 302, false)
            .unwrap();

        let redirect = table.resolve(&request("/a/b/c")).unwrap();
        assert_eq!(redirect.location, "https://long");
    }

    #[test]
    fn test_exact_match() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .add_rule("/login", "https://sso.example", false, 302, true)
            .unwrap();

        assert!(table.is_redirectable(&request("/login")));
        assert!(table.is_redirectable(&request("/login/")));
        assert!(!table.is_redirectable(&request("/login/extra")));
    }

    #[test]
    fn test_duplicate_and_invalid_status_rejected() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table.add_rule("/x", "https://x", false, 302, false).unwrap();

        let dup = table.add_rule("/x", "https://y", false, 302, false);
        assert!(matches!(dup, Err(Error::DuplicateRule(_))));
        assert_eq!(table.get_rule("/x").unwrap().target_url, "https://x");

        let bad = table.add_rule("/y", "https://y", false, 200, false);
        assert!(matches!(bad, Err(Error::Config(_))));
        assert!(table.get_rule("/y").is_none());
    }

    #[test]
    fn test_edit_removes_old_even_when_new_fails() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table.add_rule("/a", "https://a", false, 302, false).unwrap();
        table.add_rule("/b", "https://b", false, 302, false).unwrap();

        // The new key collides with an existing rule
        let result = table.edit_rule("/a", RedirectRule::new("/b", "https://c", false, 302, false));
        assert!(matches!(result, Err(Error::DuplicateRule(_))));
        assert!(table.get_rule("/a").is_none());
        assert!(!temp.path().join("redirect").join("-a.json").exists());
        assert_eq!(table.get_rule("/b").unwrap().target_url, "https://b");
    }

    #[test]
    fn test_edit_replaces_rule() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table.add_rule("/a", "https://a", false, 302, false).unwrap();
        table
            .edit_rule("/a", RedirectRule::new("/z", "https://z", false, 301, false))
            .unwrap();

        assert!(table.get_rule("/a").is_none());
        assert_eq!(table.get_rule("/z").unwrap().status_code, 301);
    }

    #[test]
    fn test_delete_absent_rule_succeeds() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table.delete_rule("/never-added").unwrap();

        table.add_rule("/a", "https://a", false, 302, false).unwrap();
        table.delete_rule("/a").unwrap();
        assert!(!table.is_redirectable(&request("/a")));
        assert!(table.get_all_rules().is_empty());
    }

    #[test]
    fn test_reload_reproduces_index() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("redirect");
        {
            let table = RedirectTable::open(&dir, false).unwrap();
            table.add_rule("/one", "https://1", false, 302, false).unwrap();
            table.add_rule("/two", "https://2", true, 308, false).unwrap();
        }

        let table = RedirectTable::open(&dir, false).unwrap();
        assert_eq!(table.get_all_rules().len(), 2);
        assert_eq!(table.reload().unwrap(), 2);
        assert_eq!(table.reload().unwrap(), 2);
        assert_eq!(
            table.resolve(&request("/two/x")).unwrap().location,
            "https://2/x"
        );
    }

    #[test]
    fn test_device_scoping() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .insert(
                RedirectRule::new("/app", "https://m.example", false, 302, false)
                    .with_required_device(RequiredDevice::Mobile),
            )
            .unwrap();

        let phone = Request::builder()
            .uri("/app")
            .header(header::USER_AGENT, "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)")
            .body(())
            .unwrap();
        let desktop = Request::builder()
            .uri("/app")
            .header(header::USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64)")
            .body(())
            .unwrap();

        assert!(table.is_redirectable(&phone));
        assert!(!table.is_redirectable(&desktop));
    }

    #[test]
    fn test_regex_mode() {
        let temp = TempDir::new().unwrap();
        let table = RedirectTable::open(temp.path().join("re"), true).unwrap();
        table
            .add_rule("^/v[0-9]+", "https://api.example", true, 302, false)
            .unwrap();

        let redirect = table.resolve(&request("/v2/users")).unwrap();
        assert_eq!(redirect.location, "https://api.example/users");
        assert!(!table.is_redirectable(&request("/vx/users")));
    }

    #[test]
    fn test_keys_sharing_a_record_name_are_rejected() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("redirect");
        let table = RedirectTable::open(&dir, false).unwrap();
        table.add_rule("/a.b", "https://dot", false, 302, false).unwrap();

        let clash = table.add_rule("/a_b", "https://underscore", false, 302, false);
        assert!(matches!(clash, Err(Error::DuplicateRule(_))));
        assert!(table.get_rule("/a_b").is_none());

        // Deleting the rejected key must not touch the stored rule
        table.delete_rule("/a_b").unwrap();
        assert!(dir.join("-a_b.json").exists());

        let reopened = RedirectTable::open(&dir, false).unwrap();
        let keys: Vec<_> = reopened
            .get_all_rules()
            .iter()
            .map(|r| r.redirect_url.clone())
            .collect();
        assert_eq!(keys, vec!["/a.b"]);
        assert_eq!(reopened.resolve(&request("/a.b")).unwrap().location, "https://dot");
    }

    #[test]
    fn test_reload_never_exposes_an_empty_table() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let temp = TempDir::new().unwrap();
        let table = Arc::new(table(&temp));
        for i in 0..30 {
            table
                .add_rule(&format!("/filler{i}"), "https://f", false, 302, false)
                .unwrap();
        }
        table.add_rule("/old", "https://new", false, 302, false).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reloader = {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    table.reload().unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let req = request("/old/page");
        let mut misses = 0;
        while !done.load(Ordering::SeqCst) {
            if !table.is_redirectable(&req) {
                misses += 1;
            }
        }
        reloader.join().unwrap();

        assert_eq!(misses, 0);
        assert_eq!(table.get_all_rules().len(), 31);
    }

    #[tokio::test]
    async fn test_handle_redirect_without_rule_is_500() {
        use http_body_util::BodyExt;

        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        let response = table.handle_redirect(&request("/nothing")).unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"500 - Internal Server Error");
    }

    #[test]
    fn test_handle_redirect_sets_location() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        table
            .add_rule("/old", "https://new.example", true, 302, false)
            .unwrap();

        let response = table.handle_redirect(&request("/old/page?x=1")).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://new.example/page?x=1"
        );
    }
}
