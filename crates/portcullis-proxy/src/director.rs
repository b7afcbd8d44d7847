//! Request rewriting toward the upstream target

use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::Uri;
use portcullis_core::{Error, Result};

/// Join two paths with exactly one slash between them
pub fn join_url_path(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');

    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Join two raw query strings with `&` when both are present
pub fn join_query(target: &str, request: &str) -> String {
    if target.is_empty() || request.is_empty() {
        format!("{target}{request}")
    } else {
        format!("{target}&{request}")
    }
}

/// Rewrites a request's URI to point at a fixed upstream
#[derive(Debug, Clone)]
pub struct Director {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: String,
}

impl Director {
    /// Build a director for an absolute `http://` target
    pub fn new(target: &Uri) -> Result<Self> {
        let scheme = target
            .scheme()
            .cloned()
            .ok_or_else(|| Error::config(format!("upstream target '{target}' has no scheme")))?;
        if scheme != Scheme::HTTP {
            return Err(Error::config(format!(
                "upstream target '{target}' must use http"
            )));
        }
        let authority = target
            .authority()
            .cloned()
            .ok_or_else(|| Error::config(format!("upstream target '{target}' has no host")))?;

        Ok(Self {
            scheme,
            authority,
            base_path: target.path().to_string(),
            base_query: target.query().unwrap_or_default().to_string(),
        })
    }

    /// Parse and build
    pub fn parse(target: &str) -> Result<Self> {
        let uri: Uri = target
            .parse()
            .map_err(|e| Error::config(format!("invalid upstream target '{target}': {e}")))?;
        Self::new(&uri)
    }

    /// Upstream host and port
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Path prefix of the target
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Compute the upstream URI for an inbound one
    pub fn rewrite(&self, inbound: &Uri) -> Result<Uri> {
        let path = join_url_path(&self.base_path, inbound.path());
        let query = join_query(&self.base_query, inbound.query().unwrap_or_default());

        let path_and_query = if query.is_empty() {
            path
        } else {
            format!("{path}?{query}")
        };
        let path_and_query = PathAndQuery::try_from(path_and_query)
            .map_err(|e| Error::InvalidRequest(format!("rewritten path: {e}")))?;

        Ok(Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?)
    }

    /// Rewrite the request head in place
    pub fn direct(&self, parts: &mut Parts) -> Result<()> {
        parts.uri = self.rewrite(&parts.uri)?;
        Ok(())
    }
}
