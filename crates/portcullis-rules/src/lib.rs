//! # Portcullis Rules
//!
//! Rule tables consulted before a request is forwarded:
//! - Generic longest-match rule index with exact, prefix and regex modes
//! - Redirection table with device scoping and child-path forwarding
//! - Path-block table producing verbatim block responses
//! - One-JSON-file-per-rule persistence
//!
//! Lookups are lock-free reads over `DashMap` entries, so request tasks can
//! match while an administrative caller edits a table.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod matcher;
pub mod pathblock;
pub mod redirect;
pub mod store;

pub use matcher::{MatchMode, MatchRule, RuleIndex, RuleMatch};
pub use pathblock::{BlockMatches, BlockingRule, PathBlockTable};
pub use redirect::{Redirect, RedirectRule, RedirectTable, RequiredDevice};
pub use store::{escape_filename, RecordStore};
