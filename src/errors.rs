//! # Error Taxonomy
//!
//! All fallible operations return `eyre::Result`. The error kinds that
//! callers dispatch on are carried as a typed [`Error`] at the root of the
//! report chain:
//!
//! | Kind | Meaning | Disposition |
//! |------|---------|-------------|
//! | `Corrupt` | checksum or structural violation | fatal at the transaction boundary; repair re-entry point |
//! | `Conflict` | commit-time read/write intersection | caller may retry the transaction |
//! | `Constraint` | unique index or schema violation | surfaced at the offending mutation |
//! | `Query` | parse failure or unsatisfiable plan | surfaced at plan time |
//! | `Runtime` | conversion failure or size limit | surfaced to the caller |
//! | `Cancelled` | interrupt flag raised mid-operation | surfaced to the caller |
//!
//! Failures inside `total`/`average` aggregate combiners are suppressed per
//! row; everything else unwinds to the transaction boundary.

use eyre::Report;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("corrupt: {0}")]
    Corrupt(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("query: {0}")]
    Query(String),
    #[error("runtime: {0}")]
    Runtime(String),
    #[error("operation cancelled")]
    Cancelled,
}

pub fn corrupt(msg: impl Into<String>) -> Report {
    Error::Corrupt(msg.into()).into()
}

pub fn conflict(msg: impl Into<String>) -> Report {
    Error::Conflict(msg.into()).into()
}

pub fn constraint(msg: impl Into<String>) -> Report {
    Error::Constraint(msg.into()).into()
}

pub fn query_error(msg: impl Into<String>) -> Report {
    Error::Query(msg.into()).into()
}

pub fn runtime(msg: impl Into<String>) -> Report {
    Error::Runtime(msg.into()).into()
}

pub fn is_conflict(report: &Report) -> bool {
    matches!(report.downcast_ref::<Error>(), Some(Error::Conflict(_)))
}

pub fn is_corrupt(report: &Report) -> bool {
    matches!(report.downcast_ref::<Error>(), Some(Error::Corrupt(_)))
}

pub fn is_cancelled(report: &Report) -> bool {
    matches!(report.downcast_ref::<Error>(), Some(Error::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_through_report() {
        let r = conflict("write overlap on t.k");
        assert!(is_conflict(&r));
        assert!(!is_corrupt(&r));

        let r = corrupt("bad checksum at 0x40");
        assert!(is_corrupt(&r));
        assert!(!is_conflict(&r));
    }
}
