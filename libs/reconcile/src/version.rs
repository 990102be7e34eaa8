//! Semantic version ordering for release tags.
//!
//! Release tags are usually written with a leading `v` (`v5.12.3`), which is
//! stripped before parsing.

use semver::Version;

use crate::ReconcileError;

/// Parse a release tag such as `v1.2.3` or `1.2.3-beta.1`.
pub fn parse_version(input: &str) -> Result<Version, ReconcileError> {
    let trimmed = input.trim();
    let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);

    Version::parse(raw).map_err(|e| ReconcileError::InvalidVersion {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Returns true if `a` orders strictly before `b`.
pub fn less_than(a: &str, b: &str) -> Result<bool, ReconcileError> {
    Ok(parse_version(a)? < parse_version(b)?)
}
