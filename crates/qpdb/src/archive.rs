//! Symbol archive path convention.
//!
//! PDBs are stored under `{pdb_name}/{GUID}{age}/{pdb_name}`:
//! - GUID: uppercase hex, no dashes (or the 8-char NB10 signature)
//! - age: uppercase hex, no padding, appended directly to the GUID
//!
//! The same relative path is the local cache key and the remote URL suffix, so
//! it must stay byte-compatible with Microsoft-style symbol servers.

use crate::error::{QpdbError, QpdbResult};
use crate::identity::DebugIdentity;

/// Relative archive path for an identity.
pub fn relative_path(identity: &DebugIdentity) -> String {
    format!(
        "{}/{}{:X}/{}",
        identity.file_name, identity.unique_id, identity.age, identity.file_name
    )
}

/// Full download URL: `{base}/{relative_path}` with exactly one separator.
pub fn download_url(base: &str, identity: &DebugIdentity) -> String {
    format!("{}/{}", base.trim_end_matches('/'), relative_path(identity))
}

/// Reject identities whose fields cannot be used as single path components.
///
/// Identities arrive from request bodies, so the name must not climb out of
/// the cache root and the GUID must be plain uppercase hex. A lowercase GUID
/// would name a second cache entry for the same PDB.
pub fn check_components(identity: &DebugIdentity) -> QpdbResult<()> {
    if !identity.is_valid() {
        return Err(QpdbError::InvalidIdentity);
    }
    let name = identity.file_name.as_str();
    if name == "." || name == ".." || name.contains(|c: char| matches!(c, '/' | '\\' | ':' | '\0')) {
        return Err(QpdbError::UnsafePath(name.to_string()));
    }
    if !identity
        .unique_id
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
    {
        return Err(QpdbError::UnsafePath(identity.unique_id.clone()));
    }
    Ok(())
}
