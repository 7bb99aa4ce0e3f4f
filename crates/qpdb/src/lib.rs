//! Remote PDB offset resolution.
//!
//! This crate identifies a PE module by the CodeView record in its debug
//! directory and answers name-based queries against the matching PDB:
//!
//! - Extraction of the `(pdb name, GUID/signature, age)` identity from PE32/PE32+ images
//! - The symbol-server path convention `{name}/{GUID}{AGE}/{name}`
//! - Symbol address, struct field offset (including bitfields) and enum value
//!   resolution from a PDB's global symbol and TPI streams
//! - A blocking client for the HTTP query service
//!
//! # Example
//!
//! ```rust,ignore
//! use qpdb::{DebugIdentity, PdbFile};
//!
//! let identity = DebugIdentity::from_file(r"C:\Windows\System32\ntoskrnl.exe")?;
//! let path = cache_root.join(qpdb::archive::relative_path(&identity));
//! let mut pdb = PdbFile::open(path)?;
//! let fields = pdb.resolve_structs(&query)?;
//! ```

pub mod archive;
pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-fixtures"))]
#[doc(hidden)]
pub mod fixture;
pub mod identity;
pub mod pdbfile;
pub mod records;
pub mod resolve;
pub mod types;

// Re-export key types at crate root.
pub use client::QueryClient;
pub use error::{QpdbError, QpdbResult};
pub use identity::DebugIdentity;
pub use pdbfile::PdbFile;
pub use types::{EnumMap, FieldInfo, NestedQuery, NestedRequest, StructMap, SymbolMap, SymbolRequest};
