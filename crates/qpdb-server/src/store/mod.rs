//! Local PDB store backed by a remote symbol archive.

pub mod cache;
pub mod symserver;

pub use cache::SymbolStore;
pub use symserver::{Fetch, HttpArchive};
