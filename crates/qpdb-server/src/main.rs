//! qpdb-server: resolve symbol addresses, struct field offsets and enum values
//! from PDB files over HTTP.
//!
//! PDBs are fetched on first use from a Microsoft-style symbol server and kept
//! in a local cache laid out like the server itself.

mod config;
mod logging;
mod server;
mod store;

use anyhow::Context;
use clap::Parser;
use config::{Args, Settings};
use std::sync::Arc;
use store::{HttpArchive, SymbolStore};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args(Args::parse())?;
    logging::init_logging(settings.log_file.as_deref())?;

    tracing::info!("qpdb-server starting...");

    std::fs::create_dir_all(&settings.cache_dir).with_context(|| {
        format!("creating cache directory {}", settings.cache_dir.display())
    })?;

    let archive = Arc::new(HttpArchive::new(settings.symbol_server.clone()));
    let store = Arc::new(SymbolStore::new(settings.cache_dir.clone(), archive.clone()));
    tracing::info!(
        "Symbol server: {}, cache: {}",
        archive.base(),
        store.root().display()
    );

    let listener = TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("binding {}", settings.bind))?;

    server::serve(listener, store)
        .await
        .inspect_err(|e| tracing::error!("Server error: {}", e))?;

    tracing::info!("qpdb-server shutting down");
    Ok(())
}
