//! Query endpoints.
//!
//! Each handler makes sure the PDB is cached, opens it, and runs the query on
//! the blocking pool; PDB decoding never runs on the async workers. Names that
//! do not resolve are left out of the response rather than failing it.

use super::error::ApiError;
use super::AppState;
use axum::extract::State;
use axum::Json;
use qpdb::{
    DebugIdentity, EnumMap, NestedRequest, PdbFile, QpdbResult, StructMap, SymbolMap,
    SymbolRequest,
};
use tracing::info;

pub async fn symbol(
    State(state): State<AppState>,
    Json(request): Json<SymbolRequest>,
) -> Result<Json<SymbolMap>, ApiError> {
    info!(
        "symbol: {} ({} names)",
        describe(&request.identity),
        request.query.len()
    );
    let query = request.query;
    let found = run_query(state, request.identity, move |pdb| pdb.resolve_symbols(&query)).await?;
    Ok(Json(found))
}

pub async fn structs(
    State(state): State<AppState>,
    Json(request): Json<NestedRequest>,
) -> Result<Json<StructMap>, ApiError> {
    info!(
        "struct: {} ({} types)",
        describe(&request.identity),
        request.query.len()
    );
    let query = request.query;
    let found = run_query(state, request.identity, move |pdb| pdb.resolve_structs(&query)).await?;
    Ok(Json(found))
}

pub async fn enums(
    State(state): State<AppState>,
    Json(request): Json<NestedRequest>,
) -> Result<Json<EnumMap>, ApiError> {
    info!(
        "enum: {} ({} types)",
        describe(&request.identity),
        request.query.len()
    );
    let query = request.query;
    let found = run_query(state, request.identity, move |pdb| pdb.resolve_enums(&query)).await?;
    Ok(Json(found))
}

fn describe(identity: &DebugIdentity) -> String {
    format!(
        "{} {}{:X}",
        identity.file_name, identity.unique_id, identity.age
    )
}

async fn run_query<T, F>(state: AppState, identity: DebugIdentity, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut PdbFile) -> QpdbResult<T> + Send + 'static,
{
    let store = state.store;
    tokio::task::spawn_blocking(move || {
        let path = store.ensure_local(&identity)?;
        let mut pdb = PdbFile::open(&path)?;
        query(&mut pdb)
    })
    .await
    .map_err(|e| ApiError::Worker(e.to_string()))?
    .map_err(ApiError::from)
}
