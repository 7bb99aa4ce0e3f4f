//! HTTP query service.
//!
//! | Route          | Request body                              | Response                          |
//! |----------------|-------------------------------------------|-----------------------------------|
//! | `POST /symbol` | identity + `query: [name]`                | `{name: rva}`                     |
//! | `POST /struct` | identity + `query: {struct: [field]}`     | `{struct: {field: [off, bitoff]}}` |
//! | `POST /enum`   | identity + `query: {enum: [enumerator]}`  | `{enum: {enumerator: value}}`     |

pub mod error;
pub mod routes;

use crate::store::SymbolStore;
use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SymbolStore>,
}

pub fn router(store: Arc<SymbolStore>) -> Router {
    Router::new()
        .route("/symbol", post(routes::symbol))
        .route("/struct", post(routes::structs))
        .route("/enum", post(routes::enums))
        .with_state(AppState { store })
}

/// Serve until Ctrl-C.
pub async fn serve(listener: TcpListener, store: Arc<SymbolStore>) -> anyhow::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await?;
    Ok(())
}
