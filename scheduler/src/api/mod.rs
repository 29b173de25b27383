/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! REST surface over the stores and the release operations.

mod route;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::cache::StateCache;
use crate::store::InstanceStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InstanceStore>,
    pub cache: Option<Arc<StateCache>>,
}

/// Serve the HTTP API until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = route::router(state).layer(cors);

    info!("http api listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Map a store outcome onto an API response.
pub(crate) fn status(result: common::Result<()>) -> Response {
    match result {
        Ok(()) => (StatusCode::OK, Json(String::from("Ok"))).into_response(),
        Err(common::StoreError::AlreadyExists(key)) => {
            (StatusCode::CONFLICT, Json(format!("already exists: {}", key))).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response(),
    }
}
