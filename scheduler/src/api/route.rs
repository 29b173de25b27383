/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Route handlers for formations, releases and instances.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;

use common::spec::{Formation, Instance, Release};

use crate::release::ReleaseCtl;
use crate::store::{FormationStore, InstanceWriter, ReleaseStore};

use super::{status, AppState};

/// Upper bound on steps a single scale/migrate request may drive.
const MAX_STEPS: usize = 200;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/formation", get(list_formations).post(create_formation))
        .route(
            "/formation/:name",
            get(get_formation).delete(delete_formation),
        )
        .route("/formation/:name/instances", get(list_instances))
        .route("/release", post(create_release))
        .route("/release/:formation", get(list_releases))
        .route("/release/:formation/:name", get(get_release))
        .route("/release/:formation/:name/scale", post(scale_release))
        .route("/release/:formation/:name/migrate", post(migrate_release))
        .route(
            "/instance/:formation/:name",
            get(get_instance).delete(delete_instance),
        )
        .route(
            "/instance/:formation/:name/observed",
            get(observed_instance_state),
        )
        .with_state(state)
}

async fn list_formations(State(_state): State<AppState>) -> Response {
    match FormationStore::list().await {
        Ok(formations) => Json(formations).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response(),
    }
}

async fn create_formation(
    State(_state): State<AppState>,
    Json(formation): Json<Formation>,
) -> Response {
    status(FormationStore::create(&formation).await)
}

async fn get_formation(State(_state): State<AppState>, Path(name): Path<String>) -> Response {
    match FormationStore::get(&name).await {
        Ok(Some(formation)) => Json(formation).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response(),
    }
}

async fn delete_formation(State(_state): State<AppState>, Path(name): Path<String>) -> Response {
    status(FormationStore::delete(&name).await)
}

async fn list_instances(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    Json(state.store.query_formation(&name).await).into_response()
}

async fn create_release(State(_state): State<AppState>, Json(release): Json<Release>) -> Response {
    status(ReleaseStore::create(&release).await)
}

async fn list_releases(State(_state): State<AppState>, Path(formation): Path<String>) -> Response {
    match ReleaseStore::index(&formation).await {
        Ok(releases) => Json(releases).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response(),
    }
}

async fn get_release(
    State(_state): State<AppState>,
    Path((formation, name)): Path<(String, String)>,
) -> Response {
    match ReleaseStore::get(&formation, &name).await {
        Ok(Some(release)) => Json(release).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response(),
    }
}

/// Drive the scale operation until balanced, one bounded step at a
/// time over a locally maintained view of the formation.
async fn scale_release(
    State(state): State<AppState>,
    Path((formation, name)): Path<(String, String)>,
    Json(scales): Json<BTreeMap<String, u32>>,
) -> Response {
    let release = match ReleaseStore::get(&formation, &name).await {
        Ok(Some(release)) => release,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response()
        }
    };

    let ctl = ReleaseCtl::new(release);
    let mut view = state.store.query_formation(&formation).await;
    let mut steps = 0;
    loop {
        if steps >= MAX_STEPS {
            warn!(formation = %formation, release = %name, "scale stopped after {MAX_STEPS} steps");
            break;
        }
        match ctl.scale(&view, state.store.as_ref(), &scales).await {
            Ok(Some(inst)) => {
                upsert(&mut view, inst);
                steps += 1;
            }
            Ok(None) => break,
            Err(err) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response()
            }
        }
    }
    Json(json!({ "steps": steps })).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    from_release: Option<String>,
}

/// Drive the migration until every eligible instance is on the target
/// release.
async fn migrate_release(
    State(state): State<AppState>,
    Path((formation, name)): Path<(String, String)>,
    Json(request): Json<MigrateRequest>,
) -> Response {
    let release = match ReleaseStore::get(&formation, &name).await {
        Ok(Some(release)) => release,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response()
        }
    };

    let ctl = ReleaseCtl::new(release);
    let from = request.from_release.as_deref();
    let mut view = state.store.query_formation(&formation).await;
    let mut steps = 0;
    loop {
        if steps >= MAX_STEPS {
            warn!(formation = %formation, release = %name, "migrate stopped after {MAX_STEPS} steps");
            break;
        }
        match ctl.migrate(&view, state.store.as_ref(), from).await {
            Ok(Some(inst)) => {
                upsert(&mut view, inst);
                steps += 1;
            }
            Ok(None) => break,
            Err(err) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(err.to_string())).into_response()
            }
        }
    }
    Json(json!({ "steps": steps })).into_response()
}

async fn get_instance(
    State(state): State<AppState>,
    Path((formation, name)): Path<(String, String)>,
) -> Response {
    match state.store.get_by_name(&formation, &name).await {
        Some(inst) => Json(inst).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Remove an instance record. This is also the operator's lever for
/// clearing `lost` instances.
async fn delete_instance(
    State(state): State<AppState>,
    Path((formation, name)): Path<(String, String)>,
) -> Response {
    match state.store.get_by_name(&formation, &name).await {
        Some(inst) => status(state.store.delete(&inst).await),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Observed state as mirrored into the state cache.
async fn observed_instance_state(
    State(state): State<AppState>,
    Path((formation, name)): Path<(String, String)>,
) -> Response {
    let Some((service, instance)) = name.split_once('.') else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match &state.cache {
        Some(cache) => Json(cache.lookup(&formation, service, instance).await).into_response(),
        None => Json(json!({})).into_response(),
    }
}

fn upsert(view: &mut Vec<Instance>, inst: Instance) {
    if let Some(slot) = view.iter_mut().find(|existing| existing.name == inst.name) {
        *slot = inst;
    } else {
        view.push(inst);
    }
}
