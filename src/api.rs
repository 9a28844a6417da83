use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use proto::{Ack, CloseRequest, DataChannelDefinition, OpenResponse, PeerInfo, UpdateRequest};
use serde_json::json;
use tokio::net::TcpListener;

use crate::{
    bus::{Bus, BusError},
    config::Config,
};

struct ApiState {
    config: Arc<Config>,
    bus: Bus,
    uptime: Instant,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn status_of(error: &BusError) -> StatusCode {
    match error {
        BusError::Auth(_) => StatusCode::UNAUTHORIZED,
        BusError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        // Domain failures travel inside the envelope.
        BusError::Rib(_) => StatusCode::OK,
    }
}

fn ack(result: Result<(), BusError>) -> Response {
    match result {
        Ok(()) => Json(Ack::ok()).into_response(),
        Err(e) => (status_of(&e), Json(Ack::error(&e))).into_response(),
    }
}

/// start http server
///
/// One server carries both surfaces: the operator API under `/network` and
/// `/channels`, and the peer-facing protocol under `/protocol`. Authorization
/// happens per call inside the scoped clients, so exposure is uniform.
pub async fn start_server(config: Arc<Config>, bus: Bus) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        config: config.clone(),
        uptime: Instant::now(),
        bus,
    });

    let app = Router::new()
        .route(
            "/info",
            get(|State(state): State<Arc<ApiState>>| async move {
                let snapshot = state.bus.snapshot();
                Json(json!({
                    "software": crate::SOFTWARE,
                    "uptime": state.uptime.elapsed().as_secs(),
                    "node": state.bus.node_info(),
                    "peers": snapshot.table.peers.len(),
                    "local_routes": snapshot.table.local.len(),
                    "internal_routes": snapshot.table.internal.len(),
                    "port_capacity": state
                        .config
                        .envoy
                        .as_ref()
                        .map(|e| e.port_range.iter().map(|r| r.size()).sum::<usize>())
                        .unwrap_or(0),
                    "port_allocated": snapshot.allocations.len(),
                }))
            }),
        )
        .route(
            "/network/peers",
            get(
                |State(state): State<Arc<ApiState>>, headers: HeaderMap| async move {
                    match state.bus.network_client(bearer(&headers)).list_peers().await {
                        Ok(peers) => Json(peers).into_response(),
                        Err(e) => (status_of(&e), Json(Ack::error(&e))).into_response(),
                    }
                },
            )
            .post(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(peer): Json<PeerInfo>| async move {
                    ack(state.bus.network_client(bearer(&headers)).add_peer(peer).await)
                },
            )
            .put(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(peer): Json<PeerInfo>| async move {
                    ack(state.bus.network_client(bearer(&headers)).update_peer(peer).await)
                },
            ),
        )
        .route(
            "/network/peers/{name}",
            axum::routing::delete(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Path(name): Path<String>| async move {
                    ack(state.bus.network_client(bearer(&headers)).remove_peer(&name).await)
                },
            ),
        )
        .route(
            "/channels",
            get(
                |State(state): State<Arc<ApiState>>, headers: HeaderMap| async move {
                    match state.bus.data_channel(bearer(&headers)).list_routes().await {
                        Ok(routes) => Json(routes).into_response(),
                        Err(e) => (status_of(&e), Json(Ack::error(&e))).into_response(),
                    }
                },
            )
            .post(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(channel): Json<DataChannelDefinition>| async move {
                    ack(state.bus.data_channel(bearer(&headers)).add_route(channel).await)
                },
            )
            .delete(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(channel): Json<DataChannelDefinition>| async move {
                    ack(state.bus.data_channel(bearer(&headers)).remove_route(channel).await)
                },
            ),
        )
        .route(
            "/protocol/open",
            post(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(peer): Json<PeerInfo>| async move {
                    match state.bus.ibgp_client(bearer(&headers)).open(peer).await {
                        Ok(node) => Json(OpenResponse {
                            ok: true,
                            peer: Some(node),
                            error: None,
                        })
                        .into_response(),
                        Err(e) => (
                            status_of(&e),
                            Json(OpenResponse {
                                ok: false,
                                peer: None,
                                error: Some(e.to_string()),
                            }),
                        )
                            .into_response(),
                    }
                },
            ),
        )
        .route(
            "/protocol/close",
            post(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(request): Json<CloseRequest>| async move {
                    ack(state
                        .bus
                        .ibgp_client(bearer(&headers))
                        .close(request.peer, request.code, request.reason)
                        .await)
                },
            ),
        )
        .route(
            "/protocol/update",
            post(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(request): Json<UpdateRequest>| async move {
                    ack(state
                        .bus
                        .ibgp_client(bearer(&headers))
                        .update(request.peer, request.message)
                        .await)
                },
            ),
        )
        .route(
            "/protocol/keepalive",
            post(
                |State(state): State<Arc<ApiState>>,
                 headers: HeaderMap,
                 Json(peer): Json<PeerInfo>| async move {
                    ack(state.bus.ibgp_client(bearer(&headers)).keepalive(peer).await)
                },
            ),
        );

    let listener = TcpListener::bind(config.api.listen).await?;

    log::info!("api server listening={:?}", &config.api.listen);

    axum::serve(listener, app.with_state(state)).await?;
    Ok(())
}
