//! Fallback transport endpoints and realtime stats
//!
//! Clients that cannot hold a WebSocket open either a server-push stream or a
//! polling registration. Both join the same rooms a WebSocket client would.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    Json,
};
use forkcast_realtime::{
    fallback::FallbackTransportManager, EntityId, EventEnvelope, PollBatch, PollingTicket,
    RealtimeStats,
};
use forkcast_shared::{ConnectionId, Identity, UserId};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    auth,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    token: Option<String>,
    order_id: Option<EntityId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRegistration {
    pub user_id: UserId,
    pub client_id: String,
    /// Requested poll interval in milliseconds
    pub interval: Option<u64>,
    #[serde(default)]
    pub order_ids: Vec<EntityId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Resolve the caller's identity from a bearer header or `token` query parameter
async fn caller(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> ApiResult<Identity> {
    let Some(credential) = auth::credential(headers, query_token) else {
        return Err(ApiError::Unauthorized);
    };
    Ok(state.hub.gateway().verify(Some(credential)).await?)
}

/// Only the registration's owner (or an admin) may read or remove it
fn ensure_owner(identity: &Identity, user_id: &UserId) -> ApiResult<()> {
    if &identity.user_id == user_id || identity.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Unregisters the stream once axum drops the response body
struct StreamGuard {
    fallback: FallbackTransportManager,
    connection_id: ConnectionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let fallback = self.fallback.clone();
        let connection_id = self.connection_id;
        runtime.spawn(async move {
            if fallback.unregister_stream(connection_id).await {
                tracing::info!(connection_id = %connection_id, "Event stream closed by client");
            }
        });
    }
}

/// GET /realtime/stream
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let identity = caller(&state, &headers, query.token.as_deref()).await?;
    let subscription = state
        .hub
        .fallback()
        .register_stream(identity, query.order_id)
        .await?;

    let guard = StreamGuard {
        fallback: state.hub.fallback().clone(),
        connection_id: subscription.connection_id,
    };
    let events = ReceiverStream::new(subscription.receiver).map(move |envelope: Arc<EventEnvelope>| {
        let _guard = &guard;
        Event::default()
            .event(envelope.event_type.as_str())
            .json_data(envelope.as_ref())
    });

    Ok(Sse::new(events))
}

/// POST /realtime/poll
pub async fn register_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PollRegistration>,
) -> ApiResult<Json<PollingTicket>> {
    let identity = caller(&state, &headers, None).await?;
    if identity.user_id != body.user_id {
        return Err(ApiError::Forbidden);
    }

    let ticket = state
        .hub
        .fallback()
        .register_polling(&identity, &body.client_id, body.interval, body.order_ids)
        .await?;
    Ok(Json(ticket))
}

/// GET /realtime/poll/:user_id/:client_id
pub async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, client_id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<PollBatch>> {
    let identity = caller(&state, &headers, query.token.as_deref()).await?;
    let user_id = UserId::new(user_id);
    ensure_owner(&identity, &user_id)?;

    Ok(Json(state.hub.fallback().poll(&user_id, &client_id)?))
}

/// DELETE /realtime/poll/:user_id/:client_id
pub async fn unregister_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, client_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let identity = caller(&state, &headers, None).await?;
    let user_id = UserId::new(user_id);
    ensure_owner(&identity, &user_id)?;

    if state
        .hub
        .fallback()
        .unregister_polling(&user_id, &client_id)
        .await
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// GET /realtime/stats
pub async fn stats(State(state): State<AppState>) -> Json<RealtimeStats> {
    Json(state.hub.stats().await)
}
