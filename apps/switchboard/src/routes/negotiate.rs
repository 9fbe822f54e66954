//! Transport negotiation: which kinds a client should try, in order.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use switchboard_common::id::{prefix, prefixed_ulid};

use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::probe::{capability_flags, capability_header, NegotiationProbe, ServerCapabilities};
use crate::gateway::transport::TransportKind;
use crate::AppState;

/// Ordered list of usable transport kinds, e.g. `websocket,longpoll`.
pub const CAPABILITIES_HEADER: &str = "x-transport-capabilities";

pub fn router() -> Router<AppState> {
    Router::new().route("/negotiate", get(negotiate))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct NegotiateQuery {
    /// Client id from an earlier negotiation; a fresh one is issued if absent.
    pub client: Option<String>,
    /// Comma-separated kinds the client can speak. All kinds if absent.
    pub transports: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NegotiateResponse {
    pub client_id: String,
    /// Usable kinds, most preferred first.
    pub transports: Vec<TransportKind>,
    /// One flag per known kind.
    pub capabilities: BTreeMap<String, bool>,
    /// Whether the answer came from the negotiation cache.
    pub cached: bool,
}

// ---------------------------------------------------------------------------
// GET /negotiate
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/negotiate",
    tag = "Negotiation",
    params(NegotiateQuery),
    responses(
        (status = 200, description = "Usable transports in preference order", body = NegotiateResponse),
        (status = 406, description = "No usable transport", body = ApiErrorBody),
    ),
)]
pub async fn negotiate(
    State(state): State<AppState>,
    Query(query): Query<NegotiateQuery>,
) -> Result<(HeaderMap, Json<NegotiateResponse>), ApiError> {
    let client_id = query
        .client
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| prefixed_ulid(prefix::CLIENT));

    let declared = query.transports.as_deref().map(TransportKind::parse_list);

    // A restated capability list always probes again.
    let cached = match declared {
        None => state.negotiation.get(&client_id),
        Some(_) => None,
    };

    let (transports, cached) = match cached {
        Some(transports) => (transports, true),
        None => {
            let prober = ServerCapabilities::new(&state, declared);
            let probe = NegotiationProbe::new(state.config.probe_timeout);
            let usable = probe
                .negotiate(&prober, &TransportKind::PREFERENCE)
                .await
                .map_err(|e| {
                    state.diagnostics.record(&e);
                    e
                })?;
            state.negotiation.insert(&client_id, usable.clone());
            (usable, false)
        }
    };

    tracing::debug!(
        client_id = %client_id,
        transports = %capability_header(&transports),
        cached,
        "negotiated"
    );

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&capability_header(&transports)) {
        headers.insert(CAPABILITIES_HEADER, value);
    }

    Ok((
        headers,
        Json(NegotiateResponse {
            client_id,
            capabilities: capability_flags(&transports),
            transports,
            cached,
        }),
    ))
}
