//! HTTP facade over the session ledger
//!
//! Thin JSON layer for the surrounding collaborators: facility admin, entry
//! and exit terminals, and the payment service reporting settlements. Also
//! serves /metrics and /health. Uses hyper for the HTTP server.

use crate::domain::{
    Charge, ChargeId, Exit, Facility, FacilityId, LedgerError, LedgerResult, NewFacility, SessionId,
    SpotId, VehicleId,
};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::{format_prometheus_metrics, PROMETHEUS_CONTENT_TYPE};
use crate::services::ledger::{SessionLedger, Settlement};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Request bodies above this size are rejected
const MAX_BODY_BYTES: usize = 64 * 1024;

const JSON: &str = "application/json";

/// Shared handles for request handlers
pub struct ApiState {
    pub ledger: Arc<SessionLedger>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
}

#[derive(Serialize)]
struct FacilityView {
    #[serde(flatten)]
    facility: Facility,
    free_spots: u32,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

#[derive(Serialize)]
struct CloseView {
    exit: Exit,
    charge: Charge,
}

#[derive(Deserialize)]
struct NewSpotRequest {
    number: String,
}

#[derive(Deserialize)]
struct OpenSessionRequest {
    spot_id: SpotId,
    vehicle_id: VehicleId,
}

#[derive(Deserialize)]
struct CloseSessionRequest {
    payment_method: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum SettleStatus {
    Settled,
    Failed,
}

#[derive(Deserialize)]
struct SettleRequest {
    status: SettleStatus,
}

/// HTTP status for a ledger error
pub fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::Conflict(_) => StatusCode::CONFLICT,
        LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        LedgerError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, JSON, body),
        Err(e) => {
            error!(error = %e, "api_encode_failed");
            response(
                StatusCode::INTERNAL_SERVER_ERROR,
                JSON,
                r#"{"error":"encode_failed","message":"response encoding failed"}"#,
            )
        }
    }
}

fn error_response(err: &LedgerError) -> Response<Full<Bytes>> {
    json(status_for(err), &ErrorBody { error: err.kind(), message: err.to_string() })
}

fn reply<T: Serialize>(status: StatusCode, result: LedgerResult<T>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => json(status, &value),
        Err(e) => error_response(&e),
    }
}

fn parse_id<T: FromStr>(raw: &str, entity: &str) -> LedgerResult<T> {
    raw.parse().map_err(|_| LedgerError::InvalidInput(format!("malformed {entity} id {raw:?}")))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> LedgerResult<T> {
    serde_json::from_slice(body).map_err(|e| LedgerError::InvalidInput(format!("bad request body: {e}")))
}

fn facility_view(ledger: &SessionLedger, facility: Facility) -> LedgerResult<FacilityView> {
    let free_spots = ledger.free_spot_count(facility.id)?;
    Ok(FacilityView { facility, free_spots })
}

/// Dispatch one request. Bodies are already collected.
pub fn route(state: &ApiState, method: &Method, path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    let ledger = state.ledger.as_ref();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => response(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, ["metrics"]) => response(
            StatusCode::OK,
            PROMETHEUS_CONTENT_TYPE,
            format_prometheus_metrics(&state.metrics, &state.site_id),
        ),

        (&Method::GET, ["facilities"]) => {
            let views: LedgerResult<Vec<FacilityView>> =
                ledger.facilities().into_iter().map(|f| facility_view(ledger, f)).collect();
            reply(StatusCode::OK, views)
        }
        (&Method::POST, ["facilities"]) => {
            let result = parse_body::<NewFacility>(body)
                .and_then(|input| ledger.register_facility(input))
                .and_then(|facility| facility_view(ledger, facility));
            reply(StatusCode::CREATED, result)
        }
        (&Method::GET, ["facilities", id]) => {
            let result = parse_id::<FacilityId>(id, "facility")
                .and_then(|id| ledger.facility(id))
                .and_then(|facility| facility_view(ledger, facility));
            reply(StatusCode::OK, result)
        }
        (&Method::GET, ["facilities", id, "spots"]) => {
            let result = parse_id::<FacilityId>(id, "facility").and_then(|id| ledger.spots(id));
            reply(StatusCode::OK, result)
        }
        (&Method::POST, ["facilities", id, "spots"]) => {
            let result = parse_id::<FacilityId>(id, "facility").and_then(|id| {
                let req: NewSpotRequest = parse_body(body)?;
                ledger.add_spot(id, &req.number)
            });
            reply(StatusCode::CREATED, result)
        }

        (&Method::POST, ["sessions"]) => {
            let result = parse_body::<OpenSessionRequest>(body)
                .and_then(|req| ledger.open_session(req.spot_id, req.vehicle_id));
            reply(StatusCode::CREATED, result)
        }
        (&Method::GET, ["sessions", id]) => {
            let result = parse_id::<SessionId>(id, "session").and_then(|id| ledger.session(id));
            reply(StatusCode::OK, result)
        }
        (&Method::POST, ["sessions", id, "close"]) => {
            let result = parse_id::<SessionId>(id, "session").and_then(|id| {
                let req: CloseSessionRequest = parse_body(body)?;
                if req.payment_method.trim().is_empty() {
                    return Err(LedgerError::InvalidInput("payment_method is empty".to_string()));
                }
                let (exit, charge) = ledger.close_session(id, &req.payment_method)?;
                Ok(CloseView { exit, charge })
            });
            reply(StatusCode::CREATED, result)
        }

        (&Method::GET, ["charges", id]) => {
            let result = parse_id::<ChargeId>(id, "charge").and_then(|id| ledger.charge(id));
            reply(StatusCode::OK, result)
        }
        (&Method::POST, ["charges", id, "settle"]) => {
            let result = parse_id::<ChargeId>(id, "charge").and_then(|id| {
                let req: SettleRequest = parse_body(body)?;
                let outcome = match req.status {
                    SettleStatus::Settled => Settlement::Settled,
                    SettleStatus::Failed => Settlement::Failed,
                };
                ledger.settle_charge(id, outcome)
            });
            reply(StatusCode::OK, result)
        }

        _ => json(
            StatusCode::NOT_FOUND,
            &ErrorBody { error: "not_found", message: format!("no route for {method} {path}") },
        ),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(method = %method, path = %path, error = %e, "api_body_rejected");
            return Ok(error_response(&LedgerError::InvalidInput(format!(
                "request body unreadable or larger than {MAX_BODY_BYTES} bytes"
            ))));
        }
    };

    let resp = route(&state, &method, &path, &body);
    debug!(method = %method, path = %path, status = %resp.status().as_u16(), "api_request");
    Ok(resp)
}

/// Start the HTTP facade
pub async fn start_api_server(
    port: u16,
    state: Arc<ApiState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %state.site_id, "api_server_started");
    serve_api(listener, state, shutdown).await;
    Ok(())
}

/// Serve the facade on an already bound listener until shutdown
pub async fn serve_api(listener: TcpListener, state: Arc<ApiState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return;
                }
            }
        }
    }
}
