//! HTTP API served next to the station WebSocket.
//!
//! Every JSON body has the shape `{"success": true, "data": ...}` on success
//! and `{"success": false, "error": "..."}` on failure. Mutating routes go
//! through the [`EventRouter`] so connected stations see the same events a
//! WebSocket request would produce.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use protocol::CreateTicket;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::broker::PrintJobBroker;
use crate::clock::{iso8601, Clock};
use crate::hub::RealtimeHub;
use crate::reset::{DailyResetEngine, ResetError};
use crate::router::{EventRouter, RouterError};
use crate::socket;
use crate::store::{ParseStatusError, PrintStatus, Store, StoreError, TicketFilter, TicketStatus};

/// Shared handles for every request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub reset: Arc<DailyResetEngine>,
    pub hub: Arc<RealtimeHub>,
    pub broker: Arc<PrintJobBroker>,
    pub router: Arc<EventRouter>,
    pub clock: Arc<dyn Clock>,
    pub server_name: String,
    pub started_at: DateTime<Utc>,
    /// Cancelled when the server stops; station sockets close with it.
    pub shutdown: CancellationToken,
}

/// Build the router for the API and the WebSocket upgrade.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(root))
        .route("/health", get(health))
        .route("/api", get(index))
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/services", get(list_services))
        .route("/api/services/{id}", get(get_service))
        .route("/api/windows", get(list_windows))
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route("/api/tickets/{id}", get(get_ticket))
        .route("/api/tickets/{id}/print-status", put(update_print_status))
        .route("/api/reset/status", get(reset_status))
        .route("/api/reset/history", get(reset_history))
        .route("/api/reset/force", post(force_reset))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error response with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found", what))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::ServiceNotFound(_) | StoreError::WindowNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidPrintTransition { .. }
            | StoreError::InvalidStatusTransition { .. }
            | StoreError::ResetConflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ResetError> for ApiError {
    fn from(e: ResetError) -> Self {
        match e {
            ResetError::Store(e) => e.into(),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Store(e) => e.into(),
            RouterError::Reset(e) => e.into(),
            RouterError::NotFound(what) => Self::not_found(what),
            RouterError::Payload(_) | RouterError::InvalidRequest(_) => {
                Self::new(StatusCode::BAD_REQUEST, e.to_string())
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<ParseStatusError> for ApiError {
    fn from(e: ParseStatusError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

type ApiResult = Result<Response, ApiError>;

fn ok<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn ok_list<T: Serialize>(items: Vec<T>) -> Response {
    Json(json!({ "success": true, "count": items.len(), "data": items })).into_response()
}

// =============================================================================
// Root and Health
// =============================================================================

/// `GET /` and `GET /ws`
///
/// Upgrades stations to the realtime socket; plain requests get a summary.
async fn root(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| socket::run_station(socket, peer, state)),
        Err(_) => Json(json!({
            "name": state.server_name,
            "version": env!("CARGO_PKG_VERSION"),
            "status": "running",
            "timestamp": iso8601(state.clock.now()),
        }))
        .into_response(),
    }
}

/// `GET /health` and `GET /api/health`
async fn health(State(state): State<AppState>) -> Response {
    let now = state.clock.now();
    let database = state.store.health_check();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "success": database,
        "status": if database { "OK" } else { "DEGRADED" },
        "server": state.server_name,
        "timestamp": iso8601(now),
        "uptime": (now - state.started_at).num_seconds().max(0),
        "services": {
            "database": if database { "connected" } else { "unavailable" },
            "socket": if state.hub.is_initialized() { "active" } else { "inactive" },
            "connections": state.hub.connection_count(),
        },
    }));
    (status, body).into_response()
}

/// `GET /api`
async fn index(State(state): State<AppState>) -> Response {
    Json(json!({
        "name": state.server_name,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/api/health",
            "services": "/api/services",
            "windows": "/api/windows",
            "tickets": "/api/tickets",
            "reset": "/api/reset/status",
            "stats": "/api/stats",
            "socket": "/ws",
        },
    }))
    .into_response()
}

/// `GET /api/stats`
async fn stats(State(state): State<AppState>) -> ApiResult {
    Ok(ok(json!({
        "database": state.store.stats()?,
        "connections": state.hub.connection_stats(),
        "print": state.broker.statistics(),
    })))
}

// =============================================================================
// Services and Windows
// =============================================================================

/// `GET /api/services`
async fn list_services(State(state): State<AppState>) -> ApiResult {
    Ok(ok_list(state.store.list_services()?))
}

/// `GET /api/services/{id}`
async fn get_service(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let service = state
        .store
        .get_service(id)?
        .ok_or_else(|| ApiError::not_found(format!("service {}", id)))?;
    Ok(ok(service))
}

/// `GET /api/windows`
async fn list_windows(State(state): State<AppState>) -> ApiResult {
    Ok(ok_list(state.store.list_windows()?))
}

// =============================================================================
// Tickets
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketQuery {
    service_id: Option<i64>,
    status: Option<String>,
}

/// `GET /api/tickets?serviceId=&status=`
async fn list_tickets(
    State(state): State<AppState>,
    Query(query): Query<TicketQuery>,
) -> ApiResult {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TicketStatus>)
        .transpose()?;
    let tickets = state.store.list_tickets(TicketFilter {
        service_id: query.service_id,
        status,
    })?;
    Ok(ok_list(tickets))
}

/// `POST /api/tickets`
async fn create_ticket(
    State(state): State<AppState>,
    Json(request): Json<CreateTicket>,
) -> ApiResult {
    let ticket = state.router.create_ticket(&request)?;
    Ok((StatusCode::CREATED, ok(ticket)).into_response())
}

/// `GET /api/tickets/{id}`
async fn get_ticket(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let ticket = state
        .store
        .get_ticket(id)?
        .ok_or_else(|| ApiError::not_found(format!("ticket {}", id)))?;
    Ok(ok(ticket))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrintStatusBody {
    #[serde(alias = "print_status")]
    print_status: String,
}

/// `PUT /api/tickets/{id}/print-status`
async fn update_print_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<PrintStatusBody>,
) -> ApiResult {
    let status: PrintStatus = body.print_status.parse()?;
    if !state.router.update_print_status(id, status)? {
        return Err(ApiError::not_found(format!("ticket {}", id)));
    }
    let ticket = state
        .store
        .get_ticket(id)?
        .ok_or_else(|| ApiError::not_found(format!("ticket {}", id)))?;
    Ok(ok(ticket))
}

// =============================================================================
// Daily Reset
// =============================================================================

/// `GET /api/reset/status`
async fn reset_status(State(state): State<AppState>) -> ApiResult {
    Ok(ok(state.reset.status()?))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

/// `GET /api/reset/history?limit=`
async fn reset_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult {
    Ok(ok_list(state.reset.history(params.limit)?))
}

/// `POST /api/reset/force`
async fn force_reset(State(state): State<AppState>) -> ApiResult {
    let report = state.router.force_reset("http")?;
    Ok(ok(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DateZone, ManualClock};
    use crate::hub::TransportBinding;
    use crate::store::{NewService, StoreOptions};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        _dir: TempDir,
    }

    fn create_test_state() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap(),
        ));
        let store = Arc::new(
            Store::open(dir.path().join("queue.db"), StoreOptions::default(), clock.clone())
                .unwrap(),
        );
        let reset = Arc::new(DailyResetEngine::new(
            Arc::clone(&store),
            clock.clone(),
            DateZone::Utc,
        ));
        let hub = Arc::new(RealtimeHub::new(clock.clone()));
        hub.initialize(TransportBinding::in_process());
        let broker = Arc::new(PrintJobBroker::new(Arc::clone(&hub), clock.clone()));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&store),
            Arc::clone(&reset),
            Arc::clone(&hub),
            Arc::clone(&broker),
        ));
        let state = AppState {
            store,
            reset,
            hub,
            broker,
            router,
            started_at: clock.now(),
            clock,
            server_name: "Test Coordinator".to_string(),
            shutdown: CancellationToken::new(),
        };
        Fixture { state, _dir: dir }
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = routes(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send_json(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let f = create_test_state();
        for uri in ["/health", "/api/health"] {
            let (status, body) = call(&f.state, get(uri)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "OK");
            assert_eq!(body["services"]["database"], "connected");
            assert_eq!(body["server"], "Test Coordinator");
        }
    }

    #[tokio::test]
    async fn test_list_and_get_services() {
        let f = create_test_state();
        let visa = f.state.store.create_service(&NewService::active("Visa")).unwrap();

        let (status, body) = call(&f.state, get("/api/services")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["name"], "Visa");

        let (status, body) = call(&f.state, get(&format!("/api/services/{}", visa.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], visa.id);

        let (status, body) = call(&f.state, get("/api/services/999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_create_and_get_ticket() {
        let f = create_test_state();
        let visa = f.state.store.create_service(&NewService::active("Visa")).unwrap();
        let mut station = f.state.hub.connect(None).unwrap();

        let (status, body) = call(
            &f.state,
            send_json("POST", "/api/tickets", json!({ "serviceId": visa.id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["ticket_number"], "1");
        assert_eq!(body["data"]["print_status"], "pending");

        // Stations hear about tickets created over HTTP.
        let created = station.events.try_recv().unwrap();
        assert_eq!(created.event, protocol::events::TICKET_CREATED);

        let (status, body) = call(&f.state, get("/api/tickets/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["service_name"], "Visa");

        let (status, _) = call(&f.state, get("/api/tickets/42")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_ticket_unknown_service() {
        let f = create_test_state();
        let (status, body) = call(
            &f.state,
            send_json("POST", "/api/tickets", json!({ "serviceId": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_list_tickets_filtered() {
        let f = create_test_state();
        let visa = f.state.store.create_service(&NewService::active("Visa")).unwrap();
        let cash = f.state.store.create_service(&NewService::active("Cash")).unwrap();
        f.state.store.create_ticket(visa.id, None).unwrap();
        f.state.store.create_ticket(cash.id, None).unwrap();
        f.state.store.create_ticket(visa.id, None).unwrap();

        let (_, body) = call(&f.state, get("/api/tickets")).await;
        assert_eq!(body["count"], 3);

        let (_, body) = call(&f.state, get(&format!("/api/tickets?serviceId={}", visa.id))).await;
        assert_eq!(body["count"], 2);

        let (status, _) = call(&f.state, get("/api/tickets?status=lost")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_print_status() {
        let f = create_test_state();
        let visa = f.state.store.create_service(&NewService::active("Visa")).unwrap();
        let ticket = f.state.store.create_ticket(visa.id, None).unwrap();
        let uri = format!("/api/tickets/{}/print-status", ticket.id);

        let (status, body) = call(
            &f.state,
            send_json("PUT", &uri, json!({ "print_status": "printed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["print_status"], "printed");

        // Backward moves are refused.
        let (status, _) = call(
            &f.state,
            send_json("PUT", &uri, json!({ "printStatus": "pending" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &f.state,
            send_json("PUT", &uri, json!({ "printStatus": "shredded" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &f.state,
            send_json(
                "PUT",
                "/api/tickets/99/print-status",
                json!({ "printStatus": "printed" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_routes() {
        let f = create_test_state();
        let visa = f.state.store.create_service(&NewService::active("Visa")).unwrap();
        f.state.store.create_ticket(visa.id, None).unwrap();
        f.state.store.create_ticket(visa.id, None).unwrap();

        let (status, body) = call(&f.state, get("/api/reset/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["today"], "2026-10-18");
        assert_eq!(body["data"]["needsReset"], true);

        let mut station = f.state.hub.connect(None).unwrap();
        let (status, body) = call(&f.state, send_json("POST", "/api/reset/force", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["success"], true);
        assert_eq!(body["data"]["ticketsCleared"], 2);

        let completed = station.events.try_recv().unwrap();
        assert_eq!(completed.event, protocol::events::RESET_COMPLETED);
        assert_eq!(completed.data["manual"], true);

        let (_, body) = call(&f.state, get("/api/tickets")).await;
        assert_eq!(body["count"], 0);

        let (status, body) = call(&f.state, get("/api/reset/history?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["lastResetDate"], "2026-10-18");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let f = create_test_state();
        let (status, _) = call(&f.state, get("/api/nothing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
