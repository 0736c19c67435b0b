//! Game HTTP surface
//!
//! `/get_game` and `/make_move` are thin wrappers over the engine;
//! `/ws` attaches a WebSocket observer to the fan-out dispatcher and pushes
//! every update of one match as a JSON text frame.

use crate::engine::MatchStateEngine;
use crate::error::EngineError;
use crate::fanout::DispatcherHandle;
use crate::store::StoreError;
use crate::types::{MatchView, UpdateEvent};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Game server configuration
#[derive(Debug, Clone)]
pub struct GameServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for GameServerConfig {
    fn default() -> Self {
        Self {
            port: 8082,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state of the game routes
#[derive(Clone)]
pub struct GameApiState {
    pub engine: Arc<MatchStateEngine>,
    pub dispatcher: DispatcherHandle,
}

#[derive(Debug, Default, Deserialize)]
struct MatchParams {
    mid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MoveParams {
    mid: Option<String>,
    row: Option<String>,
    col: Option<String>,
    number: Option<String>,
}

/// Routes of the game surface
pub fn router(state: GameApiState) -> Router {
    Router::new()
        .route("/get_game", get(get_game_handler))
        .route("/make_move", get(make_move_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// HTTP server for the game surface
pub struct GameServer {
    config: GameServerConfig,
    state: GameApiState,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    pub fn new(config: GameServerConfig, state: GameApiState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    /// Serve until `stop` is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid game server address")?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind game server to {}", addr))?;
        info!("Game server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Game server shutdown signal received");
            })
            .await?;

        info!("Game server stopped");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to game server: {}", e);
        }
        Ok(())
    }
}

async fn get_game_handler(
    State(state): State<GameApiState>,
    Query(params): Query<MatchParams>,
) -> Response {
    let Some(mid) = non_empty(params.mid) else {
        return bad_request("missing mid");
    };

    if let Err(e) = state.engine.ensure_match(&mid).await {
        return error_response(&e);
    }
    match state.engine.get_match(&mid).await {
        Ok(Some(record)) => with_cors(Json(MatchView::from_record(&mid, &record))),
        Ok(None) => error_response(&EngineError::MatchNotFound { mid }.into()),
        Err(e) => error_response(&e),
    }
}

async fn make_move_handler(
    State(state): State<GameApiState>,
    Query(params): Query<MoveParams>,
) -> Response {
    let Some(mid) = non_empty(params.mid) else {
        return bad_request("missing mid");
    };
    let (Some(row), Some(col)) = (parse_index(params.row), parse_index(params.col)) else {
        return bad_request("row and col must be integers");
    };
    // Only the first character of `number` is the digit
    let Some(value) = params.number.as_deref().and_then(|n| n.chars().next()) else {
        return bad_request("missing number");
    };

    match state.engine.make_move(&mid, row, col, value).await {
        Ok(outcome) => {
            debug!("Move ({}, {}) = {} on {}: {:?}", row, col, value, mid, outcome);
            with_cors(Json(json!({ "status": "OK" })))
        }
        Err(e) => error_response(&e),
    }
}

async fn ws_handler(
    State(state): State<GameApiState>,
    Query(params): Query<MatchParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(mid) = non_empty(params.mid) else {
        return bad_request("missing mid");
    };
    ws.on_upgrade(move |socket| observe(socket, state.dispatcher, mid))
}

/// Serve one observer connection until either side goes away
async fn observe(socket: WebSocket, dispatcher: DispatcherHandle, mid: String) {
    let (id, updates) = match dispatcher.register(&mid).await {
        Ok(registration) => registration,
        Err(e) => {
            error!("Failed to register observer for {}: {}", mid, e);
            return;
        }
    };
    info!("Observer {} attached to match {}", id, mid);

    let (sink, mut incoming) = socket.split();
    let closed = async {
        while let Some(Ok(frame)) = incoming.next().await {
            if matches!(frame, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        result = forward_updates(sink, updates) => {
            if let Err(e) = result {
                debug!("Observer {} of {} stopped: {}", id, mid, e);
            }
        }
        _ = closed => debug!("Observer {} of {} disconnected", id, mid),
    }

    if let Err(e) = dispatcher.unregister(&mid, id).await {
        debug!("Failed to unregister observer {}: {}", id, e);
    }
    info!("Observer {} detached from match {}", id, mid);
}

/// Write every update as a JSON text frame, in arrival order
async fn forward_updates<S>(mut sink: S, mut updates: mpsc::Receiver<UpdateEvent>) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(update) = updates.recv().await {
        let payload = update.to_json()?;
        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send failed: {}", e))?;
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_index(value: Option<String>) -> Option<usize> {
    value.and_then(|v| v.trim().parse().ok())
}

fn with_cors(response: impl IntoResponse) -> Response {
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], response).into_response()
}

fn bad_request(message: &str) -> Response {
    with_cors((StatusCode::BAD_REQUEST, Json(json!({ "error": message }))))
}

/// Status code for an engine or store failure
fn status_for(err: &anyhow::Error) -> StatusCode {
    if let Some(engine_error) = err.downcast_ref::<EngineError>() {
        return match engine_error {
            EngineError::InvalidMove { .. } => StatusCode::BAD_REQUEST,
            EngineError::MatchNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    if err
        .downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_conflict)
    {
        return StatusCode::CONFLICT;
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

fn error_response(err: &anyhow::Error) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Request failed: {:#}", err);
    }
    with_cors((status, Json(json!({ "error": err.to_string() }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::fanout::FanoutDispatcher;
    use crate::puzzle::grid::tests::SOLVED;
    use crate::puzzle::provider::MockPuzzleProvider;
    use crate::puzzle::{Grid, Mask};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::BTreeMap;
    use tower::ServiceExt; // for oneshot

    fn app(store: &MemoryStore) -> Router {
        let mut puzzles = MockPuzzleProvider::new();
        puzzles
            .expect_generate_solution()
            .returning(|| Grid::parse(SOLVED).unwrap());
        puzzles.expect_minimal_mask().returning(|_| {
            let mut mask = Mask::full();
            mask.set(0, 0, false);
            mask
        });
        let engine = MatchStateEngine::new(
            Arc::new(store.clone()),
            Arc::new(puzzles),
            &EngineSettings::default(),
        );
        let (_updates, updates_rx) = mpsc::channel(4);
        let (_dispatcher, handle) = FanoutDispatcher::new(updates_rx, 4);

        router(GameApiState {
            engine: Arc::new(engine),
            dispatcher: handle,
        })
    }

    async fn call(app: Router, uri: &str) -> (StatusCode, Response) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_get_game_creates_match() {
        let store = MemoryStore::new();
        let (status, response) = call(app(&store), "/get_game?mid=g1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
        let body = json_body(response).await;
        assert_eq!(body["Mid"], "g1");
        assert_eq!(body["Game"]["puzzle"], body["Game"]["original"]);
        assert_eq!(body["Game"]["state"], "");
    }

    #[tokio::test]
    async fn test_make_move_reports_ok() {
        let store = MemoryStore::new();
        let app = app(&store);
        call(app.clone(), "/get_game?mid=g1").await;

        let digit = Grid::parse(SOLVED).unwrap().get(0, 0).unwrap();
        let uri = format!("/make_move?mid=g1&row=0&col=0&number={}", digit);
        let (status, response) = call(app.clone(), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "OK" }));

        let (_, response) = call(app, "/get_game?mid=g1").await;
        assert_eq!(json_body(response).await["Game"]["state"], "ENDED");
    }

    #[tokio::test]
    async fn test_make_move_rejects_bad_input() {
        let store = MemoryStore::new();
        let app = app(&store);

        for uri in [
            "/make_move?row=0&col=0&number=1",
            "/make_move?mid=g1&row=x&col=0&number=1",
            "/make_move?mid=g1&row=0&col=0",
            "/make_move?mid=g1&row=9&col=0&number=1",
            "/make_move?mid=g1&row=0&col=0&number=0",
        ] {
            let (status, _) = call(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_make_move_on_unknown_match() {
        let store = MemoryStore::new();
        let (status, response) = call(app(&store), "/make_move?mid=nope&row=0&col=0&number=1").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .contains("nope"));
    }

    #[tokio::test]
    async fn test_store_outage_is_server_error() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let (status, _) = call(app(&store), "/get_game?mid=g1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_mapping() {
        let conflict: anyhow::Error = EngineError::Conflict {
            mid: "g1".to_string(),
            attempts: 2,
        }
        .into();
        assert_eq!(status_for(&conflict), StatusCode::CONFLICT);

        let lost_race: anyhow::Error = StoreError::TxConflict {
            key: "sudoku-engine:g1-{0}".to_string(),
        }
        .into();
        assert_eq!(status_for(&lost_race), StatusCode::CONFLICT);

        let store: anyhow::Error = StoreError::Connection {
            message: "refused".to_string(),
        }
        .into();
        assert_eq!(status_for(&store), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_forward_updates_as_text_frames() {
        let (frames_tx, mut frames_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (updates_tx, updates_rx) = mpsc::channel(4);

        let event = UpdateEvent::new(
            "g1",
            BTreeMap::from([("state".to_string(), String::new())]),
        );
        updates_tx.send(event.clone()).await.unwrap();
        drop(updates_tx);

        forward_updates(frames_tx, updates_rx).await.unwrap();

        match frames_rx.next().await {
            Some(Message::Text(text)) => {
                assert_eq!(UpdateEvent::from_json(text.as_str()).unwrap(), event);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(frames_rx.next().await.is_none());
    }
}
