use crate::core::ChannelEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use livetv_proto::protocol::{ActiveShow, ChannelState, Command};
use livetv_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<ChannelEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<ChannelEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, router(state_manager, event_tx)).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<ChannelEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/now-playing", get(now_playing))
        .route("/api/toggle-pause", post(toggle_pause))
        .route("/api/fullscreen", post(toggle_fullscreen))
        .route("/api/retry", post(retry))
        .layer(CorsLayer::permissive())
        .with_state(HttpState {
            state_manager,
            event_tx,
        })
}

async fn get_state(State(state): State<HttpState>) -> Json<ChannelState> {
    Json(state.state_manager.get_state().await)
}

/// `null` when nothing is on air.
async fn now_playing(State(state): State<HttpState>) -> Json<Option<ActiveShow>> {
    Json(state.state_manager.now_playing().await)
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(ChannelEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command to channel core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn toggle_pause(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::TogglePause).await
}

async fn toggle_fullscreen(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::ToggleFullscreen).await
}

async fn retry(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::RetrySchedule).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetv_proto::protocol::PlaybackPhase;

    async fn spawn_api() -> (String, Arc<StateManager>, mpsc::Receiver<ChannelEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state_manager = Arc::new(StateManager::new());
        let (event_tx, event_rx) = mpsc::channel(8);
        let app = router(state_manager.clone(), event_tx);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state_manager, event_rx)
    }

    #[tokio::test]
    async fn test_state_and_now_playing() {
        let (base, sm, _rx) = spawn_api().await;
        sm.set_phase(PlaybackPhase::Loading).await;

        let state: ChannelState = reqwest::get(format!("{}/api/state", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state.phase, PlaybackPhase::Loading);
        assert_eq!(state.rev, 2);

        let resp = reqwest::get(format!("{}/api/now-playing", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "null");
    }

    #[tokio::test]
    async fn test_post_routes_forward_commands() {
        let (base, _sm, mut rx) = spawn_api().await;
        let client = reqwest::Client::new();

        for (path, expected) in [
            ("toggle-pause", Command::TogglePause),
            ("fullscreen", Command::ToggleFullscreen),
            ("retry", Command::RetrySchedule),
        ] {
            let resp = client
                .post(format!("{}/api/{}", base, path))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
            match rx.recv().await {
                Some(ChannelEvent::ClientCommand(cmd)) => assert_eq!(cmd, expected),
                other => panic!("expected a command, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_cors_is_permissive() {
        let (base, _sm, _rx) = spawn_api().await;
        let resp = reqwest::Client::new()
            .get(format!("{}/api/state", base))
            .header("Origin", "http://example.test")
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }
}
