use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use button_proto::protocol::{ControllerState, HealthReply};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::client::PlaybackClient;
use crate::coordinator::PressCoordinator;
use crate::core::DaemonEvent;

struct HttpState<C> {
    coordinator: Arc<PressCoordinator<C>>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl<C> Clone for HttpState<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            event_tx: self.event_tx.clone(),
        }
    }
}

pub fn router<C: PlaybackClient + 'static>(
    coordinator: Arc<PressCoordinator<C>>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> Router {
    let app_state = HttpState {
        coordinator,
        event_tx,
    };

    Router::new()
        .route("/api/press/:pin", post(press::<C>))
        .route("/api/stop", post(stop_all::<C>))
        .route("/api/state", get(get_state::<C>))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server<C: PlaybackClient + 'static>(
    bind_address: String,
    port: u16,
    coordinator: Arc<PressCoordinator<C>>,
    event_tx: mpsc::Sender<DaemonEvent>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(coordinator, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP control API listening on http://{}", addr);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn press<C: PlaybackClient + 'static>(
    State(state): State<HttpState<C>>,
    Path(pin): Path<u32>,
) -> StatusCode {
    info!("HTTP API: press pin {}", pin);
    let event = DaemonEvent::Press {
        pin,
        source: "http",
    };
    if state.event_tx.send(event).await.is_err() {
        error!("Failed to send press event");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn stop_all<C: PlaybackClient + 'static>(State(state): State<HttpState<C>>) -> StatusCode {
    info!("HTTP API: stop all");
    if state.event_tx.send(DaemonEvent::StopAll).await.is_err() {
        error!("Failed to send stop event");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn get_state<C: PlaybackClient + 'static>(
    State(state): State<HttpState<C>>,
) -> Json<ControllerState> {
    Json(state.coordinator.snapshot())
}

async fn health() -> Json<HealthReply> {
    Json(HealthReply {
        status: "healthy".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::MockClient;
    use crate::registry::ButtonRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use button_proto::config::ButtonConfig;
    use tower::ServiceExt;

    fn setup() -> (
        Router,
        Arc<PressCoordinator<MockClient>>,
        mpsc::Receiver<DaemonEvent>,
    ) {
        let registry = ButtonRegistry::from_buttons([
            ButtonConfig {
                pin: 17,
                file: "/midi/a.mid".to_string(),
            },
            ButtonConfig {
                pin: 27,
                file: "/midi/b.mid".to_string(),
            },
        ]);
        let coordinator = Arc::new(PressCoordinator::new(Arc::new(MockClient::new()), registry));
        let (event_tx, event_rx) = mpsc::channel(8);
        (router(coordinator.clone(), event_tx), coordinator, event_rx)
    }

    fn post_to(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_press_forwards_event() {
        let (app, _coordinator, mut event_rx) = setup();

        let response = app.oneshot(post_to("/api/press/17")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            event_rx.try_recv().unwrap(),
            DaemonEvent::Press {
                pin: 17,
                source: "http"
            }
        );
    }

    #[tokio::test]
    async fn test_press_rejects_non_numeric_pin() {
        let (app, _coordinator, mut event_rx) = setup();

        let response = app.oneshot(post_to("/api/press/seventeen")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_forwards_event() {
        let (app, _coordinator, mut event_rx) = setup();

        let response = app.oneshot(post_to("/api/stop")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(event_rx.try_recv().unwrap(), DaemonEvent::StopAll);
    }

    #[tokio::test]
    async fn test_state_reports_playing_pins() {
        let (app, coordinator, _event_rx) = setup();
        coordinator.handle_press(27).await;

        let request = Request::builder()
            .uri("/api/state")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let state: ControllerState = serde_json::from_slice(&body).unwrap();
        assert_eq!(state.playing_pins, vec![27]);
        assert_eq!(state.buttons.len(), 2);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _coordinator, _event_rx) = setup();

        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: HealthReply = serde_json::from_slice(&body).unwrap();
        assert!(reply.is_healthy());
    }
}
