/// Client for the Moppy playback HTTP API.
///
/// `PlaybackClient` is the seam the press coordinator talks through.  Every
/// method reports failure as `false` (or an empty `RemoteStatus`); transport
/// and decode errors are logged here and never reach the caller.
use std::time::Duration;

use async_trait::async_trait;
use button_proto::protocol::{CommandReply, HealthReply, LoadRequest, RemoteStatus};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("non-JSON response (HTTP {status}): {body}")]
    NotJson { status: u16, body: String },
}

#[async_trait]
pub trait PlaybackClient: Send + Sync {
    async fn load_song(&self, file_path: &str) -> bool;
    async fn play(&self) -> bool;
    async fn pause(&self) -> bool;
    async fn stop(&self) -> bool;
    async fn status(&self) -> RemoteStatus;
    async fn health_check(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct MoppyClient {
    client: Client,
    base_url: String,
}

impl MoppyClient {
    /// `timeout` bounds each request end to end; `None` leaves requests
    /// unbounded.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        if !is_json {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::NotJson {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// POST a command endpoint and report whether the service accepted it.
    async fn command(
        &self,
        op: &'static str,
        endpoint: &str,
        load: Option<LoadRequest<'_>>,
    ) -> bool {
        let url = self.url(endpoint);
        let mut request = self.client.post(&url);
        if let Some(body) = &load {
            request = request.json(body);
        }
        match self.fetch::<CommandReply>(request).await {
            Ok(reply) if reply.success => {
                debug!(op, "remote accepted command");
                true
            }
            Ok(reply) => {
                error!(op, reason = reply.reason(), "remote rejected command");
                false
            }
            Err(e) => {
                error!(op, "Request failed: POST {} - {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl PlaybackClient for MoppyClient {
    async fn load_song(&self, file_path: &str) -> bool {
        info!(file = file_path, "Loading song");
        let ok = self
            .command("load", "/api/load", Some(LoadRequest { file_path }))
            .await;
        if ok {
            info!(file = file_path, "Successfully loaded");
        }
        ok
    }

    async fn play(&self) -> bool {
        info!("Starting playback");
        self.command("play", "/api/play", None).await
    }

    async fn pause(&self) -> bool {
        info!("Pausing playback");
        self.command("pause", "/api/pause", None).await
    }

    async fn stop(&self) -> bool {
        info!("Stopping playback");
        self.command("stop", "/api/stop", None).await
    }

    async fn status(&self) -> RemoteStatus {
        let url = self.url("/api/status");
        match self.fetch::<RemoteStatus>(self.client.get(&url)).await {
            Ok(status) => {
                debug!(
                    file = %status.file_name,
                    playing = status.is_playing,
                    "remote status"
                );
                status
            }
            Err(e) => {
                error!("Error getting status: GET {} - {}", url, e);
                RemoteStatus::default()
            }
        }
    }

    async fn health_check(&self) -> bool {
        let url = self.url("/api/health");
        match self.fetch::<HealthReply>(self.client.get(&url)).await {
            Ok(reply) => {
                if !reply.is_healthy() {
                    error!(status = %reply.status, "Health check reported unhealthy service");
                }
                reply.is_healthy()
            }
            Err(e) => {
                error!("Health check failed: GET {} - {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> MoppyClient {
        MoppyClient::new(&server.uri(), Some(Duration::from_secs(2))).unwrap()
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let client = MoppyClient::new("http://moppy.local:8080/", None).unwrap();
        assert_eq!(client.base_url(), "http://moppy.local:8080");
        assert_eq!(client.url("/api/play"), "http://moppy.local:8080/api/play");
    }

    #[tokio::test]
    async fn test_load_song_posts_file_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/load"))
            .and(body_json(json!({ "filePath": "/midi/a.mid" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "Song loaded successfully",
                "fileName": "a.mid"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.load_song("/midi/a.mid").await);
    }

    #[tokio::test]
    async fn test_error_body_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/play"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({ "error": "No song loaded", "status": 400 })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(!client.play().await);
    }

    #[tokio::test]
    async fn test_non_json_reply_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/stop"))
            .respond_with(ResponseTemplate::new(200).set_body_string("stopped"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(!client.stop().await);
    }

    #[tokio::test]
    async fn test_pause_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pause"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": true, "message": "Playback paused" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.pause().await);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "PLAYING",
                "isPlaying": true,
                "fileName": "b.mid",
                "progress": 0.5,
                "position": "1:00",
                "duration": "2:00"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let status = client.status().await;
        assert!(status.is_playing);
        assert_eq!(status.file_name, "b.mid");
    }

    #[tokio::test]
    async fn test_status_failure_reads_as_idle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.status().await, RemoteStatus::default());
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "healthy" })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "starting" })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_failure() {
        // grab a free port, then close it again
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let uri = format!("http://127.0.0.1:{}", port);

        let client = MoppyClient::new(&uri, Some(Duration::from_millis(500))).unwrap();
        assert!(!client.play().await);
        assert!(!client.health_check().await);
        assert_eq!(client.status().await, RemoteStatus::default());
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/play"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "success": true }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = MoppyClient::new(&server.uri(), Some(Duration::from_millis(50))).unwrap();
        assert!(!client.play().await);
    }
}
