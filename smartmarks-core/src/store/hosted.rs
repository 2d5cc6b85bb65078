//! Client for the hosted bookmark table.
//!
//! Rows are read and written through the REST interface at
//! `{url}/rest/v1/bookmarks`; live changes arrive over the realtime
//! websocket at `{url}/realtime/v1/websocket`. Each open feed is served by
//! its own reader task that also keeps the socket alive with heartbeats.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::realtime::{decode_change, PhoenixMessage};
use super::{FeedEvent, RemoteStore, StoreError, Subscription, SubscriptionId};
use crate::models::{Bookmark, NewBookmark};

/// Timeout for the channel join reply.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between heartbeats on an open feed.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

const TABLE_PATH: &str = "/rest/v1/bookmarks";
const REALTIME_PATH: &str = "/realtime/v1/websocket";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection settings for the hosted service.
#[derive(Debug, Clone)]
pub struct HostedConfig {
    /// Project URL, e.g. `https://abc.example.co`
    pub url: String,
    /// Public API key sent as `apikey`
    pub anon_key: String,
    /// Signed-in user's access token
    pub access_token: String,
}

/// Error body returned by the REST interface.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

struct FeedTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct HostedStore {
    config: HostedConfig,
    http: reqwest::Client,
    feeds: Mutex<HashMap<SubscriptionId, FeedTask>>,
}

impl HostedStore {
    pub fn new(config: HostedConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostedConfig {
        &self.config
    }

    fn lock_feeds(&self) -> MutexGuard<'_, HashMap<SubscriptionId, FeedTask>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.access_token),
            )
    }

    /// Builds an HTTP URL for a given path.
    fn build_http_url(&self, path: &str) -> String {
        let url = &self.config.url;
        let base_url = if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else if !url.starts_with("http://") && !url.starts_with("https://") {
            format!("https://{}", url)
        } else {
            url.clone()
        };

        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    /// Builds the realtime websocket URL.
    fn build_ws_url(&self) -> String {
        let url = &self.config.url;
        let base_url = if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if !url.starts_with("ws://") && !url.starts_with("wss://") {
            format!("wss://{}", url)
        } else {
            url.clone()
        };

        format!(
            "{}{}?apikey={}&vsn=1.0.0",
            base_url.trim_end_matches('/'),
            REALTIME_PATH,
            urlencoding::encode(&self.config.anon_key)
        )
    }

    fn fetch_url(&self, owner_id: &str) -> String {
        format!(
            "{}?select=*&user_id=eq.{}&order=created_at.desc",
            self.build_http_url(TABLE_PATH),
            urlencoding::encode(owner_id)
        )
    }

    fn delete_url(&self, id: &str) -> String {
        format!(
            "{}?id=eq.{}",
            self.build_http_url(TABLE_PATH),
            urlencoding::encode(id)
        )
    }

    /// Performs the join handshake: sends `phx_join` and waits for its reply.
    async fn join(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        owner_id: &str,
    ) -> Result<(), StoreError> {
        let join_ref = 1;
        send_frame(
            sink,
            &PhoenixMessage::join(owner_id, &self.config.access_token, join_ref),
        )
        .await?;

        let reply = timeout(JOIN_TIMEOUT, async {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let Ok(frame) = PhoenixMessage::decode(text.as_str()) else {
                            continue;
                        };
                        if let Some(status) = frame.reply_status(join_ref) {
                            return status.map_err(|reason| {
                                StoreError::new(format!("Realtime join refused: {}", reason))
                            });
                        }
                    }
                    Ok(Message::Close(_)) => {
                        return Err(StoreError::new(
                            "Server closed connection during join".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(StoreError::new(format!("WebSocket error: {}", e))),
                }
            }
            Err(StoreError::new(
                "Connection closed before join completed".to_string(),
            ))
        })
        .await;

        match reply {
            Ok(result) => result,
            Err(_) => Err(StoreError::new("Realtime join timed out".to_string())),
        }
    }
}

impl RemoteStore for HostedStore {
    async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        let response = self
            .authorized(self.http.get(self.fetch_url(owner_id)))
            .send()
            .await
            .map_err(|e| StoreError::new(e.to_string()))?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::new(e.to_string()))
    }

    async fn insert(&self, bookmark: &NewBookmark) -> Result<(), StoreError> {
        let response = self
            .authorized(self.http.post(self.build_http_url(TABLE_PATH)))
            .header("Prefer", "return=minimal")
            .json(bookmark)
            .send()
            .await
            .map_err(|e| StoreError::new(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let response = self
            .authorized(self.http.delete(self.delete_url(id)))
            .send()
            .await
            .map_err(|e| StoreError::new(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }

    async fn subscribe(&self, owner_id: &str) -> Result<Subscription, StoreError> {
        let (ws_stream, _) = connect_async(self.build_ws_url())
            .await
            .map_err(|e| StoreError::new(format!("Connection error: {}", e)))?;
        let (mut sink, mut source) = ws_stream.split();

        self.join(&mut sink, &mut source, owner_id).await?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_feed(sink, source, events_tx, shutdown_rx));

        let id = SubscriptionId::new();
        self.lock_feeds().insert(id, FeedTask { shutdown, task });
        tracing::debug!(subscription = %id, "realtime feed joined");

        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let feed = self.lock_feeds().remove(&id);
        if let Some(feed) = feed {
            // The task may already have exited on a dropped connection.
            let _ = feed.shutdown.send(());
            let _ = feed.task.await;
            tracing::debug!(subscription = %id, "realtime feed closed");
        }
    }
}

/// Maps a non-2xx response to an error carrying the body's `message`.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or_else(|_| format!("HTTP {}", status));
    Err(StoreError::new(message))
}

async fn send_frame(sink: &mut WsSink, frame: &PhoenixMessage) -> Result<(), StoreError> {
    let text = frame
        .encode()
        .map_err(|e| StoreError::new(format!("Encoding error: {}", e)))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| StoreError::new(format!("WebSocket error: {}", e)))
}

/// Reads frames until shutdown, connection loss, or the consumer going away.
/// Dropping `events` on exit is what tells the consumer the feed ended.
async fn run_feed(
    mut sink: WsSink,
    mut source: WsSource,
    events: mpsc::UnboundedSender<FeedEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    // Ref 1 was the join.
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = send_frame(&mut sink, &PhoenixMessage::leave(next_ref)).await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_frame(&mut sink, &PhoenixMessage::heartbeat(next_ref)).await {
                    tracing::warn!("realtime heartbeat failed: {}", e);
                    break;
                }
                next_ref += 1;
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => match decode_change(text.as_str()) {
                    Some(event) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    None => tracing::debug!("skipping realtime frame: {}", text.as_str()),
                },
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!("realtime connection closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("realtime connection error: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str) -> HostedStore {
        HostedStore::new(HostedConfig {
            url: url.to_string(),
            anon_key: "anon-key".to_string(),
            access_token: "token".to_string(),
        })
    }

    #[test]
    fn test_build_http_url() {
        assert_eq!(
            store("https://proj.example.co").build_http_url(TABLE_PATH),
            "https://proj.example.co/rest/v1/bookmarks"
        );
        assert_eq!(
            store("https://proj.example.co/").build_http_url(TABLE_PATH),
            "https://proj.example.co/rest/v1/bookmarks"
        );
        assert_eq!(
            store("http://localhost:54321").build_http_url(TABLE_PATH),
            "http://localhost:54321/rest/v1/bookmarks"
        );
        assert_eq!(
            store("wss://proj.example.co").build_http_url(TABLE_PATH),
            "https://proj.example.co/rest/v1/bookmarks"
        );
        assert_eq!(
            store("proj.example.co").build_http_url(TABLE_PATH),
            "https://proj.example.co/rest/v1/bookmarks"
        );
    }

    #[test]
    fn test_build_ws_url() {
        assert_eq!(
            store("https://proj.example.co").build_ws_url(),
            "wss://proj.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        assert_eq!(
            store("http://localhost:54321").build_ws_url(),
            "ws://localhost:54321/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
        assert_eq!(
            store("proj.example.co").build_ws_url(),
            "wss://proj.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_query_urls_scope_and_encode() {
        let store = store("https://proj.example.co");
        assert_eq!(
            store.fetch_url("user 1"),
            "https://proj.example.co/rest/v1/bookmarks?select=*&user_id=eq.user%201&order=created_at.desc"
        );
        assert_eq!(
            store.delete_url("b-7"),
            "https://proj.example.co/rest/v1/bookmarks?id=eq.b-7"
        );
    }

    #[test]
    fn test_config_accessor() {
        let store = store("https://proj.example.co");
        assert_eq!(store.config().anon_key, "anon-key");
    }
}
