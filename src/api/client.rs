// Actor client
// Caller-side wrapper: mints an access token per call, fetches snapshots,
// posts events and follows the live diff socket

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::tokens::TokenService;
use super::types::ErrorResponse;
use crate::engine::diff::DiffMessage;
use crate::engine::host::FetchedSnapshot;
use crate::models::{Caller, Snapshot};
use crate::{LiveStateError, Result};

/// Talks to one actor type on one server as one caller
#[derive(Clone)]
pub struct ActorClient {
    http: reqwest::Client,
    base_url: Url,
    actor_type: String,
    tokens: TokenService,
    caller: Caller,
}

impl ActorClient {
    pub fn new(
        base_url: &str,
        actor_type: impl Into<String>,
        tokens: TokenService,
        caller: Caller,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LiveStateError::InvalidInput(format!("invalid base url {}: {}", base_url, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            actor_type: actor_type.into(),
            tokens,
            caller,
        })
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    fn access_token(&self, actor_id: &str) -> Result<String> {
        self.tokens.create_access_token(
            actor_id,
            &self.caller.id,
            self.caller.caller_type,
            &self.actor_type,
        )
    }

    fn room_url(&self, actor_id: &str, suffix: Option<&str>) -> Result<Url> {
        let mut path = format!(
            "{}/{}",
            urlencoding::encode(&self.actor_type),
            urlencoding::encode(actor_id)
        );
        if let Some(suffix) = suffix {
            path.push('/');
            path.push_str(suffix);
        }
        self.base_url
            .join(&path)
            .map_err(|e| LiveStateError::InvalidInput(format!("invalid room url: {}", e)))
    }

    /// Fetch the snapshot, creating the actor with `input` if it is not running
    pub async fn get(&self, actor_id: &str, input: &Value) -> Result<FetchedSnapshot> {
        let mut url = self.room_url(actor_id, None)?;
        if !input.is_null() {
            url.query_pairs_mut().append_pair("input", &input.to_string());
        }

        let response = self
            .http
            .get(url)
            .bearer_auth(self.access_token(actor_id)?)
            .send()
            .await
            .map_err(network_error)?;
        let body: Value = read_body(response).await?;

        let fetched: FetchedSnapshot = serde_json::from_value(body)
            .map_err(|e| LiveStateError::Internal(format!("unexpected snapshot response: {}", e)))?;
        Snapshot::from_persisted(fetched.snapshot.clone())
            .map_err(|e| LiveStateError::Internal(format!("unexpected snapshot shape: {}", e)))?;
        Ok(fetched)
    }

    /// Post one event
    pub async fn send(&self, actor_id: &str, event: &Value) -> Result<()> {
        let url = self.room_url(actor_id, None)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.access_token(actor_id)?)
            .json(event)
            .send()
            .await
            .map_err(network_error)?;
        read_body(response).await?;
        Ok(())
    }

    /// Open the live socket with a connection token from [`ActorClient::get`]
    pub async fn connect(&self, actor_id: &str, connection_token: &str) -> Result<ActorSocket> {
        let mut url = self.room_url(actor_id, Some("socket"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| LiveStateError::InvalidInput(format!("cannot open a socket to {}", url)))?;
        url.query_pairs_mut().append_pair("token", connection_token);

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LiveStateError::Internal(format!("socket connect failed: {}", e)))?;
        debug!("Socket open to {}/{}", self.actor_type, actor_id);
        Ok(ActorSocket { stream })
    }
}

/// An open live socket
pub struct ActorSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ActorSocket {
    /// Next patch batch; `None` once the server closed the socket
    pub async fn next_diff(&mut self) -> Option<Result<DiffMessage>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(LiveStateError::from))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(LiveStateError::Internal(format!("socket error: {}", e)))),
            }
        }
        None
    }

    /// Send a raw event body over the socket
    pub async fn send(&mut self, event: &Value) -> Result<()> {
        self.stream
            .send(Message::Text(event.to_string()))
            .await
            .map_err(|e| LiveStateError::Internal(format!("socket send failed: {}", e)))
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn network_error(e: reqwest::Error) -> LiveStateError {
    if e.is_timeout() {
        LiveStateError::Timeout(e.to_string())
    } else {
        LiveStateError::Internal(format!("request failed: {}", e))
    }
}

/// Body of a 2xx response, or the server's error mapped back to its variant
async fn read_body(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await.map_err(network_error)?;
    if status.is_success() {
        return Ok(serde_json::from_str(&text)?);
    }

    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or(text);
    Err(match status {
        StatusCode::UNAUTHORIZED => LiveStateError::Unauthorized(message),
        StatusCode::BAD_REQUEST => LiveStateError::InvalidEvent(message),
        StatusCode::NOT_FOUND => LiveStateError::NotFound(message),
        StatusCode::GATEWAY_TIMEOUT => LiveStateError::Timeout(message),
        _ => LiveStateError::Internal(format!("HTTP {}: {}", status, message)),
    })
}
