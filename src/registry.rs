//! Centralized registry client (`spec.md` §4.8): a fallback directory used
//! when gossip discovery yields nothing. Scheme-dispatched between plain
//! HTTP(S) (`reqwest`, grounded on the `reqwest` usage already established
//! for the registry's REST surface in the teacher's own HTTP clients) and
//! WebSocket (`tokio-tungstenite`, the client role also taken in
//! `examples/other_examples/manifests/saorsa-labs-x0x` and
//! `hyperledger-iroha`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

use crate::error::RegistryError;
use crate::model::{now_millis, Capability, PeerInfo};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// `{success:true, data, timestamp}` / `{success:false, error, timestamp}`
/// (`spec.md` §6).
#[derive(Debug, Deserialize)]
struct HttpEnvelope<T> {
    success: bool,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// WebSocket request framing `{id, type, payload, timestamp}`.
#[derive(Debug, Serialize)]
struct WsRequest {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
    timestamp: i64,
}

/// WebSocket reply framing `{type: 'response'|'error', id, payload}`.
#[derive(Debug, Deserialize)]
struct WsReply {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySearch {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

enum Backend {
    Http { base: Url, client: reqwest::Client },
    WebSocket { sender: tokio::sync::mpsc::UnboundedSender<WsMessage>, pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>> },
}

/// Registry client for one configured endpoint. Scheme (`http(s)` vs.
/// `ws(s)`) decides the backend at construction.
pub struct RegistryClient {
    backend: Backend,
}

impl RegistryClient {
    /// Connect to `url`, picking HTTP or WebSocket transport from its
    /// scheme. WebSocket mode spawns a background reader/ping task and
    /// auto-reconnects with `reconnect_interval` on close.
    pub async fn connect(url: &str, reconnect_interval: Option<Duration>) -> Result<Self, RegistryError> {
        let parsed = Url::parse(url).map_err(|e| RegistryError::Connection(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| RegistryError::Connection(e.to_string()))?;
                Ok(Self { backend: Backend::Http { base: parsed, client } })
            }
            "ws" | "wss" => {
                let backend = Self::connect_ws(parsed, reconnect_interval.unwrap_or(DEFAULT_RECONNECT_INTERVAL)).await?;
                Ok(Self { backend })
            }
            other => Err(RegistryError::Connection(format!("unsupported registry scheme: {other}"))),
        }
    }

    async fn connect_ws(url: Url, reconnect_interval: Duration) -> Result<Backend, RegistryError> {
        let stream = Self::dial_ws(&url).await?;
        let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>> = Arc::new(Mutex::new(HashMap::new()));

        let pending_for_task = pending.clone();
        tokio::spawn(Self::run_ws_loop(stream, rx, pending_for_task, url, reconnect_interval));

        let ping_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if ping_tx.send(WsMessage::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        });

        Ok(Backend::WebSocket { sender: tx, pending })
    }

    async fn dial_ws(url: &Url) -> Result<WsStream, RegistryError> {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        Ok(stream)
    }

    /// Owns the connection for the client's whole lifetime: pumps outbound
    /// requests and inbound replies over one socket until it closes, then
    /// reconnects after `reconnect_interval` and resumes, per `spec.md`
    /// §4.8's "on WebSocket close, auto-reconnect with `reconnectInterval`".
    async fn run_ws_loop(
        mut stream: WsStream,
        mut rx: mpsc::UnboundedReceiver<WsMessage>,
        pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
        url: Url,
        reconnect_interval: Duration,
    ) {
        loop {
            let (mut write, mut read) = stream.split();
            loop {
                tokio::select! {
                    outbound = rx.recv() => {
                        match outbound {
                            Some(msg) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => return, // client dropped, nothing left to reconnect for
                        }
                    }
                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(WsMessage::Text(text))) => {
                                if let Ok(reply) = serde_json::from_str::<WsReply>(&text) {
                                    if reply.kind == "response" || reply.kind == "error" {
                                        if let Some(sender) = pending.lock().await.remove(&reply.id) {
                                            let _ = sender.send(reply.payload);
                                        }
                                    }
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("registry websocket read error: {e}");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            tracing::warn!("registry websocket closed; reconnecting in {:?}", reconnect_interval);
            tokio::time::sleep(reconnect_interval).await;
            loop {
                match Self::dial_ws(&url).await {
                    Ok(s) => {
                        stream = s;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "registry websocket reconnect failed, retrying");
                        tokio::time::sleep(reconnect_interval).await;
                    }
                }
            }
        }
    }

    async fn ws_request(&self, kind: &str, payload: Value) -> Result<Value, RegistryError> {
        let Backend::WebSocket { sender, pending } = &self.backend else {
            return Err(RegistryError::Connection("not a websocket registry".into()));
        };
        let id = Uuid::new_v4().to_string();
        let request = WsRequest { id: id.clone(), kind: kind.into(), payload, timestamp: now_millis() };
        let (reply_tx, reply_rx) = oneshot::channel();
        pending.lock().await.insert(id.clone(), reply_tx);
        let body = serde_json::to_string(&request).map_err(|e| RegistryError::Query(e.to_string()))?;
        sender
            .send(WsMessage::Text(body.into()))
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        reply_rx.await.map_err(|_| RegistryError::Query(format!("no reply for request {id}")))
    }

    async fn http_call<T: for<'de> Deserialize<'de>>(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<T, RegistryError> {
        let Backend::Http { base, client } = &self.backend else {
            return Err(RegistryError::Connection("not an http registry".into()));
        };
        let url = base.join(path).map_err(|e| RegistryError::Query(e.to_string()))?;
        let mut request = client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| RegistryError::Connection(e.to_string()))?;
        let envelope: HttpEnvelope<T> = response.json().await.map_err(|e| RegistryError::Query(e.to_string()))?;
        if !envelope.success {
            return Err(RegistryError::ServerError(envelope.error.unwrap_or_default()));
        }
        envelope.data.ok_or_else(|| RegistryError::ServerError("missing data field".into()))
    }

    pub async fn register(&self, peer: &PeerInfo) -> Result<(), RegistryError> {
        let payload = serde_json::to_value(peer).map_err(|e| RegistryError::Query(e.to_string()))?;
        match &self.backend {
            Backend::Http { .. } => self.http_call::<Value>(reqwest::Method::POST, "/api/register", Some(&payload)).await.map(|_| ()),
            Backend::WebSocket { .. } => self.ws_request("register", payload).await.map(|_| ()),
        }
    }

    pub async fn unregister(&self, peer_id: &str) -> Result<(), RegistryError> {
        let payload = serde_json::json!({"id": peer_id});
        match &self.backend {
            Backend::Http { .. } => self.http_call::<Value>(reqwest::Method::POST, "/api/unregister", Some(&payload)).await.map(|_| ()),
            Backend::WebSocket { .. } => self.ws_request("unregister", payload).await.map(|_| ()),
        }
    }

    pub async fn ping(&self) -> Result<(), RegistryError> {
        match &self.backend {
            Backend::Http { .. } => self.http_call::<Value>(reqwest::Method::POST, "/api/ping", None).await.map(|_| ()),
            Backend::WebSocket { .. } => self.ws_request("ping", Value::Null).await.map(|_| ()),
        }
    }

    pub async fn report_reputation(&self, peer_id: &str, score: f64) -> Result<(), RegistryError> {
        let payload = serde_json::json!({"score": score});
        match &self.backend {
            Backend::Http { .. } => {
                let path = format!("/api/nodes/{peer_id}/reputation");
                self.http_call::<Value>(reqwest::Method::POST, &path, Some(&payload)).await.map(|_| ())
            }
            Backend::WebSocket { .. } => {
                // spec's WS type enum is {register,unregister,query,ping,subscribe,unsubscribe} —
                // no reputation-report type exists, so this is HTTP-only.
                Err(RegistryError::Query("reputation reporting is not available over the websocket registry protocol".into()))
            }
        }
    }

    pub async fn get_node(&self, peer_id: &str) -> Result<Option<PeerInfo>, RegistryError> {
        match &self.backend {
            Backend::Http { .. } => {
                let path = format!("/api/nodes/{peer_id}");
                self.http_call::<PeerInfo>(reqwest::Method::GET, &path, None).await.map(Some)
            }
            Backend::WebSocket { .. } => {
                let payload = serde_json::json!({"id": peer_id});
                let value = self.ws_request("query", payload).await?;
                Ok(serde_json::from_value(value).ok())
            }
        }
    }

    /// `query`: search by capability, sorted by reputation desc.
    pub async fn query(&self, search: CapabilitySearch) -> Result<Vec<PeerInfo>, RegistryError> {
        let mut nodes: Vec<PeerInfo> = match &self.backend {
            Backend::Http { .. } => {
                let mut path = format!("/api/capabilities/search?type={}&name={}", search.kind, search.name);
                if let Some(limit) = search.limit {
                    path.push_str(&format!("&limit={limit}"));
                }
                self.http_call::<Vec<PeerInfo>>(reqwest::Method::GET, &path, None).await?
            }
            Backend::WebSocket { .. } => {
                let payload = serde_json::to_value(&search).map_err(|e| RegistryError::Query(e.to_string()))?;
                let value = self.ws_request("query", payload).await?;
                serde_json::from_value(value).map_err(|e| RegistryError::Query(e.to_string()))?
            }
        };
        nodes.sort_by(|a, b| b.reputation.unwrap_or(0.0).partial_cmp(&a.reputation.unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal));
        Ok(nodes)
    }

    pub fn search_by_capability(&self, capability: &Capability) -> CapabilitySearch {
        CapabilitySearch { kind: capability.kind.clone(), name: capability.name.clone(), limit: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_envelope_rejects_unsuccessful_response() {
        let raw = serde_json::json!({"success": false, "error": "nope", "timestamp": 0});
        let envelope: HttpEnvelope<Value> = serde_json::from_value(raw).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.error.as_deref(), Some("nope"));
    }

    #[test]
    fn query_sorts_by_reputation_desc() {
        let mut nodes = vec![
            PeerInfo { id: "a".into(), addresses: vec![], capabilities: vec![], last_seen: 0, reputation: Some(10.0) },
            PeerInfo { id: "b".into(), addresses: vec![], capabilities: vec![], last_seen: 0, reputation: Some(90.0) },
        ];
        nodes.sort_by(|a, b| b.reputation.unwrap_or(0.0).partial_cmp(&a.reputation.unwrap_or(0.0)).unwrap());
        assert_eq!(nodes[0].id, "b");
    }
}
