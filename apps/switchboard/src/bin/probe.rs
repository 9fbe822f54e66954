//! Client-side negotiation probe: tries every transport kind against a running
//! gateway and prints which ones work, most preferred first.
//!
//! Usage: `switchboard-probe [BASE_URL] [KINDS]`, e.g.
//! `switchboard-probe http://127.0.0.1:4100 websocket,longpoll`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchboard::config::Config;
use switchboard::gateway::envelope::{ns, Envelope};
use switchboard::gateway::probe::{capability_flags, capability_header, NegotiationProbe, TransportProber};
use switchboard::gateway::transport::TransportKind;
use switchboard::gateway::GatewayError;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4100";
const SCRIPT_CALLBACK: &str = "probe";

#[derive(Debug, Deserialize)]
struct OpenResponse {
    connection_id: String,
}

/// Attempts real transport opens against `base_url`, closing each connection
/// it manages to establish.
struct RemoteProber {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteProber {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn ws_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|r| format!("wss://{r}"))
            .or_else(|| self.base_url.strip_prefix("http://").map(|r| format!("ws://{r}")))
            .unwrap_or_else(|| self.base_url.clone());
        format!("{rest}/transport/websocket")
    }

    async fn websocket(&self) -> Result<(), String> {
        let (mut socket, _) = tokio_tungstenite::connect_async(self.ws_url())
            .await
            .map_err(|e| e.to_string())?;
        let _ = socket.close(None).await;
        Ok(())
    }

    /// Open a push stream and read until the `open` frame arrives.
    async fn push(&self, path: &str) -> Result<String, String> {
        let mut response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;

        let mut buffered = String::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            buffered.push_str(&String::from_utf8_lossy(&chunk));
            if let Some(connection_id) = find_open_frame(&buffered) {
                return Ok(connection_id);
            }
        }
        Err("stream ended before the open frame".into())
    }

    async fn open_pull(&self, kind: TransportKind) -> Result<String, String> {
        let opened: OpenResponse = self
            .http
            .post(format!("{}/transport/open", self.base_url))
            .query(&[("kind", kind.as_str())])
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;
        Ok(opened.connection_id)
    }

    /// One immediate read on a script-tag or plain-poll connection.
    async fn read_once(&self, kind: TransportKind, connection_id: &str) -> Result<(), String> {
        let (route, query) = match kind {
            TransportKind::ScriptTag => ("script", vec![("callback", SCRIPT_CALLBACK)]),
            _ => ("fetch", Vec::new()),
        };
        let body = self
            .http
            .get(format!("{}/transport/{connection_id}/{route}", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .text()
            .await
            .map_err(|e| e.to_string())?;
        if kind == TransportKind::ScriptTag && !body.starts_with(&format!("{SCRIPT_CALLBACK}(")) {
            return Err("response is not a script callback".into());
        }
        Ok(())
    }

    async fn close(&self, connection_id: &str) {
        let _ = self
            .http
            .delete(format!("{}/transport/{connection_id}", self.base_url))
            .send()
            .await;
    }

    async fn try_kind(&self, kind: TransportKind) -> Result<(), String> {
        match kind {
            TransportKind::WebSocket => self.websocket().await,
            TransportKind::EventStream | TransportKind::Streaming => {
                let path = if kind == TransportKind::EventStream {
                    "/transport/eventstream"
                } else {
                    "/transport/stream"
                };
                let connection_id = self.push(path).await?;
                self.close(&connection_id).await;
                Ok(())
            }
            TransportKind::LongPoll => {
                // A held poll would outlast the probe timeout; opening is enough.
                let connection_id = self.open_pull(kind).await?;
                self.close(&connection_id).await;
                Ok(())
            }
            TransportKind::ScriptTag | TransportKind::Polling => {
                let connection_id = self.open_pull(kind).await?;
                let read = self.read_once(kind, &connection_id).await;
                self.close(&connection_id).await;
                read
            }
        }
    }
}

#[async_trait]
impl TransportProber for RemoteProber {
    async fn attempt(&self, kind: TransportKind) -> Result<(), GatewayError> {
        self.try_kind(kind).await.map_err(|reason| {
            tracing::debug!(transport = %kind, %reason, "attempt failed");
            GatewayError::NegotiationFailed(kind)
        })
    }
}

/// Connection id carried by the first `open` envelope in an SSE or NDJSON
/// buffer, once a complete one has arrived.
fn find_open_frame(buffered: &str) -> Option<String> {
    buffered
        .lines()
        .map(|line| line.strip_prefix("data:").map(str::trim).unwrap_or(line))
        .filter_map(|line| serde_json::from_str::<Envelope>(line).ok())
        .find(|envelope| envelope.ns == ns::OPEN)
        .and_then(|envelope| {
            envelope.data["connection_id"]
                .as_str()
                .map(str::to_string)
        })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let base_url = args.next().unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let candidates = args
        .next()
        .map(|list| TransportKind::parse_list(&list))
        .unwrap_or_else(|| TransportKind::PREFERENCE.to_vec());

    let probe = NegotiationProbe::new(Config::from_env().probe_timeout);
    let prober = RemoteProber::new(&base_url);
    let usable = probe.probe(&prober, &candidates).await;

    if usable.is_empty() {
        eprintln!("{}: no usable transport", GatewayError::NoUsableTransport.code());
        std::process::exit(1);
    }

    let report = serde_json::json!({
        "gateway": base_url,
        "transports": capability_header(&usable),
        "capabilities": capability_flags(&usable),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string())
    );
}
