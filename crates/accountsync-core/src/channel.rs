//! Realtime sync channels
//!
//! After a sync endpoint has been negotiated, a realtime channel is attached
//! to it. Channels are additive: they augment whatever transport the document
//! store already uses and stay attached until explicitly closed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AccountError, AccountResult};

/// Default capacity for the inbound frame channel
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// A negotiated sync endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEndpoint {
    /// Host (and optional port) of the sync server
    pub host: String,
    /// Session token issued by the server
    pub token: String,
}

impl SyncEndpoint {
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
        }
    }

    /// Realtime URL carrying the token as a connection parameter
    pub fn realtime_url(&self, scheme: &str) -> AccountResult<Url> {
        let mut url = Url::parse(&format!("{}://{}/", scheme, self.host))
            .map_err(|e| AccountError::Malformed(format!("invalid sync host '{}': {}", self.host, e)))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }
}

/// Attaches realtime channels to negotiated endpoints
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn attach(&self, endpoint: &SyncEndpoint) -> AccountResult<()>;
}

/// Binary frame received on an attached channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFrame {
    pub host: String,
    pub data: Vec<u8>,
}

struct Attached {
    endpoint: SyncEndpoint,
    task: JoinHandle<()>,
}

/// WebSocket implementation of [`RealtimeChannel`]
pub struct WebSocketChannel {
    scheme: String,
    attached: Mutex<Vec<Attached>>,
    frames: broadcast::Sender<ChannelFrame>,
}

impl WebSocketChannel {
    /// Create a channel connecting with the given scheme (`wss` or `ws`)
    pub fn new(scheme: impl Into<String>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Arc::new(Self {
            scheme: scheme.into(),
            attached: Mutex::new(Vec::new()),
            frames,
        })
    }

    /// Subscribe to inbound binary frames from every attached endpoint
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFrame> {
        self.frames.subscribe()
    }

    /// Endpoints whose connection task is still running
    pub fn attached(&self) -> Vec<SyncEndpoint> {
        self.attached
            .lock()
            .iter()
            .filter(|a| !a.task.is_finished())
            .map(|a| a.endpoint.clone())
            .collect()
    }

    /// Close every attached channel
    pub fn close_all(&self) {
        for attached in self.attached.lock().drain(..) {
            debug!(host = %attached.endpoint.host, "Closing realtime channel");
            attached.task.abort();
        }
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    async fn attach(&self, endpoint: &SyncEndpoint) -> AccountResult<()> {
        let url = endpoint.realtime_url(&self.scheme)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| AccountError::Network(format!("realtime connect to {} failed: {e}", endpoint.host)))?;
        info!(host = %endpoint.host, "Realtime channel attached");

        let host = endpoint.host.clone();
        let frames = self.frames.clone();
        let task = tokio::spawn(async move {
            let (_sink, mut source) = stream.split();
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let _ = frames.send(ChannelFrame {
                            host: host.clone(),
                            data: data.to_vec(),
                        });
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%host, error = %e, "Realtime channel error");
                        break;
                    }
                }
            }
            debug!(%host, "Realtime channel closed");
        });

        let mut attached = self.attached.lock();
        attached.retain(|a| !a.task.is_finished());
        attached.push(Attached {
            endpoint: endpoint.clone(),
            task,
        });
        Ok(())
    }
}
