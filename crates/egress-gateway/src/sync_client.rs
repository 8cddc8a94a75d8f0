//! Reconnecting client for the control-plane route stream.
//!
//! The client subscribes to the node agent, forwards every message into the
//! current [`FactStream`], and on any failure swaps in a fresh stream before
//! closing the old one. A consumer that sees its stream end can therefore
//! always pick up the replacement with [`SyncClient::current_fact_stream`].

use crate::error::{EgressError, Result};
use crate::proto::{PolicySyncClient, SyncRequest, ToDataplane};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, instrument, warn};

/// Subscription topic for workload/tunnel routes.
pub const SUBSCRIPTION_L3_ROUTES: &str = "l3-routes";

/// Depth of the hand-off queue between the client and the route store.
pub const FACT_QUEUE_DEPTH: usize = 1024;

/// Default pause between a failed stream and the next dial.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A subscription to the control plane.
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Opens one stream of messages. The stream ends or yields an error when
    /// the connection is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ToDataplane>>>;
}

/// [`FactSource`] speaking `felix.PolicySync` over a Unix socket.
#[derive(Debug, Clone)]
pub struct PolicySyncSource {
    socket_path: PathBuf,
    subscription_type: String,
}

impl PolicySyncSource {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            subscription_type: SUBSCRIPTION_L3_ROUTES.to_string(),
        }
    }

    pub fn with_subscription_type(mut self, subscription_type: impl Into<String>) -> Self {
        self.subscription_type = subscription_type.into();
        self
    }
}

#[async_trait]
impl FactSource for PolicySyncSource {
    #[instrument(skip(self), fields(socket = %self.socket_path.display()))]
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ToDataplane>>> {
        let path = self.socket_path.clone();
        // The authority is ignored; every connection goes to the socket.
        let channel = Endpoint::try_from("http://[::]:50051")?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await?;

        let mut client = PolicySyncClient::new(channel);
        let response = client
            .sync(SyncRequest {
                subscription_type: self.subscription_type.clone(),
            })
            .await?;
        debug!("Sync stream opened");

        let stream = response.into_inner().map(move |item| {
            // Hold the client for as long as the stream is polled.
            let _client = &client;
            item.map_err(EgressError::from)
        });
        Ok(stream.boxed())
    }
}

/// Receiving end of one hand-off queue. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct FactStream {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ToDataplane>>>,
}

impl FactStream {
    /// Next message, or `None` once the queue has been closed.
    pub async fn recv(&self) -> Option<ToDataplane> {
        self.rx.lock().await.recv().await
    }

    /// True if both handles refer to the same queue.
    pub fn same_stream(&self, other: &FactStream) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

/// Creates a hand-off queue of the given depth.
pub fn fact_stream(capacity: usize) -> (mpsc::Sender<ToDataplane>, FactStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        tx,
        FactStream {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        },
    )
}

struct StreamSlot {
    tx: mpsc::Sender<ToDataplane>,
    stream: FactStream,
}

/// Keeps a route stream from the control plane open.
pub struct SyncClient {
    source: Arc<dyn FactSource>,
    slot: Mutex<StreamSlot>,
    reconnect_delay: Duration,
}

impl SyncClient {
    pub fn new(source: Arc<dyn FactSource>) -> Self {
        let (tx, stream) = fact_stream(FACT_QUEUE_DEPTH);
        Self {
            source,
            slot: Mutex::new(StreamSlot { tx, stream }),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// The queue currently being fed.
    pub fn current_fact_stream(&self) -> FactStream {
        self.slot.lock().stream.clone()
    }

    /// Dials, forwards and reconnects until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(delay_ms = self.reconnect_delay.as_millis() as u64, "Sync client started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.forward_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Sync stream failed, reconnecting");
                    }
                }
            }

            self.replace_stream();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("Sync client stopped");
    }

    async fn forward_once(&self) -> Result<()> {
        let mut stream = self.source.subscribe().await?;
        let tx = self.slot.lock().tx.clone();
        info!("Connected to control plane");

        let mut forwarded: u64 = 0;
        while let Some(item) = stream.next().await {
            let msg = item?;
            if tx.send(msg).await.is_err() {
                break;
            }
            forwarded += 1;
        }
        debug!(forwarded, "Sync stream ended");
        Err(EgressError::StreamClosed)
    }

    /// Installs a fresh queue, then closes the old one by dropping its sender.
    fn replace_stream(&self) {
        let (tx, stream) = fact_stream(FACT_QUEUE_DEPTH);
        let old = std::mem::replace(&mut *self.slot.lock(), StreamSlot { tx, stream });
        drop(old);
    }
}
