//! Server session (§4.C): the single long-lived TLS connection to the relay
//! server. Owns a reader task and a writer task selected via a
//! `watch::Receiver<bool>` shutdown signal. Multiplexes Subscribe/Push/
//! Pay/Ack onto one connection with bounded backpressure per operation
//! class, and reconnects with exponential backoff + jitter, re-subscribing
//! every live RV tag and re-pushing any un-acked outbox entries.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};
use tracing::{debug, error, info, warn};

/// One client→server frame (§6, relay server wire protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data")]
pub enum ClientFrame {
    Subscribe { rv: [u8; 32], paid: bool },
    Unsubscribe { rv: [u8; 32] },
    Push {
        rv: [u8; 32],
        payload: Vec<u8>,
        payment: Option<String>,
    },
    AckReceived { rv: [u8; 32] },
    Pay { invoice: String, preimage: String },
    Ping,
}

/// One server→client frame (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data")]
pub enum ServerFrame {
    PushPayload {
        rv: [u8; 32],
        payload: Vec<u8>,
        delivery_id: u64,
    },
    InvoiceRequest { rv: [u8; 32], amount: u64 },
    Error { code: u32, text: String },
    Pong,
}

/// An outbound operation queued by the rest of the core, paired with a
/// completion channel the caller awaits on (satisfies a bounded inflight
/// window — §4.C, §5).
pub struct PendingOp {
    pub frame: ClientFrame,
    pub done: oneshot::Sender<Result<()>>,
}

#[derive(Clone)]
pub struct SessionHandle {
    op_tx: mpsc::Sender<PendingOp>,
    connected: Arc<std::sync::atomic::AtomicBool>,
}

impl SessionHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Enqueue an operation, blocking (async) until the bounded inflight
    /// window has room (§4.C backpressure).
    pub async fn submit(&self, frame: ClientFrame) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(PendingOp { frame, done: tx })
            .await
            .map_err(|_| anyhow!("session writer task gone"))?;
        rx.await.map_err(|_| anyhow!("session dropped op before completion"))?
    }
}

pub struct SessionConfig {
    pub server_addr: String,
    pub tls_server_name: String,
    pub max_inflight: usize,
    pub keepalive_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

/// Subscriptions to re-establish and outbox entries to re-push after every
/// reconnect (§4.C "on reconnect the session re-subscribes to all live RV
/// tags and re-pushes any un-acked outbox entries").
#[async_trait::async_trait]
pub trait ReconnectHooks: Send + Sync {
    async fn live_rv_tags(&self) -> Vec<([u8; 32], bool)>;
    async fn unacked_pushes(&self) -> Vec<ClientFrame>;
}

pub struct Session {
    config: SessionConfig,
    inbound_tx: mpsc::Sender<ServerFrame>,
}

impl Session {
    pub fn new(config: SessionConfig, inbound_tx: mpsc::Sender<ServerFrame>) -> Self {
        Self { config, inbound_tx }
    }

    /// Spawn the session's reconnect-loop task. Returns a handle the rest of
    /// the core submits operations through, plus the `JoinHandle` the
    /// orchestrator awaits at shutdown.
    pub fn spawn(
        self,
        hooks: Arc<dyn ReconnectHooks>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        let (op_tx, op_rx) = mpsc::channel(self.config.max_inflight);
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = SessionHandle {
            op_tx,
            connected: connected.clone(),
        };

        let join = tokio::spawn(async move {
            let mut op_rx = op_rx;
            let mut attempt: u32 = 0;
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match self.connect_once(&mut op_rx, &hooks, connected.clone(), &mut shutdown).await {
                    Ok(()) => {
                        // clean shutdown requested mid-session
                        if *shutdown.borrow() {
                            return;
                        }
                        attempt = 0;
                    }
                    Err(e) => {
                        connected.store(false, Ordering::Relaxed);
                        attempt += 1;
                        let delay = backoff_with_jitter(
                            attempt,
                            self.config.reconnect_base,
                            self.config.reconnect_cap,
                        );
                        warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "relay session dropped, reconnecting");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() { return; }
                            }
                        }
                    }
                }
            }
        });

        (handle, join)
    }

    async fn connect_once(
        &self,
        op_rx: &mut mpsc::Receiver<PendingOp>,
        hooks: &Arc<dyn ReconnectHooks>,
        connected: Arc<std::sync::atomic::AtomicBool>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let stream = self.dial().await.context("dialing relay server")?;
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        connected.store(true, Ordering::Relaxed);
        info!(addr = %self.config.server_addr, "relay session connected");

        for (rv, paid) in hooks.live_rv_tags().await {
            write_frame(&mut write_half, &ClientFrame::Subscribe { rv, paid }).await?;
        }
        for frame in hooks.unacked_pushes().await {
            write_frame(&mut write_half, &frame).await?;
        }

        let keepalive = self.config.keepalive_interval;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write_half.shutdown().await;
                        return Ok(());
                    }
                }

                frame = read_frame(&mut read_half) => {
                    let frame = frame?;
                    debug!(?frame, "relay frame received");
                    if self.inbound_tx.send(frame).await.is_err() {
                        return Err(anyhow!("inbound consumer gone"));
                    }
                }

                op = op_rx.recv() => {
                    let Some(op) = op else {
                        return Err(anyhow!("operation queue closed"));
                    };
                    let result = write_frame(&mut write_half, &op.frame).await;
                    let _ = op.done.send(result.map_err(|e| anyhow!(e.to_string())));
                }

                _ = tokio::time::sleep(keepalive) => {
                    write_frame(&mut write_half, &ClientFrame::Ping).await?;
                }
            }
        }
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(&self.config.server_addr).await?;
        tcp.set_nodelay(true).ok();

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().context("loading native roots")? {
            let _ = roots.add(cert);
        }
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(self.config.tls_server_name.clone())
            .map_err(|_| anyhow!("invalid server name"))?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(tls)
    }
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, frame: &ClientFrame) -> Result<()> {
    let bytes = serde_json::to_vec(frame)?;
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<ServerFrame> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 16 * 1024 * 1024 {
        return Err(anyhow!("relay frame exceeds maximum size"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    let frame = serde_json::from_slice(&buf).context("decoding relay frame")?;
    Ok(frame)
}

fn backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(cap.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..=(capped / 4).max(1));
    Duration::from_millis(capped.saturating_sub(jitter / 2) + jitter / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let d = backoff_with_jitter(20, Duration::from_millis(100), Duration::from_secs(5));
        assert!(d <= Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let d1 = backoff_with_jitter(1, Duration::from_millis(100), Duration::from_secs(30));
        let d5 = backoff_with_jitter(5, Duration::from_millis(100), Duration::from_secs(30));
        assert!(d5 >= d1);
    }

    #[test]
    fn client_frame_round_trips_through_json() {
        let frame = ClientFrame::Subscribe { rv: [7u8; 32], paid: true };
        let bytes = serde_json::to_vec(&frame).unwrap();
        let back: ClientFrame = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(back, ClientFrame::Subscribe { paid: true, .. }));
    }
}
