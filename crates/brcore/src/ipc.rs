//! Control-plane IPC (§4.N): the local, authenticated, newline-delimited-
//! JSON protocol `brctl` (and any other local frontend) speaks to
//! `brrelayd` over a Unix domain socket (a named pipe on Windows). A
//! challenge-response handshake establishes each `IpcEnvelope` session with
//! nonce-replay protection, after which `IpcRequest`/`IpcResponse` carry the
//! Chat/Posts/Payments/Version RPC surface from §6, plus a `Push` envelope
//! variant for server-initiated stream events (`PMStream` et al.).

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

pub const IPC_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChallenge {
    pub session_id: String,
    pub server_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuth {
    pub session_id: String,
    pub client_nonce: String,
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcEnvelope {
    ClientHello(ClientHello),
    ServerChallenge(ServerChallenge),
    ClientAuth(ClientAuth),
    AuthOk(AuthOk),
    Error { message: String },
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    /// Server-initiated push frame carrying a streaming RPC event
    /// (`PMStream`, `GCMStream`, `KXStream`, `PostsStream`,
    /// `PostsStatusStream`, `KeepaliveStream`) — the teacher's protocol had
    /// no analogue since it was pure request/response.
    Push(PushEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub session_id: String,
    pub nonce: u64,
    pub request: IpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub session_id: String,
    pub nonce: u64,
    pub response: IpcResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub session_id: String,
    pub event: StreamEvent,
}

/// One ordered event on a consumer stream (§4.H, §6). `sequence_id` is the
/// stream's monotonic order; consumers ack through `AckReceived*`/
/// `AckKXCompleted`/`AckReceivedPost*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", content = "data")]
pub enum StreamEvent {
    Pm {
        uid: String,
        nick: String,
        msg: String,
        timestamp_ms: i64,
        sequence_id: u64,
    },
    Gcm {
        gc_id: String,
        uid: String,
        nick: String,
        msg: String,
        timestamp_ms: i64,
        sequence_id: u64,
    },
    Kx {
        uid: String,
        nick: String,
        sequence_id: u64,
    },
    Post {
        uid: String,
        post_id: String,
        title: String,
        body: String,
        timestamp_ms: i64,
        sequence_id: u64,
    },
    PostStatus {
        post_id: String,
        status: String,
        sequence_id: u64,
    },
    Keepalive {
        timestamp_ms: i64,
    },
}

/// The consumer-facing RPC surface (§6): five logical services — Version,
/// Chat, Posts, Payments — collapsed into one exhaustive request enum per
/// §9's "prefer compile-time enumeration to reflection".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum IpcRequest {
    Version,
    KeepaliveStream { interval_ms: u64 },

    Pm { user: String, msg: String },
    PmStream { unacked_from: u64 },
    AckReceivedPm { sequence_id: u64 },

    Gcm { gc_id: String, msg: String },
    GcmStream { unacked_from: u64 },
    AckReceivedGcm { sequence_id: u64 },

    MediateKx { mediator: String, target: String },
    KxStream { unacked_from: u64 },
    AckKxCompleted { sequence_id: u64 },

    SubscribeToPosts { user: String },
    UnsubscribeToPosts { user: String },
    PostsStream { unacked_from: u64 },
    AckReceivedPost { sequence_id: u64 },
    PostsStatusStream { unacked_from: u64 },
    AckReceivedPostStatus { sequence_id: u64 },

    TipUser { user: String, dcr_amount: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum IpcResponse {
    Version {
        app_version: String,
        runtime: String,
        app_name: String,
    },
    StreamStarted,
    Sent,
    Acked,
    KxMediationStarted,
    Subscribed,
    Unsubscribed,
    TipSent,
    Error {
        kind: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_nonce: u64,
}

pub struct IpcAuthContext {
    shared_secret: Vec<u8>,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl IpcAuthContext {
    pub fn new(shared_secret: Vec<u8>) -> Self {
        Self {
            shared_secret,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn compute_proof(&self, server_nonce: &str, client_nonce: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.shared_secret)
            .map_err(|e| anyhow!("mac init: {e}"))?;
        mac.update(server_nonce.as_bytes());
        mac.update(client_nonce.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub async fn register_session(&self, session_id: String) {
        let mut guard = self.sessions.lock().await;
        guard.insert(session_id, SessionState { last_nonce: 0 });
    }

    pub async fn verify_and_update_nonce(&self, session_id: &str, nonce: u64) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session"))?;
        if nonce <= session.last_nonce {
            return Err(anyhow!("replay detected: nonce not increasing"));
        }
        session.last_nonce = nonce;
        Ok(())
    }
}

pub struct IpcServer {
    auth: Arc<IpcAuthContext>,
    socket_path: std::path::PathBuf,
}

impl IpcServer {
    pub fn new(auth_secret: Vec<u8>, socket_path: std::path::PathBuf) -> Self {
        Self {
            auth: Arc::new(IpcAuthContext::new(auth_secret)),
            socket_path,
        }
    }

    #[cfg(unix)]
    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        use tokio::net::UnixListener;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        loop {
            let (stream, _addr) = listener.accept().await?;
            let auth = self.auth.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, auth, handler).await {
                    tracing::warn!(error = %e, "ipc connection error");
                }
            });
        }
    }

    #[cfg(windows)]
    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
        loop {
            let server: NamedPipeServer = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&self.socket_path)?;
            server.connect().await?;
            let auth = self.auth.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(server, auth, handler).await {
                    tracing::warn!(error = %e, "ipc connection error");
                }
            });
        }
    }
}

/// Implemented by the orchestrator (O): routes each request to the right
/// component and, for streaming RPCs, hands back a receiver the connection
/// loop forwards as `Push` frames.
#[async_trait::async_trait]
pub trait IpcHandler {
    async fn handle(&self, req: IpcRequest, session_id: &str) -> Result<IpcResponse>;
    /// Non-`None` only for the `*Stream` request variants: the connection
    /// loop drains this alongside request/response traffic and forwards
    /// each item as a `Push` frame until the client disconnects.
    async fn open_stream(
        &self,
        req: &IpcRequest,
        session_id: &str,
    ) -> Option<mpsc::Receiver<StreamEvent>>;
}

async fn handle_connection<S>(
    stream: S,
    auth: Arc<IpcAuthContext>,
    handler: Arc<dyn IpcHandler + Send + Sync>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("empty hello"));
    }
    let envelope: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    let hello = match envelope {
        IpcEnvelope::ClientHello(h) => h,
        _ => return Err(anyhow!("expected ClientHello")),
    };
    if hello.protocol_version != IPC_PROTOCOL_VERSION {
        write_envelope(
            &writer,
            &IpcEnvelope::Error {
                message: "protocol version mismatch".to_string(),
            },
        )
        .await?;
        return Err(anyhow!("protocol version mismatch"));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut server_nonce_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut server_nonce_bytes);
    let server_nonce = hex::encode(server_nonce_bytes);

    write_envelope(
        &writer,
        &IpcEnvelope::ServerChallenge(ServerChallenge {
            session_id: session_id.clone(),
            server_nonce: server_nonce.clone(),
        }),
    )
    .await?;

    line.clear();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("missing client auth"));
    }
    let envelope: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    let auth_msg = match envelope {
        IpcEnvelope::ClientAuth(m) => m,
        _ => return Err(anyhow!("expected ClientAuth")),
    };
    if auth_msg.session_id != session_id {
        return Err(anyhow!("session id mismatch"));
    }
    let expected = auth.compute_proof(&server_nonce, &auth_msg.client_nonce)?;
    if expected != auth_msg.proof {
        return Err(anyhow!("invalid proof"));
    }

    auth.register_session(session_id.clone()).await;
    write_envelope(
        &writer,
        &IpcEnvelope::AuthOk(AuthOk {
            session_id: session_id.clone(),
        }),
    )
    .await?;

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let env: IpcEnvelope = serde_json::from_str(line.trim_end())?;
        let req_env = match env {
            IpcEnvelope::Request(r) => r,
            _ => return Err(anyhow!("expected Request envelope")),
        };
        if req_env.session_id != session_id {
            return Err(anyhow!("session mismatch"));
        }
        auth.verify_and_update_nonce(&session_id, req_env.nonce)
            .await?;

        if let Some(mut rx) = handler.open_stream(&req_env.request, &session_id).await {
            let writer = writer.clone();
            let session_id_clone = session_id.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let push = IpcEnvelope::Push(PushEnvelope {
                        session_id: session_id_clone.clone(),
                        event,
                    });
                    if write_envelope(&writer, &push).await.is_err() {
                        break;
                    }
                }
            });
            write_envelope(
                &writer,
                &IpcEnvelope::Response(ResponseEnvelope {
                    session_id: session_id.clone(),
                    nonce: req_env.nonce,
                    response: IpcResponse::StreamStarted,
                }),
            )
            .await?;
            continue;
        }

        let resp = match handler.handle(req_env.request, &session_id).await {
            Ok(resp) => resp,
            Err(e) => IpcResponse::Error {
                kind: "request_failed".to_string(),
                message: e.to_string(),
            },
        };
        write_envelope(
            &writer,
            &IpcEnvelope::Response(ResponseEnvelope {
                session_id: session_id.clone(),
                nonce: req_env.nonce,
                response: resp,
            }),
        )
        .await?;
    }
    Ok(())
}

async fn write_envelope<W>(writer: &Arc<Mutex<W>>, envelope: &IpcEnvelope) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    w.write_all(serde_json::to_string(envelope)?.as_bytes())
        .await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn proof_changes_with_nonce() {
        let ctx = IpcAuthContext::new(vec![1, 2, 3, 4]);
        let p1 = ctx.compute_proof("abc", "def").unwrap();
        let p2 = ctx.compute_proof("abc", "xyz").unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn nonce_replay_rejected() {
        let ctx = IpcAuthContext::new(vec![1, 2, 3, 4]);
        ctx.register_session("s1".to_string()).await;
        ctx.verify_and_update_nonce("s1", 1).await.unwrap();
        assert!(ctx.verify_and_update_nonce("s1", 1).await.is_err());
    }
}
