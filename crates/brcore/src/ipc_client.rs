use crate::ipc::{
    AuthOk, ClientAuth, ClientHello, IpcEnvelope, IpcRequest, IpcResponse, PushEnvelope,
    RequestEnvelope, ServerChallenge, StreamEvent, IPC_PROTOCOL_VERSION,
};
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

fn compute_proof(secret: &[u8], server_nonce: &str, client_nonce: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| anyhow!("mac init: {e}"))?;
    mac.update(server_nonce.as_bytes());
    mac.update(client_nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub async fn send_request(
    socket_path: std::path::PathBuf,
    secret: &[u8],
    request: IpcRequest,
) -> Result<IpcResponse> {
    #[cfg(unix)]
    let stream = UnixStream::connect(socket_path).await?;

    #[cfg(windows)]
    let stream = ClientOptions::new()
        .open(socket_path)
        .map_err(|e| anyhow!("ipc connect: {e}"))?;

    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let session_id = handshake(&mut reader, &mut writer, secret).await?;

    let request_envelope = IpcEnvelope::Request(RequestEnvelope {
        session_id,
        nonce: 1,
        request,
    });
    write_line(&mut writer, &request_envelope).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    match response {
        IpcEnvelope::Response(envelope) => Ok(envelope.response),
        IpcEnvelope::Error { message } => Err(anyhow!(message)),
        _ => Err(anyhow!("unexpected response")),
    }
}

/// Handshake, then issue a `*Stream` request and invoke `on_event` for every
/// `Push` frame the server sends until the connection closes or `on_event`
/// returns `false`. Used by `brctl` for long-running subscriptions such as
/// `PmStream`/`GcmStream` (§6).
pub async fn stream_request<F>(
    socket_path: std::path::PathBuf,
    secret: &[u8],
    request: IpcRequest,
    mut on_event: F,
) -> Result<()>
where
    F: FnMut(StreamEvent) -> bool,
{
    #[cfg(unix)]
    let stream = UnixStream::connect(socket_path).await?;

    #[cfg(windows)]
    let stream = ClientOptions::new()
        .open(socket_path)
        .map_err(|e| anyhow!("ipc connect: {e}"))?;

    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let session_id = handshake(&mut reader, &mut writer, secret).await?;

    let request_envelope = IpcEnvelope::Request(RequestEnvelope {
        session_id: session_id.clone(),
        nonce: 1,
        request,
    });
    write_line(&mut writer, &request_envelope).await?;

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let envelope: IpcEnvelope = serde_json::from_str(line.trim_end())?;
        match envelope {
            IpcEnvelope::Response(resp) => {
                if let IpcResponse::Error { kind, message } = resp.response {
                    return Err(anyhow!("{kind}: {message}"));
                }
            }
            IpcEnvelope::Push(PushEnvelope { event, .. }) => {
                if !on_event(event) {
                    return Ok(());
                }
            }
            IpcEnvelope::Error { message } => return Err(anyhow!(message)),
            _ => {}
        }
    }
}

async fn handshake<R, W>(reader: &mut BufReader<R>, writer: &mut W, secret: &[u8]) -> Result<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let client_hello = ClientHello {
        protocol_version: IPC_PROTOCOL_VERSION,
        client_id: "ui".to_string(),
    };
    write_line(writer, &IpcEnvelope::ClientHello(client_hello)).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let challenge: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    let ServerChallenge {
        session_id,
        server_nonce,
    } = match challenge {
        IpcEnvelope::ServerChallenge(c) => c,
        IpcEnvelope::Error { message } => return Err(anyhow!(message)),
        _ => return Err(anyhow!("expected ServerChallenge")),
    };

    let mut nonce_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let client_nonce = hex::encode(nonce_bytes);
    let proof = compute_proof(secret, &server_nonce, &client_nonce)?;

    write_line(
        writer,
        &IpcEnvelope::ClientAuth(ClientAuth {
            session_id: session_id.clone(),
            client_nonce,
            proof,
        }),
    )
    .await?;

    line.clear();
    reader.read_line(&mut line).await?;
    let auth_ok: IpcEnvelope = serde_json::from_str(line.trim_end())?;
    match auth_ok {
        IpcEnvelope::AuthOk(AuthOk { session_id }) => Ok(session_id),
        IpcEnvelope::Error { message } => Err(anyhow!(message)),
        _ => Err(anyhow!("expected AuthOk")),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &IpcEnvelope) -> Result<()> {
    writer
        .write_all(serde_json::to_string(envelope)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
