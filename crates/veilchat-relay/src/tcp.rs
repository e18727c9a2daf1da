use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use veilchat_protocol::codec::{
    decode_client_msg, encode_server_msg, try_decode_frame, PROTOCOL_VERSION,
};
use veilchat_protocol::{ClientMessage, ServerMessage};

use crate::state::{send_msg, Rejection, RelayState};

/// How long a new connection has to send `Join`.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a single client connection.
pub async fn handle_connection<S>(mut stream: S, peer_addr: String, state: Arc<RelayState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(peer = %peer_addr, "new TCP connection");

    // Frames for this peer are queued here before it is visible to others.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    // --- Join phase (with timeout) ---
    let mut buf = BytesMut::with_capacity(4096);
    let join_result = tokio::time::timeout(
        JOIN_TIMEOUT,
        join(&mut stream, &mut buf, &state, &peer_addr, tx.clone()),
    )
    .await;
    let username = match join_result {
        Ok(Ok(username)) => username,
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, "join failed: {}", e);
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "join timed out");
            return;
        }
    };

    // --- Split into reader/writer ---
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer_handle = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                error!("TCP write error: {}", e);
                break;
            }
        }
    });

    // --- Message loop ---
    'conn: loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!(username = %username, "client disconnected (EOF)");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(username = %username, "TCP read error: {}", e);
                break;
            }
        }

        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => match decode_client_msg(&payload) {
                    Ok(ClientMessage::Disconnect) => {
                        info!(username = %username, "client sent disconnect");
                        break 'conn;
                    }
                    Ok(msg) => {
                        if let Err(e) = handle_message(msg, &state, &username, &tx).await {
                            error!(username = %username, "error handling message: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!(username = %username, "failed to decode client message: {}", e);
                    }
                },
                Ok(None) => break, // need more data
                Err(e) => {
                    error!(username = %username, "frame decode error: {}", e);
                    break 'conn;
                }
            }
        }
    }

    // --- Cleanup ---
    state.leave(&username).await;
    info!(username = %username, "peer removed");
    drop(tx);
    // Let queued frames drain before the writer is torn down.
    let _ = tokio::time::timeout(Duration::from_millis(100), writer_handle).await;
}

/// Wait for `Join` and admit the peer. Rejections are answered on `stream`.
async fn join<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    state: &RelayState,
    peer_addr: &str,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read until we get a complete message
    let payload = loop {
        if let Some(payload) = try_decode_frame(buf)? {
            break payload;
        }
        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("connection closed before join");
        }
    };

    let ClientMessage::Join {
        username,
        public_key,
        protocol_version,
    } = decode_client_msg(&payload)?
    else {
        anyhow::bail!("expected Join as first message");
    };

    let admitted = if protocol_version != PROTOCOL_VERSION {
        Err(Rejection::VersionMismatch {
            client: protocol_version,
            relay: PROTOCOL_VERSION,
        })
    } else {
        state.join(&username, &public_key, tx).await?
    };

    if let Err(rejection) = admitted {
        let data = encode_server_msg(&ServerMessage::JoinRejected {
            reason: rejection.to_string(),
        })?;
        stream.write_all(&data).await?;
        anyhow::bail!("rejected {username:?}: {rejection}");
    }

    info!(peer = %peer_addr, username = %username, "peer joined");
    Ok(username)
}

/// Handle a client message after join.
///
/// Payloads are forwarded untouched; only the addressing is rewritten.
async fn handle_message(
    msg: ClientMessage,
    state: &RelayState,
    username: &str,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let (to, outbound) = match msg {
        ClientMessage::RequestKeyExchange { to } => {
            let outbound = ServerMessage::KeyExchangeRequested {
                from: username.to_string(),
            };
            (to, outbound)
        }
        ClientMessage::WrappedKey { to, wrapped_key } => {
            let outbound = ServerMessage::WrappedKey {
                from: username.to_string(),
                wrapped_key,
            };
            (to, outbound)
        }
        ClientMessage::SendMessage { to, envelope } => {
            let outbound = ServerMessage::Message {
                from: username.to_string(),
                envelope,
                timestamp: now_millis(),
            };
            (to, outbound)
        }
        ClientMessage::Join { .. } => {
            warn!(username = %username, "received duplicate Join, ignoring");
            return Ok(());
        }
        ClientMessage::Disconnect => return Ok(()),
    };

    if !state.forward(&to, &outbound).await {
        send_msg(
            tx,
            &ServerMessage::Error {
                message: format!("unknown peer: {to}"),
            },
        )
        .await?;
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
