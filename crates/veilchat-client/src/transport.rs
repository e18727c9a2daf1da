//! Relay connection.
//!
//! The connection is an owned handle: `connect` spawns a writer task and a
//! reader task, and `disconnect` (or drop) tears both down. Everything above
//! this layer talks to the relay through the [`Transport`] trait so it can
//! be driven without a socket.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use veilchat_protocol::codec::{
    decode_server_msg, encode_client_msg, try_decode_frame, PROTOCOL_VERSION,
};
use veilchat_protocol::{ClientMessage, ServerMessage};

use crate::config::parse_address;
use crate::error::ClientError;

/// Outbound half of a relay connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError>;

    /// announce-presence
    async fn announce(&self, username: &str, public_key: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::Join {
            username: username.to_string(),
            public_key: public_key.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Disconnect).await
    }
}

/// A live TCP connection to the relay.
pub struct Connection {
    tx: mpsc::Sender<Vec<u8>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to the relay and start the I/O tasks.
    ///
    /// Incoming server messages are delivered on the returned receiver,
    /// which closes when the relay hangs up.
    pub async fn connect(
        address: &str,
    ) -> Result<(Self, mpsc::Receiver<ServerMessage>), ClientError> {
        let (host, port) = parse_address(address)?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        info!("TCP connected to {}", address);
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream<S>(stream: S) -> (Self, mpsc::Receiver<ServerMessage>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerMessage>(256);

        let writer = tokio::spawn(writer_task(write_half, rx));
        let reader = tokio::spawn(reader_task(read_half, inbound_tx));

        let connection = Self {
            tx,
            tasks: Mutex::new(vec![writer, reader]),
        };
        (connection, inbound_rx)
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let data = encode_client_msg(&msg)?;
        self.tx
            .send(data)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let result = self.send(ClientMessage::Disconnect).await;
        // let the writer flush the goodbye before the tasks go away
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.abort_tasks();
        info!("disconnected from relay");
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn writer_task<W>(mut write_half: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            error!("TCP write error: {}", e);
            break;
        }
    }
    info!("TCP writer task ended");
}

async fn reader_task<R>(mut read_half: R, inbound: mpsc::Sender<ServerMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    'read: loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!("relay closed TCP connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("TCP read error: {}", e);
                break;
            }
        }

        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => match decode_server_msg(&payload) {
                    Ok(msg) => {
                        if inbound.send(msg).await.is_err() {
                            break 'read;
                        }
                    }
                    Err(e) => warn!("failed to decode server message: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("frame decode error: {}", e);
                    break 'read;
                }
            }
        }
    }
    info!("TCP reader task ended");
}
