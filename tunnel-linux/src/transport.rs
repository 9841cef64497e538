//! Peer channels: TCP listener (inbound), dialer (outbound), identity handshake and framed I/O.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tunnel_core::wire::{self, LEN_SIZE};
use tunnel_core::{ChannelInfo, ChannelOrigin, Role, RoomId, PROTOCOL_VERSION};

use crate::driver::Driver;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// First frame on every channel, in both directions. The acceptor echoes the dialer's nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub identity: String,
    pub nonce: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame: {0}")]
    Decode(#[from] wire::FrameDecodeError),
    #[error("frame: {0}")]
    Encode(#[from] wire::FrameEncodeError),
    #[error("handshake timed out")]
    Timeout,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unexpected peer identity {0:?}")]
    Identity(String),
    #[error("peer did not echo the channel nonce")]
    Nonce,
}

/// Read one frame and return its payload (length prefix stripped).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let len = wire::frame_len(&header)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_hello<W: AsyncWrite + Unpin>(
    w: &mut W,
    identity: &str,
    nonce: u64,
) -> Result<(), TransportError> {
    let bytes = wire::encode_frame(&Hello {
        version: PROTOCOL_VERSION,
        identity: identity.to_string(),
        nonce,
    })?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<Hello, TransportError> {
    let hello: Hello = wire::decode_payload(&read_frame(r).await?)?;
    if hello.version != PROTOCOL_VERSION {
        return Err(TransportError::Version(hello.version));
    }
    Ok(hello)
}

/// Acceptor side: the dialer must present the counterpart identity of our room.
pub async fn handshake_accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    room: &RoomId,
    my_role: Role,
) -> Result<ChannelInfo, TransportError> {
    let hello = read_hello(stream).await?;
    let dialer = my_role.other();
    if room.role_of(&hello.identity) != Some(dialer) {
        return Err(TransportError::Identity(hello.identity));
    }
    write_hello(stream, &room.endpoint(my_role), hello.nonce).await?;
    Ok(ChannelInfo {
        origin: ChannelOrigin::Inbound,
        dialer,
        nonce: hello.nonce,
    })
}

/// Dialer side: announce ourselves as `my_role` with `nonce`, then check we reached the
/// counterpart and that it echoed the nonce.
pub async fn handshake_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    room: &RoomId,
    my_role: Role,
    nonce: u64,
) -> Result<ChannelInfo, TransportError> {
    write_hello(stream, &room.endpoint(my_role), nonce).await?;
    let hello = read_hello(stream).await?;
    if hello.identity != room.endpoint(my_role.other()) {
        return Err(TransportError::Identity(hello.identity));
    }
    if hello.nonce != nonce {
        return Err(TransportError::Nonce);
    }
    Ok(ChannelInfo {
        origin: ChannelOrigin::Outbound,
        dialer: my_role,
        nonce,
    })
}

async fn with_timeout<T>(
    f: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, f)
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Accept inbound peer channels until the listener fails.
pub async fn run_listener(listener: TcpListener, driver: Arc<Driver>) -> std::io::Result<()> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let driver = driver.clone();
        tokio::spawn(async move {
            let Some((room, role)) = driver.room_and_role().await else {
                tracing::debug!(%peer, "inbound channel before registration, dropping");
                return;
            };
            match with_timeout(handshake_accept(&mut stream, &room, role)).await {
                Ok(info) => run_channel(stream, info, driver).await,
                Err(e) => tracing::debug!(%peer, error = %e, "inbound handshake failed"),
            }
        });
    }
}

/// Dial the peer at `addr`, expecting it to hold the counterpart of `my_role`.
pub async fn dial(
    addr: std::net::SocketAddr,
    room: &RoomId,
    my_role: Role,
    driver: Arc<Driver>,
) -> Result<(), TransportError> {
    let connect = async { TcpStream::connect(addr).await.map_err(TransportError::from) };
    let mut stream = with_timeout(connect).await?;
    let nonce = rand::random::<u64>();
    let info = with_timeout(handshake_connect(&mut stream, room, my_role, nonce)).await?;
    run_channel(stream, info, driver).await;
    Ok(())
}

/// Drive one channel: register it with the driver, pump frames into the core until the
/// stream ends or the core closes the channel.
async fn run_channel(stream: TcpStream, info: ChannelInfo, driver: Arc<Driver>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, mut close_rx) = oneshot::channel();

    // Drains everything queued before the sender is dropped.
    let write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    let channel = driver.attach(tx, close_tx, write_task);

    driver.channel_opened(channel, info).await;
    loop {
        tokio::select! {
            r = read_frame(&mut reader) => match r {
                Ok(payload) => driver.channel_data(channel, &payload).await,
                Err(e) => {
                    tracing::debug!(channel, error = %e, "channel read ended");
                    break;
                }
            },
            _ = &mut close_rx => break,
        }
    }
    driver.detach(channel);
    driver.channel_closed(channel).await;
}
