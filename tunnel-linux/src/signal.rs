//! Signalling: identity registry server and its client.
//!
//! Newline-delimited JSON over TCP. A claim lives exactly as long as the TCP connection that
//! registered it; lookups return the claimant's IP with its announced listen port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tunnel_core::RegisterError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Register { identity: String, listen_port: u16 },
    Lookup { identity: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnavailableId,
    BadRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    Registered { identity: String },
    Found { identity: String, addr: SocketAddr },
    NotFound { identity: String },
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signalling io: {0}")]
    Io(#[from] std::io::Error),
    #[error("signalling server timed out")]
    Timeout,
    #[error("identity already claimed")]
    Taken,
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("bad server reply: {0}")]
    Protocol(String),
    #[error("server closed the connection")]
    Closed,
}

impl From<SignalError> for RegisterError {
    fn from(e: SignalError) -> Self {
        match e {
            SignalError::Taken => RegisterError::IdentityTaken,
            other => RegisterError::Unavailable(other.to_string()),
        }
    }
}

/// A held identity. Dropping it (or calling `release`) closes the registering connection,
/// which frees the identity on the server.
#[derive(Debug)]
pub struct Claim {
    identity: String,
    release: Option<oneshot::Sender<()>>,
}

impl Claim {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn release(mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}

/// Register `identity`. On success the returned receiver fires if the server connection is
/// lost while the claim is still held.
pub async fn register(
    server: &str,
    identity: &str,
    listen_port: u16,
) -> Result<(Claim, oneshot::Receiver<()>), SignalError> {
    let stream = connect(server).await?;
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);
    send(
        &mut write,
        &ClientMsg::Register {
            identity: identity.to_string(),
            listen_port,
        },
    )
    .await?;
    match recv(&mut read).await? {
        ServerMsg::Registered { identity: got } if got == identity => {}
        ServerMsg::Error {
            code: ErrorCode::UnavailableId,
            ..
        } => return Err(SignalError::Taken),
        ServerMsg::Error { message, .. } => return Err(SignalError::Rejected(message)),
        other => return Err(SignalError::Protocol(format!("{other:?}"))),
    }

    let (release_tx, release_rx) = oneshot::channel();
    let (lost_tx, lost_rx) = oneshot::channel();
    let held = identity.to_string();
    tokio::spawn(async move {
        let mut line = String::new();
        tokio::select! {
            _ = release_rx => {
                tracing::debug!(identity = %held, "claim released");
            }
            _ = read.read_line(&mut line) => {
                tracing::warn!(identity = %held, "signalling connection lost");
                let _ = lost_tx.send(());
            }
        }
        drop(write);
    });

    Ok((
        Claim {
            identity: identity.to_string(),
            release: Some(release_tx),
        },
        lost_rx,
    ))
}

/// Resolve a claimed identity to the address its holder listens on.
pub async fn lookup(server: &str, identity: &str) -> Result<Option<SocketAddr>, SignalError> {
    let stream = connect(server).await?;
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);
    send(
        &mut write,
        &ClientMsg::Lookup {
            identity: identity.to_string(),
        },
    )
    .await?;
    match recv(&mut read).await? {
        ServerMsg::Found { addr, .. } => Ok(Some(addr)),
        ServerMsg::NotFound { .. } => Ok(None),
        ServerMsg::Error { message, .. } => Err(SignalError::Rejected(message)),
        other => Err(SignalError::Protocol(format!("{other:?}"))),
    }
}

async fn connect(server: &str) -> Result<TcpStream, SignalError> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(server))
        .await
        .map_err(|_| SignalError::Timeout)?
        .map_err(SignalError::Io)
}

async fn send<T: Serialize>(w: &mut OwnedWriteHalf, msg: &T) -> Result<(), SignalError> {
    let mut line = serde_json::to_vec(msg).map_err(|e| SignalError::Protocol(e.to_string()))?;
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await?;
    Ok(())
}

async fn recv(r: &mut BufReader<OwnedReadHalf>) -> Result<ServerMsg, SignalError> {
    let mut line = String::new();
    let n = tokio::time::timeout(CONNECT_TIMEOUT, r.read_line(&mut line))
        .await
        .map_err(|_| SignalError::Timeout)??;
    if n == 0 {
        return Err(SignalError::Closed);
    }
    serde_json::from_str(line.trim_end()).map_err(|e| SignalError::Protocol(e.to_string()))
}

type ConnId = u64;

/// Identity claims held by live connections.
#[derive(Debug, Default)]
pub struct Registry {
    claims: HashMap<String, (ConnId, SocketAddr)>,
}

impl Registry {
    /// Claim `identity` for `conn`. Re-claiming an identity the same connection holds succeeds.
    pub fn claim(&mut self, conn: ConnId, identity: &str, addr: SocketAddr) -> bool {
        match self.claims.get(identity) {
            Some((owner, _)) if *owner != conn => false,
            _ => {
                self.claims.insert(identity.to_string(), (conn, addr));
                true
            }
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<SocketAddr> {
        self.claims.get(identity).map(|(_, addr)| *addr)
    }

    /// Drop every claim held by `conn`. Returns how many were dropped.
    pub fn release_all(&mut self, conn: ConnId) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, (owner, _)| *owner != conn);
        before - self.claims.len()
    }
}

/// Run the signalling server on `listener` until the listener fails.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    let registry = Arc::new(Mutex::new(Registry::default()));
    let mut next_conn: ConnId = 0;
    loop {
        let (stream, peer) = listener.accept().await?;
        next_conn += 1;
        let conn = next_conn;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, conn, &registry).await {
                tracing::debug!(%peer, error = %e, "signalling client error");
            }
            let dropped = registry
                .lock()
                .map(|mut r| r.release_all(conn))
                .unwrap_or_default();
            if dropped > 0 {
                tracing::info!(%peer, dropped, "claims released");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnId,
    registry: &Mutex<Registry>,
) -> Result<(), SignalError> {
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);
    let mut line = Vec::new();
    loop {
        match read_request(&mut read, &mut line).await? {
            LineRead::Eof => return Ok(()),
            LineRead::TooLong => {
                let reply = error(ErrorCode::BadRequest, "line too long");
                send(&mut write, &reply).await?;
                return Ok(());
            }
            LineRead::Line => {}
        }
        let reply = match serde_json::from_slice::<ClientMsg>(&line) {
            Ok(msg) => answer(msg, peer, conn, registry),
            Err(e) => error(ErrorCode::BadRequest, &e.to_string()),
        };
        send(&mut write, &reply).await?;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    TooLong,
}

/// Read one request line into `line`, buffering at most `MAX_LINE + 1` bytes of it.
async fn read_request<R: AsyncBufRead + Unpin>(
    r: &mut R,
    line: &mut Vec<u8>,
) -> std::io::Result<LineRead> {
    line.clear();
    let n = (&mut *r)
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', line)
        .await?;
    Ok(match n {
        0 => LineRead::Eof,
        n if n > MAX_LINE => LineRead::TooLong,
        _ => LineRead::Line,
    })
}

fn answer(msg: ClientMsg, peer: SocketAddr, conn: ConnId, registry: &Mutex<Registry>) -> ServerMsg {
    let Ok(mut reg) = registry.lock() else {
        return error(ErrorCode::BadRequest, "registry unavailable");
    };
    match msg {
        ClientMsg::Register {
            identity,
            listen_port,
        } => {
            let addr = SocketAddr::new(peer.ip(), listen_port);
            if reg.claim(conn, &identity, addr) {
                tracing::info!(%identity, %addr, "registered");
                ServerMsg::Registered { identity }
            } else {
                tracing::debug!(%identity, "claim refused");
                error(ErrorCode::UnavailableId, &format!("{identity} is taken"))
            }
        }
        ClientMsg::Lookup { identity } => match reg.lookup(&identity) {
            Some(addr) => ServerMsg::Found { identity, addr },
            None => ServerMsg::NotFound { identity },
        },
    }
}

fn error(code: ErrorCode, message: &str) -> ServerMsg {
    ServerMsg::Error {
        code,
        message: message.to_string(),
    }
}
