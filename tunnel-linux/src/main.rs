// Tunnel Linux: terminal chat client for one room, plus the signalling server.

mod config;
mod driver;
mod signal;
mod store;
mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tunnel_core::{ChatCore, ChatEvent, ConnectionStatus, MessageStatus, SenderRole, SessionConfig};

use crate::driver::Driver;
use crate::store::SqliteStore;

const DEFAULT_SIGNAL_PORT: u16 = 45680;

#[derive(Parser, Debug)]
#[command(name = "tunnel-linux", version, about)]
struct Cli {
    /// Config file (default: ~/.config/tunnel/config.toml, then /etc/tunnel/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the room derived from a shared secret.
    Join { secret: String },
    /// Rejoin the last room joined on this machine.
    Resume,
    /// Run the signalling server.
    Signal {
        /// TCP port (default: the port of the configured signal address).
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Join { secret } => run_chat(&cfg, Some(secret)).await,
            Command::Resume => run_chat(&cfg, None).await,
            Command::Signal { port } => run_signal(&cfg, port).await,
        }
    })
}

async fn run_signal(cfg: &config::Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| {
        cfg.signal_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(DEFAULT_SIGNAL_PORT)
    });
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind signalling port {port}"))?;
    tracing::info!(addr = %listener.local_addr()?, "signalling server up");
    tokio::select! {
        r = signal::serve(listener) => r?,
        r = shutdown_signal() => r?,
    }
    Ok(())
}

async fn run_chat(cfg: &config::Config, secret: Option<String>) -> anyhow::Result<()> {
    let store = SqliteStore::open(&cfg.db_path)
        .with_context(|| format!("open {}", cfg.db_path.display()))?;
    let secret = match secret {
        Some(s) => s,
        None => store
            .last_room_secret()?
            .context("no remembered room; use `join <secret>`")?,
    };
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("bind listen port {}", cfg.listen_port))?;
    let listen_port = listener.local_addr()?.port();

    let config = SessionConfig {
        room_secret: secret,
    };
    let (core, actions) = ChatCore::join(&config, store, now_ms())?;
    core.log().store().remember_room_secret(&config.room_secret)?;
    println!(
        "-- room {} as {} (/kill ends the room for both, /logout, /quit)",
        core.room_id(),
        core.my_display_name()
    );
    let mut view = View::default();
    view.render(&core);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let driver = Driver::new(core, cfg.signal_addr.clone(), listen_port, events_tx);
    let listener_task = tokio::spawn(transport::run_listener(listener, driver.clone()));
    let ticker = driver.spawn_ticker();
    driver.with_core(move |_| actions).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_input(&driver, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            ev = events.recv() => match ev {
                Some(ChatEvent::LoggedOut) | None => {
                    println!("-- left the room");
                    break;
                }
                Some(ChatEvent::StatusChanged(ConnectionStatus::Online)) => {
                    println!("-- peer connected");
                }
                Some(ChatEvent::StatusChanged(ConnectionStatus::Offline)) => {
                    println!("-- peer offline");
                }
                Some(ChatEvent::PeerNameChanged(name)) => println!("-- peer is {name}"),
                Some(ChatEvent::MessagesChanged) => view.render(&*driver.core().lock().await),
            },
            r = &mut shutdown => {
                r?;
                break;
            }
        }
    }

    ticker.abort();
    listener_task.abort();
    driver.shutdown().await;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_input(driver: &Arc<Driver>, line: &str) -> bool {
    match line {
        "" => {}
        "/quit" => return false,
        "/kill" => driver.with_core(|c| c.end_session()).await,
        "/logout" => driver.with_core(|c| c.log_out()).await,
        text => {
            driver
                .with_core(|c| match c.send_message(text, now_ms()) {
                    Ok(actions) => actions,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not store message");
                        vec![]
                    }
                })
                .await
        }
    }
    true
}

/// Prints new messages and read marks; remembers what it already showed.
#[derive(Default)]
struct View {
    shown: HashMap<String, MessageStatus>,
}

impl View {
    fn render(&mut self, core: &ChatCore<SqliteStore>) {
        if core.messages().is_empty() {
            self.shown.clear();
        }
        for m in core.messages() {
            match self.shown.insert(m.id.clone(), m.status) {
                None => {
                    let who = match m.sender {
                        SenderRole::Me => core.my_display_name(),
                        SenderRole::Peer => core.peer_display_name(),
                    };
                    println!("<{who}> {}", m.content);
                }
                Some(MessageStatus::Sent)
                    if m.status == MessageStatus::Read && m.sender == SenderRole::Me =>
                {
                    println!("   (read: {})", m.content);
                }
                Some(_) => {}
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
