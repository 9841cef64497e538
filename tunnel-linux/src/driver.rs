//! Runs a `ChatCore` on tokio: executes its actions against signalling, peer channels and the
//! store, and feeds timer ticks and I/O events back in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tunnel_core::{
    Action, ChannelId, ChannelInfo, ChatCore, ChatEvent, RegisterError, Role, RoomId, TICK,
};

use crate::signal::{self, Claim};
use crate::store::SqliteStore;
use crate::transport;

/// How long `shutdown` waits for queued channel writes.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct ChannelHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    close: oneshot::Sender<()>,
}

pub struct Driver {
    core: Mutex<ChatCore<SqliteStore>>,
    channels: StdMutex<HashMap<ChannelId, ChannelHandle>>,
    writers: StdMutex<Vec<JoinHandle<()>>>,
    claims: StdMutex<HashMap<String, Claim>>,
    next_channel: AtomicU64,
    signal_addr: String,
    listen_port: u16,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl Driver {
    pub fn new(
        core: ChatCore<SqliteStore>,
        signal_addr: String,
        listen_port: u16,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(core),
            channels: StdMutex::new(HashMap::new()),
            writers: StdMutex::new(Vec::new()),
            claims: StdMutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            signal_addr,
            listen_port,
            events,
        })
    }

    pub fn core(&self) -> &Mutex<ChatCore<SqliteStore>> {
        &self.core
    }

    /// Tick the core every `TICK` until the returned task is aborted.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.tick().await;
            loop {
                interval.tick().await;
                this.with_core(|c| c.tick()).await;
            }
        })
    }

    /// Run a user operation against the core and execute what it asks for before the core is
    /// unlocked again.
    pub async fn with_core<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&mut ChatCore<SqliteStore>) -> Vec<Action>,
    {
        let mut core = self.core.lock().await;
        let actions = f(&mut *core);
        self.dispatch(&*core, actions);
    }

    /// Leave the room, drop every claim and channel, then wait (bounded) for queued channel
    /// writes to reach the socket.
    pub async fn shutdown(self: &Arc<Self>) {
        self.with_core(|c| c.leave()).await;
        if let Ok(mut claims) = self.claims.lock() {
            claims.clear();
        }
        let open: Vec<ChannelHandle> = self
            .channels
            .lock()
            .map(|mut ch| ch.drain().map(|(_, h)| h).collect())
            .unwrap_or_default();
        for h in open {
            let _ = h.close.send(());
        }
        let writers = self
            .writers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        let flush = async {
            for w in writers {
                let _ = w.await;
            }
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
            tracing::warn!("channel writes still pending at shutdown");
        }
    }

    pub(crate) async fn room_and_role(&self) -> Option<(RoomId, Role)> {
        let core = self.core.lock().await;
        core.role().map(|r| (core.room_id().clone(), r))
    }

    /// Register a channel's writer queue, close trigger and writer task.
    pub(crate) fn attach(
        &self,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        close: oneshot::Sender<()>,
        writer: JoinHandle<()>,
    ) -> ChannelId {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut ch) = self.channels.lock() {
            ch.insert(id, ChannelHandle { tx, close });
        }
        if let Ok(mut w) = self.writers.lock() {
            w.retain(|h| !h.is_finished());
            w.push(writer);
        }
        id
    }

    pub(crate) fn detach(&self, channel: ChannelId) {
        if let Ok(mut ch) = self.channels.lock() {
            ch.remove(&channel);
        }
    }

    pub(crate) async fn channel_opened(self: &Arc<Self>, channel: ChannelId, info: ChannelInfo) {
        self.with_core(|c| c.on_channel_open(channel, info)).await;
    }

    pub(crate) async fn channel_data(self: &Arc<Self>, channel: ChannelId, payload: &[u8]) {
        self.with_core(|c| c.on_channel_data(channel, payload)).await;
    }

    pub(crate) async fn channel_closed(self: &Arc<Self>, channel: ChannelId) {
        self.with_core(|c| c.on_channel_closed(channel)).await;
    }

    /// Execute core actions while the caller still holds the core. Never blocks; anything that
    /// needs network I/O or the core lock again is spawned.
    fn dispatch(self: &Arc<Self>, core: &ChatCore<SqliteStore>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Register { identity } => self.spawn_register(identity),
                Action::Release { identity } => {
                    let claim = self.claims.lock().ok().and_then(|mut c| c.remove(&identity));
                    if let Some(claim) = claim {
                        tracing::debug!(identity = claim.identity(), "releasing claim");
                        claim.release();
                    }
                }
                Action::Connect { target } => self.spawn_connect(target),
                Action::Send { channel, bytes } => {
                    let sent = self
                        .channels
                        .lock()
                        .ok()
                        .and_then(|ch| ch.get(&channel).map(|h| h.tx.send(bytes).is_ok()));
                    if sent != Some(true) {
                        tracing::debug!(channel, "send on closed channel dropped");
                    }
                }
                Action::Close { channel } => {
                    let handle = self.channels.lock().ok().and_then(|mut ch| ch.remove(&channel));
                    if let Some(h) = handle {
                        drop(h.tx);
                        let _ = h.close.send(());
                    }
                }
                Action::ForgetRoom => {
                    if let Err(e) = core.log().store().forget_room_secret() {
                        tracing::warn!(error = %e, "could not forget room secret");
                    }
                }
                Action::Notify(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn spawn_register(self: &Arc<Self>, identity: String) {
        let this = self.clone();
        tokio::spawn(async move {
            match signal::register(&this.signal_addr, &identity, this.listen_port).await {
                Ok((claim, lost)) => {
                    if let Ok(mut c) = this.claims.lock() {
                        c.insert(identity.clone(), claim);
                    }
                    this.with_core(|c| c.on_registered(&identity)).await;
                    this.watch_claim(identity, lost);
                }
                Err(e) => {
                    tracing::debug!(%identity, error = %e, "registration failed");
                    let err = RegisterError::from(e);
                    this.with_core(|c| c.on_register_failed(&err)).await;
                }
            }
        });
    }

    fn watch_claim(self: &Arc<Self>, identity: String, lost: oneshot::Receiver<()>) {
        let this = self.clone();
        tokio::spawn(async move {
            if lost.await.is_err() {
                return;
            }
            if let Ok(mut c) = this.claims.lock() {
                c.remove(&identity);
            }
            this.with_core(|c| c.on_signalling_lost()).await;
        });
    }

    fn spawn_connect(self: &Arc<Self>, target: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let Some((room, role)) = this.room_and_role().await else {
                return;
            };
            if room.endpoint(role.other()) != target {
                tracing::debug!(%target, "role changed since connect was requested");
                return;
            }
            let addr = match signal::lookup(&this.signal_addr, &target).await {
                Ok(Some(addr)) => addr,
                Ok(None) => {
                    tracing::debug!(%target, "peer not registered yet");
                    return;
                }
                Err(e) => {
                    tracing::debug!(%target, error = %e, "lookup failed");
                    return;
                }
            };
            if let Err(e) = transport::dial(addr, &room, role, this.clone()).await {
                tracing::debug!(%target, %addr, error = %e, "dial failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tunnel_core::{
        wire, ChannelOrigin, ConnectionStatus, Frame, MessageStatus, SenderRole, SessionConfig,
    };

    const NOW: i64 = 1_700_000_000_000;

    fn driver(signal_addr: &str, listen_port: u16) -> Arc<Driver> {
        let (driver, _) = joined(signal_addr, listen_port);
        driver
    }

    /// Join "alpha" on a fresh in-memory store that remembers the secret. Returns the driver
    /// and the join actions, not yet dispatched.
    fn joined(signal_addr: &str, listen_port: u16) -> (Arc<Driver>, Vec<Action>) {
        let store = SqliteStore::open_in_memory().unwrap();
        store.remember_room_secret("alpha").unwrap();
        let config = SessionConfig {
            room_secret: "alpha".into(),
        };
        let (core, actions) = ChatCore::join(&config, store, NOW).unwrap();
        let (events, _) = mpsc::unbounded_channel();
        let driver = Driver::new(core, signal_addr.to_string(), listen_port, events);
        (driver, actions)
    }

    fn claim_count(driver: &Driver) -> usize {
        driver.claims.lock().unwrap().len()
    }

    async fn wait_for(
        what: &str,
        driver: &Driver,
        check: impl Fn(&ChatCore<SqliteStore>, usize) -> bool,
    ) {
        for _ in 0..400 {
            {
                let core = driver.core.lock().await;
                if check(&*core, claim_count(driver)) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_unregistered(server: &str, identity: &str) {
        for _ in 0..100 {
            if signal::lookup(server, identity).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{identity} still registered");
    }

    async fn signal_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(signal::serve(listener));
        addr
    }

    fn fake_channel(
        driver: &Driver,
    ) -> (ChannelId, mpsc::UnboundedReceiver<Vec<u8>>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let id = driver.attach(tx, close_tx, tokio::spawn(async {}));
        (id, rx, close_rx)
    }

    fn info(origin: ChannelOrigin) -> ChannelInfo {
        ChannelInfo {
            origin,
            dialer: Role::Secondary,
            nonce: 1,
        }
    }

    #[tokio::test]
    async fn end_session_forgets_secret_before_returning() {
        let d = driver("127.0.0.1:9", 0);
        d.with_core(|c| c.end_session()).await;
        let core = d.core().lock().await;
        assert!(core.is_logged_out());
        assert_eq!(core.log().store().last_room_secret().unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_kill_signal() {
        let d = driver("127.0.0.1:9", 0);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (close_tx, _close_rx) = oneshot::channel();
        let written = Arc::new(StdMutex::new(Vec::new()));
        let sink = written.clone();
        // Slow writer: each frame takes a while to reach the socket.
        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                tokio::time::sleep(Duration::from_millis(100)).await;
                sink.lock().unwrap().extend(bytes);
            }
        });
        let ch = d.attach(tx, close_tx, writer);
        d.with_core(|c| c.on_channel_open(ch, info(ChannelOrigin::Outbound))).await;
        d.with_core(|c| c.end_session()).await;
        d.shutdown().await;

        let written = written.lock().unwrap().clone();
        let mut rest = &written[..];
        let mut frames = Vec::new();
        while !rest.is_empty() {
            let (frame, used) = wire::decode_frame::<Frame>(rest).unwrap();
            frames.push(frame);
            rest = &rest[used..];
        }
        assert_eq!(frames.last(), Some(&Frame::KillSignal));
    }

    #[tokio::test]
    async fn close_drains_then_tears_down_writer() {
        let d = driver("127.0.0.1:9", 0);
        let (ch, mut rx, close_rx) = fake_channel(&d);
        d.with_core(|_| {
            vec![
                Action::Send {
                    channel: ch,
                    bytes: b"one".to_vec(),
                },
                Action::Close { channel: ch },
                Action::Send {
                    channel: ch,
                    bytes: b"late".to_vec(),
                },
            ]
        })
        .await;
        assert_eq!(rx.recv().await.as_deref(), Some(&b"one"[..]));
        assert_eq!(rx.recv().await, None);
        assert!(close_rx.await.is_ok());
        assert!(d.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claims_follow_registration_and_stale_ones_are_released() {
        let server = signal_server().await;
        let (d, actions) = joined(&server, 4000);
        let room = d.core().lock().await.room_id().clone();
        let primary = room.endpoint(Role::Primary);
        let secondary = room.endpoint(Role::Secondary);

        d.with_core(move |_| actions).await;
        wait_for("primary", &d, |c, claims| {
            c.role() == Some(Role::Primary) && claims == 1
        })
        .await;
        assert!(signal::lookup(&server, &primary).await.unwrap().is_some());

        // Late success for an identity the core is not claiming.
        let (stale, _lost) = signal::register(&server, &secondary, 4000).await.unwrap();
        d.claims.lock().unwrap().insert(secondary.clone(), stale);
        d.with_core(|c| c.on_registered(&secondary)).await;
        assert_eq!(claim_count(&d), 1);
        assert!(d.claims.lock().unwrap().contains_key(&primary));
        assert_eq!(d.core().lock().await.role(), Some(Role::Primary));
        wait_unregistered(&server, &secondary).await;

        d.shutdown().await;
        assert_eq!(claim_count(&d), 0);
        wait_unregistered(&server, &primary).await;
    }

    #[tokio::test]
    async fn lost_signalling_connection_drops_claim_and_role() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap().to_string();
        let (hang_up, hung_up) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut read = BufReader::new(read);
            let mut line = String::new();
            read.read_line(&mut line).await.unwrap();
            let identity = match serde_json::from_str::<signal::ClientMsg>(&line).unwrap() {
                signal::ClientMsg::Register { identity, .. } => identity,
                other => panic!("unexpected request {other:?}"),
            };
            let mut reply = serde_json::to_vec(&signal::ServerMsg::Registered { identity }).unwrap();
            reply.push(b'\n');
            write.write_all(&reply).await.unwrap();
            let _ = hung_up.await;
        });

        let (d, actions) = joined(&server, 4000);
        d.with_core(move |_| actions).await;
        wait_for("registered", &d, |c, claims| {
            c.role() == Some(Role::Primary) && claims == 1
        })
        .await;

        drop(hang_up);
        wait_for("claim lost", &d, |c, claims| c.role().is_none() && claims == 0).await;
    }

    #[tokio::test]
    async fn two_drivers_meet_chat_and_end_the_room() {
        let server = signal_server().await;
        let mut peers = Vec::new();
        for _ in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (d, actions) = joined(&server, port);
            tokio::spawn(transport::run_listener(listener, d.clone()));
            let ticker = d.spawn_ticker();
            d.with_core(move |_| actions).await;
            peers.push((d, ticker));
        }
        let (x, y) = (&peers[0].0, &peers[1].0);

        for d in [x, y] {
            wait_for("online", d, |c, _| {
                c.connection_status() == ConnectionStatus::Online && c.role().is_some()
            })
            .await;
        }
        let rx = x.core().lock().await.role();
        let ry = y.core().lock().await.role();
        assert_ne!(rx, ry);

        x.with_core(|c| c.send_message("hi", NOW + 1).unwrap()).await;
        wait_for("delivered", y, |c, _| {
            c.messages()
                .iter()
                .any(|m| m.content == "hi" && m.sender == SenderRole::Peer)
        })
        .await;
        wait_for("read mark", x, |c, _| {
            c.messages()
                .iter()
                .any(|m| m.content == "hi" && m.status == MessageStatus::Read)
        })
        .await;

        x.with_core(|c| c.end_session()).await;
        peers[0].1.abort();
        x.shutdown().await;
        assert_eq!(
            x.core().lock().await.log().store().last_room_secret().unwrap(),
            None
        );
        wait_for("peer wiped", y, |c, _| {
            c.is_logged_out()
                && c.messages().is_empty()
                && c.log().list_by_room(c.room_id()).unwrap().is_empty()
        })
        .await;
        assert_eq!(
            y.core().lock().await.log().store().last_room_secret().unwrap(),
            None
        );
        peers[1].1.abort();
    }
}
