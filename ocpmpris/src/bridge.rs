use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zbus::fdo::DBusProxy;
use zbus::zvariant::{Array, OwnedValue, Str};
use zbus::{Connection, connection};

use ocpbus::MessageBus;
use ocpmodel::{LoopState, PlayerState};

use crate::export::{MPRIS_PATH, MprisPlayer, MprisRoot, OCP_BUS_NAME};
use crate::flags::CommandFlags;
use crate::handle::{ExternalMediaMeta, PlayerHandle};
use crate::Result;
use crate::proxies::MprisPlayerRemoteProxy;

const MPRIS_NAME_MARKER: &str = "org.mpris.MediaPlayer2";
const KDECONNECT_PREFIX: &str = "org.mpris.MediaPlayer2.kdeconnect.";
/// Consecutive failed queries before a peer is declared lost.
const MAX_FAILS: u32 = 3;
/// Loop crashes tolerated before the bridge gives up for good.
const MAX_RESTARTS: u32 = 5;
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbusKind {
    Session,
    System,
}

impl DbusKind {
    pub fn from_config(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("system") {
            Self::System
        } else {
            Self::Session
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub dbus: DbusKind,
    /// Stop other external players when one takes over.
    pub manage_players: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dbus: DbusKind::Session,
            manage_players: false,
        }
    }
}

#[derive(Default)]
struct SharedState {
    meta: HashMap<String, ExternalMediaMeta>,
    fails: HashMap<String, u32>,
    main_player: Option<String>,
}

/// Mirrors and controls the other MPRIS players on the desktop bus.
///
/// Command methods only set event flags; the loop thread drains them on its
/// next tick. `shutdown` is the single cancellation point.
pub struct ExternalPlayerBridge {
    flags: Arc<CommandFlags>,
    stop_requested: Arc<AtomicBool>,
    shared: Arc<Mutex<SharedState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalPlayerBridge {
    /// Start the bridge on its own thread and return the shared handle.
    pub fn spawn(
        player: Arc<dyn PlayerHandle>,
        bus: MessageBus,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let flags = Arc::new(CommandFlags::default());
        let stop_requested = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Mutex::new(SharedState::default()));

        let mut loop_state = BridgeLoop {
            player,
            bus,
            config,
            flags: flags.clone(),
            stop_requested: stop_requested.clone(),
            shared: shared.clone(),
        };
        let handle = thread::Builder::new()
            .name("ocpmpris-loop".into())
            .spawn(move || loop_state.run())
            .expect("failed to spawn mpris bridge thread");

        Arc::new(Self {
            flags,
            stop_requested,
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Stop every external player (level-triggered).
    pub fn stop(&self) {
        CommandFlags::set(&self.flags.stop_all);
    }

    /// Pause every external player.
    pub fn pause(&self) {
        CommandFlags::set(&self.flags.pause_all);
    }

    /// Resume the tracked main player.
    pub fn resume(&self) {
        CommandFlags::set(&self.flags.resume);
    }

    pub fn play_next(&self) {
        CommandFlags::set(&self.flags.next);
    }

    pub fn play_prev(&self) {
        CommandFlags::set(&self.flags.prev);
    }

    pub fn toggle_shuffle(&self) {
        CommandFlags::set(&self.flags.shuffle);
    }

    pub fn toggle_repeat(&self) {
        CommandFlags::set(&self.flags.repeat);
    }

    /// Re-announce the exported properties on the next tick.
    pub fn update_props(&self) {
        CommandFlags::set(&self.flags.props_dirty);
    }

    pub fn main_player(&self) -> Option<String> {
        self.shared.lock().unwrap().main_player.clone()
    }

    /// Signal the loop to exit and join its thread.
    pub fn shutdown(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Everything the loop thread owns.
struct BridgeLoop {
    player: Arc<dyn PlayerHandle>,
    bus: MessageBus,
    config: BridgeConfig,
    flags: Arc<CommandFlags>,
    stop_requested: Arc<AtomicBool>,
    shared: Arc<Mutex<SharedState>>,
}

/// One discovered peer: its proxy plus the task watching its signals.
struct Peer {
    proxy: MprisPlayerRemoteProxy<'static>,
    monitor: tokio::task::JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

/// Property-changed notifications forwarded out of per-peer monitor tasks.
enum PeerSignal {
    Status(String, String),
    Metadata(String, HashMap<String, OwnedValue>),
    Shuffle(String, bool),
    Loop(String, String),
}

impl BridgeLoop {
    fn run(&mut self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("failed to build bridge runtime: {e}");
                return;
            }
        };

        runtime.block_on(async {
            let mut restarts = 0u32;
            while !self.stopping() {
                match self.run_loop().await {
                    Ok(()) => break,
                    Err(e) => {
                        restarts += 1;
                        if restarts > MAX_RESTARTS {
                            error!("mpris bridge exited: {e}");
                            break;
                        }
                        warn!(restarts, "mpris bridge crashed, restarting: {e}");
                        tokio::time::sleep(TICK).await;
                    }
                }
            }
        });
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    async fn run_loop(&mut self) -> Result<()> {
        let conn = self.connect().await?;
        let dbus = DBusProxy::new(&conn).await?;
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<PeerSignal>();
        let mut peers: HashMap<String, Peer> = HashMap::new();

        while !self.stopping() {
            self.drain_flags(&conn, &peers).await;
            if let Err(e) = self.scan_players(&conn, &dbus, &mut peers, &signal_tx).await {
                warn!("player scan failed: {e}");
            }
            self.sleep_draining(&mut signal_rx, &peers, TICK).await;

            // Not every player emits signals (autoplaying embedded videos in
            // particular), so re-query everyone each tick.
            let names: Vec<String> = peers.keys().cloned().collect();
            for name in names {
                self.query_player(&name, &mut peers).await;
            }
            self.sleep_draining(&mut signal_rx, &peers, TICK).await;
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Connection> {
        let builder = match self.config.dbus {
            DbusKind::Session => connection::Builder::session()?,
            DbusKind::System => connection::Builder::system()?,
        };
        let conn = builder
            .name(OCP_BUS_NAME)?
            .serve_at(MPRIS_PATH, MprisRoot)?
            .serve_at(
                MPRIS_PATH,
                MprisPlayer::new(self.player.clone(), self.bus.clone()),
            )?
            .build()
            .await?;
        info!(name = OCP_BUS_NAME, "exported player on the desktop bus");
        Ok(conn)
    }

    fn is_ignored(name: &str) -> bool {
        // This process and browser aggregators; browsers already show up as
        // individual players.
        name == OCP_BUS_NAME
            || name == "org.mpris.MediaPlayer2.plasma-browser-integration"
            || name.starts_with(KDECONNECT_PREFIX)
    }

    async fn scan_players(
        &mut self,
        conn: &Connection,
        dbus: &DBusProxy<'_>,
        peers: &mut HashMap<String, Peer>,
        signal_tx: &mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<()> {
        let names = dbus.list_names().await?;
        for name in names {
            let name = name.to_string();
            if !name.contains(MPRIS_NAME_MARKER)
                || Self::is_ignored(&name)
                || peers.contains_key(&name)
            {
                continue;
            }
            match self.register_player(conn, &name, signal_tx).await {
                Ok(peer) => {
                    info!(player = %name, "found MPRIS player");
                    peers.insert(name.clone(), peer);
                    self.query_player(&name, peers).await;
                }
                Err(e) => debug!(player = %name, "could not attach to player: {e}"),
            }
        }
        Ok(())
    }

    async fn register_player(
        &self,
        conn: &Connection,
        name: &str,
        signal_tx: &mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<Peer> {
        let proxy = MprisPlayerRemoteProxy::builder(conn)
            .destination(name.to_string())?
            .build()
            .await?;
        let monitor = tokio::spawn(monitor_peer(
            name.to_string(),
            proxy.clone(),
            signal_tx.clone(),
        ));
        Ok(Peer { proxy, monitor })
    }

    /// Sleep for `duration`, handling peer signals as they arrive instead of
    /// letting them queue until the next tick.
    async fn sleep_draining(
        &mut self,
        signal_rx: &mut mpsc::UnboundedReceiver<PeerSignal>,
        peers: &HashMap<String, Peer>,
        duration: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.stopping() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                signal = signal_rx.recv() => {
                    if let Some(signal) = signal {
                        self.handle_signal(signal, peers).await;
                    }
                }
            }
        }
    }

    async fn handle_signal(&mut self, signal: PeerSignal, peers: &HashMap<String, Peer>) {
        match signal {
            PeerSignal::Status(name, status) => {
                let state = PlayerState::from_mpris_status(&status);
                let meta = {
                    let mut shared = self.shared.lock().unwrap();
                    let entry = shared.meta.entry(name.clone()).or_insert_with(|| {
                        ExternalMediaMeta {
                            player_name: name.clone(),
                            ..Default::default()
                        }
                    });
                    entry.state = state;
                    entry.clone()
                };
                self.sync_peer_state(&name, meta, peers).await;
            }
            PeerSignal::Metadata(name, map) => {
                let meta = {
                    let mut shared = self.shared.lock().unwrap();
                    let cached_state = shared.meta.get(&name).map(|m| m.state);
                    let mut meta = translate_metadata(&name, &map);
                    meta.state = match cached_state {
                        Some(state) => state,
                        // Players like embedded browser videos never report a
                        // status; fresh metadata means they are playing.
                        None if !meta.title.is_empty() => PlayerState::Playing,
                        None => PlayerState::Stopped,
                    };
                    if let Some(cached) = shared.meta.get(&name) {
                        meta.loop_state = cached.loop_state;
                        meta.shuffle = cached.shuffle;
                    }
                    shared.meta.insert(name.clone(), meta.clone());
                    meta
                };
                debug!(player = %name, title = %meta.title, "MPRIS metadata");
                self.sync_peer_state(&name, meta, peers).await;
            }
            PeerSignal::Shuffle(name, shuffle) => {
                let is_main = {
                    let mut shared = self.shared.lock().unwrap();
                    if let Some(meta) = shared.meta.get_mut(&name) {
                        meta.shuffle = Some(shuffle);
                    }
                    shared.main_player.as_deref() == Some(name.as_str())
                };
                if is_main {
                    self.player.set_shuffle(shuffle);
                }
            }
            PeerSignal::Loop(name, status) => {
                let state = LoopState::from_mpris_status(&status);
                let is_main = {
                    let mut shared = self.shared.lock().unwrap();
                    if let Some(meta) = shared.meta.get_mut(&name) {
                        meta.loop_state = state;
                    }
                    shared.main_player.as_deref() == Some(name.as_str())
                };
                if is_main {
                    self.player.set_loop_state(state);
                }
            }
        }
    }

    /// Promotion rule: a peer that is playing becomes the main player; other
    /// updates are only pushed when they concern the current main player.
    async fn sync_peer_state(
        &mut self,
        name: &str,
        meta: ExternalMediaMeta,
        peers: &HashMap<String, Peer>,
    ) {
        if meta.state == PlayerState::Playing {
            self.set_main_player(name, peers).await;
        } else if self.shared.lock().unwrap().main_player.as_deref() == Some(name) {
            self.player.sync_external(meta);
        }
    }

    async fn set_main_player(&mut self, name: &str, peers: &HashMap<String, Peer>) {
        let (meta, changed) = {
            let mut shared = self.shared.lock().unwrap();
            let changed = shared.main_player.as_deref() != Some(name);
            shared.main_player = Some(name.to_string());
            (shared.meta.get(name).cloned(), changed)
        };
        if changed {
            info!(player = %name, "active MPRIS player");
        }
        if let Some(meta) = meta {
            self.player.sync_external(meta);
        }

        // Several external players playing at once: silence the others.
        if self.config.manage_players {
            let others: Vec<String> = {
                let shared = self.shared.lock().unwrap();
                shared
                    .meta
                    .iter()
                    .filter(|(n, m)| n.as_str() != name && m.state == PlayerState::Playing)
                    .map(|(n, _)| n.clone())
                    .collect()
            };
            for other in others {
                self.stop_peer(&other, peers).await;
            }
        }
    }

    async fn stop_peer(&mut self, name: &str, peers: &HashMap<String, Peer>) {
        let Some(peer) = peers.get(name) else {
            return;
        };
        info!(player = %name, "stopping MPRIS player");
        if retry_once(|| peer.proxy.stop()).await.is_err() {
            warn!(player = %name, "player can not be stopped");
        }
        let mut shared = self.shared.lock().unwrap();
        if let Some(meta) = shared.meta.get_mut(name) {
            meta.state = PlayerState::Stopped;
        }
        if shared.main_player.as_deref() == Some(name) {
            shared.main_player = None;
        }
    }

    async fn pause_peer(&mut self, name: &str, peers: &HashMap<String, Peer>) {
        let Some(peer) = peers.get(name) else {
            return;
        };
        let playing = self
            .shared
            .lock()
            .unwrap()
            .meta
            .get(name)
            .is_some_and(|m| m.state == PlayerState::Playing);
        if !playing {
            return;
        }
        debug!(player = %name, "pausing player");
        if retry_once(|| peer.proxy.pause()).await.is_err() {
            warn!(player = %name, "player can not be paused");
        }
    }

    async fn drain_flags(&mut self, conn: &Connection, peers: &HashMap<String, Peer>) {
        if CommandFlags::take(&self.flags.stop_all) {
            let names: Vec<String> = peers.keys().cloned().collect();
            for name in names {
                let playing = self
                    .shared
                    .lock()
                    .unwrap()
                    .meta
                    .get(&name)
                    .is_some_and(|m| m.state == PlayerState::Playing);
                if playing {
                    self.stop_peer(&name, peers).await;
                }
            }
        }

        if CommandFlags::take(&self.flags.pause_all) {
            let names: Vec<String> = peers.keys().cloned().collect();
            for name in names {
                self.pause_peer(&name, peers).await;
            }
        }

        let main = self.shared.lock().unwrap().main_player.clone();
        if let Some(main) = main {
            if CommandFlags::take(&self.flags.prev) {
                if let Some(peer) = peers.get(&main) {
                    if retry_once(|| peer.proxy.previous()).await.is_err() {
                        warn!(player = %main, "player does not support Previous");
                    }
                }
            }
            if CommandFlags::take(&self.flags.next) {
                if let Some(peer) = peers.get(&main) {
                    if retry_once(|| peer.proxy.next()).await.is_err() {
                        warn!(player = %main, "player does not support Next");
                    }
                }
            }
            if CommandFlags::take(&self.flags.resume) {
                if let Some(peer) = peers.get(&main) {
                    if retry_once(|| peer.proxy.play()).await.is_err() {
                        warn!(player = %main, "player can not be resumed");
                    }
                }
            }
            if CommandFlags::take(&self.flags.shuffle) {
                let current = self
                    .shared
                    .lock()
                    .unwrap()
                    .meta
                    .get(&main)
                    .and_then(|m| m.shuffle)
                    .unwrap_or_else(|| self.player.snapshot().shuffle);
                if let Some(peer) = peers.get(&main) {
                    if retry_once(|| peer.proxy.set_shuffle(!current)).await.is_err() {
                        warn!(player = %main, "player can not control shuffle");
                    }
                }
            }
            if CommandFlags::take(&self.flags.repeat) {
                let current = self
                    .shared
                    .lock()
                    .unwrap()
                    .meta
                    .get(&main)
                    .map(|m| m.loop_state)
                    .unwrap_or_else(|| self.player.snapshot().loop_state);
                let next = current.cycled();
                if let Some(peer) = peers.get(&main) {
                    if retry_once(|| peer.proxy.set_loop_status(next.mpris_status()))
                        .await
                        .is_err()
                    {
                        warn!(player = %main, "player can not control repeat");
                    }
                }
            }
        } else {
            // No main player: these commands have no target, drop them.
            CommandFlags::take(&self.flags.prev);
            CommandFlags::take(&self.flags.next);
            CommandFlags::take(&self.flags.resume);
            CommandFlags::take(&self.flags.shuffle);
            CommandFlags::take(&self.flags.repeat);
        }

        if CommandFlags::take(&self.flags.props_dirty) {
            if let Err(e) = self.emit_props(conn).await {
                debug!("could not announce property change: {e}");
            }
        }
    }

    async fn emit_props(&self, conn: &Connection) -> Result<()> {
        let iface_ref = conn
            .object_server()
            .interface::<_, MprisPlayer>(MPRIS_PATH)
            .await?;
        let iface = iface_ref.get().await;
        let emitter = iface_ref.signal_emitter();
        iface.playback_status_changed(emitter).await?;
        iface.metadata_changed(emitter).await?;
        iface.can_play_changed(emitter).await?;
        iface.can_pause_changed(emitter).await?;
        iface.can_go_next_changed(emitter).await?;
        iface.can_go_previous_changed(emitter).await?;
        Ok(())
    }

    /// Poll one peer's properties, with the shared failure accounting:
    /// retry once, three strikes and the peer is declared lost.
    async fn query_player(&mut self, name: &str, peers: &mut HashMap<String, Peer>) {
        let already_failed = *self.shared.lock().unwrap().fails.get(name).unwrap_or(&0);
        if already_failed > MAX_FAILS {
            return;
        }

        let queried = {
            let Some(peer) = peers.get(name) else {
                return;
            };
            match retry_once(|| peer.proxy.metadata()).await {
                Ok(metadata) => {
                    let mut meta = translate_metadata(name, &metadata);
                    match peer.proxy.playback_status().await {
                        Ok(status) => meta.state = PlayerState::from_mpris_status(&status),
                        // Players without a readable status but with a title
                        // are assumed playing.
                        Err(_) if !meta.title.is_empty() => meta.state = PlayerState::Playing,
                        Err(_) => meta.state = PlayerState::Stopped,
                    }
                    if let Ok(status) = peer.proxy.loop_status().await {
                        meta.loop_state = LoopState::from_mpris_status(&status);
                    }
                    if let Ok(shuffle) = peer.proxy.shuffle().await {
                        meta.shuffle = Some(shuffle);
                    }
                    Ok(meta)
                }
                Err(e) => Err(e),
            }
        };

        let meta = match queried {
            Ok(meta) => meta,
            Err(e) => {
                let fails = {
                    let mut shared = self.shared.lock().unwrap();
                    let fails = shared.fails.entry(name.to_string()).or_insert(0);
                    *fails += 1;
                    *fails
                };
                if fails > MAX_FAILS {
                    self.lose_player(name, peers);
                } else {
                    debug!(player = %name, fails, "failed to query player: {e}");
                }
                return;
            }
        };

        let first_sighting = {
            let mut shared = self.shared.lock().unwrap();
            shared.fails.insert(name.to_string(), 0);
            shared.meta.insert(name.to_string(), meta.clone()).is_none()
        };
        if first_sighting {
            info!(player = %name, title = %meta.title, "MPRIS info");
        }
        self.sync_peer_state(name, meta, peers).await;
    }

    fn lose_player(&mut self, name: &str, peers: &mut HashMap<String, Peer>) {
        info!(player = %name, "lost MPRIS player");
        peers.remove(name);
        let mut shared = self.shared.lock().unwrap();
        shared.meta.remove(name);
        shared.fails.remove(name);
        if shared.main_player.as_deref() == Some(name) {
            shared.main_player = None;
        }
    }
}

/// Forward this peer's property-changed signals into the loop.
async fn monitor_peer(
    name: String,
    proxy: MprisPlayerRemoteProxy<'static>,
    tx: mpsc::UnboundedSender<PeerSignal>,
) {
    let mut status_stream = proxy.receive_playback_status_changed().await;
    let mut metadata_stream = proxy.receive_metadata_changed().await;
    let mut shuffle_stream = proxy.receive_shuffle_changed().await;
    let mut loop_stream = proxy.receive_loop_status_changed().await;

    loop {
        tokio::select! {
            Some(change) = status_stream.next() => {
                if let Ok(value) = change.get().await {
                    if tx.send(PeerSignal::Status(name.clone(), value)).is_err() {
                        break;
                    }
                }
            }
            Some(change) = metadata_stream.next() => {
                if let Ok(value) = change.get().await {
                    if tx.send(PeerSignal::Metadata(name.clone(), value)).is_err() {
                        break;
                    }
                }
            }
            Some(change) = shuffle_stream.next() => {
                if let Ok(value) = change.get().await {
                    if tx.send(PeerSignal::Shuffle(name.clone(), value)).is_err() {
                        break;
                    }
                }
            }
            Some(change) = loop_stream.next() => {
                if let Ok(value) = change.get().await {
                    if tx.send(PeerSignal::Loop(name.clone(), value)).is_err() {
                        break;
                    }
                }
            }
            else => break,
        }
    }
    debug!(player = %name, "signal monitoring ended");
}

async fn retry_once<T, F, Fut>(op: F) -> zbus::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = zbus::Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            debug!("bus call failed, retrying once: {first}");
            op().await
        }
    }
}

/// Translate an MPRIS metadata map into our view of the peer.
/// `mpris:length` arrives in microseconds and is stored in milliseconds.
fn translate_metadata(name: &str, map: &HashMap<String, OwnedValue>) -> ExternalMediaMeta {
    let mut meta = ExternalMediaMeta {
        player_name: name.to_string(),
        ..Default::default()
    };
    for (key, value) in map {
        match key.as_str() {
            "xesam:title" => {
                if let Ok(s) = value.downcast_ref::<Str>() {
                    meta.title = s.to_string();
                }
            }
            "xesam:artist" => {
                if let Ok(artists) = value.downcast_ref::<Array>() {
                    if let Some(first) = artists.iter().next() {
                        if let Ok(s) = first.downcast_ref::<Str>() {
                            meta.artist = s.to_string();
                        }
                    }
                } else if let Ok(s) = value.downcast_ref::<Str>() {
                    // MPRIS wants a string list here, but plain strings are
                    // seen in the wild.
                    meta.artist = s.to_string();
                }
            }
            "xesam:album" => {
                if let Ok(s) = value.downcast_ref::<Str>() {
                    meta.album = s.to_string();
                }
            }
            "mpris:artUrl" => {
                if let Ok(s) = value.downcast_ref::<Str>() {
                    meta.image = s.to_string();
                }
            }
            "mpris:length" => {
                let micros = value
                    .downcast_ref::<i64>()
                    .ok()
                    .or_else(|| value.downcast_ref::<u64>().ok().map(|v| v as i64));
                if let Some(micros) = micros {
                    meta.length = (micros.max(0) as u64) / 1000;
                }
            }
            _ => {}
        }
    }
    meta
}
