//! Process lifecycle supervision: wires the player to the bus and reports
//! liveness so the rest of the voice stack can sequence its startup.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use serde_json::json;
use tracing::{error, info};

use ocpbus::{Message, MessageBus, Subscription};
use ocpconfig::Config;

use crate::OCP_ID;
use crate::backends::BackendPluginRegistry;
use crate::extractor::StreamExtractorSet;
use crate::player::MediaPlayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Started,
    Alive,
    Ready,
    Stopping,
}

impl ProcessState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Alive => "alive",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        }
    }
}

/// Announces lifecycle transitions and answers readiness queries.
pub struct ProcessStatus {
    bus: MessageBus,
    state: Mutex<ProcessState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ProcessStatus {
    fn create(bus: MessageBus) -> Arc<Self> {
        let status = Arc::new(Self {
            bus,
            state: Mutex::new(ProcessState::Started),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&status);
        let sub = status.bus.on("mycroft.audio.is_ready", move |msg: &Message| {
            if let Some(status) = weak.upgrade() {
                let ready = status.state() == ProcessState::Ready;
                status.bus.emit(msg.response(json!({"status": ready})));
            }
        });
        status.subscriptions.lock().unwrap().push(sub);
        status
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap()
    }

    fn set(&self, state: ProcessState) {
        *self.state.lock().unwrap() = state;
        self.bus.emit(
            Message::new("ovos.media.service.state")
                .with_data(json!({"state": state.as_str()})),
        );
    }

    fn shutdown(&self) {
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.remove(&sub);
        }
    }
}

/// The media service supervisor: STARTED -> ALIVE -> READY -> STOPPING.
pub struct MediaService {
    bus: MessageBus,
    status: Arc<ProcessStatus>,
    player: Arc<MediaPlayer>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MediaService {
    pub fn start(
        bus: MessageBus,
        config: Config,
        extractors: StreamExtractorSet,
        plugins: &BackendPluginRegistry,
        liked_songs_path: PathBuf,
    ) -> Arc<Self> {
        info!("starting media service");
        let status = ProcessStatus::create(bus.clone());
        status.set(ProcessState::Started);
        status.set(ProcessState::Alive);

        let player = MediaPlayer::create(
            bus.clone(),
            config,
            extractors,
            plugins,
            liked_songs_path,
        );

        let service = Arc::new(Self {
            bus,
            status,
            player,
            subscriptions: Mutex::new(Vec::new()),
        });
        service.register_bus_handlers();
        service.status.set(ProcessState::Ready);
        info!("media service is ready");
        service
    }

    fn register_bus_handlers(self: &Arc<Self>) {
        let mut subs = Vec::new();

        macro_rules! handler {
            ($event:expr, $method:ident) => {{
                let weak: Weak<Self> = Arc::downgrade(self);
                self.bus.on($event, move |msg: &Message| {
                    if let Some(service) = weak.upgrade() {
                        service.$method(msg);
                    }
                })
            }};
        }

        subs.push(handler!(format!("{OCP_ID}.ping"), handle_ping));
        subs.push(handler!(format!("{OCP_ID}.home"), handle_home));
        subs.push(handler!(format!("{OCP_ID}.search.start"), handle_search_start));
        subs.push(handler!(format!("{OCP_ID}.search.end"), handle_search_end));

        *self.subscriptions.lock().unwrap() = subs;
    }

    pub fn player(&self) -> &Arc<MediaPlayer> {
        &self.player
    }

    pub fn status(&self) -> ProcessState {
        self.status.state()
    }

    fn handle_ping(&self, message: &Message) {
        self.bus.emit(message.reply(format!("{OCP_ID}.pong"), json!({})));
    }

    fn handle_home(&self, _message: &Message) {
        self.emit_gui("home");
    }

    /// The OCP pipeline started matching; show the search animation.
    fn handle_search_start(&self, _message: &Message) {
        self.emit_gui("spinner");
    }

    fn handle_search_end(&self, _message: &Message) {
        self.emit_gui("spinner.close");
    }

    fn emit_gui(&self, state: &str) {
        self.bus.emit(
            Message::new(format!("{OCP_ID}.gui.state")).with_data(json!({"state": state})),
        );
    }

    /// Stop playback and tear everything down in announcement order.
    pub fn shutdown(&self) {
        if self.status.state() == ProcessState::Stopping {
            return;
        }
        info!("media service is shutting down");
        self.player.reset();
        self.status.set(ProcessState::Stopping);
        self.player.shutdown();
        self.status.shutdown();
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.remove(&sub);
        }
    }
}

impl Drop for MediaService {
    fn drop(&mut self) {
        if self.status.state() != ProcessState::Stopping {
            error!("media service dropped without shutdown");
        }
    }
}
