use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use ocpbus::{Message, MessageBus, Subscription, is_message_for_sources};
use ocpconfig::{MediaConfig, PlayerEntry};
use ocpmodel::{MediaState, PlaybackKind, TrackState};

use super::{BackendHandle, BackendPluginRegistry};
use crate::OCP_ID;

/// Stops arriving within this window of a play are considered stale and
/// dropped; they were aimed at whatever played before.
const STOP_RATE_LIMIT: Duration = Duration::from_secs(1);
const LOAD_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Backend family a service routes for. One service instance == one bus
/// namespace (`ovos.{audio|video|web}.service.*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Audio,
    Video,
    Web,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Web => "web",
        }
    }

    pub fn playback_kind(self) -> PlaybackKind {
        match self {
            Self::Audio => PlaybackKind::Audio,
            Self::Video => PlaybackKind::Video,
            Self::Web => PlaybackKind::Webview,
        }
    }

    fn playing_state(self) -> TrackState {
        match self {
            Self::Audio => TrackState::PlayingAudio,
            Self::Video => TrackState::PlayingVideo,
            Self::Web => TrackState::PlayingWebview,
        }
    }

    fn queued_state(self) -> TrackState {
        match self {
            Self::Audio => TrackState::QueuedAudio,
            Self::Video => TrackState::QueuedVideo,
            Self::Web => TrackState::QueuedWebview,
        }
    }

    fn players(self, config: &MediaConfig) -> &HashMap<String, PlayerEntry> {
        match self {
            Self::Audio => &config.audio_players,
            Self::Video => &config.video_players,
            Self::Web => &config.web_players,
        }
    }
}

struct ServiceState {
    services: Vec<BackendHandle>,
    current: Option<usize>,
    play_start_time: Option<Instant>,
    volume_is_low: bool,
}

/// Holds the loaded backends of one family, routes play requests to a
/// suitable one by URI scheme, and proxies transport commands.
///
/// The single state mutex doubles as the service lock: a stop can never race
/// a selection in progress.
pub struct BackendService {
    bus: MessageBus,
    namespace: Namespace,
    native_sources: Vec<String>,
    validate_source: bool,
    state: Mutex<ServiceState>,
    loaded: Mutex<bool>,
    loaded_cv: Condvar,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl BackendService {
    pub fn create(
        bus: MessageBus,
        namespace: Namespace,
        config: &MediaConfig,
        plugins: &BackendPluginRegistry,
        validate_source: bool,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            bus,
            namespace,
            native_sources: config.native_sources.clone(),
            validate_source,
            state: Mutex::new(ServiceState {
                services: Vec::new(),
                current: None,
                play_start_time: None,
                volume_is_low: false,
            }),
            loaded: Mutex::new(false),
            loaded_cv: Condvar::new(),
            subscriptions: Mutex::new(Vec::new()),
        });
        service.load_services(config, plugins);
        service.register_bus_handlers();
        service
    }

    /// Instantiate every configured backend of this family. A plugin that is
    /// unknown or fails to construct is logged and skipped; loading always
    /// continues.
    fn load_services(&self, config: &MediaConfig, plugins: &BackendPluginRegistry) {
        let mut local = Vec::new();
        let mut remote = Vec::new();

        for (player_name, entry) in self.namespace.players(config) {
            if !entry.active {
                info!(module = %entry.module, "disabled in configuration");
                continue;
            }
            let backend = match plugins.create(entry, self.bus.clone()) {
                Ok(backend) => backend,
                Err(super::PluginError::UnknownPlugin(module)) => {
                    error!("{module} configured but not installed");
                    continue;
                }
                Err(e) => {
                    error!("failed to load backend: {e}");
                    continue;
                }
            };
            let aliases = if entry.aliases.is_empty() {
                vec![entry.module.clone()]
            } else {
                entry.aliases.clone()
            };
            let handle = BackendHandle {
                name: player_name.clone(),
                aliases,
                remote: backend.is_remote(),
                backend,
            };
            info!(namespace = self.namespace.as_str(), player = %handle.name, "loaded backend");
            if handle.remote {
                remote.push(handle);
            } else {
                local.push(handle);
            }
        }

        // Local backends are preferred over remote ones at routing time.
        let mut services = local;
        services.append(&mut remote);

        let namespace = self.namespace.as_str();
        let bus = self.bus.clone();
        for handle in &services {
            let bus = bus.clone();
            handle
                .backend
                .set_track_start_callback(Some(Arc::new(move |track| match track {
                    Some(track) => {
                        info!("new {namespace} track coming up");
                        bus.emit(
                            Message::new(format!("ovos.{namespace}.playing_track"))
                                .with_data(json!({"track": track.as_value()})),
                        );
                    }
                    None => {
                        debug!("end of playlist");
                        bus.emit(Message::new(format!("ovos.{namespace}.queue_end")));
                    }
                })));
        }

        self.state.lock().unwrap().services = services;

        *self.loaded.lock().unwrap() = true;
        self.loaded_cv.notify_all();
    }

    fn register_bus_handlers(self: &Arc<Self>) {
        let ns = self.namespace.as_str();
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

        subs.push(handler!(format!("ovos.{ns}.service.play"), handle_play));
        subs.push(handler!(format!("ovos.{ns}.service.pause"), handle_pause));
        subs.push(handler!(format!("ovos.{ns}.service.resume"), handle_resume));
        subs.push(handler!(format!("ovos.{ns}.service.stop"), handle_stop));
        subs.push(handler!(
            format!("ovos.{ns}.service.track_info"),
            handle_track_info
        ));
        subs.push(handler!(
            format!("ovos.{ns}.service.list_backends"),
            handle_list_backends
        ));
        subs.push(handler!(
            format!("ovos.{ns}.service.set_track_position"),
            handle_set_track_position
        ));
        subs.push(handler!(
            format!("ovos.{ns}.service.get_track_position"),
            handle_get_track_position
        ));
        subs.push(handler!(
            format!("ovos.{ns}.service.get_track_length"),
            handle_get_track_length
        ));
        subs.push(handler!(
            format!("ovos.{ns}.service.seek_forward"),
            handle_seek_forward
        ));
        subs.push(handler!(
            format!("ovos.{ns}.service.seek_backward"),
            handle_seek_backward
        ));
        subs.push(handler!(format!("ovos.{ns}.service.duck"), handle_duck));
        subs.push(handler!(format!("ovos.{ns}.service.unduck"), handle_unduck));
        subs.push(handler!(
            format!("{OCP_ID}.media.state"),
            handle_media_state_change
        ));

        *self.subscriptions.lock().unwrap() = subs;
    }

    fn is_message_for_service(&self, message: Option<&Message>) -> bool {
        let Some(message) = message else {
            return true;
        };
        if !self.validate_source {
            return true;
        }
        is_message_for_sources(message, &self.native_sources)
    }

    /// Block until the configured backends finished loading.
    pub fn wait_for_load(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(LOAD_TIMEOUT);
        let loaded = self.loaded.lock().unwrap();
        let (loaded, _) = self
            .loaded_cv
            .wait_timeout_while(loaded, timeout, |done| !*done)
            .unwrap();
        *loaded
    }

    pub fn available_backends(&self) -> Value {
        let state = self.state.lock().unwrap();
        let mut data = serde_json::Map::new();
        for handle in &state.services {
            data.insert(
                handle.name.clone(),
                json!({
                    "supported_uris": handle.backend.supported_uris(),
                    "remote": handle.remote,
                }),
            );
        }
        Value::Object(data)
    }

    /// Name of the backend currently selected for playback, if any.
    pub fn current_backend(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.current.map(|idx| state.services[idx].name.clone())
    }

    /// Route `uri` to a suitable backend and start loading it.
    ///
    /// Selection order: the explicitly preferred backend, then the currently
    /// active one, then the first loaded backend claiming the scheme. With
    /// no claimant the request is refused quietly; intent parsing upstream
    /// is allowed to guess wrong.
    pub fn play(&self, uri: &str, preferred: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        self.play_locked(&mut state, uri, preferred);
    }

    fn play_locked(&self, state: &mut ServiceState, uri: &str, preferred: Option<&str>) {
        let scheme = match uri.split_once(':') {
            Some((scheme, _)) if !scheme.is_empty() => scheme,
            _ => "file",
        };

        let selected = preferred
            .and_then(|name| {
                state
                    .services
                    .iter()
                    .position(|h| h.name == name && h.supports_scheme(scheme))
            })
            .or_else(|| {
                state
                    .current
                    .filter(|&idx| state.services[idx].supports_scheme(scheme))
            })
            .or_else(|| {
                state
                    .services
                    .iter()
                    .position(|h| h.supports_scheme(scheme))
            });

        let Some(idx) = selected else {
            info!(namespace = self.namespace.as_str(), scheme, "no backend for uri scheme");
            return;
        };

        let handle = state.services[idx].clone();
        debug!(backend = %handle.name, uri, "selected backend");
        state.current = Some(idx);
        state.play_start_time = Some(Instant::now());

        self.bus.emit(
            Message::new(format!("{OCP_ID}.track.state"))
                .with_data(json!({"state": self.namespace.queued_state()})),
        );
        // Playback starts when the backend reports media.state = LOADED.
        handle.backend.load_track(uri);
    }

    /// Transport-only pause, for callers that announce the state change
    /// themselves.
    pub fn pause(&self) {
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            state.services[idx].backend.pause();
        }
    }

    /// Transport-only resume, for callers that announce the state change
    /// themselves.
    pub fn resume(&self) {
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            state.services[idx].backend.resume();
        }
    }

    /// Stop playback, unless the request lands inside the stale-stop window.
    pub fn stop(&self, message: Option<&Message>) {
        if !self.is_message_for_service(message) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let fresh_play = state
            .play_start_time
            .is_some_and(|t| t.elapsed() <= STOP_RATE_LIMIT);
        if fresh_play {
            debug!(namespace = self.namespace.as_str(), "ignoring stop right after play");
            return;
        }
        self.perform_stop_locked(&mut state, message);
    }

    fn perform_stop_locked(&self, state: &mut ServiceState, message: Option<&Message>) {
        if let Some(idx) = state.current {
            let handle = &state.services[idx];
            debug!(backend = %handle.name, "stopping playing service");
            if handle.backend.stop() {
                handle.backend.ocp_stop();
                let reply = match message {
                    Some(msg) => msg.reply("mycroft.stop.handled", json!({"by": "OCP"})),
                    None => Message::new("mycroft.stop.handled").with_data(json!({"by": "OCP"})),
                };
                self.bus.emit(reply);
            }
        }
        state.current = None;
    }

    pub fn lower_volume(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            if !state.volume_is_low {
                debug!("lowering volume");
                state.services[idx].backend.lower_volume();
                state.volume_is_low = true;
            }
        }
    }

    pub fn restore_volume(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            if state.volume_is_low {
                debug!("restoring volume");
                state.volume_is_low = false;
                state.services[idx].backend.restore_volume();
            }
        }
    }

    pub fn set_track_position(&self, millis: u64) {
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            state.services[idx].backend.set_track_position(millis);
        }
    }

    pub fn get_track_position(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .current
            .and_then(|idx| state.services[idx].backend.get_track_position())
    }

    pub fn get_track_length(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .current
            .and_then(|idx| state.services[idx].backend.get_track_length())
    }

    pub fn track_info(&self) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state
            .current
            .map(|idx| state.services[idx].backend.track_info().as_value())
    }

    pub fn shutdown(&self) {
        let services = {
            let mut state = self.state.lock().unwrap();
            state.current = None;
            std::mem::take(&mut state.services)
        };
        for handle in services {
            info!(backend = %handle.name, "shutting down");
            handle.backend.shutdown();
        }
        self.remove_listeners();
    }

    fn remove_listeners(&self) {
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.remove(&sub);
        }
    }

    // Bus handler surface. Every handler is gated by the message source
    // check before it touches anything.

    fn handle_play(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let uri = match message.data.get("tracks") {
            Some(Value::String(uri)) => uri.clone(),
            Some(Value::Array(tracks)) => match tracks.first().and_then(Value::as_str) {
                Some(uri) => uri.to_string(),
                None => {
                    warn!("play request without a playable track");
                    return;
                }
            },
            _ => {
                warn!("play request without tracks");
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        // A spoken request may name one of the configured backends.
        let utterance = message.data_str("utterance").unwrap_or_default();
        let preferred = if utterance.is_empty() {
            None
        } else {
            state
                .services
                .iter()
                .find(|h| h.matches_utterance(utterance))
                .map(|h| h.name.clone())
        };
        if let Some(name) = &preferred {
            debug!(backend = %name, "preferred by utterance");
        }
        self.play_locked(&mut state, &uri, preferred.as_deref());
    }

    /// Bus-driven pause: here the service is the one announcing the state
    /// change, through the backend's hook.
    fn handle_pause(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            let backend = &state.services[idx].backend;
            backend.pause();
            backend.ocp_pause();
        }
    }

    fn handle_resume(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            let backend = &state.services[idx].backend;
            backend.resume();
            backend.ocp_resume();
        }
    }

    fn handle_stop(&self, message: &Message) {
        self.stop(Some(message));
    }

    fn handle_track_info(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let info = self.track_info().unwrap_or_else(|| json!({}));
        self.bus.emit(message.response(info));
    }

    fn handle_list_backends(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        self.bus.emit(message.response(self.available_backends()));
    }

    fn handle_set_track_position(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        if let Some(millis) = message.data_i64("position") {
            self.set_track_position(millis.max(0) as u64);
        }
    }

    fn handle_get_track_position(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let position = self.get_track_position();
        self.bus
            .emit(message.response(json!({"position": position})));
    }

    fn handle_get_track_length(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let length = self.get_track_length();
        self.bus.emit(message.response(json!({"length": length})));
    }

    fn handle_seek_forward(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let seconds = message.data_i64("seconds").unwrap_or(1);
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            state.services[idx].backend.seek_forward(seconds);
        }
    }

    fn handle_seek_backward(&self, message: &Message) {
        if !self.is_message_for_service(Some(message)) {
            return;
        }
        let seconds = message.data_i64("seconds").unwrap_or(1);
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            state.services[idx].backend.seek_backward(seconds);
        }
    }

    fn handle_duck(&self, message: &Message) {
        if self.is_message_for_service(Some(message)) {
            self.lower_volume();
        }
    }

    fn handle_unduck(&self, message: &Message) {
        if self.is_message_for_service(Some(message)) {
            self.restore_volume();
        }
    }

    /// Once a backend reports the track loaded, actually start it and
    /// announce the per-family playing state.
    fn handle_media_state_change(&self, message: &Message) {
        let Some(code) = message.data_i64("state") else {
            warn!("media state update without a state");
            return;
        };
        let Ok(media_state) = MediaState::try_from(code) else {
            warn!(code, "unknown media state");
            return;
        };
        if media_state != MediaState::LoadedMedia {
            return;
        }
        let state = self.state.lock().unwrap();
        if let Some(idx) = state.current {
            state.services[idx].backend.play();
            self.bus.emit(
                Message::new(format!("{OCP_ID}.track.state"))
                    .with_data(json!({"state": self.namespace.playing_state()})),
            );
        }
    }
}
