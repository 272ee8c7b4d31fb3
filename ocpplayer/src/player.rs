//! The player state machine and command dispatcher.
//!
//! `MediaPlayer` owns the playlist, the now-playing view, the media catalog
//! and the three backend services, drives the MPRIS bridge, and answers the
//! whole `ovos.common_play.*` bus surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use ocpbus::{Message, MessageBus, Subscription};
use ocpconfig::Config;
use ocpmodel::{
    LoopState, MediaEntry, MediaState, PlaybackKind, PlaybackMode, PlayerState, Playlist,
    TrackState,
};
use ocpmpris::{
    BridgeConfig, DbusKind, ExternalMediaMeta, ExternalPlayerBridge, PlayerHandle, PlayerSnapshot,
};

use crate::OCP_ID;
use crate::backends::{BackendPluginRegistry, BackendService, Namespace};
use crate::catalog::MediaCatalog;
use crate::display::OneShotTimer;
use crate::extractor::StreamExtractorSet;
use crate::now_playing::NowPlaying;

/// Lets the backend's asynchronous load begin before the next command.
const PLAY_SETTLE: Duration = Duration::from_millis(500);
/// How long a playback error stays visible before moving on.
const ERROR_DISPLAY: Duration = Duration::from_secs(3);
/// Idle results view lingers this long before falling back home.
const RESULTS_TIMEOUT: Duration = Duration::from_secs(60);

/// A play request after normalization: a single track or a whole list.
#[derive(Debug, Clone)]
pub enum TrackRequest {
    Entry(MediaEntry),
    List(Vec<MediaEntry>),
}

impl TrackRequest {
    pub fn from_value(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Array(items) => {
                let entries = items
                    .iter()
                    .map(MediaEntry::from_value)
                    .collect::<ocpmodel::Result<Vec<_>>>()
                    .map_err(|e| crate::PlayerError::BadMessage(e.to_string()))?;
                Ok(Self::List(entries))
            }
            Value::Object(_) => MediaEntry::from_value(value)
                .map(Self::Entry)
                .map_err(|e| crate::PlayerError::BadMessage(e.to_string())),
            _ => Err(crate::PlayerError::BadMessage(
                "expected a track or a track list".into(),
            )),
        }
    }
}

/// What `play_next` decided to do.
enum NextPick {
    Replay,
    Track(MediaEntry),
    GiveUp,
}

struct PlayerCore {
    state: PlayerState,
    loop_state: LoopState,
    media_state: MediaState,
    shuffle: bool,
    playlist: Playlist,
    paused_on_duck: bool,
    track_history: HashMap<String, u32>,
}

pub struct MediaPlayer {
    bus: MessageBus,
    config: Config,
    extractors: StreamExtractorSet,
    now_playing: Arc<NowPlaying>,
    catalog: Arc<MediaCatalog>,
    audio: Arc<BackendService>,
    video: Arc<BackendService>,
    web: Arc<BackendService>,
    bridge: Mutex<Option<Arc<ExternalPlayerBridge>>>,
    core: Mutex<PlayerCore>,
    display_timer: OneShotTimer,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MediaPlayer {
    pub fn create(
        bus: MessageBus,
        config: Config,
        extractors: StreamExtractorSet,
        plugins: &BackendPluginRegistry,
        liked_songs_path: PathBuf,
    ) -> Arc<Self> {
        let validate_source = true;
        let now_playing = NowPlaying::create(bus.clone(), extractors.clone());
        let catalog = MediaCatalog::create(bus.clone(), liked_songs_path);
        let audio = BackendService::create(
            bus.clone(),
            Namespace::Audio,
            &config.media,
            plugins,
            validate_source,
        );
        let video = BackendService::create(
            bus.clone(),
            Namespace::Video,
            &config.media,
            plugins,
            validate_source,
        );
        let web = BackendService::create(
            bus.clone(),
            Namespace::Web,
            &config.media,
            plugins,
            validate_source,
        );

        let player = Arc::new(Self {
            bus: bus.clone(),
            config,
            extractors,
            now_playing,
            catalog,
            audio,
            video,
            web,
            bridge: Mutex::new(None),
            core: Mutex::new(PlayerCore {
                state: PlayerState::Stopped,
                loop_state: LoopState::None,
                media_state: MediaState::NoMedia,
                shuffle: false,
                playlist: Playlist::new("Now Playing"),
                paused_on_duck: false,
                track_history: HashMap::new(),
            }),
            display_timer: OneShotTimer::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        if player.config.ocp.disable_mpris {
            info!("MPRIS integration is disabled");
        } else {
            let bridge_config = BridgeConfig {
                dbus: DbusKind::from_config(&player.config.media.dbus_type),
                manage_players: player.config.ocp.manage_external_players,
            };
            let handle: Arc<dyn PlayerHandle> = player.clone();
            let bridge = ExternalPlayerBridge::spawn(handle, bus, bridge_config);
            *player.bridge.lock().unwrap() = Some(bridge);
        }

        player.register_bus_handlers();
        // Report capabilities and state so listeners that started before us
        // catch up.
        player.handle_get_seis(&Message::new(format!("{OCP_ID}.SEI.get")));
        player.broadcast_status();
        player
    }

    fn register_bus_handlers(self: &Arc<Self>) {
        let mut subs = Vec::new();

        macro_rules! handler {
            ($suffix:literal, $method:ident) => {{
                let weak: Weak<Self> = Arc::downgrade(self);
                self.bus.on(format!("{OCP_ID}.{}", $suffix), move |msg: &Message| {
                    if let Some(player) = weak.upgrade() {
                        player.$method(msg);
                    }
                })
            }};
        }

        subs.push(handler!("player.state", handle_player_state_event));
        subs.push(handler!("media.state", handle_media_state_event));
        subs.push(handler!("play", handle_play_request));
        subs.push(handler!("pause", handle_pause_request));
        subs.push(handler!("resume", handle_resume_request));
        subs.push(handler!("stop", handle_stop_request));
        subs.push(handler!("next", handle_next_request));
        subs.push(handler!("previous", handle_prev_request));
        subs.push(handler!("seek", handle_seek_request));
        subs.push(handler!("get_track_length", handle_track_length_request));
        subs.push(handler!(
            "set_track_position",
            handle_set_track_position_request
        ));
        subs.push(handler!("get_track_position", handle_track_position_request));
        subs.push(handler!("track_info", handle_track_info_request));
        subs.push(handler!("list_backends", handle_list_backends_request));
        subs.push(handler!("playlist.set", handle_playlist_set_request));
        subs.push(handler!("playlist.queue", handle_playlist_queue_request));
        subs.push(handler!("playlist.clear", handle_playlist_clear_request));
        subs.push(handler!("duck", handle_duck_request));
        subs.push(handler!("unduck", handle_unduck_request));
        subs.push(handler!("cork", handle_cork_request));
        subs.push(handler!("uncork", handle_uncork_request));
        subs.push(handler!("shuffle.set", handle_set_shuffle));
        subs.push(handler!("shuffle.unset", handle_unset_shuffle));
        subs.push(handler!("shuffle.toggle", handle_shuffle_toggle_request));
        subs.push(handler!("repeat.set", handle_set_repeat));
        subs.push(handler!("repeat.unset", handle_unset_repeat));
        subs.push(handler!("repeat.toggle", handle_repeat_toggle_request));
        subs.push(handler!("SEI.get", handle_get_seis));
        subs.push(handler!("search.start", handle_search_start));
        subs.push(handler!("like", handle_like));
        subs.push(handler!("unlike", handle_unlike));
        subs.push(handler!("status", handle_status));

        *self.subscriptions.lock().unwrap() = subs;
    }

    // Accessors used by the service layer and tests.

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn state(&self) -> PlayerState {
        self.core.lock().unwrap().state
    }

    pub fn media_state(&self) -> MediaState {
        self.core.lock().unwrap().media_state
    }

    pub fn loop_state(&self) -> LoopState {
        self.core.lock().unwrap().loop_state
    }

    pub fn shuffle(&self) -> bool {
        self.core.lock().unwrap().shuffle
    }

    pub fn paused_on_duck(&self) -> bool {
        self.core.lock().unwrap().paused_on_duck
    }

    pub fn playlist_position(&self) -> usize {
        self.core.lock().unwrap().playlist.position()
    }

    pub fn playlist_len(&self) -> usize {
        self.core.lock().unwrap().playlist.len()
    }

    pub fn now_playing(&self) -> &Arc<NowPlaying> {
        &self.now_playing
    }

    pub fn catalog(&self) -> &Arc<MediaCatalog> {
        &self.catalog
    }

    pub fn audio_service(&self) -> &Arc<BackendService> {
        &self.audio
    }

    pub fn video_service(&self) -> &Arc<BackendService> {
        &self.video
    }

    pub fn web_service(&self) -> &Arc<BackendService> {
        &self.web
    }

    fn bridge(&self) -> Option<Arc<ExternalPlayerBridge>> {
        self.bridge.lock().unwrap().clone()
    }

    fn playback_type(&self) -> PlaybackKind {
        self.now_playing.playback()
    }

    fn active_skill(&self) -> String {
        self.now_playing.skill_id()
    }

    fn autoplay(&self) -> bool {
        self.config.ocp.autoplay
    }

    fn can_prev_locked(&self, core: &PlayerCore) -> bool {
        self.playback_type() == PlaybackKind::Mpris || !core.playlist.is_first_track()
    }

    fn can_next_locked(&self, core: &PlayerCore) -> bool {
        if core.loop_state != LoopState::None
            || core.shuffle
            || self.playback_type() == PlaybackKind::Mpris
        {
            return true;
        }
        if self.config.ocp.merge_search
            && !self.catalog.with_search_playlist(|s| s.is_last_track())
        {
            return true;
        }
        !core.playlist.is_last_track()
    }

    // State reporting.

    /// Assign the new media state, then announce it.
    pub fn set_media_state(&self, state: MediaState) {
        {
            let mut core = self.core.lock().unwrap();
            if core.media_state == state {
                return;
            }
            core.media_state = state;
        }
        self.bus.emit(
            Message::new(format!("{OCP_ID}.media.state")).with_data(json!({"state": state})),
        );
    }

    /// Assign the new player state, announce it, and refresh the exported
    /// MPRIS properties.
    pub fn set_player_state(&self, state: PlayerState) {
        {
            let mut core = self.core.lock().unwrap();
            if core.state == state {
                return;
            }
            core.state = state;
        }
        self.bus.emit(
            Message::new(format!("{OCP_ID}.player.state")).with_data(json!({"state": state})),
        );
        if let Some(bridge) = self.bridge() {
            bridge.update_props();
        }
        self.broadcast_status();
    }

    fn status_record(&self) -> Value {
        let now_playing = self.now_playing.as_entry();
        let core = self.core.lock().unwrap();
        json!({
            "playback_type": now_playing.playback,
            "media_type": now_playing.media_type,
            "player_state": core.state,
            "loop_state": core.loop_state,
            "media_state": core.media_state,
            "shuffle": core.shuffle,
            "playlist_position": core.playlist.position(),
            "playlist_size": core.playlist.len(),
            "title": now_playing.title,
            "artist": now_playing.artist,
            "image": now_playing.image,
        })
    }

    fn broadcast_status(&self) {
        self.handle_status(&Message::new(format!("{OCP_ID}.status")));
    }

    fn emit_gui_state(&self, state: &str, timeout: Option<Duration>) {
        self.display_timer.cancel();
        self.bus.emit(
            Message::new(format!("{OCP_ID}.gui.state")).with_data(json!({"state": state})),
        );
        if let Some(timeout) = timeout {
            let bus = self.bus.clone();
            self.display_timer.schedule(timeout, move || {
                bus.emit(
                    Message::new(format!("{OCP_ID}.gui.state"))
                        .with_data(json!({"state": "home"})),
                );
            });
        }
    }

    // Now-playing management.

    /// Install `track` as the current media and keep the playlist in step.
    pub fn set_now_playing(&self, track: MediaEntry) {
        {
            let mut core = self.core.lock().unwrap();

            // Leaving an external-player session drops its placeholder entry.
            if self.now_playing.playback() == PlaybackKind::Mpris
                && track.playback != PlaybackKind::Mpris
            {
                core.playlist.clear();
            }

            // Reset first so nothing of the previous track bleeds through.
            self.now_playing.reset();
            self.now_playing.update_entry(&track, false);

            if track.playback == PlaybackKind::Mpris {
                core.playlist.clear();
                core.playlist.add_entry(track);
            } else {
                if !core.playlist.contains(&track) {
                    core.playlist.add_entry(track.clone());
                }
                core.playlist.goto_entry(&track);
            }
        }

        if let Some(bridge) = self.bridge() {
            bridge.update_props();
        }
        self.broadcast_status();
    }

    /// Resolve and sanity-check the current stream; headless setups and
    /// force-audio configs coerce playback onto the audio service.
    fn validate_stream(&self) -> bool {
        let playback = self.playback_type();
        if !matches!(
            playback,
            PlaybackKind::Skill | PlaybackKind::Undefined | PlaybackKind::Mpris
        ) {
            if let Err(e) = self.now_playing.extract_stream() {
                warn!("stream validation failed: {e}");
                return false;
            }
            let has_gui = self.config.ocp.assume_gui;
            if !has_gui
                || self.config.ocp.force_audioservice
                || self.config.ocp.playback_mode == PlaybackMode::ForceAudio
            {
                self.now_playing.set_playback(PlaybackKind::Audio);
            }
        }
        true
    }

    /// Playback error path: make the failure visible, give the user a moment
    /// to see it, then move on.
    fn on_invalid_stream(&self) {
        self.set_media_state(MediaState::InvalidMedia);
        self.bus.emit(
            Message::new("mycroft.audio.play_sound").with_data(json!({"uri": "snd/error.mp3"})),
        );
        self.emit_gui_state("playback_error", None);
        warn!(uri = %self.now_playing.uri(), "failed to play");
        thread::sleep(ERROR_DISPLAY);
        if self.autoplay() {
            self.play_next();
        }
    }

    // Media controls.

    /// Start playing the requested media, replacing any current playback.
    pub fn play_media(
        &self,
        track: TrackRequest,
        disambiguation: Option<Vec<MediaEntry>>,
        playlist: Option<Vec<MediaEntry>>,
    ) {
        let (track, playlist) = match track {
            TrackRequest::Entry(track) => (track, playlist),
            TrackRequest::List(list) => match list.first().cloned() {
                Some(first) => (first, Some(list)),
                None => {
                    warn!("play request with an empty track list");
                    return;
                }
            },
        };

        if let Some(bridge) = self.bridge() {
            bridge.stop();
        }

        if let Some(disambiguation) = disambiguation {
            let mut seen = Vec::new();
            let mut deduped = Vec::new();
            for entry in disambiguation {
                if !seen.contains(&entry.uri) {
                    seen.push(entry.uri.clone());
                    deduped.push(entry);
                }
            }
            self.catalog.with_search_playlist(|search| {
                search.replace(deduped);
                search.sort_by_confidence();
            });
        }

        {
            let mut core = self.core.lock().unwrap();
            if let Some(playlist) = playlist {
                core.playlist.replace(playlist);
            }
            if core.playlist.contains(&track) {
                core.playlist.goto_entry(&track);
            }
        }

        self.set_now_playing(track);
        self.play();
        // Let the backend's async load get under way.
        thread::sleep(PLAY_SETTLE);
    }

    /// Start playback of the current now-playing entry.
    pub fn play(&self) {
        // Whatever external players were doing, this takes priority.
        if let Some(bridge) = self.bridge() {
            bridge.stop();
        }

        // Track how often liked songs actually get played.
        self.catalog.bump_play_count(&self.now_playing.uri());

        if !self.validate_stream() {
            warn!("stream validation failed");
            self.on_invalid_stream();
            return;
        }

        self.emit_gui_state("player", None);

        {
            let mut core = self.core.lock().unwrap();
            let uri = self.now_playing.uri();
            *core.track_history.entry(uri).or_insert(0) += 1;
        }

        let playback = self.playback_type();
        match playback {
            PlaybackKind::Audio => {
                debug!("requesting playback: audio");
                self.audio.play(&self.now_playing.uri(), None);
            }
            PlaybackKind::Video => {
                debug!("requesting playback: video");
                self.video.play(&self.now_playing.uri(), None);
            }
            PlaybackKind::Webview => {
                debug!("requesting playback: web view");
                self.web.play(&self.now_playing.uri(), None);
            }
            PlaybackKind::Skill => {
                debug!("requesting playback: skill");
                self.bus.emit(
                    Message::new(format!("{OCP_ID}.{}.play", self.active_skill()))
                        .with_data(self.now_playing.infocard()),
                );
                self.bus.emit(
                    Message::new(format!("{OCP_ID}.track.state"))
                        .with_data(json!({"state": TrackState::PlayingSkill})),
                );
            }
            PlaybackKind::Mpris | PlaybackKind::Undefined => {
                error!(?playback, "invalid playback request");
                return;
            }
        }

        if let Some(bridge) = self.bridge() {
            bridge.update_props();
        }
        self.set_player_state(PlayerState::Playing);
    }

    /// Pick a random playlist position, falling through to the search
    /// results once the playlist is exhausted.
    fn choose_shuffle(&self, core: &mut PlayerCore) -> Option<MediaEntry> {
        if core.playlist.len() > 1 && !core.playlist.is_last_track() {
            let index = rand::rng().random_range(0..core.playlist.len());
            core.playlist.set_position(index);
            core.playlist.current_track().cloned()
        } else {
            self.catalog.with_search_playlist(|search| {
                search.next_track();
                search.current_track().cloned()
            })
        }
    }

    /// Advance to the next track, honoring repeat, shuffle and the
    /// merge-search fallthrough.
    pub fn play_next(&self) {
        match self.playback_type() {
            PlaybackKind::Mpris => {
                if let Some(bridge) = self.bridge() {
                    bridge.play_next();
                }
                return;
            }
            PlaybackKind::Skill => {
                debug!("deferring next track to the skill");
                self.bus
                    .emit(Message::new(format!("{OCP_ID}.{}.next", self.active_skill())));
                return;
            }
            _ => {}
        }

        let pick = {
            let mut core = self.core.lock().unwrap();
            if core.loop_state == LoopState::RepeatTrack {
                debug!("repeating single track");
                NextPick::Replay
            } else if core.shuffle {
                debug!("shuffling");
                match self.choose_shuffle(&mut core) {
                    Some(track) => NextPick::Track(track),
                    None => NextPick::GiveUp,
                }
            } else if !core.playlist.is_last_track() {
                core.playlist.next_track();
                info!(index = core.playlist.position(), "next track");
                match core.playlist.current_track().cloned() {
                    Some(track) => NextPick::Track(track),
                    None => NextPick::GiveUp,
                }
            } else if self.config.ocp.merge_search {
                // The playlist ran dry; continue into search results that
                // have not been played from the playlist already.
                let pick = self.catalog.with_search_playlist(|search| {
                    if search.is_last_track() {
                        return None;
                    }
                    loop {
                        let current = search.current_track().cloned()?;
                        if !core.playlist.contains(&current) {
                            info!(index = search.position(), "next search result");
                            return Some(current);
                        }
                        if search.is_last_track() {
                            return None;
                        }
                        search.next_track();
                    }
                });
                match pick {
                    Some(track) => NextPick::Track(track),
                    None if core.loop_state == LoopState::RepeatPlaylist
                        && !core.playlist.is_empty() =>
                    {
                        info!("end of playlist, repeating");
                        core.playlist.set_position(0);
                        match core.playlist.current_track().cloned() {
                            Some(track) => NextPick::Track(track),
                            None => NextPick::GiveUp,
                        }
                    }
                    None => NextPick::GiveUp,
                }
            } else if core.loop_state == LoopState::RepeatPlaylist && !core.playlist.is_empty() {
                info!("end of playlist, repeating");
                core.playlist.set_position(0);
                match core.playlist.current_track().cloned() {
                    Some(track) => NextPick::Track(track),
                    None => NextPick::GiveUp,
                }
            } else {
                NextPick::GiveUp
            }
        };

        match pick {
            NextPick::Replay => self.play(),
            NextPick::Track(track) => {
                self.set_now_playing(track);
                self.play();
            }
            NextPick::GiveUp => {
                info!("requested next, but there are no more tracks");
            }
        }
    }

    /// Step back to the previous track; under shuffle this reuses the
    /// shuffle picker.
    pub fn play_prev(&self) {
        match self.playback_type() {
            PlaybackKind::Mpris => {
                if let Some(bridge) = self.bridge() {
                    bridge.play_prev();
                }
                return;
            }
            PlaybackKind::Skill | PlaybackKind::Undefined => {
                self.bus
                    .emit(Message::new(format!("{OCP_ID}.{}.prev", self.active_skill())));
                return;
            }
            _ => {}
        }

        let pick = {
            let mut core = self.core.lock().unwrap();
            if core.shuffle {
                self.choose_shuffle(&mut core)
            } else if !core.playlist.is_first_track() {
                core.playlist.prev_track();
                debug!(index = core.playlist.position(), "previous track");
                core.playlist.current_track().cloned()
            } else {
                debug!("requested previous, but already at the first track");
                None
            }
        };

        if let Some(track) = pick {
            self.set_now_playing(track);
            self.play();
        }
    }

    pub fn pause(&self) {
        let playback = self.playback_type();
        debug!(?playback, "pausing playback");
        if matches!(playback, PlaybackKind::Audio | PlaybackKind::Undefined) {
            self.audio.pause();
        }
        if matches!(playback, PlaybackKind::Video | PlaybackKind::Undefined) {
            self.video.pause();
        }
        if matches!(playback, PlaybackKind::Skill | PlaybackKind::Undefined) {
            self.bus
                .emit(Message::new(format!("{OCP_ID}.{}.pause", self.active_skill())));
        }
        if playback == PlaybackKind::Mpris {
            if let Some(bridge) = self.bridge() {
                bridge.pause();
            }
        }
        self.set_player_state(PlayerState::Paused);
        self.core.lock().unwrap().paused_on_duck = false;
    }

    pub fn resume(&self) {
        let playback = self.playback_type();
        debug!(?playback, "resuming playback");
        if matches!(playback, PlaybackKind::Audio | PlaybackKind::Undefined) {
            self.audio.resume();
        }
        if matches!(playback, PlaybackKind::Skill | PlaybackKind::Undefined) {
            self.bus
                .emit(Message::new(format!("{OCP_ID}.{}.resume", self.active_skill())));
        }
        if playback == PlaybackKind::Video {
            self.video.resume();
        }
        if playback == PlaybackKind::Mpris {
            if let Some(bridge) = self.bridge() {
                bridge.resume();
            }
        }
        self.set_player_state(PlayerState::Playing);
    }

    /// Seek to an absolute position. Only audio playback supports this.
    pub fn seek(&self, position_ms: u64) {
        if matches!(
            self.playback_type(),
            PlaybackKind::Audio | PlaybackKind::Undefined
        ) {
            self.audio.set_track_position(position_ms);
        }
    }

    pub fn stop(&self) {
        // Stop any search still in flight.
        self.bus.emit(Message::new(format!("{OCP_ID}.search.stop")));

        debug!("stopping playback");
        let playback = self.playback_type();
        if matches!(playback, PlaybackKind::Audio | PlaybackKind::Undefined) {
            self.audio.stop(None);
        }
        if matches!(playback, PlaybackKind::Skill | PlaybackKind::Undefined) {
            self.stop_skill();
        }
        if matches!(playback, PlaybackKind::Video | PlaybackKind::Undefined) {
            self.video.stop(None);
        }
        if matches!(playback, PlaybackKind::Webview | PlaybackKind::Undefined) {
            self.web.stop(None);
        }
        if playback == PlaybackKind::Mpris {
            if let Some(bridge) = self.bridge() {
                bridge.pause();
            }
        }
        self.set_player_state(PlayerState::Stopped);
    }

    fn stop_skill(&self) {
        self.bus
            .emit(Message::new(format!("{OCP_ID}.{}.stop", self.active_skill())));
    }

    /// An external player went active: silence everything local before its
    /// metadata is adopted.
    pub fn handle_mpris_takeover(&self) {
        self.audio.stop(None);
        self.video.stop(None);
        self.web.stop(None);
        self.stop_skill();
        self.now_playing.set_original_uri("");
    }

    /// Clear media, settings and lists back to the idle state.
    pub fn reset(&self) {
        self.now_playing.reset();
        let was_mpris = self.playback_type() == PlaybackKind::Mpris;
        {
            let mut core = self.core.lock().unwrap();
            core.playlist.clear();
            core.shuffle = false;
            core.loop_state = LoopState::None;
            core.state = PlayerState::Stopped;
        }
        self.catalog.clear();
        if !was_mpris {
            self.set_media_state(MediaState::NoMedia);
        }
    }

    pub fn shutdown(&self) {
        self.stop();
        if let Some(bridge) = self.bridge.lock().unwrap().take() {
            bridge.shutdown();
        }
        self.now_playing.shutdown();
        self.catalog.shutdown();
        self.audio.shutdown();
        self.video.shutdown();
        self.web.shutdown();
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.remove(&sub);
        }
    }

    // Bus event handlers.

    /// Echoes of `player.state`, also reported by backends.
    fn handle_player_state_event(&self, message: &Message) {
        let Some(code) = message.data_i64("state") else {
            error!("player state update with no state");
            return;
        };
        let Ok(state) = PlayerState::try_from(code) else {
            error!(code, "not a player state");
            return;
        };
        {
            let mut core = self.core.lock().unwrap();
            if core.state == state {
                return;
            }
            info!(from = ?core.state, to = ?state, "player state changed");
            core.state = state;
        }
        if let Some(bridge) = self.bridge() {
            bridge.update_props();
        }
    }

    /// Echoes of `media.state`, also reported by backends.
    fn handle_media_state_event(&self, message: &Message) {
        let Some(code) = message.data_i64("state") else {
            error!("media state update with no state");
            return;
        };
        let Ok(state) = MediaState::try_from(code) else {
            error!(code, "not a media state");
            return;
        };
        {
            let mut core = self.core.lock().unwrap();
            if core.media_state == state {
                return;
            }
            info!(from = ?core.media_state, to = ?state, "media state changed");
            core.media_state = state;
        }
        match state {
            MediaState::EndOfMedia => self.handle_playback_ended(),
            MediaState::InvalidMedia => {
                self.emit_gui_state("playback_error", None);
                thread::sleep(ERROR_DISPLAY);
                if self.autoplay() {
                    self.play_next();
                }
            }
            _ => {}
        }
    }

    fn handle_playback_ended(&self) {
        let has_tracks = !self.core.lock().unwrap().playlist.is_empty();
        let playback = self.playback_type();
        if has_tracks
            && self.autoplay()
            && !matches!(playback, PlaybackKind::Mpris | PlaybackKind::Undefined)
        {
            debug!("playing next track");
            self.play_next();
            return;
        }
        info!("playback ended");
        // Leave the results list up for a while, then go back home.
        self.emit_gui_state("disambiguation", Some(RESULTS_TIMEOUT));
    }

    fn handle_play_request(&self, message: &Message) {
        debug!("received playback request");
        if message.data_bool("repeat").unwrap_or(false) {
            self.core.lock().unwrap().loop_state = LoopState::RepeatPlaylist;
        }

        let Some(media) = message.data.get("media") else {
            error!("play request without media");
            return;
        };
        let track = match TrackRequest::from_value(media) {
            Ok(track) => track,
            Err(e) => {
                error!("unplayable media in play request: {e}");
                return;
            }
        };

        let parse_list = |value: Option<&Vec<Value>>| -> Option<Vec<MediaEntry>> {
            value.map(|items| {
                items
                    .iter()
                    .filter_map(|item| MediaEntry::from_value(item).ok())
                    .collect()
            })
        };
        let playlist = parse_list(message.data_array("playlist")).or_else(|| match &track {
            TrackRequest::Entry(entry) => Some(vec![entry.clone()]),
            TrackRequest::List(_) => None,
        });
        let disambiguation =
            parse_list(message.data_array("disambiguation")).or_else(|| playlist.clone());

        self.play_media(track, disambiguation, playlist);
    }

    fn handle_pause_request(&self, _message: &Message) {
        self.pause();
    }

    fn handle_resume_request(&self, _message: &Message) {
        self.resume();
    }

    fn handle_stop_request(&self, _message: &Message) {
        self.stop();
        self.reset();
    }

    fn handle_next_request(&self, _message: &Message) {
        self.play_next();
    }

    fn handle_prev_request(&self, _message: &Message) {
        self.play_prev();
    }

    fn handle_seek_request(&self, message: &Message) {
        // Either an absolute target from a seekbar or a relative jump in
        // seconds from the voice intent.
        let position = match message.data_i64("seekValue") {
            Some(target) => target.max(0) as u64,
            None => {
                let delta_ms = (message.data_f64("seconds").unwrap_or(0.0) * 1000.0) as i64;
                let current = self
                    .audio
                    .get_track_position()
                    .unwrap_or_else(|| self.now_playing.position());
                (current as i64 + delta_ms).max(0) as u64
            }
        };
        self.seek(position);
    }

    fn handle_set_track_position_request(&self, message: &Message) {
        if let Some(position) = message.data_i64("position") {
            self.seek(position.max(0) as u64);
        }
    }

    fn handle_track_length_request(&self, message: &Message) {
        let mut length = self.now_playing.length();
        if self.playback_type() == PlaybackKind::Audio {
            length = self.audio.get_track_length().unwrap_or(length);
        }
        self.bus.emit(message.response(json!({"length": length})));
    }

    fn handle_track_position_request(&self, message: &Message) {
        let mut position = self.now_playing.position();
        if self.playback_type() == PlaybackKind::Audio {
            position = self.audio.get_track_position().unwrap_or(position);
        }
        self.bus
            .emit(message.response(json!({"position": position})));
    }

    fn handle_track_info_request(&self, message: &Message) {
        self.bus.emit(message.response(self.now_playing.as_value()));
    }

    fn handle_list_backends_request(&self, message: &Message) {
        self.bus
            .emit(message.response(self.audio.available_backends()));
    }

    fn handle_playlist_set_request(&self, message: &Message) {
        self.core.lock().unwrap().playlist.clear();
        self.handle_playlist_queue_request(message);
    }

    fn handle_playlist_queue_request(&self, message: &Message) {
        let Some(tracks) = message.data_array("tracks") else {
            error!("playlist request without tracks");
            return;
        };
        let mut core = self.core.lock().unwrap();
        for track in tracks {
            match MediaEntry::from_value(track) {
                Ok(entry) => core.playlist.add_entry(entry),
                Err(e) => warn!("skipping unparseable track: {e}"),
            }
        }
    }

    fn handle_playlist_clear_request(&self, _message: &Message) {
        self.core.lock().unwrap().playlist.clear();
    }

    // Voice-assistant audio interplay. Corking pauses for the listen
    // window; ducking only drops the volume for the speak window. The two
    // contracts stay separate.

    fn handle_cork_request(&self, _message: &Message) {
        if self.state() == PlayerState::Playing {
            self.pause();
            self.core.lock().unwrap().paused_on_duck = true;
        }
    }

    fn handle_uncork_request(&self, _message: &Message) {
        if self.state() == PlayerState::Paused && self.paused_on_duck() {
            self.resume();
            self.core.lock().unwrap().paused_on_duck = false;
        }
    }

    fn handle_duck_request(&self, _message: &Message) {
        if self.state() == PlayerState::Playing {
            match self.playback_type() {
                PlaybackKind::Video => self.video.lower_volume(),
                PlaybackKind::Audio => self.audio.lower_volume(),
                _ => {}
            }
        }
    }

    fn handle_unduck_request(&self, _message: &Message) {
        match self.playback_type() {
            PlaybackKind::Video => self.video.restore_volume(),
            PlaybackKind::Audio => self.audio.restore_volume(),
            _ => {}
        }
    }

    fn handle_set_shuffle(&self, _message: &Message) {
        self.core.lock().unwrap().shuffle = true;
        self.broadcast_status();
    }

    fn handle_unset_shuffle(&self, _message: &Message) {
        self.core.lock().unwrap().shuffle = false;
        self.broadcast_status();
    }

    fn handle_shuffle_toggle_request(&self, _message: &Message) {
        if self.playback_type() == PlaybackKind::Mpris {
            if let Some(bridge) = self.bridge() {
                bridge.toggle_shuffle();
                return;
            }
        }
        let shuffle = {
            let mut core = self.core.lock().unwrap();
            core.shuffle = !core.shuffle;
            core.shuffle
        };
        info!(shuffle, "shuffle toggled");
        self.broadcast_status();
    }

    fn handle_set_repeat(&self, _message: &Message) {
        self.core.lock().unwrap().loop_state = LoopState::RepeatPlaylist;
        self.broadcast_status();
    }

    fn handle_unset_repeat(&self, _message: &Message) {
        self.core.lock().unwrap().loop_state = LoopState::None;
        self.broadcast_status();
    }

    fn handle_repeat_toggle_request(&self, _message: &Message) {
        if self.playback_type() == PlaybackKind::Mpris {
            if let Some(bridge) = self.bridge() {
                bridge.toggle_repeat();
                return;
            }
        }
        let loop_state = {
            let mut core = self.core.lock().unwrap();
            core.loop_state = core.loop_state.cycled();
            core.loop_state
        };
        info!(?loop_state, "repeat mode");
        self.broadcast_status();
    }

    /// Report the stream-extractor identifiers plugins can resolve, so
    /// search results may defer extraction to playback time.
    fn handle_get_seis(&self, message: &Message) {
        self.bus
            .emit(message.response(json!({"SEI": self.extractors.supported_seis()})));
    }

    fn handle_search_start(&self, _message: &Message) {
        self.emit_gui_state("spinner", None);
    }

    fn handle_like(&self, message: &Message) {
        let uri = message
            .data_str("uri")
            .map(ToString::to_string)
            .unwrap_or_else(|| self.now_playing.original_uri());
        if uri.is_empty() {
            warn!("like request without a uri");
            return;
        }
        let title = message
            .data_str("title")
            .map(ToString::to_string)
            .unwrap_or_else(|| self.now_playing.title());
        let image = message
            .data_str("image")
            .or_else(|| message.data_str("thumbnail"))
            .map(ToString::to_string)
            .unwrap_or_else(|| self.now_playing.image());
        let artist = message
            .data_str("artist")
            .map(ToString::to_string)
            .unwrap_or_else(|| self.now_playing.artist());
        self.catalog.like(&uri, &title, &artist, &image);
        self.bus.emit(message.forward(
            "mycroft.audio.play_sound",
            json!({"uri": "snd/acknowledge.mp3"}),
        ));
        self.broadcast_status();
    }

    fn handle_unlike(&self, message: &Message) {
        let uri = message
            .data_str("uri")
            .map(ToString::to_string)
            .unwrap_or_else(|| self.now_playing.original_uri());
        if !uri.is_empty() {
            self.catalog.unlike(&uri);
        }
    }

    fn handle_status(&self, message: &Message) {
        self.bus.emit(message.response(self.status_record()));
    }
}

impl PlayerHandle for MediaPlayer {
    fn pause(&self) {
        MediaPlayer::pause(self);
    }

    fn resume(&self) {
        MediaPlayer::resume(self);
    }

    fn play_next(&self) {
        MediaPlayer::play_next(self);
    }

    fn play_prev(&self) {
        MediaPlayer::play_prev(self);
    }

    fn set_player_state(&self, state: PlayerState) {
        MediaPlayer::set_player_state(self, state);
    }

    fn set_media_state(&self, state: MediaState) {
        MediaPlayer::set_media_state(self, state);
    }

    fn set_loop_state(&self, state: LoopState) {
        self.core.lock().unwrap().loop_state = state;
        self.broadcast_status();
    }

    fn set_shuffle(&self, shuffle: bool) {
        self.core.lock().unwrap().shuffle = shuffle;
        self.broadcast_status();
    }

    /// Adopt (or refresh) an external player's track as the current media.
    fn sync_external(&self, meta: ExternalMediaMeta) {
        let adopting = self.now_playing.skill_id() != meta.player_name;
        if adopting {
            // Local playback yields before the mirrored metadata lands.
            self.handle_mpris_takeover();
        }

        match meta.state {
            PlayerState::Playing => {
                self.set_player_state(PlayerState::Playing);
                self.set_media_state(MediaState::BufferedMedia);
            }
            PlayerState::Paused => {
                self.set_player_state(PlayerState::Paused);
                self.set_media_state(MediaState::BufferedMedia);
            }
            PlayerState::Stopped => {
                self.set_player_state(PlayerState::Stopped);
                self.set_media_state(MediaState::EndOfMedia);
            }
        }
        {
            let mut core = self.core.lock().unwrap();
            core.loop_state = meta.loop_state;
            if let Some(shuffle) = meta.shuffle {
                core.shuffle = shuffle;
            }
        }

        let entry = MediaEntry {
            title: meta.title,
            artist: meta.artist,
            image: meta.image.clone(),
            bg_image: meta.image,
            length: meta.length,
            playback: PlaybackKind::Mpris,
            status: TrackState::PlayingMpris,
            skill_id: meta.player_name,
            ..MediaEntry::default()
        };
        self.set_now_playing(entry);
    }

    fn snapshot(&self) -> PlayerSnapshot {
        let metadata = self.now_playing.mpris_metadata();
        let core = self.core.lock().unwrap();
        PlayerSnapshot {
            state: core.state,
            loop_state: core.loop_state,
            shuffle: core.shuffle,
            can_next: self.can_next_locked(&core),
            can_prev: self.can_prev_locked(&core),
            metadata,
        }
    }
}
