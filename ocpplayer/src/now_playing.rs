//! Live view of the currently playing track.
//!
//! `NowPlaying` is distinct from any playlist entry: it is the single
//! mutable record of what is on right now, kept in sync with the world by
//! bus events from backends, skills and the GUI seekbar.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{error, info};

use ocpbus::{Message, MessageBus, Subscription};
use ocpmodel::{MediaEntry, MediaState, MediaType, PlaybackKind, TrackState};

use crate::extractor::StreamExtractorSet;
use crate::{OCP_ID, PlayerError, Result};

pub struct NowPlaying {
    bus: MessageBus,
    extractors: StreamExtractorSet,
    state: Mutex<MediaEntry>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl NowPlaying {
    pub fn create(bus: MessageBus, extractors: StreamExtractorSet) -> Arc<Self> {
        let now_playing = Arc::new(Self {
            bus,
            extractors,
            state: Mutex::new(MediaEntry::default()),
            subscriptions: Mutex::new(Vec::new()),
        });
        now_playing.register_bus_handlers();
        now_playing
    }

    fn register_bus_handlers(self: &Arc<Self>) {
        let mut subs = Vec::new();

        macro_rules! handler {
            ($event:expr, $method:ident) => {{
                let weak: Weak<Self> = Arc::downgrade(self);
                self.bus.on($event, move |msg: &Message| {
                    if let Some(now_playing) = weak.upgrade() {
                        now_playing.$method(msg);
                    }
                })
            }};
        }

        subs.push(handler!(
            format!("{OCP_ID}.track.state"),
            handle_track_state_change
        ));
        subs.push(handler!(
            format!("{OCP_ID}.media.state"),
            handle_media_state_change
        ));
        subs.push(handler!(format!("{OCP_ID}.play"), handle_external_play));
        subs.push(handler!(
            format!("{OCP_ID}.playback_time"),
            handle_sync_seekbar
        ));

        *self.subscriptions.lock().unwrap() = subs;
    }

    pub fn shutdown(&self) {
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.remove(&sub);
        }
    }

    // Snapshots and field access. Multi-field readers must go through a
    // snapshot; individual getters are only consistent by themselves.

    pub fn as_entry(&self) -> MediaEntry {
        self.state.lock().unwrap().clone()
    }

    pub fn as_value(&self) -> Value {
        self.state.lock().unwrap().as_value()
    }

    pub fn infocard(&self) -> Value {
        self.state.lock().unwrap().infocard()
    }

    pub fn mpris_metadata(&self) -> Value {
        self.state.lock().unwrap().mpris_metadata()
    }

    pub fn uri(&self) -> String {
        self.state.lock().unwrap().uri.clone()
    }

    pub fn original_uri(&self) -> String {
        self.state.lock().unwrap().original_uri.clone()
    }

    pub fn set_original_uri(&self, uri: impl Into<String>) {
        self.state.lock().unwrap().original_uri = uri.into();
    }

    pub fn playback(&self) -> PlaybackKind {
        self.state.lock().unwrap().playback
    }

    pub fn set_playback(&self, playback: PlaybackKind) {
        self.state.lock().unwrap().playback = playback;
    }

    pub fn status(&self) -> TrackState {
        self.state.lock().unwrap().status
    }

    pub fn media_type(&self) -> MediaType {
        self.state.lock().unwrap().media_type
    }

    pub fn skill_id(&self) -> String {
        self.state.lock().unwrap().skill_id.clone()
    }

    pub fn title(&self) -> String {
        self.state.lock().unwrap().title.clone()
    }

    pub fn artist(&self) -> String {
        self.state.lock().unwrap().artist.clone()
    }

    pub fn image(&self) -> String {
        self.state.lock().unwrap().image.clone()
    }

    pub fn length(&self) -> u64 {
        self.state.lock().unwrap().length
    }

    pub fn position(&self) -> u64 {
        self.state.lock().unwrap().position
    }

    /// Merge another entry into the current one. With `newonly`, fields that
    /// already hold a value are preserved -- except `uri`, which is always
    /// overwritten so stream extraction can swap in the resolved URL while
    /// keeping title and artwork.
    pub fn update_entry(&self, entry: &MediaEntry, newonly: bool) {
        let mut state = self.state.lock().unwrap();
        merge_entry(&mut state, &entry.as_value(), newonly);
    }

    /// Same as `update_entry` for a raw dict; only keys present in the dict
    /// are touched.
    pub fn update_value(&self, value: &Value, newonly: bool) {
        let mut state = self.state.lock().unwrap();
        merge_entry(&mut state, value, newonly);
    }

    /// Back to a blank slate between tracks so nothing bleeds through.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.title.clear();
        state.artist.clear();
        state.skill_id.clear();
        state.skill_icon.clear();
        state.image.clear();
        state.javascript.clear();
        state.position = 0;
        state.length = 0;
        state.playback = PlaybackKind::Undefined;
        state.status = TrackState::Disambiguation;
        state.media_type = MediaType::Generic;
    }

    /// Resolve the current URI through the stream extractors and validate
    /// that the result is actually playable.
    pub fn extract_stream(&self) -> Result<()> {
        let (uri, video) = {
            let state = self.state.lock().unwrap();
            (state.uri.clone(), state.playback == PlaybackKind::Video)
        };
        if uri.is_empty() {
            return Err(PlayerError::InvalidStream("no uri to extract".into()));
        }

        if let Some(meta) = self.extractors.extract_stream(&uri, video)? {
            info!(%meta, "stream extractor metadata");
            let mut state = self.state.lock().unwrap();
            merge_entry(&mut state, &meta, true);
            state.original_uri = uri;
        }

        let state = self.state.lock().unwrap();
        let playable = state.uri.starts_with("http")
            || state.uri.starts_with("file")
            || state.uri.starts_with('/');
        if !playable {
            return Err(PlayerError::InvalidStream(state.uri.clone()));
        }
        Ok(())
    }

    // Bus event surface.

    fn handle_track_state_change(&self, message: &Message) {
        let Some(code) = message.data_i64("state") else {
            error!("track state update with no state: {}", message.msg_type);
            return;
        };
        let Ok(status) = TrackState::try_from(code) else {
            error!(code, "not a track state");
            return;
        };
        let mut state = self.state.lock().unwrap();
        if status == state.status {
            return;
        }
        info!(from = ?state.status, to = ?status, "track state changed");
        state.status = status;
    }

    fn handle_media_state_change(&self, message: &Message) {
        let Some(code) = message.data_i64("state") else {
            error!("media state update with no state: {}", message.msg_type);
            return;
        };
        let Ok(media_state) = MediaState::try_from(code) else {
            error!(code, "not a media state");
            return;
        };
        if media_state == MediaState::EndOfMedia {
            // Playback ended; let the next track change metadata again.
            self.reset();
        }
    }

    /// A play request replaces the metadata unconditionally, otherwise the
    /// previous track's fields would bleed into the new one.
    fn handle_external_play(&self, message: &Message) {
        let media = message
            .data
            .get("media")
            .cloned()
            .or_else(|| {
                message
                    .data_array("tracks")
                    .and_then(|tracks| tracks.first().cloned())
            });
        if let Some(media) = media {
            self.update_value(&media, false);
        }
    }

    fn handle_sync_seekbar(&self, message: &Message) {
        let (Some(length), Some(position)) =
            (message.data_i64("length"), message.data_i64("position"))
        else {
            error!("playback_time without length/position");
            return;
        };
        let mut state = self.state.lock().unwrap();
        state.length = length.max(0) as u64;
        state.position = position.max(0) as u64;
    }
}

/// Field-wise merge of a dict into the entry. Only keys present in the dict
/// are considered; `newonly` preserves fields that already hold a value,
/// with `uri` exempt.
fn merge_entry(entry: &mut MediaEntry, value: &Value, newonly: bool) {
    let Some(obj) = value.as_object() else {
        return;
    };

    macro_rules! merge_str {
        ($field:ident, $key:literal) => {
            if let Some(v) = obj.get($key).and_then(Value::as_str) {
                if !newonly || entry.$field.is_empty() {
                    entry.$field = v.to_string();
                }
            }
        };
    }

    macro_rules! merge_num {
        ($field:ident, $key:literal) => {
            if let Some(v) = obj.get($key).and_then(Value::as_i64) {
                if !newonly || entry.$field == 0 {
                    entry.$field = v.max(0) as _;
                }
            }
        };
    }

    merge_str!(title, "title");
    merge_str!(artist, "artist");
    merge_str!(image, "image");
    merge_str!(bg_image, "bg_image");
    merge_str!(skill_id, "skill_id");
    merge_str!(skill_icon, "skill_icon");
    merge_str!(javascript, "javascript");
    merge_str!(original_uri, "original_uri");
    merge_num!(length, "length");
    merge_num!(position, "position");
    merge_num!(match_confidence, "match_confidence");
    merge_num!(play_count, "play_count");

    if let Some(code) = obj.get("playback").and_then(Value::as_i64) {
        if let Ok(playback) = PlaybackKind::try_from(code) {
            if !newonly || entry.playback == PlaybackKind::Undefined {
                entry.playback = playback;
            }
        }
    }
    if let Some(code) = obj.get("status").and_then(Value::as_i64) {
        if let Ok(status) = TrackState::try_from(code) {
            if !newonly || entry.status == TrackState::Disambiguation {
                entry.status = status;
            }
        }
    }
    if let Some(code) = obj.get("media_type").and_then(Value::as_i64) {
        if let Ok(media_type) = MediaType::try_from(code) {
            if !newonly || entry.media_type == MediaType::Generic {
                entry.media_type = media_type;
            }
        }
    }

    // uri updates must never be skipped.
    if let Some(uri) = obj.get("uri").and_then(Value::as_str) {
        if !uri.is_empty() {
            entry.uri = uri.to_string();
        }
    }
    // Until extraction rewrites anything, the logical form is the uri itself.
    if entry.original_uri.is_empty() {
        entry.original_uri = entry.uri.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn now_playing() -> (MessageBus, Arc<NowPlaying>) {
        let bus = MessageBus::new();
        let np = NowPlaying::create(bus.clone(), StreamExtractorSet::new());
        (bus, np)
    }

    fn settle(bus: &MessageBus) {
        let flush = bus.waiter("test.settle");
        bus.emit(Message::new("test.settle"));
        flush.wait(Duration::from_secs(1));
    }

    #[test]
    fn play_event_replaces_metadata() {
        let (bus, np) = now_playing();
        np.update_value(
            &json!({"uri": "http://old", "title": "Old", "artist": "Prev"}),
            false,
        );
        bus.emit(Message::new(format!("{OCP_ID}.play")).with_data(json!({
            "media": {"uri": "http://new", "title": "New"}
        })));
        settle(&bus);
        assert_eq!(np.uri(), "http://new");
        assert_eq!(np.title(), "New");
        bus.shutdown();
    }

    #[test]
    fn end_of_media_resets() {
        let (bus, np) = now_playing();
        np.update_value(
            &json!({"uri": "http://x", "title": "T", "playback": 2, "media_type": 2}),
            false,
        );
        bus.emit(
            Message::new(format!("{OCP_ID}.media.state"))
                .with_data(json!({"state": MediaState::EndOfMedia})),
        );
        settle(&bus);
        assert_eq!(np.title(), "");
        assert_eq!(np.playback(), PlaybackKind::Undefined);
        assert_eq!(np.status(), TrackState::Disambiguation);
        assert_eq!(np.media_type(), MediaType::Generic);
        bus.shutdown();
    }

    #[test]
    fn newonly_preserves_existing_fields_except_uri() {
        let (bus, np) = now_playing();
        np.update_value(&json!({"uri": "logical//x", "title": "Kept"}), false);
        np.update_value(
            &json!({"uri": "http://resolved", "title": "Dropped", "artist": "Added"}),
            true,
        );
        assert_eq!(np.uri(), "http://resolved");
        assert_eq!(np.title(), "Kept");
        assert_eq!(np.artist(), "Added");
        bus.shutdown();
    }

    #[test]
    fn state_update_without_state_keeps_prior_status() {
        let (bus, np) = now_playing();
        bus.emit(
            Message::new(format!("{OCP_ID}.track.state"))
                .with_data(json!({"state": TrackState::PlayingAudio})),
        );
        settle(&bus);
        assert_eq!(np.status(), TrackState::PlayingAudio);
        bus.emit(Message::new(format!("{OCP_ID}.track.state")).with_data(json!({})));
        settle(&bus);
        assert_eq!(np.status(), TrackState::PlayingAudio);
        bus.shutdown();
    }

    #[test]
    fn seekbar_sync_updates_live_fields() {
        let (bus, np) = now_playing();
        bus.emit(
            Message::new(format!("{OCP_ID}.playback_time"))
                .with_data(json!({"length": 180000, "position": 42000})),
        );
        settle(&bus);
        assert_eq!(np.length(), 180_000);
        assert_eq!(np.position(), 42_000);
        bus.shutdown();
    }

    #[test]
    fn extract_stream_rejects_unplayable_uri() {
        let (bus, np) = now_playing();
        np.update_value(&json!({"uri": "unknown-sei//whatever"}), false);
        assert!(matches!(
            np.extract_stream(),
            Err(PlayerError::InvalidStream(_))
        ));
        bus.shutdown();
    }

    #[test]
    fn extract_stream_accepts_local_paths() {
        let (bus, np) = now_playing();
        np.update_value(&json!({"uri": "/music/song.flac"}), false);
        assert!(np.extract_stream().is_ok());
        bus.shutdown();
    }
}
