//! The MPRIS surface this process exports, so desktop tooling can see and
//! control OCPMedia like any other media player.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;
use zbus::interface;
use zbus::zvariant::{Array, Str, Value};

use ocpbus::{Message, MessageBus};
use ocpmodel::{LoopState, PlayerState};

use crate::handle::PlayerHandle;

pub const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
pub const OCP_BUS_NAME: &str = "org.mpris.MediaPlayer2.OCP";

const VOLUME_TIMEOUT: Duration = Duration::from_millis(500);

pub struct MprisRoot;

#[interface(name = "org.mpris.MediaPlayer2")]
impl MprisRoot {
    #[zbus(property)]
    fn identity(&self) -> &str {
        "OCP"
    }

    #[zbus(property)]
    fn desktop_entry(&self) -> &str {
        "OCP"
    }

    #[zbus(property)]
    fn supported_uri_schemes(&self) -> Vec<String> {
        [
            "file", "http", "https", "rtsp", "realrtsp", "pnm", "ftp", "mtp", "smb", "mms", "mmsu",
            "mmst", "mmsh", "unsv", "itpc", "icyx", "rtmp", "rtp", "dccp", "dvd", "vcd",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    #[zbus(property)]
    fn supported_mime_types(&self) -> Vec<String> {
        [
            "audio/mpeg",
            "audio/x-mpeg",
            "video/mpeg",
            "video/x-mpeg",
            "video/mpeg-system",
            "video/x-mpeg-system",
            "video/mp4",
            "audio/mp4",
            "video/x-msvideo",
            "video/quicktime",
            "application/ogg",
            "application/x-ogg",
            "video/x-ms-asf",
            "video/x-ms-asf-plugin",
            "application/x-mplayer2",
            "video/x-ms-wmv",
            "audio/wav",
            "audio/x-wav",
            "audio/3gpp",
            "video/3gpp",
            "audio/3gpp2",
            "video/3gpp2",
            "video/divx",
            "video/flv",
            "video/x-flv",
            "video/x-matroska",
            "audio/x-matroska",
            "application/xspf+xml",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    #[zbus(property)]
    fn has_track_list(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_quit(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_raise(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_set_fullscreen(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn fullscreen(&self) -> bool {
        false
    }

    fn raise(&self) {}

    fn quit(&self) {}
}

pub struct MprisPlayer {
    player: Arc<dyn PlayerHandle>,
    bus: MessageBus,
}

impl MprisPlayer {
    pub fn new(player: Arc<dyn PlayerHandle>, bus: MessageBus) -> Self {
        Self { player, bus }
    }
}

#[interface(name = "org.mpris.MediaPlayer2.Player")]
impl MprisPlayer {
    #[zbus(property)]
    fn metadata(&self) -> HashMap<String, Value<'static>> {
        metadata_to_zvariant(&self.player.snapshot().metadata)
    }

    #[zbus(property)]
    fn playback_status(&self) -> &str {
        self.player.snapshot().state.mpris_status()
    }

    #[zbus(property)]
    fn loop_status(&self) -> &str {
        self.player.snapshot().loop_state.mpris_status()
    }

    #[zbus(property)]
    fn set_loop_status(&self, status: &str) {
        self.player.set_loop_state(LoopState::from_mpris_status(status));
    }

    #[zbus(property)]
    fn shuffle(&self) -> bool {
        self.player.snapshot().shuffle
    }

    #[zbus(property)]
    fn set_shuffle(&self, shuffle: bool) {
        self.player.set_shuffle(shuffle);
    }

    /// Volume is owned by the voice stack, not the player; round-trip it
    /// over the message bus.
    #[zbus(property)]
    async fn volume(&self) -> f64 {
        let bus = self.bus.clone();
        let reply = tokio::task::spawn_blocking(move || {
            bus.wait_for_response(Message::new("mycroft.volume.get"), VOLUME_TIMEOUT)
        })
        .await;
        match reply {
            Ok(Ok(msg)) => msg.data_f64("percent").unwrap_or(1.0),
            _ => 1.0,
        }
    }

    #[zbus(property)]
    fn set_volume(&self, volume: f64) {
        self.bus.emit(
            Message::new("mycroft.volume.set").with_data(json!({"percent": volume})),
        );
    }

    #[zbus(property)]
    fn rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn minimum_rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn maximum_rate(&self) -> f64 {
        1.0
    }

    #[zbus(property)]
    fn position(&self) -> i64 {
        0
    }

    #[zbus(property)]
    fn can_play(&self) -> bool {
        self.player.snapshot().state == PlayerState::Paused
    }

    #[zbus(property)]
    fn can_pause(&self) -> bool {
        self.player.snapshot().state == PlayerState::Playing
    }

    #[zbus(property)]
    fn can_go_next(&self) -> bool {
        self.player.snapshot().can_next
    }

    #[zbus(property)]
    fn can_go_previous(&self) -> bool {
        self.player.snapshot().can_prev
    }

    #[zbus(property)]
    fn can_seek(&self) -> bool {
        false
    }

    #[zbus(property)]
    fn can_control(&self) -> bool {
        true
    }

    fn previous(&self) {
        debug!("mpris Previous");
        self.player.play_prev();
    }

    fn next(&self) {
        debug!("mpris Next");
        self.player.play_next();
    }

    /// External controllers conflate stop with pause; pausing keeps resume
    /// possible, so Stop maps to pause.
    fn stop(&self) {
        debug!("mpris Stop");
        self.player.pause();
    }

    fn play(&self) {
        debug!("mpris Play");
        self.player.resume();
    }

    fn pause(&self) {
        debug!("mpris Pause");
        self.player.pause();
    }

    fn play_pause(&self) {
        if self.player.snapshot().state == PlayerState::Paused {
            self.player.resume();
        } else {
            self.player.pause();
        }
    }
}

/// Translate the player's JSON metadata map into D-Bus variants.
fn metadata_to_zvariant(meta: &serde_json::Value) -> HashMap<String, Value<'static>> {
    let mut map = HashMap::new();
    let Some(object) = meta.as_object() else {
        return map;
    };
    for (key, value) in object {
        let variant = match value {
            serde_json::Value::String(s) => Value::Str(Str::from(s.clone())),
            serde_json::Value::Number(n) if n.is_i64() => Value::I64(n.as_i64().unwrap_or(0)),
            serde_json::Value::Number(n) => Value::F64(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Array(items) => {
                let strings: Vec<String> = items
                    .iter()
                    .filter_map(|i| i.as_str().map(ToString::to_string))
                    .collect();
                Value::Array(Array::from(strings))
            }
            _ => continue,
        };
        map.insert(key.clone(), variant);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_translation_covers_the_mpris_keys() {
        let meta = json!({
            "xesam:title": "T",
            "xesam:artist": ["A"],
            "mpris:artUrl": "http://x/cover.png",
            "mpris:length": 180_000_000i64,
        });
        let map = metadata_to_zvariant(&meta);
        assert_eq!(map.len(), 4);
        assert!(matches!(map.get("xesam:title"), Some(Value::Str(_))));
        assert!(matches!(map.get("xesam:artist"), Some(Value::Array(_))));
        assert!(matches!(map.get("mpris:length"), Some(Value::I64(180_000_000))));
    }

    #[test]
    fn non_object_metadata_is_empty() {
        assert!(metadata_to_zvariant(&json!(null)).is_empty());
    }
}
