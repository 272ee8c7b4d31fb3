use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::states::{MediaType, PlaybackKind, TrackState};
use crate::{ModelError, Result};

/// A single playable item as it travels between skills, the player and the
/// backends. All fields are optional on the wire; absent ones default.
///
/// Two entries are considered the same track when their `uri` matches, which
/// is what playlist membership and deduplication rely on.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaEntry {
    #[serde(default)]
    pub uri: String,
    /// Logical form before stream extraction rewrote `uri`.
    #[serde(default)]
    pub original_uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub bg_image: String,
    #[serde(default)]
    pub skill_id: String,
    #[serde(default)]
    pub skill_icon: String,
    #[serde(default)]
    pub playback: PlaybackKind,
    #[serde(default)]
    pub status: TrackState,
    #[serde(default)]
    pub media_type: MediaType,
    /// Track length in milliseconds.
    #[serde(default)]
    pub length: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    /// Search confidence, 0-100.
    #[serde(default)]
    pub match_confidence: u8,
    /// Payload executed by the web view backend after the page loads.
    #[serde(default)]
    pub javascript: String,
    #[serde(default)]
    pub play_count: u32,
}

impl PartialEq for MediaEntry {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for MediaEntry {}

impl MediaEntry {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// The URI scheme, i.e. everything before the first `:`. Bare paths have
    /// no scheme and route as `file`.
    pub fn scheme(&self) -> &str {
        match self.uri.split_once(':') {
            Some((scheme, _)) => scheme,
            None => "file",
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| ModelError::BadEntry(e.to_string()))
    }

    pub fn as_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Compact snapshot handed to skills and GUI listeners.
    pub fn infocard(&self) -> Value {
        json!({
            "uri": self.uri,
            "title": self.title,
            "artist": self.artist,
            "image": self.image,
            "bg_image": self.bg_image,
            "skill_id": self.skill_id,
            "skill_icon": self.skill_icon,
            "playback": self.playback,
            "status": self.status,
            "media_type": self.media_type,
            "length": self.length,
        })
    }

    /// The `xesam:`/`mpris:` property map advertised over MPRIS.
    /// `mpris:length` is in microseconds per the MPRIS convention.
    pub fn mpris_metadata(&self) -> Value {
        json!({
            "xesam:title": self.title,
            "xesam:artist": [self.artist],
            "mpris:artUrl": self.image,
            "mpris:length": (self.length as i64) * 1000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip_preserves_fields() {
        let entry = MediaEntry {
            uri: "http://x/s.mp3".into(),
            original_uri: "youtube//http://y".into(),
            title: "Song".into(),
            artist: "Band".into(),
            image: "http://x/cover.png".into(),
            playback: PlaybackKind::Audio,
            status: TrackState::QueuedAudio,
            media_type: MediaType::Music,
            length: 180_000,
            match_confidence: 85,
            play_count: 3,
            ..MediaEntry::default()
        };
        let back = MediaEntry::from_value(&entry.as_value()).unwrap();
        assert_eq!(back.uri, entry.uri);
        assert_eq!(back.original_uri, entry.original_uri);
        assert_eq!(back.title, entry.title);
        assert_eq!(back.artist, entry.artist);
        assert_eq!(back.playback, PlaybackKind::Audio);
        assert_eq!(back.status, TrackState::QueuedAudio);
        assert_eq!(back.media_type, MediaType::Music);
        assert_eq!(back.length, 180_000);
        assert_eq!(back.match_confidence, 85);
        assert_eq!(back.play_count, 3);
    }

    #[test]
    fn equality_is_by_uri() {
        let a = MediaEntry {
            uri: "http://x".into(),
            title: "one".into(),
            ..MediaEntry::default()
        };
        let b = MediaEntry {
            uri: "http://x".into(),
            title: "two".into(),
            ..MediaEntry::default()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn scheme_extraction() {
        assert_eq!(MediaEntry::new("spotify:track:123").scheme(), "spotify");
        assert_eq!(MediaEntry::new("http://x/s.mp3").scheme(), "http");
        assert_eq!(MediaEntry::new("/music/song.flac").scheme(), "file");
    }

    #[test]
    fn sparse_dict_deserializes_with_defaults() {
        let entry = MediaEntry::from_value(&json!({"uri": "http://x"})).unwrap();
        assert_eq!(entry.playback, PlaybackKind::Undefined);
        assert_eq!(entry.status, TrackState::Disambiguation);
        assert_eq!(entry.media_type, MediaType::Generic);
        assert_eq!(entry.length, 0);
    }
}
