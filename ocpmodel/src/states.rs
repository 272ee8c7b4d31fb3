//! State enums with their bus wire codes.
//!
//! Every enum here crosses the message bus as a bare integer, so the codes
//! are part of the protocol and must not be renumbered.

use crate::ModelError;

/// Generates an enum that serializes as its integer wire code.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i64)]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            pub fn code(self) -> i64 {
                self as i64
            }
        }

        impl TryFrom<i64> for $name {
            type Error = ModelError;

            fn try_from(code: i64) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    other => Err(ModelError::UnknownCode {
                        kind: stringify!($name),
                        code: other,
                    }),
                }
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_i64(*self as i64)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let code = i64::deserialize(deserializer)?;
                Self::try_from(code).map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum! {
    /// Transport state of the player itself.
    PlayerState {
        Stopped = 0,
        Playing = 1,
        Paused = 2,
    }
}

wire_enum! {
    /// Readiness of the current media, reported by backends.
    MediaState {
        Unknown = 0,
        NoMedia = 1,
        LoadingMedia = 2,
        LoadedMedia = 3,
        StalledMedia = 4,
        BufferingMedia = 5,
        BufferedMedia = 6,
        EndOfMedia = 7,
        InvalidMedia = 8,
    }
}

wire_enum! {
    /// Where a track currently sits in its lifecycle.
    TrackState {
        Disambiguation = 1,
        PlayingSkill = 20,
        PlayingVideo = 22,
        PlayingAudio = 23,
        PlayingMpris = 24,
        PlayingWebview = 25,
        QueuedSkill = 30,
        QueuedVideo = 32,
        QueuedAudio = 33,
        QueuedWebview = 34,
    }
}

wire_enum! {
    /// Which family of backend a track wants.
    PlaybackKind {
        Skill = 0,
        Video = 1,
        Audio = 2,
        Mpris = 4,
        Webview = 5,
        Undefined = 100,
    }
}

wire_enum! {
    LoopState {
        None = 0,
        RepeatPlaylist = 1,
        RepeatTrack = 2,
    }
}

wire_enum! {
    /// Content classification used for search scoring and the safety filter.
    MediaType {
        Generic = 0,
        Audio = 1,
        Music = 2,
        Video = 3,
        Audiobook = 4,
        Game = 5,
        Podcast = 6,
        Radio = 7,
        News = 8,
        Tv = 9,
        Movie = 10,
        Trailer = 11,
        Adult = 12,
        Documentary = 13,
        Cartoon = 14,
        Anime = 15,
        Theatre = 16,
        ShortFilm = 17,
        SilentMovie = 18,
        VideoEpisodes = 19,
        BlackWhiteMovie = 20,
        RadioTheatre = 21,
        AudioDescription = 22,
        VisualStory = 23,
        BehindTheScenes = 24,
        Hentai = 25,
    }
}

wire_enum! {
    /// Configured playback coercion policy.
    PlaybackMode {
        Auto = 0,
        AudioOnly = 10,
        VideoOnly = 20,
        ForceAudio = 30,
    }
}

impl Default for PlayerState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl Default for MediaState {
    fn default() -> Self {
        Self::NoMedia
    }
}

impl Default for TrackState {
    fn default() -> Self {
        Self::Disambiguation
    }
}

impl Default for PlaybackKind {
    fn default() -> Self {
        Self::Undefined
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::None
    }
}

impl Default for MediaType {
    fn default() -> Self {
        Self::Generic
    }
}

impl Default for PlaybackMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl PlayerState {
    /// MPRIS `PlaybackStatus` string for this state.
    pub fn mpris_status(self) -> &'static str {
        match self {
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
        }
    }

    /// Anything that is not playing or paused reads as stopped.
    pub fn from_mpris_status(status: &str) -> Self {
        match status {
            "Playing" => Self::Playing,
            "Paused" => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

impl LoopState {
    /// MPRIS `LoopStatus` string mapping.
    pub fn mpris_status(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::RepeatTrack => "Track",
            Self::RepeatPlaylist => "Playlist",
        }
    }

    pub fn from_mpris_status(status: &str) -> Self {
        match status {
            "Track" => Self::RepeatTrack,
            "Playlist" => Self::RepeatPlaylist,
            _ => Self::None,
        }
    }

    /// NONE -> REPEAT_PLAYLIST -> REPEAT_TRACK -> NONE.
    pub fn cycled(self) -> Self {
        match self {
            Self::None => Self::RepeatPlaylist,
            Self::RepeatPlaylist => Self::RepeatTrack,
            Self::RepeatTrack => Self::None,
        }
    }
}

impl MediaType {
    /// Content that the featured-skills listing hides unless adult content
    /// was explicitly requested.
    pub fn is_adult_only(self) -> bool {
        matches!(self, Self::Adult | Self::Hentai)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for state in [MediaState::NoMedia, MediaState::EndOfMedia, MediaState::InvalidMedia] {
            assert_eq!(MediaState::try_from(state.code()).unwrap(), state);
        }
        assert_eq!(PlaybackKind::try_from(100).unwrap(), PlaybackKind::Undefined);
        assert_eq!(TrackState::try_from(24).unwrap(), TrackState::PlayingMpris);
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(PlayerState::try_from(7).is_err());
        assert!(LoopState::try_from(-1).is_err());
    }

    #[test]
    fn serializes_as_integer() {
        assert_eq!(serde_json::to_value(PlayerState::Paused).unwrap(), serde_json::json!(2));
        let state: MediaState = serde_json::from_value(serde_json::json!(7)).unwrap();
        assert_eq!(state, MediaState::EndOfMedia);
    }

    #[test]
    fn repeat_cycle_returns_to_none() {
        let state = LoopState::None;
        assert_eq!(state.cycled().cycled().cycled(), LoopState::None);
    }

    #[test]
    fn loop_status_string_mapping() {
        assert_eq!(LoopState::RepeatPlaylist.mpris_status(), "Playlist");
        assert_eq!(LoopState::from_mpris_status("Track"), LoopState::RepeatTrack);
        assert_eq!(LoopState::from_mpris_status("anything"), LoopState::None);
    }
}
