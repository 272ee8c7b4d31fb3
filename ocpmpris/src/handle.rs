use ocpmodel::{LoopState, MediaState, PlayerState};
use serde_json::Value;

/// Consistent multi-field view of the player, taken under its lock.
///
/// The exported MPRIS properties are answered from this snapshot so a D-Bus
/// reader never observes a half-applied transition.
#[derive(Debug, Clone, Default)]
pub struct PlayerSnapshot {
    pub state: PlayerState,
    pub loop_state: LoopState,
    pub shuffle: bool,
    pub can_next: bool,
    pub can_prev: bool,
    /// `xesam:`/`mpris:` metadata map of the current track.
    pub metadata: Value,
}

/// Live state of one external player, translated from its MPRIS properties.
#[derive(Debug, Clone, Default)]
pub struct ExternalMediaMeta {
    /// Well-known bus name of the player, doubles as the logical skill id
    /// once the track is adopted.
    pub player_name: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub image: String,
    /// Track length in milliseconds.
    pub length: u64,
    pub state: PlayerState,
    pub loop_state: LoopState,
    pub shuffle: Option<bool>,
}

/// Command interface the player injects into the bridge.
///
/// The bridge reads through `snapshot` and writes through the command
/// methods; it never holds a reference into player state. Everything here
/// may be called from the bridge thread or from a D-Bus dispatch task.
pub trait PlayerHandle: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn play_next(&self);
    fn play_prev(&self);
    fn set_player_state(&self, state: PlayerState);
    fn set_media_state(&self, state: MediaState);
    fn set_loop_state(&self, state: LoopState);
    fn set_shuffle(&self, shuffle: bool);
    /// Adopt (or refresh) an external player's track as the current media.
    fn sync_external(&self, meta: ExternalMediaMeta);
    fn snapshot(&self) -> PlayerSnapshot;
}
