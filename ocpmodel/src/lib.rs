//! Data model shared across the OCPMedia workspace.
//!
//! Media entries, the cursored playlist, and the state enums that travel on
//! the message bus as integer codes.

mod entry;
mod playlist;
mod states;

pub use entry::MediaEntry;
pub use playlist::Playlist;
pub use states::{LoopState, MediaState, MediaType, PlaybackKind, PlaybackMode, PlayerState, TrackState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown {kind} wire code: {code}")]
    UnknownCode { kind: &'static str, code: i64 },
    #[error("not a valid media entry: {0}")]
    BadEntry(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
