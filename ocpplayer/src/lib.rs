//! The OCPMedia player core.
//!
//! A headless coordinator that receives playback intents over the message
//! bus, routes them to pluggable media backends (audio, video, web view),
//! tracks the now-playing state, manages the playlist and search results,
//! and mirrors external MPRIS players through `ocpmpris`.

pub mod backends;
pub mod catalog;
pub mod display;
pub mod extractor;
pub mod now_playing;
pub mod player;
pub mod service;

pub use catalog::MediaCatalog;
pub use extractor::{StreamExtractor, StreamExtractorSet};
pub use now_playing::NowPlaying;
pub use player::MediaPlayer;
pub use service::MediaService;

use thiserror::Error;

/// Bus namespace of the player itself.
pub const OCP_ID: &str = "ovos.common_play";

#[derive(Error, Debug)]
pub enum PlayerError {
    /// Stream extraction failed or produced something unplayable.
    #[error("invalid stream: {0}")]
    InvalidStream(String),
    /// A bus message is missing a required field.
    #[error("bad message: {0}")]
    BadMessage(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
