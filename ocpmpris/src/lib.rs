//! Desktop media-player bridge for OCPMedia.
//!
//! Watches the session (or system) D-Bus for other MPRIS players, mirrors
//! the one that is actually playing into the OCPMedia player, optionally
//! suppresses the rest, and exports this process as
//! `org.mpris.MediaPlayer2.OCP` so desktop tooling (and e.g. KDE Connect)
//! can control it.
//!
//! The bridge owns one OS thread driving a current-thread async runtime.
//! Commands from the rest of the process arrive as level-triggered event
//! flags drained once per loop tick; the player side of the conversation
//! goes through the [`PlayerHandle`] trait so no player internals are shared
//! across threads.

mod bridge;
mod export;
mod flags;
mod handle;
mod proxies;

pub use bridge::{BridgeConfig, DbusKind, ExternalPlayerBridge};
pub use handle::{ExternalMediaMeta, PlayerHandle, PlayerSnapshot};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("dbus error: {0}")]
    Dbus(#[from] zbus::Error),
    #[error("dbus call failed: {0}")]
    Fdo(#[from] zbus::fdo::Error),
    #[error("bridge loop gave up after {0} restarts")]
    LoopFailed(u32),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
