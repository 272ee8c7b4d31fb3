//! Backend plugin contract and the per-family services that route to them.
//!
//! Backend internals are opaque to the core: plugins are registered as
//! constructors in a [`BackendPluginRegistry`] and only ever touched through
//! the [`MediaBackend`] trait.

mod service;

pub use service::{BackendService, Namespace};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::debug;

use ocpbus::{Message, MessageBus};
use ocpconfig::PlayerEntry;
use ocpmodel::{MediaEntry, PlayerState};

use crate::OCP_ID;

/// Invoked by a backend when a new track starts (`Some`) or its queue runs
/// out (`None`).
pub type TrackStartCallback = Arc<dyn Fn(Option<MediaEntry>) + Send + Sync>;

/// The contract every playback backend implements.
///
/// Methods take `&self`; backends keep their own state behind interior
/// mutability since transport commands and bus callbacks arrive from
/// different threads.
pub trait MediaBackend: Send + Sync {
    /// Bus handle the backend was built with; used by the provided
    /// state-announcement hooks.
    fn bus(&self) -> &MessageBus;

    /// URI schemes this backend can play, e.g. `http`, `file`, `spotify`.
    fn supported_uris(&self) -> Vec<String>;

    /// Remote backends play on another device and are routed to last.
    fn is_remote(&self) -> bool {
        false
    }

    /// Begin loading a track. Playback starts once the backend reports
    /// `media.state = LOADED` on the bus.
    fn load_track(&self, uri: &str);

    fn play(&self);
    fn pause(&self);
    fn resume(&self);
    /// Returns true when something was actually stopped.
    fn stop(&self) -> bool;

    fn seek_forward(&self, seconds: i64);
    fn seek_backward(&self, seconds: i64);
    /// Position in milliseconds.
    fn set_track_position(&self, millis: u64);
    fn get_track_position(&self) -> Option<u64>;
    fn get_track_length(&self) -> Option<u64>;
    fn track_info(&self) -> MediaEntry;

    fn lower_volume(&self);
    fn restore_volume(&self);

    fn set_track_start_callback(&self, callback: Option<TrackStartCallback>);

    fn shutdown(&self);

    /// State-announcement hooks so every backend reports transitions the
    /// same way.
    fn ocp_pause(&self) {
        self.bus().emit(
            Message::new(format!("{OCP_ID}.player.state"))
                .with_data(json!({"state": PlayerState::Paused})),
        );
    }

    fn ocp_resume(&self) {
        self.bus().emit(
            Message::new(format!("{OCP_ID}.player.state"))
                .with_data(json!({"state": PlayerState::Playing})),
        );
    }

    fn ocp_stop(&self) {
        self.bus().emit(
            Message::new(format!("{OCP_ID}.player.state"))
                .with_data(json!({"state": PlayerState::Stopped})),
        );
    }
}

impl std::fmt::Debug for dyn MediaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBackend")
            .field("supported_uris", &self.supported_uris())
            .field("is_remote", &self.is_remote())
            .finish()
    }
}

/// A loaded backend with the identity the configuration gave it.
#[derive(Clone)]
pub struct BackendHandle {
    /// Configured player name (the map key in the config table).
    pub name: String,
    /// Spoken names matched against play-request utterances.
    pub aliases: Vec<String>,
    pub remote: bool,
    pub backend: Arc<dyn MediaBackend>,
}

impl BackendHandle {
    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.backend.supported_uris().iter().any(|s| s == scheme)
    }

    pub fn matches_utterance(&self, utterance: &str) -> bool {
        let utterance = utterance.to_lowercase();
        self.aliases
            .iter()
            .any(|alias| utterance.contains(&alias.to_lowercase()))
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    /// Configured module is not present in the registry at all.
    #[error("plugin '{0}' is not installed")]
    UnknownPlugin(String),
    /// The constructor ran and failed.
    #[error("plugin '{module}' failed to load: {reason}")]
    ConstructionFailed { module: String, reason: String },
}

type BackendConstructor = Arc<
    dyn Fn(&PlayerEntry, MessageBus) -> std::result::Result<Arc<dyn MediaBackend>, String>
        + Send
        + Sync,
>;

/// Name-to-constructor table populated at startup.
///
/// Lookups distinguish an unknown plugin from one whose construction failed
/// so the services can log them differently; either way the entry is skipped
/// and loading continues.
#[derive(Clone, Default)]
pub struct BackendPluginRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: impl Into<String>, constructor: F)
    where
        F: Fn(&PlayerEntry, MessageBus) -> std::result::Result<Arc<dyn MediaBackend>, String>
            + Send
            + Sync
            + 'static,
    {
        let module = module.into();
        debug!(module = %module, "registered backend plugin");
        self.constructors.insert(module, Arc::new(constructor));
    }

    pub fn contains(&self, module: &str) -> bool {
        self.constructors.contains_key(module)
    }

    pub fn create(
        &self,
        entry: &PlayerEntry,
        bus: MessageBus,
    ) -> std::result::Result<Arc<dyn MediaBackend>, PluginError> {
        let constructor = self
            .constructors
            .get(&entry.module)
            .ok_or_else(|| PluginError::UnknownPlugin(entry.module.clone()))?;
        constructor(entry, bus).map_err(|reason| PluginError::ConstructionFailed {
            module: entry.module.clone(),
            reason,
        })
    }
}
