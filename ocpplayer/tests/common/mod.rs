//! Shared fixtures: a recording mock backend and config helpers.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ocpbus::{Message, MessageBus, Subscription};
use ocpconfig::{Config, PlayerEntry};
use ocpmodel::MediaEntry;
use ocpplayer::backends::{BackendPluginRegistry, MediaBackend, TrackStartCallback};

pub const MOCK_MODULE: &str = "mock-media-plugin";

/// Backend double that records every call it receives.
pub struct MockBackend {
    bus: MessageBus,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl MediaBackend for MockBackend {
    fn bus(&self) -> &MessageBus {
        &self.bus
    }

    fn supported_uris(&self) -> Vec<String> {
        vec!["http".into(), "https".into(), "file".into()]
    }

    fn load_track(&self, uri: &str) {
        self.push(format!("load_track:{uri}"));
    }

    fn play(&self) {
        self.push("play");
    }

    fn pause(&self) {
        self.push("pause");
    }

    fn resume(&self) {
        self.push("resume");
    }

    fn stop(&self) -> bool {
        self.push("stop");
        true
    }

    fn seek_forward(&self, seconds: i64) {
        self.push(format!("seek_forward:{seconds}"));
    }

    fn seek_backward(&self, seconds: i64) {
        self.push(format!("seek_backward:{seconds}"));
    }

    fn set_track_position(&self, millis: u64) {
        self.push(format!("set_track_position:{millis}"));
    }

    fn get_track_position(&self) -> Option<u64> {
        Some(1_000)
    }

    fn get_track_length(&self) -> Option<u64> {
        Some(180_000)
    }

    fn track_info(&self) -> MediaEntry {
        MediaEntry::new("http://mock/current.mp3")
    }

    fn lower_volume(&self) {
        self.push("lower_volume");
    }

    fn restore_volume(&self) {
        self.push("restore_volume");
    }

    fn set_track_start_callback(&self, _callback: Option<TrackStartCallback>) {}

    fn shutdown(&self) {
        self.push("shutdown");
    }
}

/// Plugin registry with one mock backend module wired to `calls`.
pub fn mock_plugins(calls: &Arc<Mutex<Vec<String>>>) -> BackendPluginRegistry {
    let mut plugins = BackendPluginRegistry::new();
    let calls = calls.clone();
    plugins.register(MOCK_MODULE, move |_entry, bus| {
        Ok(Arc::new(MockBackend {
            bus,
            calls: calls.clone(),
        }) as Arc<dyn MediaBackend>)
    });
    plugins
}

/// Headless test config with one mock audio backend and MPRIS off.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ocp.disable_mpris = true;
    config.media.audio_players.insert(
        "mock player".to_string(),
        PlayerEntry {
            module: MOCK_MODULE.to_string(),
            aliases: vec!["mock".to_string()],
            active: true,
        },
    );
    config
}

pub fn calls_snapshot(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    calls.lock().unwrap().clone()
}

/// Capture messages of one type as they go by.
pub struct EventLog {
    bus: MessageBus,
    sub: Subscription,
    messages: Arc<Mutex<Vec<Message>>>,
}

impl EventLog {
    pub fn record(bus: &MessageBus, msg_type: impl Into<String>) -> Self {
        let messages: Arc<Mutex<Vec<Message>>> = Arc::default();
        let sink = messages.clone();
        let sub = bus.on(msg_type, move |msg| {
            sink.lock().unwrap().push(msg.clone());
        });
        Self {
            bus: bus.clone(),
            sub,
            messages,
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<i64> {
        self.messages()
            .iter()
            .filter_map(|m| m.data_i64("state"))
            .collect()
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.bus.remove(&self.sub);
    }
}

/// Wait until everything already queued on the bus has been delivered.
pub fn settle(bus: &MessageBus) {
    let flush = bus.waiter("test.settle");
    bus.emit(Message::new("test.settle"));
    flush.wait(Duration::from_secs(2));
}
