//! Backend service routing, rate limiting and source gating.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{EventLog, MOCK_MODULE, calls_snapshot, mock_plugins, settle, test_config};
use ocpbus::{Message, MessageBus};
use ocpconfig::PlayerEntry;
use ocpmodel::{MediaEntry, MediaState, TrackState};
use ocpplayer::OCP_ID;
use ocpplayer::backends::{BackendPluginRegistry, BackendService, MediaBackend, Namespace, TrackStartCallback};

struct Fixture {
    bus: MessageBus,
    service: Arc<BackendService>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn fixture() -> Fixture {
    let bus = MessageBus::new();
    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let plugins = mock_plugins(&calls);
    let config = test_config();
    let service = BackendService::create(bus.clone(), Namespace::Audio, &config.media, &plugins, true);
    Fixture { bus, service, calls }
}

#[test]
fn load_reports_and_routes_by_scheme() {
    let f = fixture();
    assert!(f.service.wait_for_load(Some(Duration::from_secs(1))));

    let backends = f.service.available_backends();
    let entry = &backends["mock player"];
    assert_eq!(entry["remote"], json!(false));
    assert!(entry["supported_uris"]
        .as_array()
        .unwrap()
        .contains(&json!("http")));

    f.service.play("http://x/s.mp3", None);
    assert_eq!(f.service.current_backend().as_deref(), Some("mock player"));
    assert!(calls_snapshot(&f.calls).contains(&"load_track:http://x/s.mp3".to_string()));

    f.service.shutdown();
    f.bus.shutdown();
}

#[test]
fn unsupported_scheme_is_refused_quietly() {
    let f = fixture();
    f.service.play("spotify:track:123", None);
    assert!(f.service.current_backend().is_none());
    assert!(calls_snapshot(&f.calls).is_empty());
    f.service.shutdown();
    f.bus.shutdown();
}

#[test]
fn loaded_media_starts_the_current_backend() {
    let f = fixture();
    let track_states = EventLog::record(&f.bus, format!("{OCP_ID}.track.state"));

    f.service.play("http://x/s.mp3", None);
    f.bus.emit(
        Message::new(format!("{OCP_ID}.media.state"))
            .with_data(json!({"state": MediaState::LoadedMedia})),
    );
    settle(&f.bus);

    assert!(calls_snapshot(&f.calls).contains(&"play".to_string()));
    assert!(track_states.states().contains(&TrackState::PlayingAudio.code()));

    f.service.shutdown();
    f.bus.shutdown();
}

#[test]
fn stop_inside_the_rate_limit_window_is_dropped() {
    let f = fixture();
    let handled = EventLog::record(&f.bus, "mycroft.stop.handled");

    f.service.play("http://x/s.mp3", None);

    // Too soon: the stop is aimed at whatever played before this track.
    f.bus.emit(Message::new("ovos.audio.service.stop"));
    settle(&f.bus);
    assert!(!calls_snapshot(&f.calls).contains(&"stop".to_string()));
    assert!(handled.messages().is_empty());
    assert!(f.service.current_backend().is_some());

    // Past the window the same request goes through and is acknowledged.
    std::thread::sleep(Duration::from_millis(1100));
    f.bus.emit(Message::new("ovos.audio.service.stop"));
    settle(&f.bus);
    assert!(calls_snapshot(&f.calls).contains(&"stop".to_string()));
    let handled = handled.messages();
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].data_str("by"), Some("OCP"));
    assert!(f.service.current_backend().is_none());

    f.service.shutdown();
    f.bus.shutdown();
}

#[test]
fn foreign_destination_does_not_touch_the_service() {
    let f = fixture();
    f.service.play("http://x/s.mp3", None);
    std::thread::sleep(Duration::from_millis(1100));

    f.bus.emit(
        Message::new("ovos.audio.service.stop").with_context(json!({"destination": ["remote"]})),
    );
    f.bus.emit(
        Message::new("ovos.audio.service.pause").with_context(json!({"destination": ["remote"]})),
    );
    settle(&f.bus);

    let calls = calls_snapshot(&f.calls);
    assert!(!calls.contains(&"stop".to_string()));
    assert!(!calls.contains(&"pause".to_string()));
    assert!(f.service.current_backend().is_some());

    f.service.shutdown();
    f.bus.shutdown();
}

#[test]
fn duck_is_a_single_shot_latch() {
    let f = fixture();
    f.service.play("http://x/s.mp3", None);

    f.service.lower_volume();
    f.service.lower_volume();
    let lowered = calls_snapshot(&f.calls)
        .iter()
        .filter(|c| c.as_str() == "lower_volume")
        .count();
    assert_eq!(lowered, 1);

    f.service.restore_volume();
    f.service.restore_volume();
    let restored = calls_snapshot(&f.calls)
        .iter()
        .filter(|c| c.as_str() == "restore_volume")
        .count();
    assert_eq!(restored, 1);

    f.service.shutdown();
    f.bus.shutdown();
}

/// Remote-flavored mock used to check routing order.
struct RemoteBackend {
    bus: MessageBus,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MediaBackend for RemoteBackend {
    fn bus(&self) -> &MessageBus {
        &self.bus
    }

    fn supported_uris(&self) -> Vec<String> {
        vec!["http".into(), "https".into()]
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn load_track(&self, uri: &str) {
        self.calls.lock().unwrap().push(format!("remote-load:{uri}"));
    }

    fn play(&self) {}
    fn pause(&self) {}
    fn resume(&self) {}

    fn stop(&self) -> bool {
        false
    }

    fn seek_forward(&self, _seconds: i64) {}
    fn seek_backward(&self, _seconds: i64) {}
    fn set_track_position(&self, _millis: u64) {}

    fn get_track_position(&self) -> Option<u64> {
        None
    }

    fn get_track_length(&self) -> Option<u64> {
        None
    }

    fn track_info(&self) -> MediaEntry {
        MediaEntry::default()
    }

    fn lower_volume(&self) {}
    fn restore_volume(&self) {}
    fn set_track_start_callback(&self, _callback: Option<TrackStartCallback>) {}
    fn shutdown(&self) {}
}

#[test]
fn local_backends_are_tried_before_remote_ones() {
    let bus = MessageBus::new();
    let calls: Arc<Mutex<Vec<String>>> = Arc::default();

    let mut plugins = mock_plugins(&calls);
    let remote_calls = calls.clone();
    plugins.register("remote-media-plugin", move |_entry, bus| {
        Ok(Arc::new(RemoteBackend {
            bus,
            calls: remote_calls.clone(),
        }) as Arc<dyn MediaBackend>)
    });

    let mut config = test_config();
    config.media.audio_players.insert(
        "remote speaker".to_string(),
        PlayerEntry {
            module: "remote-media-plugin".to_string(),
            aliases: vec!["speaker".to_string()],
            active: true,
        },
    );

    let service = BackendService::create(bus.clone(), Namespace::Audio, &config.media, &plugins, true);
    service.play("http://x/s.mp3", None);
    assert_eq!(service.current_backend().as_deref(), Some("mock player"));

    // A spoken preference overrides the ordering.
    bus.emit(
        Message::new("ovos.audio.service.play").with_data(json!({
            "tracks": ["http://x/s.mp3"],
            "utterance": "play it on the speaker",
        })),
    );
    settle(&bus);
    assert_eq!(service.current_backend().as_deref(), Some("remote speaker"));
    assert!(calls_snapshot(&calls).contains(&"remote-load:http://x/s.mp3".to_string()));

    service.shutdown();
    bus.shutdown();
}

#[test]
fn inactive_and_unknown_plugins_are_skipped() {
    let bus = MessageBus::new();
    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let plugins = mock_plugins(&calls);

    let mut config = test_config();
    config.media.audio_players.insert(
        "disabled player".to_string(),
        PlayerEntry {
            module: MOCK_MODULE.to_string(),
            aliases: vec![],
            active: false,
        },
    );
    config.media.audio_players.insert(
        "ghost player".to_string(),
        PlayerEntry {
            module: "never-installed-plugin".to_string(),
            aliases: vec![],
            active: true,
        },
    );

    let service = BackendService::create(bus.clone(), Namespace::Audio, &config.media, &plugins, true);
    let backends = service.available_backends();
    let names: Vec<&String> = backends.as_object().unwrap().keys().collect();
    assert_eq!(names, vec!["mock player"]);

    service.shutdown();
    bus.shutdown();
}

#[test]
fn plugin_registry_distinguishes_unknown_from_failed() {
    let mut plugins = BackendPluginRegistry::new();
    plugins.register("flaky-plugin", |_entry, _bus| Err("no sound card".to_string()));

    let bus = MessageBus::new();
    let entry = PlayerEntry {
        module: "flaky-plugin".to_string(),
        aliases: vec![],
        active: true,
    };
    let err = plugins.create(&entry, bus.clone()).unwrap_err();
    assert!(matches!(
        err,
        ocpplayer::backends::PluginError::ConstructionFailed { .. }
    ));

    let entry = PlayerEntry {
        module: "missing-plugin".to_string(),
        aliases: vec![],
        active: true,
    };
    let err = plugins.create(&entry, bus.clone()).unwrap_err();
    assert!(matches!(
        err,
        ocpplayer::backends::PluginError::UnknownPlugin(_)
    ));
    bus.shutdown();
}
