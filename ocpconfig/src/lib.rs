//! Configuration loading for OCPMedia.
//!
//! A YAML file is merged over the embedded default below and deserialized
//! into typed structs. The loaded `Config` value is handed to the player,
//! the backend services and the bridge at construction time; nothing in the
//! workspace re-reads configuration while handling a command.
//!
//! Lookup order for the configuration directory:
//! 1. an explicit directory passed to `load_config`
//! 2. the `OCPMEDIA_CONFIG` environment variable
//! 3. the user configuration directory (`~/.config/ocpmedia`)
//! 4. the embedded defaults only

mod store;

pub use store::JsonStore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, fs};

use anyhow::{Context, Result};
use ocpmodel::PlaybackMode;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

const DEFAULT_CONFIG: &str = include_str!("ocpmedia.yaml");

const ENV_CONFIG_DIR: &str = "OCPMEDIA_CONFIG";
const CONFIG_FILE: &str = "ocpmedia.yaml";
const APP_DIR: &str = "ocpmedia";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub ocp: OcpConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

/// Player-level policy switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcpConfig {
    #[serde(default)]
    pub manage_external_players: bool,
    #[serde(default)]
    pub disable_mpris: bool,
    #[serde(default)]
    pub force_audioservice: bool,
    #[serde(default)]
    pub playback_mode: PlaybackMode,
    #[serde(default = "default_true")]
    pub autoplay: bool,
    #[serde(default = "default_true")]
    pub merge_search: bool,
    #[serde(default)]
    pub assume_gui: bool,
}

impl Default for OcpConfig {
    fn default() -> Self {
        Self {
            manage_external_players: false,
            disable_mpris: false,
            force_audioservice: false,
            playback_mode: PlaybackMode::Auto,
            autoplay: true,
            merge_search: true,
            assume_gui: false,
        }
    }
}

/// Backend tables and bus routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub audio_players: HashMap<String, PlayerEntry>,
    #[serde(default)]
    pub video_players: HashMap<String, PlayerEntry>,
    #[serde(default)]
    pub web_players: HashMap<String, PlayerEntry>,
    #[serde(default = "default_native_sources")]
    pub native_sources: Vec<String>,
    #[serde(default = "default_dbus_type")]
    pub dbus_type: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio_players: HashMap::new(),
            video_players: HashMap::new(),
            web_players: HashMap::new(),
            native_sources: default_native_sources(),
            dbus_type: default_dbus_type(),
        }
    }
}

/// One configured backend plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub module: String,
    /// Spoken names matched against the play request utterance.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

fn default_native_sources() -> Vec<String> {
    vec!["debug_cli".to_string(), "audio".to_string()]
}

fn default_dbus_type() -> String {
    "session".to_string()
}

/// Directory for user-scoped state files (liked songs, ...).
pub fn data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR)
}

fn find_config_file(directory: &str) -> Option<PathBuf> {
    if !directory.is_empty() {
        return Some(PathBuf::from(directory).join(CONFIG_FILE));
    }
    if let Ok(env_dir) = env::var(ENV_CONFIG_DIR) {
        info!(env_var = ENV_CONFIG_DIR, path = %env_dir, "loading config from env override");
        return Some(PathBuf::from(env_dir).join(CONFIG_FILE));
    }
    dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
}

/// Load configuration, merging a user file (if any) over the embedded
/// defaults. A missing user file is not an error; a malformed one is.
pub fn load_config(directory: &str) -> Result<Config> {
    let mut merged: Value =
        serde_yaml::from_str(DEFAULT_CONFIG).context("embedded default config is invalid")?;

    if let Some(path) = find_config_file(directory) {
        if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let user: Value = serde_yaml::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            merge_yaml(&mut merged, &user);
            info!(path = %path.display(), "configuration loaded");
        } else {
            debug!(path = %path.display(), "no user configuration, using defaults");
        }
    }

    serde_yaml::from_value(merged).context("configuration does not match the expected layout")
}

/// Recursively merge `external` over `default`: mappings merge key-wise,
/// everything else replaces.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(default_map), Value::Mapping(external_map)) => {
            for (k, v) in external_map {
                match default_map.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        default_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (default, external) => *default = external.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse() {
        let config = load_config("/nonexistent-dir-for-tests").unwrap();
        assert!(!config.ocp.manage_external_players);
        assert!(config.ocp.autoplay);
        assert!(config.ocp.merge_search);
        assert_eq!(config.media.dbus_type, "session");
        assert_eq!(config.media.native_sources, vec!["debug_cli", "audio"]);
        assert!(config.media.audio_players.is_empty());
    }

    #[test]
    fn user_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
ocp:
  autoplay: false
media:
  audio_players:
    my speaker:
      module: test-audio-plugin
      aliases: ["speaker", "living room"]
"#,
        )
        .unwrap();
        let config = load_config(dir.path().to_str().unwrap()).unwrap();
        assert!(!config.ocp.autoplay);
        // Untouched defaults survive the merge.
        assert!(config.ocp.merge_search);
        let entry = &config.media.audio_players["my speaker"];
        assert_eq!(entry.module, "test-audio-plugin");
        assert_eq!(entry.aliases, vec!["speaker", "living room"]);
        assert!(entry.active);
    }

    #[test]
    fn playback_mode_codes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "ocp:\n  playback_mode: 30\n").unwrap();
        let config = load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.ocp.playback_mode, PlaybackMode::ForceAudio);
    }
}
