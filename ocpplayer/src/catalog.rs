//! Durable and ephemeral content lists: search results, featured skills and
//! the persisted liked-songs library.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use ocpbus::{Message, MessageBus, Subscription};
use ocpconfig::JsonStore;
use ocpmodel::{MediaEntry, MediaType, PlaybackKind, Playlist};

use crate::OCP_ID;

/// How long skill presence announcements are collected after a prompt.
const ANNOUNCE_WAIT: Duration = Duration::from_millis(200);

const LIKED_ICON: &str = "liked.svg";

/// Phrases that mean "my liked songs" regardless of what they are liked as.
const PLAYLIST_NAMES: &[&str] = &[
    "favorite",
    "liked",
    "favorites",
    "favorite songs",
    "favorite tracks",
    "favorite music",
    "my favorite songs",
    "my favorite tracks",
    "my favorite music",
    "liked songs",
    "liked tracks",
    "liked music",
    "my liked songs",
    "my liked tracks",
    "my liked music",
];

pub struct MediaCatalog {
    bus: MessageBus,
    skill_id: String,
    search_playlist: Mutex<Playlist>,
    known_skills: Mutex<HashMap<String, Value>>,
    featured_skills: Mutex<HashMap<String, Value>>,
    liked_songs: Mutex<JsonStore>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MediaCatalog {
    pub fn create(bus: MessageBus, liked_songs_path: PathBuf) -> Arc<Self> {
        let store = JsonStore::open(liked_songs_path);
        debug!(path = %store.path().display(), "liked songs library loaded");
        let catalog = Arc::new(Self {
            bus,
            skill_id: format!("{OCP_ID}.favorites"),
            search_playlist: Mutex::new(Playlist::new("Search Results")),
            known_skills: Mutex::new(HashMap::new()),
            featured_skills: Mutex::new(HashMap::new()),
            liked_songs: Mutex::new(store),
            subscriptions: Mutex::new(Vec::new()),
        });
        catalog.register_bus_handlers();
        catalog
    }

    fn register_bus_handlers(self: &Arc<Self>) {
        let mut subs = Vec::new();

        let weak: Weak<Self> = Arc::downgrade(self);
        subs.push(self.bus.on(format!("{OCP_ID}.announce"), move |msg| {
            if let Some(catalog) = weak.upgrade() {
                catalog.handle_skill_announce(msg);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        subs.push(self.bus.on(format!("{OCP_ID}.skills.detach"), move |msg| {
            if let Some(catalog) = weak.upgrade() {
                catalog.handle_skill_detach(msg);
            }
        }));

        *self.subscriptions.lock().unwrap() = subs;
    }

    pub fn shutdown(&self) {
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.remove(&sub);
        }
    }

    // Search playlist. The lock serializes replacements against readers.

    pub fn with_search_playlist<R>(&self, f: impl FnOnce(&mut Playlist) -> R) -> R {
        let mut playlist = self.search_playlist.lock().unwrap();
        f(&mut playlist)
    }

    pub fn replace_search(&self, entries: Vec<MediaEntry>) {
        self.search_playlist.lock().unwrap().replace(entries);
    }

    pub fn clear(&self) {
        self.search_playlist.lock().unwrap().clear();
    }

    // Skill registry.

    fn handle_skill_announce(&self, message: &Message) {
        let Some(skill_id) = message.data_str("skill_id").map(ToString::to_string) else {
            return;
        };
        let skill_name = message
            .data_str("skill_name")
            .unwrap_or(&skill_id)
            .to_string();
        let image = message
            .data_str("image")
            .or_else(|| message.data_str("thumbnail"))
            .unwrap_or_default()
            .to_string();
        let has_featured = message
            .data_array("featured_tracks")
            .is_some_and(|tracks| !tracks.is_empty());
        let media_types = message
            .data
            .get("media_types")
            .or_else(|| message.data.get("media_type"))
            .cloned()
            .unwrap_or_else(|| json!([MediaType::Generic]));

        let mut known = self.known_skills.lock().unwrap();
        if !known.contains_key(&skill_id) {
            debug!(skill = %skill_id, "registered skill");
        }
        known.insert(skill_id.clone(), json!({"skill_id": skill_id}));
        drop(known);

        if has_featured {
            debug!(skill = %skill_id, "skill offers featured media");
            self.featured_skills.lock().unwrap().insert(
                skill_id.clone(),
                json!({
                    "skill_id": skill_id,
                    "skill_name": skill_name,
                    "image": image,
                    "media_types": media_types,
                }),
            );
        }
    }

    fn handle_skill_detach(&self, message: &Message) {
        let Some(skill_id) = message.data_str("skill_id") else {
            return;
        };
        self.known_skills.lock().unwrap().remove(skill_id);
        self.featured_skills.lock().unwrap().remove(skill_id);
    }

    /// Prompt every loaded skill to announce itself, give the replies a
    /// moment to land, then return the featured cards. Adult-only media is
    /// filtered unless explicitly requested.
    pub fn get_featured_skills(&self, adult: bool) -> Vec<Value> {
        self.bus.emit(Message::new(format!("{OCP_ID}.skills.get")));
        thread::sleep(ANNOUNCE_WAIT);
        let skills = self.featured_skills.lock().unwrap();
        skills
            .values()
            .filter(|card| adult || !card_is_adult_only(card))
            .cloned()
            .collect()
    }

    // Liked songs.

    pub fn like(&self, uri: &str, title: &str, artist: &str, image: &str) {
        let mut store = self.liked_songs.lock().unwrap();
        store.insert(
            uri,
            json!({"uri": uri, "title": title, "artist": artist, "image": image}),
        );
        if let Err(e) = store.store() {
            info!("could not persist liked songs: {e}");
        }
        info!(uri, "liked song");
    }

    pub fn unlike(&self, uri: &str) {
        let mut store = self.liked_songs.lock().unwrap();
        if store.remove(uri).is_some() {
            if let Err(e) = store.store() {
                info!("could not persist liked songs: {e}");
            }
            info!(uri, "unliked song");
        }
    }

    pub fn is_liked(&self, uri: &str) -> bool {
        self.liked_songs.lock().unwrap().contains(uri)
    }

    pub fn liked_count(&self) -> usize {
        self.liked_songs.lock().unwrap().len()
    }

    /// Bump the play counter of a liked track.
    pub fn bump_play_count(&self, uri: &str) {
        let mut store = self.liked_songs.lock().unwrap();
        let Some(entry) = store.get_mut(uri) else {
            return;
        };
        let count = entry.get("play_count").and_then(Value::as_u64).unwrap_or(0);
        entry["play_count"] = json!(count + 1);
        if let Err(e) = store.store() {
            info!("could not persist liked songs: {e}");
        }
    }

    /// The liked songs as playable entries, most played first.
    pub fn liked_songs_playlist(&self) -> Vec<MediaEntry> {
        let store = self.liked_songs.lock().unwrap();
        let mut entries: Vec<MediaEntry> = store
            .values()
            .filter_map(|value| {
                let mut entry = MediaEntry::from_value(value).ok()?;
                entry.media_type = MediaType::Music;
                entry.playback = PlaybackKind::Audio;
                // Lets confidence sorting order a liked-songs playlist by
                // how often each track was played.
                entry.match_confidence = (50 + entry.play_count.min(50)) as u8;
                Some(entry)
            })
            .collect();
        entries.sort_by(|a, b| b.play_count.cmp(&a.play_count));
        entries
    }

    /// Search the liked-songs library.
    ///
    /// Scoring: 15 base for music queries, +30 per matched entity, an exact
    /// playlist-name phrase raises the base to 100; the playlist card gets
    /// +35 and title matches +40, clamped at 100.
    pub fn search_db(&self, phrase: &str, media_type: MediaType) -> Vec<Value> {
        let phrase = phrase.to_lowercase();
        let mut base: u32 = if media_type == MediaType::Music { 15 } else { 0 };
        let mut results = Vec::new();

        let playlist_entity = PLAYLIST_NAMES
            .iter()
            .find(|name| phrase.contains(*name))
            .copied();
        let song_entity = self.match_song_name(&phrase);

        let mut entities = 0;
        if playlist_entity.is_some() {
            entities += 1;
        }
        if song_entity.is_some() {
            entities += 1;
        }
        base += 30 * entities;

        if let Some(name) = playlist_entity {
            if phrase == name {
                base = 100;
            }
            results.push(json!({
                "match_confidence": (base + 35).min(100),
                "media_type": MediaType::Music,
                "playback": PlaybackKind::Audio,
                "playlist": self
                    .liked_songs_playlist()
                    .iter()
                    .map(MediaEntry::as_value)
                    .collect::<Vec<_>>(),
                "skill_icon": LIKED_ICON,
                "title": "Liked Songs",
                "skill_id": self.skill_id,
            }));
        }

        if let Some(title) = song_entity {
            for song in self.liked_songs_playlist() {
                if !song.title.to_lowercase().contains(&title) {
                    continue;
                }
                let mut card = song.as_value();
                card["match_confidence"] = json!((base + 40).min(100));
                card["media_type"] = json!(MediaType::Music);
                card["playback"] = json!(PlaybackKind::Audio);
                card["skill_id"] = json!(self.skill_id);
                card["skill_icon"] = json!(LIKED_ICON);
                results.push(card);
            }
        }

        results
    }

    /// Match the phrase against normalized liked-song titles.
    fn match_song_name(&self, phrase: &str) -> Option<String> {
        let store = self.liked_songs.lock().unwrap();
        store.values().find_map(|value| {
            let title = value.get("title").and_then(Value::as_str)?;
            let normalized = norm_name(title).to_lowercase();
            (!normalized.is_empty() && phrase.contains(&normalized)).then_some(normalized)
        })
    }
}

fn card_is_adult_only(card: &Value) -> bool {
    card.get("media_types")
        .and_then(Value::as_array)
        .map(|types| {
            types
                .iter()
                .filter_map(Value::as_i64)
                .filter_map(|code| MediaType::try_from(code).ok())
                .any(MediaType::is_adult_only)
        })
        .unwrap_or(false)
}

/// Strip featuring/remix decorations from a track title:
/// "Song (remix) [feat. X]" -> "Song".
fn norm_name(name: &str) -> String {
    let mut result = name;
    for sep in ['|', '(', '[', '{', '-'] {
        if let Some((head, _)) = result.split_once(sep) {
            result = head;
        }
    }
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> (MessageBus, Arc<MediaCatalog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::new();
        let catalog = MediaCatalog::create(bus.clone(), dir.path().join("liked.json"));
        (bus, catalog, dir)
    }

    fn settle(bus: &MessageBus) {
        let flush = bus.waiter("test.settle");
        bus.emit(Message::new("test.settle"));
        flush.wait(Duration::from_secs(1));
    }

    #[test]
    fn like_unlike_round_trip() {
        let (bus, catalog, _dir) = catalog();
        catalog.like("http://x/a.mp3", "A", "Band", "");
        assert!(catalog.is_liked("http://x/a.mp3"));
        catalog.unlike("http://x/a.mp3");
        assert!(!catalog.is_liked("http://x/a.mp3"));
        assert_eq!(catalog.liked_count(), 0);
        bus.shutdown();
    }

    #[test]
    fn like_twice_is_idempotent() {
        let (bus, catalog, _dir) = catalog();
        catalog.like("http://x/a.mp3", "A", "Band", "");
        catalog.like("http://x/a.mp3", "A", "Band", "");
        assert_eq!(catalog.liked_count(), 1);
        bus.shutdown();
    }

    #[test]
    fn play_count_orders_the_liked_playlist() {
        let (bus, catalog, _dir) = catalog();
        catalog.like("http://x/a.mp3", "A", "", "");
        catalog.like("http://x/b.mp3", "B", "", "");
        catalog.bump_play_count("http://x/b.mp3");
        catalog.bump_play_count("http://x/b.mp3");
        let playlist = catalog.liked_songs_playlist();
        assert_eq!(playlist[0].uri, "http://x/b.mp3");
        assert_eq!(playlist[0].play_count, 2);
        bus.shutdown();
    }

    #[test]
    fn featured_skills_filter_adult_content() {
        let (bus, catalog, _dir) = catalog();
        bus.emit(Message::new(format!("{OCP_ID}.announce")).with_data(json!({
            "skill_id": "skill-music",
            "featured_tracks": [{"uri": "x"}],
            "media_types": [MediaType::Music],
        })));
        bus.emit(Message::new(format!("{OCP_ID}.announce")).with_data(json!({
            "skill_id": "skill-adult",
            "featured_tracks": [{"uri": "x"}],
            "media_types": [MediaType::Adult],
        })));
        settle(&bus);

        let safe = catalog.get_featured_skills(false);
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0]["skill_id"], json!("skill-music"));
        let all = catalog.get_featured_skills(true);
        assert_eq!(all.len(), 2);
        bus.shutdown();
    }

    #[test]
    fn skill_detach_removes_both_maps() {
        let (bus, catalog, _dir) = catalog();
        bus.emit(Message::new(format!("{OCP_ID}.announce")).with_data(json!({
            "skill_id": "skill-music",
            "featured_tracks": [{"uri": "x"}],
        })));
        bus.emit(
            Message::new(format!("{OCP_ID}.skills.detach"))
                .with_data(json!({"skill_id": "skill-music"})),
        );
        settle(&bus);
        assert!(catalog.get_featured_skills(true).is_empty());
        bus.shutdown();
    }

    #[test]
    fn exact_playlist_phrase_scores_full_confidence() {
        let (bus, catalog, _dir) = catalog();
        catalog.like("http://x/a.mp3", "Alpha", "", "");
        let results = catalog.search_db("liked songs", MediaType::Music);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["match_confidence"], json!(100));
        assert_eq!(results[0]["title"], json!("Liked Songs"));
        bus.shutdown();
    }

    #[test]
    fn song_title_match_yields_candidates() {
        let (bus, catalog, _dir) = catalog();
        catalog.like("http://x/a.mp3", "Blue Monday (remastered)", "", "");
        catalog.like("http://x/b.mp3", "Something Else", "", "");
        let results = catalog.search_db("play blue monday", MediaType::Music);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["uri"], json!("http://x/a.mp3"));
        // 15 music base + 30 entity + 40 title bonus
        assert_eq!(results[0]["match_confidence"], json!(85));
        bus.shutdown();
    }

    #[test]
    fn title_normalization() {
        assert_eq!(norm_name("Song (remix) [feat. X]"), "Song");
        assert_eq!(norm_name("Track - Live"), "Track");
        assert_eq!(norm_name("Plain"), "Plain");
    }
}
