//! Stream-extractor seam.
//!
//! Skills may return logical URIs of the form `{sei}//{uri}` where the SEI
//! (stream-extractor identifier) names the resolver that turns them into a
//! real playable URI plus metadata at playback time. Extractor internals are
//! collaborators outside the core; this module only routes to whichever ones
//! the host registered.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::{PlayerError, Result};

pub trait StreamExtractor: Send + Sync {
    /// The SEI prefix this extractor resolves, without the `//`.
    fn sei(&self) -> &str;

    /// Resolve a logical URI. The returned object carries at least `uri`
    /// and may add title/artwork metadata.
    fn extract(&self, uri: &str, video: bool) -> std::result::Result<Value, String>;
}

/// The registered extractors, dispatched by SEI prefix.
#[derive(Clone, Default)]
pub struct StreamExtractorSet {
    extractors: Vec<Arc<dyn StreamExtractor>>,
}

impl StreamExtractorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extractor: Arc<dyn StreamExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn supported_seis(&self) -> Vec<String> {
        self.extractors.iter().map(|x| x.sei().to_string()).collect()
    }

    /// Split `{sei}//{payload}` into its parts. Regular scheme URIs like
    /// `http://…` have a `:` before the slashes and are not SEIs.
    fn split_sei(uri: &str) -> Option<(&str, &str)> {
        let (prefix, payload) = uri.split_once("//")?;
        if prefix.is_empty() || prefix.contains(':') {
            return None;
        }
        Some((prefix, payload))
    }

    /// Resolve a URI through the matching extractor.
    ///
    /// Plain URIs pass through as `Ok(None)`: there is nothing to extract.
    /// An SEI nobody registered also passes through; validation downstream
    /// rejects the unplayable logical URI.
    pub fn extract_stream(&self, uri: &str, video: bool) -> Result<Option<Value>> {
        let Some((sei, payload)) = Self::split_sei(uri) else {
            return Ok(None);
        };
        let Some(extractor) = self.extractors.iter().find(|x| x.sei() == sei) else {
            debug!(sei, "no extractor registered for stream");
            return Ok(None);
        };
        extractor
            .extract(payload, video)
            .map(Some)
            .map_err(PlayerError::InvalidStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeTube;

    impl StreamExtractor for FakeTube {
        fn sei(&self) -> &str {
            "youtube"
        }

        fn extract(&self, uri: &str, _video: bool) -> std::result::Result<Value, String> {
            if uri.contains("broken") {
                return Err("no playable stream found".into());
            }
            Ok(json!({"uri": format!("https://cdn/{uri}"), "title": "resolved"}))
        }
    }

    fn set() -> StreamExtractorSet {
        let mut set = StreamExtractorSet::new();
        set.register(Arc::new(FakeTube));
        set
    }

    #[test]
    fn sei_uris_are_dispatched() {
        let meta = set()
            .extract_stream("youtube//watch?v=123", false)
            .unwrap()
            .unwrap();
        assert_eq!(meta["uri"], json!("https://cdn/watch?v=123"));
    }

    #[test]
    fn plain_uris_pass_through() {
        assert!(set().extract_stream("http://x/s.mp3", false).unwrap().is_none());
        assert!(set().extract_stream("/music/a.flac", false).unwrap().is_none());
    }

    #[test]
    fn unknown_sei_passes_through() {
        assert!(set().extract_stream("bandcamp//x", false).unwrap().is_none());
    }

    #[test]
    fn extraction_failure_is_an_invalid_stream() {
        let err = set().extract_stream("youtube//broken", false).unwrap_err();
        assert!(matches!(err, PlayerError::InvalidStream(_)));
    }

    #[test]
    fn supported_seis_lists_registrations() {
        assert_eq!(set().supported_seis(), vec!["youtube"]);
    }
}
