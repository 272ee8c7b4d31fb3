use serde_json::Value;

use crate::message::Message;

/// Source gate shared by every service handler.
///
/// When several hosts share a bus, `context.destination` names who a message
/// is for. A message without a destination is a broadcast and is always
/// handled; otherwise at least one of this process's native sources must be
/// listed. Destination may be a single string or a list.
pub fn is_message_for_sources(msg: &Message, native_sources: &[String]) -> bool {
    let Some(destination) = msg.context.get("destination") else {
        return true;
    };
    match destination {
        Value::String(dest) => native_sources.iter().any(|s| s == dest),
        Value::Array(dests) => dests
            .iter()
            .filter_map(Value::as_str)
            .any(|dest| native_sources.iter().any(|s| s == dest)),
        // Malformed destination: treat as not for us rather than guessing.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sources() -> Vec<String> {
        vec!["debug_cli".to_string(), "audio".to_string()]
    }

    #[test]
    fn broadcast_without_destination_is_handled() {
        let msg = Message::new("ovos.audio.service.play");
        assert!(is_message_for_sources(&msg, &sources()));
    }

    #[test]
    fn native_destination_is_handled() {
        let msg = Message::new("ovos.audio.service.play")
            .with_context(json!({"destination": ["audio", "remote"]}));
        assert!(is_message_for_sources(&msg, &sources()));
    }

    #[test]
    fn foreign_destination_is_rejected() {
        let msg =
            Message::new("ovos.audio.service.play").with_context(json!({"destination": ["remote"]}));
        assert!(!is_message_for_sources(&msg, &sources()));
    }

    #[test]
    fn string_destination_is_accepted() {
        let msg =
            Message::new("ovos.audio.service.play").with_context(json!({"destination": "audio"}));
        assert!(is_message_for_sources(&msg, &sources()));
    }
}
