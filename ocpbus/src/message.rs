use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Envelope for everything that crosses the message bus.
///
/// `data` carries the payload, `context` the routing metadata (source,
/// destination, session). Both are free-form JSON objects; typed accessors
/// below cover the fields the core actually reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default = "empty_object")]
    pub context: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl Message {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: json!({}),
            context: json!({}),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Reply to this message: same type with a `.response` suffix, original
    /// context carried over so the requester can route the answer back.
    pub fn response(&self, data: Value) -> Message {
        Message {
            msg_type: format!("{}.response", self.msg_type),
            data,
            context: self.context.clone(),
        }
    }

    /// The type a `response()` to this message would carry.
    pub fn response_type(&self) -> String {
        format!("{}.response", self.msg_type)
    }

    /// New message of a different type, context carried over.
    pub fn reply(&self, msg_type: impl Into<String>, data: Value) -> Message {
        Message {
            msg_type: msg_type.into(),
            data,
            context: self.context.clone(),
        }
    }

    /// Alias of `reply` kept for call sites that forward rather than answer.
    pub fn forward(&self, msg_type: impl Into<String>, data: Value) -> Message {
        self.reply(msg_type, data)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    pub fn data_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.data.get(key).and_then(Value::as_array)
    }
}
