//! Events raised by tasks and consumed by downstream tasks.

use serde::{Deserialize, Serialize};

/// A name plus opaque JSON arguments. Immutable once raised; survives job
/// restarts through serialization into the running-job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

impl Event {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arguments: None,
        }
    }

    pub fn with_arguments(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            arguments: Some(arguments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_without_null_arguments() {
        let event = Event::new("new-source-files");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"name": "new-source-files"})
        );

        let event = Event::with_arguments("new-source-files", json!({"count": 3}));
        let round: Event = serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
        assert_eq!(round, event);
    }
}
