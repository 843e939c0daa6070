//! Resumable run snapshots.
//!
//! The runtime's in-flight state is persisted as a versioned, explicitly
//! typed snapshot rather than an opaque blob: only user/system entries with
//! allowed content parts survive sanitization, so tool-call bookkeeping and
//! non-serializable internals can never leak into storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    File { name: String, #[serde(default)] url: Option<String> },
    Audio { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u32,
    pub items: Vec<SnapshotItem>,
}

impl RunSnapshot {
    pub fn empty() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            items: Vec::new(),
        }
    }

    /// Build a snapshot from the runtime's raw state, dropping every entry
    /// whose role is not user/system and every content part of a kind the
    /// snapshot format does not allow. Tolerates arbitrary junk input.
    pub fn sanitize(raw: &Value) -> Self {
        let entries = raw
            .get("items")
            .and_then(|v| v.as_array())
            .or_else(|| raw.as_array())
            .cloned()
            .unwrap_or_default();

        let items = entries
            .iter()
            .filter_map(|entry| {
                let role = entry.get("role")?.as_str()?;
                if role != "user" && role != "system" {
                    return None;
                }
                let content = entry
                    .get("content")
                    .and_then(|c| c.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| serde_json::from_value::<ContentPart>(p.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                Some(SnapshotItem {
                    role: role.to_string(),
                    content,
                })
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            items,
        }
    }

    /// Parse a previously persisted snapshot. A version mismatch is treated
    /// as corrupt state.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let snapshot: RunSnapshot =
            serde_json::from_str(raw).map_err(|e| format!("malformed snapshot: {}", e))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(format!(
                "unsupported snapshot version {}",
                snapshot.version
            ));
        }
        Ok(snapshot)
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"version\":1,\"items\":[]}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_drops_disallowed_roles_and_parts() {
        let raw = json!({
            "items": [
                {"role": "user", "content": [
                    {"type": "text", "text": "hello"},
                    {"type": "tool_call", "call_id": "c1", "arguments": "{}"},
                    {"type": "image", "url": "https://img"}
                ]},
                {"role": "assistant", "content": [{"type": "text", "text": "internal"}]},
                {"role": "tool", "content": [{"type": "tool_output", "output": "x"}]},
                {"role": "system", "content": [{"type": "audio", "url": "https://a"}]}
            ]
        });

        let snapshot = RunSnapshot::sanitize(&raw);
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.items[0].role, "user");
        assert_eq!(
            snapshot.items[0].content,
            vec![
                ContentPart::Text {
                    text: "hello".to_string()
                },
                ContentPart::Image {
                    url: "https://img".to_string()
                },
            ]
        );
        assert_eq!(snapshot.items[1].role, "system");
    }

    #[test]
    fn sanitize_never_panics_on_junk() {
        for raw in [
            json!(null),
            json!("a string"),
            json!({"items": "not an array"}),
            json!([{"no_role": true}, 42]),
            json!({"items": [{"role": "user"}]}),
        ] {
            let snapshot = RunSnapshot::sanitize(&raw);
            assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        }
    }

    #[test]
    fn parse_rejects_malformed_and_wrong_version() {
        assert!(RunSnapshot::parse("not json").is_err());
        assert!(RunSnapshot::parse("{\"version\":99,\"items\":[]}").is_err());

        let snapshot = RunSnapshot::sanitize(&json!({"items": [
            {"role": "user", "content": [{"type": "text", "text": "hi"}]}
        ]}));
        let reparsed = RunSnapshot::parse(&snapshot.serialize()).unwrap();
        assert_eq!(reparsed.items.len(), 1);
    }
}
