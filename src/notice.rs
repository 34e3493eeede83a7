//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`, `notice_time_now`.
//! Role: Shared contract helper for CLI diagnostics (skipped inputs, stop requests).
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub file: String,
    pub message: String,
    pub details: Map<String, Value>,
}

impl Notice {
    /// Builds a notice stamped with the current time.
    pub fn now(
        kind: impl Into<String>,
        cmd: impl Into<String>,
        file: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            time: notice_time_now().unwrap_or_else(|| "unknown".to_string()),
            cmd: cmd.into(),
            file: file.into(),
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

pub fn notice_time_now() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("file".to_string(), json!(notice.file));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

#[cfg(test)]
mod tests {
    use super::{Notice, notice_json, notice_time_now};
    use serde_json::{Map, Value};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    #[test]
    fn notice_json_has_required_fields() {
        let mut details = Map::new();
        details.insert("error_kind".to_string(), Value::from("OpenFailed"));

        let notice = Notice {
            kind: "skip".to_string(),
            time: "2026-02-01T00:00:00Z".to_string(),
            cmd: "merge".to_string(),
            file: "ticks.AAPL".to_string(),
            message: "Skipped unreadable input.".to_string(),
            details,
        };

        let value = notice_json(&notice);
        let obj = value
            .get("notice")
            .and_then(|v| v.as_object())
            .expect("notice object");

        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("skip"));
        assert_eq!(
            obj.get("time").and_then(|v| v.as_str()),
            Some("2026-02-01T00:00:00Z")
        );
        assert_eq!(obj.get("cmd").and_then(|v| v.as_str()), Some("merge"));
        assert_eq!(obj.get("file").and_then(|v| v.as_str()), Some("ticks.AAPL"));
        assert_eq!(
            obj.get("message").and_then(|v| v.as_str()),
            Some("Skipped unreadable input.")
        );
        assert_eq!(
            obj.get("details")
                .and_then(|v| v.get("error_kind"))
                .and_then(|v| v.as_str()),
            Some("OpenFailed")
        );
    }

    #[test]
    fn now_stamps_parseable_time() {
        let notice = Notice::now("stop", "merge", "", "Stop requested.").with_detail("readers", 2);
        assert_eq!(notice.details.get("readers"), Some(&Value::from(2)));
        OffsetDateTime::parse(&notice.time, &Rfc3339).expect("rfc3339");
        assert!(notice_time_now().is_some());
    }
}
