//! The ActiveJob-compatible envelope stored in `good_jobs.serialized_params`
//! (spec §4.2 / §6.1). Field names and shapes here are frozen for interop
//! with the peer runtime — do not rename them to be more idiomatic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A lightweight stand-in for a GlobalID reference (spec §9's "Remote
/// object references"). Resolution to an actual domain object is left to
/// the application; this crate only parses and re-encodes the URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIdRef {
    pub app: String,
    pub model: String,
    pub id: String,
    pub gid: String,
}

impl GlobalIdRef {
    /// Parses `gid://<app>/<model>/<id>`. Returns `None` on anything that
    /// doesn't match the grammar, per §4.2's "pass the value through
    /// unchanged" instruction for malformed URIs.
    pub fn parse(gid: &str) -> Option<Self> {
        let rest = gid.strip_prefix("gid://")?;
        let mut parts = rest.splitn(3, '/');
        let app = parts.next()?.to_string();
        let model = parts.next()?.to_string();
        let id = parts.next()?.to_string();
        if app.is_empty() || model.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            app,
            model,
            id,
            gid: gid.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "_aj_globalid": self.gid })
    }
}

/// The on-disk envelope, per spec §4.2. Extra fields written by a peer
/// runtime are preserved in `extra` so decode → encode round-trips them
/// instead of silently dropping them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_class: String,
    pub arguments: Vec<Value>,
    pub queue_name: String,
    pub executions: i32,
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub locale: Option<String>,
    pub timezone: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl JobEnvelope {
    pub fn new(job_class: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            job_class: job_class.into(),
            arguments,
            queue_name: "default".to_string(),
            executions: 0,
            priority: None,
            scheduled_at: None,
            locale: None,
            timezone: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("JobEnvelope always serializes")
    }

    /// Tolerates extra fields (ignored via `extra`) and missing optional
    /// fields, per §4.2's "MUST tolerate extra fields added by peer
    /// runtimes" requirement.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// Recursively encodes an in-process argument value into the on-disk
/// representation: scalars and maps pass through, [`GlobalIdRef`]s become
/// `{"_aj_globalid": ...}`. There is no distinct in-process argument type
/// in this crate — handlers work directly with `serde_json::Value` plus
/// the `GlobalIdRef` convention below — so this mostly exists to make
/// building a `GlobalIdRef` argument explicit at call sites.
pub fn encode_global_id(reference: &GlobalIdRef) -> Value {
    reference.to_value()
}

/// Decodes one argument position: if it looks like `{"_aj_globalid": gid}`
/// and `gid` matches the grammar, returns the typed reference as JSON
/// (`{app, model, id, gid}`); otherwise returns the value unchanged. This
/// is applied per-element by [`decode_arguments`], never to the envelope
/// as a whole.
pub fn decode_argument(value: Value) -> Value {
    match &value {
        Value::Object(map) if map.len() == 1 => {
            if let Some(Value::String(gid)) = map.get("_aj_globalid") {
                if let Some(reference) = GlobalIdRef::parse(gid) {
                    return serde_json::to_value(reference).expect("GlobalIdRef always serializes");
                }
            }
            value
        }
        Value::Array(items) => {
            Value::Array(items.iter().cloned().map(decode_argument).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), decode_argument(v.clone())))
                .collect(),
        ),
        _ => value,
    }
}

pub fn decode_arguments(arguments: &[Value]) -> Vec<Value> {
    arguments.iter().cloned().map(decode_argument).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_global_id() {
        let r = GlobalIdRef::parse("gid://myapp/User/42").unwrap();
        assert_eq!(r.app, "myapp");
        assert_eq!(r.model, "User");
        assert_eq!(r.id, "42");
    }

    #[test]
    fn rejects_malformed_global_id() {
        assert!(GlobalIdRef::parse("gid://myapp/User").is_none());
        assert!(GlobalIdRef::parse("not-a-gid").is_none());
    }

    #[test]
    fn decode_argument_resolves_global_id_wrapper() {
        let raw = serde_json::json!({ "_aj_globalid": "gid://myapp/User/7" });
        let decoded = decode_argument(raw);
        assert_eq!(decoded["model"], "User");
        assert_eq!(decoded["id"], "7");
    }

    #[test]
    fn decode_argument_passes_through_malformed_gid_unchanged() {
        let raw = serde_json::json!({ "_aj_globalid": "not-a-gid" });
        let decoded = decode_argument(raw.clone());
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decode_argument_recurses_into_nested_structures() {
        let raw = serde_json::json!([{ "_aj_globalid": "gid://myapp/User/1" }, 42, "hi"]);
        let decoded = decode_argument(raw);
        assert_eq!(decoded[0]["id"], "1");
        assert_eq!(decoded[1], 42);
        assert_eq!(decoded[2], "hi");
    }

    #[test]
    fn envelope_round_trips_and_preserves_unknown_fields() {
        let mut value = JobEnvelope::new("EchoJob", vec![serde_json::json!("hi")]).to_value();
        value["extra_field_from_peer"] = serde_json::json!(true);

        let envelope = JobEnvelope::from_value(value).unwrap();
        assert_eq!(envelope.job_class, "EchoJob");
        assert_eq!(envelope.extra.get("extra_field_from_peer"), Some(&Value::Bool(true)));

        let re_encoded = envelope.to_value();
        assert_eq!(re_encoded["extra_field_from_peer"], Value::Bool(true));
    }

    #[test]
    fn envelope_decode_tolerates_missing_optional_fields() {
        let minimal = serde_json::json!({
            "job_class": "EchoJob",
            "arguments": [],
            "queue_name": "default",
            "executions": 0,
        });
        let envelope = JobEnvelope::from_value(minimal).unwrap();
        assert_eq!(envelope.priority, None);
        assert_eq!(envelope.locale, None);
    }
}
