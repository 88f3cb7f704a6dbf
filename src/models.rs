//! Core data models that flow through the pipeline.
//!
//! A [`RawRecord`] is one decoded tracking-log line; it lives only long
//! enough to be dispatched. A [`Statement`] is the xAPI statement built from
//! it and is what the publish queue batches and ships.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::DecodeError;

/// xAPI version stamped into every statement.
pub const XAPI_VERSION: &str = "1.0.3";

/// One decoded JSON object from a single log line.
#[derive(Debug, Clone)]
pub struct RawRecord {
    event_type: String,
    body: Value,
}

impl RawRecord {
    /// Decode one log line. The object must carry a string `event_type`.
    pub fn from_line(line: &str) -> Result<Self, DecodeError> {
        let body: Value = serde_json::from_str(line)?;
        Self::from_value(body)
    }

    pub fn from_value(body: Value) -> Result<Self, DecodeError> {
        let event_type = body
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingEventType)?
            .to_string();
        Ok(Self { event_type, body })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Top-level string field, ignoring empty strings.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.body
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// String field inside the `context` object.
    pub fn context_str(&self, name: &str) -> Option<&str> {
        self.body
            .get("context")
            .and_then(|c| c.get(name))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The `event` payload as an object.
    ///
    /// Browser-emitted events carry the payload as a JSON-encoded string;
    /// both shapes are accepted. Anything else yields `None`.
    pub fn event_payload(&self) -> Option<Map<String, Value>> {
        match self.body.get("event")? {
            Value::Object(map) => Some(map.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }
}

/// A complete xAPI statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub id: Uuid,
    pub actor: Agent,
    pub verb: Verb,
    pub object: Activity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StatementResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<StatementContext>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl Statement {
    /// Check the top-level shape the store requires.
    pub fn check_well_formed(&self) -> Result<(), String> {
        if self.version.is_empty() {
            return Err("missing version".to_string());
        }
        if self.actor.account.name.is_empty() || self.actor.account.home_page.is_empty() {
            return Err("actor has no account".to_string());
        }
        if self.verb.id.is_empty() {
            return Err("verb has no id".to_string());
        }
        if self.object.id.is_empty() {
            return Err("object has no id".to_string());
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"id\":\"{}\"}}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub object_type: String,
    pub name: String,
    pub account: Account,
}

impl Agent {
    pub fn new(name: &str, home_page: &str) -> Self {
        Self {
            object_type: "Agent".to_string(),
            name: name.to_string(),
            account: Account {
                home_page: home_page.to_string(),
                name: name.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub home_page: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verb {
    pub id: String,
    pub display: BTreeMap<String, String>,
}

impl Verb {
    pub fn new(id: &str, display: &str) -> Self {
        Self {
            id: id.to_string(),
            display: en_us(display),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub object_type: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<ActivityDefinition>,
}

impl Activity {
    pub fn new(id: impl Into<String>, activity_type: &str, name: &str) -> Self {
        Self {
            object_type: "Activity".to_string(),
            id: id.into(),
            definition: Some(ActivityDefinition {
                activity_type: Some(activity_type.to_string()),
                name: Some(en_us(name)),
                extensions: None,
            }),
        }
    }

    /// Bare activity reference, used in context activities.
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            object_type: "Activity".to_string(),
            id: id.into(),
            definition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub raw: f64,
    pub min: f64,
    pub max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaled: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementContext {
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_activities: Option<ContextActivities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextActivities {
    pub parent: Vec<Activity>,
}

fn en_us(text: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("en-US".to_string(), text.to_string())])
}
