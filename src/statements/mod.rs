//! Statement constructors, one per kind of tracking-log event.
//!
//! Each constructor takes a [`RawRecord`] and either returns a complete
//! [`Statement`] or a [`ConversionError`] describing the missing or invalid
//! field. Constructors only read the record; they never touch the network
//! or the filesystem.
//!
//! | Kind | Verb |
//! |------|------|
//! | [`StatementKind::CourseEnrollment`] | `registered` |
//! | [`StatementKind::CourseUnenrollment`] | `unregistered` |
//! | [`StatementKind::CourseCompletion`] | `completed` |
//! | [`StatementKind::ProblemCheck`] | `answered` |
//! | [`StatementKind::VideoLoaded`] | `initialized` |
//! | [`StatementKind::VideoPlayed`] | `played` |
//! | [`StatementKind::VideoPaused`] | `paused` |
//! | [`StatementKind::VideoCompleted`] | `completed` |
//! | [`StatementKind::VideoSeeked`] | `seeked` |
//! | [`StatementKind::VideoTranscript`] | `interacted` |

mod course;
mod problem;
mod video;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::StatementConfig;
use crate::errors::ConversionError;
use crate::models::{
    Activity, Agent, ContextActivities, RawRecord, Statement, StatementContext, StatementResult,
    Verb, XAPI_VERSION,
};

pub const ACTIVITY_COURSE: &str = "http://adlnet.gov/expapi/activities/course";

/// The statement kinds the converter can route a record to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    CourseEnrollment,
    CourseUnenrollment,
    CourseCompletion,
    ProblemCheck,
    VideoLoaded,
    VideoPlayed,
    VideoPaused,
    VideoCompleted,
    VideoSeeked,
    VideoTranscript,
}

impl StatementKind {
    pub fn build(
        self,
        builder: &StatementBuilder,
        record: &RawRecord,
    ) -> Result<Statement, ConversionError> {
        match self {
            StatementKind::CourseEnrollment => course::enrollment(builder, record),
            StatementKind::CourseUnenrollment => course::unenrollment(builder, record),
            StatementKind::CourseCompletion => course::completion(builder, record),
            StatementKind::ProblemCheck => problem::problem_check(builder, record),
            StatementKind::VideoLoaded => video::loaded(builder, record),
            StatementKind::VideoPlayed => video::played(builder, record),
            StatementKind::VideoPaused => video::paused(builder, record),
            StatementKind::VideoCompleted => video::completed(builder, record),
            StatementKind::VideoSeeked => video::seeked(builder, record),
            StatementKind::VideoTranscript => video::transcript(builder, record),
        }
    }
}

/// Shared pieces every constructor needs: base URL and platform name.
#[derive(Debug, Clone)]
pub struct StatementBuilder {
    lms_root_url: String,
    platform: String,
}

impl StatementBuilder {
    pub fn new(config: &StatementConfig) -> Self {
        Self {
            lms_root_url: config.lms_root_url.trim_end_matches('/').to_string(),
            platform: config.platform.clone(),
        }
    }

    pub fn lms_root_url(&self) -> &str {
        &self.lms_root_url
    }

    pub(crate) fn actor(&self, record: &RawRecord) -> Result<Agent, ConversionError> {
        let username = record
            .str_field("username")
            .ok_or_else(|| missing(record, "username"))?;
        Ok(Agent::new(username, &self.lms_root_url))
    }

    pub(crate) fn course_url(&self, course_id: &str) -> String {
        format!("{}/courses/{}", self.lms_root_url, course_id)
    }

    pub(crate) fn xblock_url(&self, usage_key: &str) -> String {
        format!("{}/xblock/{}", self.lms_root_url, usage_key)
    }

    /// Context naming the platform and, when known, the parent course.
    pub(crate) fn context(&self, course_id: Option<&str>) -> StatementContext {
        StatementContext {
            platform: self.platform.clone(),
            context_activities: course_id.map(|id| ContextActivities {
                parent: vec![Activity::reference(self.course_url(id))],
            }),
            extensions: None,
        }
    }

    /// Assemble a statement with a fresh id and the record's timestamp.
    pub(crate) fn assemble(
        &self,
        record: &RawRecord,
        verb: Verb,
        object: Activity,
        result: Option<StatementResult>,
        context: StatementContext,
    ) -> Result<Statement, ConversionError> {
        Ok(Statement {
            id: Uuid::new_v4(),
            actor: self.actor(record)?,
            verb,
            object,
            result,
            context: Some(context),
            timestamp: timestamp(record)?,
            version: XAPI_VERSION.to_string(),
        })
    }
}

/// Event time of the record, normalised to UTC.
pub(crate) fn timestamp(record: &RawRecord) -> Result<DateTime<Utc>, ConversionError> {
    let raw = record.str_field("time").ok_or_else(|| missing(record, "time"))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConversionError::InvalidField {
            event_type: record.event_type().to_string(),
            field: "time",
            reason: e.to_string(),
        })
}

pub(crate) fn payload(record: &RawRecord) -> Result<Map<String, Value>, ConversionError> {
    record.event_payload().ok_or_else(|| missing(record, "event"))
}

pub(crate) fn missing(record: &RawRecord, field: &'static str) -> ConversionError {
    ConversionError::MissingField {
        event_type: record.event_type().to_string(),
        field,
    }
}

pub(crate) fn invalid(record: &RawRecord, field: &'static str, reason: &str) -> ConversionError {
    ConversionError::InvalidField {
        event_type: record.event_type().to_string(),
        field,
        reason: reason.to_string(),
    }
}

/// Numeric payload field; tracking logs emit numbers both bare and quoted.
pub(crate) fn number(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn builder() -> StatementBuilder {
        StatementBuilder::new(&StatementConfig {
            lms_root_url: "https://lms.example.com/".to_string(),
            platform: "Open edX".to_string(),
        })
    }

    pub fn record(value: Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_is_normalised_to_utc() {
        let rec = record(json!({
            "event_type": "x",
            "time": "2024-03-01T12:30:00.123456+02:00"
        }));
        let ts = timestamp(&rec).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T10:30:00.123456+00:00");
    }

    #[test]
    fn bad_timestamp_is_invalid_field() {
        let rec = record(json!({"event_type": "x", "time": "yesterday"}));
        assert!(matches!(
            timestamp(&rec),
            Err(ConversionError::InvalidField { field: "time", .. })
        ));
    }

    #[test]
    fn context_links_parent_course() {
        let ctx = builder().context(Some("course-v1:Org+C1+2024"));
        let parent = &ctx.context_activities.unwrap().parent[0];
        assert_eq!(
            parent.id,
            "https://lms.example.com/courses/course-v1:Org+C1+2024"
        );
        assert_eq!(ctx.platform, "Open edX");
    }

    #[test]
    fn number_accepts_quoted_values() {
        let map = json!({"a": 1.5, "b": "2", "c": "x"});
        let map = map.as_object().unwrap();
        assert_eq!(number(map, "a"), Some(1.5));
        assert_eq!(number(map, "b"), Some(2.0));
        assert_eq!(number(map, "c"), None);
        assert_eq!(number(map, "d"), None);
    }
}
