use serde_json::{Map, Value};

use super::{invalid, missing, StatementBuilder, ACTIVITY_COURSE};
use crate::errors::ConversionError;
use crate::models::{Activity, RawRecord, Statement, StatementResult, Verb};

const VERB_REGISTERED: &str = "http://adlnet.gov/expapi/verbs/registered";
const VERB_UNREGISTERED: &str = "http://id.tincanapi.com/verb/unregistered";
const VERB_COMPLETED: &str = "http://adlnet.gov/expapi/verbs/completed";

const EXT_ENROLLMENT_MODE: &str = "https://w3id.org/xapi/openedx/extension/enrollment-mode";
const EXT_CERTIFICATE_URL: &str = "https://w3id.org/xapi/openedx/extension/certificate-url";

pub(super) fn enrollment(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    enrollment_statement(builder, record, Verb::new(VERB_REGISTERED, "registered"))
}

pub(super) fn unenrollment(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    enrollment_statement(builder, record, Verb::new(VERB_UNREGISTERED, "unregistered"))
}

fn enrollment_statement(
    builder: &StatementBuilder,
    record: &RawRecord,
    verb: Verb,
) -> Result<Statement, ConversionError> {
    let event = record.event_payload().unwrap_or_default();
    let course_id = course_id(record, &event)?;

    let mut context = builder.context(None);
    if let Some(mode) = event.get("mode").and_then(Value::as_str) {
        context.extensions = Some(Map::from_iter([(
            EXT_ENROLLMENT_MODE.to_string(),
            Value::String(mode.to_string()),
        )]));
    }

    builder.assemble(
        record,
        verb,
        Activity::new(builder.course_url(&course_id), ACTIVITY_COURSE, &course_id),
        None,
        context,
    )
}

pub(super) fn completion(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = record.event_payload().unwrap_or_default();
    let course_id = course_id(record, &event)?;

    let mut result = StatementResult {
        completion: Some(true),
        success: Some(true),
        ..Default::default()
    };
    if let Some(url) = event.get("certificate_url").and_then(Value::as_str) {
        result.extensions = Some(Map::from_iter([(
            EXT_CERTIFICATE_URL.to_string(),
            Value::String(url.to_string()),
        )]));
    }

    builder.assemble(
        record,
        Verb::new(VERB_COMPLETED, "completed"),
        Activity::new(builder.course_url(&course_id), ACTIVITY_COURSE, &course_id),
        Some(result),
        builder.context(None),
    )
}

/// Course id from the event payload, falling back to the record context.
fn course_id(record: &RawRecord, event: &Map<String, Value>) -> Result<String, ConversionError> {
    let id = event
        .get("course_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| record.context_str("course_id"))
        .ok_or_else(|| missing(record, "course_id"))?;
    if id.contains(char::is_whitespace) {
        return Err(invalid(record, "course_id", "contains whitespace"));
    }
    Ok(id.to_string())
}
