use serde_json::{Map, Value};

use super::{missing, number, payload, StatementBuilder};
use crate::converter::normalize_event_type;
use crate::errors::ConversionError;
use crate::models::{Activity, RawRecord, Statement, StatementResult, Verb};

const ACTIVITY_VIDEO: &str = "https://w3id.org/xapi/video/activity-type/video";

const VERB_INITIALIZED: &str = "http://adlnet.gov/expapi/verbs/initialized";
const VERB_PLAYED: &str = "https://w3id.org/xapi/video/verbs/played";
const VERB_PAUSED: &str = "https://w3id.org/xapi/video/verbs/paused";
const VERB_COMPLETED: &str = "http://adlnet.gov/expapi/verbs/completed";
const VERB_SEEKED: &str = "https://w3id.org/xapi/video/verbs/seeked";
const VERB_INTERACTED: &str = "http://adlnet.gov/expapi/verbs/interacted";

const EXT_TIME: &str = "https://w3id.org/xapi/video/extensions/time";
const EXT_TIME_FROM: &str = "https://w3id.org/xapi/video/extensions/time-from";
const EXT_TIME_TO: &str = "https://w3id.org/xapi/video/extensions/time-to";
const EXT_CC_ENABLED: &str = "https://w3id.org/xapi/video/extensions/cc-enabled";

pub(super) fn loaded(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    video_statement(builder, record, Verb::new(VERB_INITIALIZED, "initialized"), None)
}

pub(super) fn played(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;
    let result = time_result(&event, false);
    video_statement(builder, record, Verb::new(VERB_PLAYED, "played"), result)
}

pub(super) fn paused(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;
    let result = time_result(&event, false);
    video_statement(builder, record, Verb::new(VERB_PAUSED, "paused"), result)
}

pub(super) fn completed(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;
    let result = time_result(&event, true);
    video_statement(builder, record, Verb::new(VERB_COMPLETED, "completed"), result)
}

pub(super) fn seeked(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;
    let from = number(&event, "old_time").ok_or_else(|| missing(record, "old_time"))?;
    let to = number(&event, "new_time").ok_or_else(|| missing(record, "new_time"))?;

    let result = StatementResult {
        extensions: Some(Map::from_iter([
            (EXT_TIME_FROM.to_string(), Value::from(from)),
            (EXT_TIME_TO.to_string(), Value::from(to)),
        ])),
        ..Default::default()
    };
    video_statement(builder, record, Verb::new(VERB_SEEKED, "seeked"), Some(result))
}

/// Transcript and closed-caption toggles; the event type says which way.
pub(super) fn transcript(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;
    let event_type = normalize_event_type(record.event_type());
    let enabled = event_type.starts_with("show_") || event_type.ends_with(".shown");

    let mut extensions = Map::from_iter([(EXT_CC_ENABLED.to_string(), Value::Bool(enabled))]);
    if let Some(t) = current_time(&event) {
        extensions.insert(EXT_TIME.to_string(), Value::from(t));
    }
    let result = StatementResult {
        extensions: Some(extensions),
        ..Default::default()
    };
    video_statement(
        builder,
        record,
        Verb::new(VERB_INTERACTED, "interacted"),
        Some(result),
    )
}

fn video_statement(
    builder: &StatementBuilder,
    record: &RawRecord,
    verb: Verb,
    result: Option<StatementResult>,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;
    let video_id = event
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing(record, "id"))?;

    builder.assemble(
        record,
        verb,
        Activity::new(builder.xblock_url(video_id), ACTIVITY_VIDEO, video_id),
        result,
        builder.context(record.context_str("course_id")),
    )
}

fn current_time(event: &Map<String, Value>) -> Option<f64> {
    number(event, "currentTime").or_else(|| number(event, "current_time"))
}

fn time_result(event: &Map<String, Value>, completed: bool) -> Option<StatementResult> {
    let time = current_time(event);
    if time.is_none() && !completed {
        return None;
    }
    Some(StatementResult {
        completion: completed.then_some(true),
        extensions: time.map(|t| Map::from_iter([(EXT_TIME.to_string(), Value::from(t))])),
        ..Default::default()
    })
}
