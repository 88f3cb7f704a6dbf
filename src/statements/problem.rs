use serde_json::{Map, Value};

use super::{invalid, missing, number, payload, StatementBuilder};
use crate::errors::ConversionError;
use crate::models::{Activity, RawRecord, Score, Statement, StatementResult, Verb};

const VERB_ANSWERED: &str = "http://adlnet.gov/expapi/verbs/answered";
const ACTIVITY_INTERACTION: &str = "http://adlnet.gov/expapi/activities/cmi.interaction";
const EXT_ATTEMPTS: &str = "https://w3id.org/xapi/openedx/extension/attempts";

/// Server-side `problem_check`. The browser variant carries an urlencoded
/// form instead of a grade and is rejected as malformed.
pub(super) fn problem_check(
    builder: &StatementBuilder,
    record: &RawRecord,
) -> Result<Statement, ConversionError> {
    let event = payload(record)?;

    let problem_id = event
        .get("problem_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing(record, "problem_id"))?;
    let grade = number(&event, "grade").ok_or_else(|| missing(record, "grade"))?;
    let max_grade = number(&event, "max_grade").ok_or_else(|| missing(record, "max_grade"))?;
    if max_grade < 0.0 || grade < 0.0 || grade > max_grade {
        return Err(invalid(
            record,
            "grade",
            &format!("grade {} outside 0..={}", grade, max_grade),
        ));
    }

    let scaled = if max_grade > 0.0 {
        Some(grade / max_grade)
    } else {
        None
    };

    let result = StatementResult {
        score: Some(Score {
            raw: grade,
            min: 0.0,
            max: max_grade,
            scaled,
        }),
        success: Some(event.get("success").and_then(Value::as_str) == Some("correct")),
        response: answers(&event),
        extensions: event
            .get("attempts")
            .filter(|v| v.is_number())
            .map(|v| Map::from_iter([(EXT_ATTEMPTS.to_string(), v.clone())])),
        ..Default::default()
    };

    let name = event
        .get("problem_display_name")
        .and_then(Value::as_str)
        .unwrap_or(problem_id);

    builder.assemble(
        record,
        Verb::new(VERB_ANSWERED, "answered"),
        Activity::new(builder.xblock_url(problem_id), ACTIVITY_INTERACTION, name),
        Some(result),
        builder.context(record.context_str("course_id")),
    )
}

/// Submitted answers flattened into the xAPI response string.
fn answers(event: &Map<String, Value>) -> Option<String> {
    let answers = event.get("answers")?.as_object()?;
    let mut parts: Vec<String> = answers
        .values()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                .collect::<Vec<_>>()
                .join("[,]"),
            other => other.to_string(),
        })
        .collect();
    parts.sort();
    Some(parts.join("[,]"))
}
