//! Event-type dispatch from tracking-log records to statements.
//!
//! [`Converter::convert`] looks the record's event type up in a static
//! table after stripping sub-component wrapper prefixes, so that the same
//! logical event reported by different wrappers maps to one
//! [`StatementKind`]. Ignored and unknown event types produce nothing and
//! are not errors; unknown types are expected as the platform grows new
//! events.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::ConversionError;
use crate::models::{RawRecord, Statement};
use crate::statements::{StatementBuilder, StatementKind};

/// Wrapper prefixes removed (everywhere in the string) before lookup.
pub const STRIPPED_PREFIXES: &[&str] = &["xblock-video."];

/// Map a normalised event type to the statement kind that handles it.
pub fn lookup(event_type: &str) -> Option<StatementKind> {
    use StatementKind::*;

    let kind = match event_type {
        // course enrollment
        "edx.course.enrollment.activated" => CourseEnrollment,
        "edx.course.enrollment.deactivated" => CourseUnenrollment,

        // course completion
        "edx.certificate.created" => CourseCompletion,

        // problems
        "problem_check" => ProblemCheck,

        // video
        "ready_video" | "load_video" | "edx.video.loaded" => VideoLoaded,
        "play_video" | "edx.video.played" => VideoPlayed,
        "pause_video" | "edx.video.paused" => VideoPaused,
        "stop_video" | "edx.video.stopped" => VideoCompleted,
        "seek_video" | "edx.video.position.changed" => VideoSeeked,
        "show_transcript"
        | "hide_transcript"
        | "edx.video.transcript.shown"
        | "edx.video.transcript.hidden"
        | "edx.video.closed_captions.shown"
        | "edx.video.closed_captions.hidden" => VideoTranscript,

        _ => return None,
    };
    Some(kind)
}

pub fn normalize_event_type(event_type: &str) -> String {
    STRIPPED_PREFIXES
        .iter()
        .fold(event_type.to_string(), |acc, prefix| acc.replace(prefix, ""))
}

pub struct Converter {
    ignored: HashSet<String>,
    builder: StatementBuilder,
}

impl Converter {
    pub fn new(ignored: HashSet<String>, builder: StatementBuilder) -> Self {
        Self { ignored, builder }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.filters.ignored_event_types.clone(),
            StatementBuilder::new(&config.statements),
        )
    }

    /// Convert one record into zero or more statements, in constructor order.
    pub fn convert(&self, record: &RawRecord) -> Vec<Statement> {
        let event_type = normalize_event_type(record.event_type());

        if self.ignored.contains(&event_type) {
            debug!(event_type = %event_type, "ignored event type");
            return Vec::new();
        }

        let Some(kind) = lookup(&event_type) else {
            debug!(event_type = %event_type, "no statement for event type");
            return Vec::new();
        };

        let statement = match kind.build(&self.builder, record) {
            Ok(statement) => statement,
            Err(e) => {
                warn!(event_type = %event_type, "refusing to send statement: {}", e);
                return Vec::new();
            }
        };

        if let Err(reason) = statement.check_well_formed() {
            let err = ConversionError::Incomplete {
                event_type: record.event_type().to_string(),
                reason,
            };
            warn!(statement = %statement.to_json(), "refusing to send statement: {}", err);
            return Vec::new();
        }

        vec![statement]
    }
}
