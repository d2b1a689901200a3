use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

pub const ADMINISTRATIVE_TASK_ID: &str = "SESSION_COMPLETE";

/// Eligibility can be legitimately retaken, so it never takes part in
/// conformance checking.
pub const EXCLUDED_SESSION: &str = "Eligibility";

/// One task-log row as exported from the research database.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawTaskEvent {
    #[serde(default)]
    pub study_id: Option<String>,
    #[serde(rename = "participantID", default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub date_completed: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TaskCompletionEvent {
    /// Position in the ingested stream; breaks ordering ties.
    pub sequence: u64,
    pub participant_id: String,
    pub study_id: Option<String>,
    pub session_name: String,
    pub task_id: String,
    pub completed_at: Option<PrimitiveDateTime>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MalformedField {
    ParticipantId,
    SessionName,
    TaskName,
    DateCompleted,
}

impl MalformedField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParticipantId => "participant_id",
            Self::SessionName => "session_name",
            Self::TaskName => "task_name",
            Self::DateCompleted => "date_completed",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NormalizeOutcome {
    Accepted(TaskCompletionEvent),
    Administrative,
    ExcludedSession,
    Malformed(MalformedField),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizationStats {
    pub total: usize,
    pub accepted: usize,
    pub administrative: usize,
    pub excluded_sessions: usize,
    pub malformed: BTreeMap<MalformedField, usize>,
}

impl NormalizationStats {
    #[must_use]
    pub fn malformed_total(&self) -> usize {
        self.malformed.values().sum()
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NormalizedBatch {
    pub events: Vec<TaskCompletionEvent>,
    pub stats: NormalizationStats,
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(|raw| raw.trim()).filter(|trimmed| !trimmed.is_empty())
}

/// Integer ids exported through a float column come back as `2010.0`.
fn canonical_id(raw: &str) -> String {
    match raw.strip_suffix(".0") {
        Some(head) if !head.is_empty() && head.bytes().all(|byte| byte.is_ascii_digit()) => {
            head.to_string()
        }
        _ => raw.to_string(),
    }
}

/// Parse a completion timestamp. Offsets are converted to UTC and dropped;
/// naive values are taken as already being in the database's clock.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<PrimitiveDateTime> {
    let raw = raw.trim();
    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        let utc = value.to_offset(UtcOffset::UTC);
        return Some(PrimitiveDateTime::new(utc.date(), utc.time()));
    }

    let with_fraction =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    let plain = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let iso_fraction =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let iso_plain = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    for description in [with_fraction, plain, iso_fraction, iso_plain] {
        if let Ok(value) = PrimitiveDateTime::parse(raw, description) {
            return Some(value);
        }
    }

    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|date| PrimitiveDateTime::new(date, Time::MIDNIGHT))
}

/// Classify one raw row. The task id is the tag (empty when absent) followed
/// by the task name, which is how pre/post variants of a shared task become
/// distinct.
#[must_use]
pub fn normalize(raw: &RawTaskEvent, sequence: u64) -> NormalizeOutcome {
    let tag = present(raw.tag.as_ref()).unwrap_or("");
    let task_name = present(raw.task_name.as_ref());
    let session_name = present(raw.session_name.as_ref());

    if let Some(task_name) = task_name {
        if format!("{tag}{task_name}") == ADMINISTRATIVE_TASK_ID {
            return NormalizeOutcome::Administrative;
        }
    }
    if session_name == Some(EXCLUDED_SESSION) {
        return NormalizeOutcome::ExcludedSession;
    }

    let Some(participant_id) = present(raw.participant_id.as_ref()) else {
        return NormalizeOutcome::Malformed(MalformedField::ParticipantId);
    };
    let Some(session_name) = session_name else {
        return NormalizeOutcome::Malformed(MalformedField::SessionName);
    };
    let Some(task_name) = task_name else {
        return NormalizeOutcome::Malformed(MalformedField::TaskName);
    };
    let completed_at = match present(raw.date_completed.as_ref()) {
        None => None,
        Some(value) => match parse_timestamp(value) {
            Some(parsed) => Some(parsed),
            None => return NormalizeOutcome::Malformed(MalformedField::DateCompleted),
        },
    };

    NormalizeOutcome::Accepted(TaskCompletionEvent {
        sequence,
        participant_id: canonical_id(participant_id),
        study_id: present(raw.study_id.as_ref()).map(canonical_id),
        session_name: session_name.to_string(),
        task_id: format!("{tag}{task_name}"),
        completed_at,
    })
}

/// Accepting form of [`normalize`]: every dropped row becomes `None`.
#[must_use]
pub fn normalize_event(raw: &RawTaskEvent, sequence: u64) -> Option<TaskCompletionEvent> {
    match normalize(raw, sequence) {
        NormalizeOutcome::Accepted(event) => Some(event),
        _ => None,
    }
}

/// Normalize a whole ingested stream, numbering rows in input order.
#[must_use]
pub fn normalize_all(raw_events: &[RawTaskEvent]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, raw) in raw_events.iter().enumerate() {
        batch.stats.total += 1;
        let sequence = u64::try_from(index).unwrap_or(u64::MAX);
        match normalize(raw, sequence) {
            NormalizeOutcome::Accepted(event) => {
                batch.stats.accepted += 1;
                batch.events.push(event);
            }
            NormalizeOutcome::Administrative => batch.stats.administrative += 1,
            NormalizeOutcome::ExcludedSession => batch.stats.excluded_sessions += 1,
            NormalizeOutcome::Malformed(field) => {
                tracing::warn!(
                    row = index + 1,
                    field = field.as_str(),
                    "dropping malformed task-log row"
                );
                *batch.stats.malformed.entry(field).or_insert(0) += 1;
            }
        }
    }
    batch
}
