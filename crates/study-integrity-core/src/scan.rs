use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use time::PrimitiveDateTime;

use crate::compare::compare;
use crate::normalize::TaskCompletionEvent;
use crate::schedule::StudySchedule;

const SESSION_ORDER_LABEL: &str = "SessionOrder";

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "session", rename_all = "snake_case")]
pub enum DiscrepancyScope {
    SessionOrder,
    Session(String),
    /// The participant recorded a session the schedule does not define.
    UnrecognizedSession(String),
}

impl DiscrepancyScope {
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::SessionOrder => SESSION_ORDER_LABEL,
            Self::Session(name) | Self::UnrecognizedSession(name) => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Discrepancy {
    pub participant_id: String,
    pub study_id: Option<String>,
    pub scope: DiscrepancyScope,
    pub length_delta: i64,
    pub extra: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub unscheduled: BTreeSet<String>,
    pub last_event_timestamp: Option<PrimitiveDateTime>,
    pub expected_sequence: Vec<String>,
    pub observed_sequence: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct ScanSummary {
    pub participants: usize,
    pub session_order_flags: usize,
    pub task_order_flags: usize,
    pub unrecognized_sessions: usize,
}

impl ScanSummary {
    fn record(&mut self, discrepancy: &Discrepancy) {
        match discrepancy.scope {
            DiscrepancyScope::SessionOrder => self.session_order_flags += 1,
            DiscrepancyScope::Session(_) => self.task_order_flags += 1,
            DiscrepancyScope::UnrecognizedSession(_) => self.unrecognized_sessions += 1,
        }
    }
}

/// Check every participant in `events` against `schedule`, in first-seen
/// participant order.
#[must_use]
pub fn scan(events: &[TaskCompletionEvent], schedule: &StudySchedule) -> Vec<Discrepancy> {
    scan_with_summary(events, schedule).0
}

#[must_use]
pub fn scan_with_summary(
    events: &[TaskCompletionEvent],
    schedule: &StudySchedule,
) -> (Vec<Discrepancy>, ScanSummary) {
    let groups = group_by_participant(events);
    let mut summary = ScanSummary { participants: groups.len(), ..ScanSummary::default() };
    let mut discrepancies = Vec::new();

    for (participant_id, participant_events) in groups {
        let found = scan_participant(participant_id, &participant_events, schedule);
        if !found.is_empty() {
            tracing::debug!(
                participant_id,
                discrepancies = found.len(),
                "participant deviates from schedule"
            );
        }
        for discrepancy in &found {
            summary.record(discrepancy);
        }
        discrepancies.extend(found);
    }

    (discrepancies, summary)
}

/// Check one participant's events. Returns at most one session-order finding
/// followed by at most one finding per touched session, in first-seen order.
#[must_use]
pub fn scan_participant(
    participant_id: &str,
    events: &[&TaskCompletionEvent],
    schedule: &StudySchedule,
) -> Vec<Discrepancy> {
    let mut events = events.to_vec();
    events.sort_by_key(|event| event.sequence);

    let study_id = participant_study_id(&events);
    let sessions = first_seen_sessions(&events);
    let mut discrepancies = Vec::new();

    let expected_sessions =
        schedule.checked_session_names().into_iter().map(str::to_string).collect::<Vec<_>>();
    let observed_sessions = sessions.iter().map(|name| (*name).to_string()).collect::<Vec<_>>();
    let session_result = compare(&observed_sessions, &expected_sessions);
    if !session_result.is_match {
        discrepancies.push(Discrepancy {
            participant_id: participant_id.to_string(),
            study_id: study_id.clone(),
            scope: DiscrepancyScope::SessionOrder,
            length_delta: session_result.length_delta,
            extra: session_result.extra,
            missing: session_result.missing,
            unscheduled: session_result.unscheduled,
            last_event_timestamp: None,
            expected_sequence: expected_sessions,
            observed_sequence: observed_sessions,
        });
    }

    for session_name in sessions {
        let mut session_events = events
            .iter()
            .copied()
            .filter(|event| event.session_name == session_name)
            .collect::<Vec<_>>();
        session_events.sort_by(|lhs, rhs| completion_order(lhs, rhs));

        let observed_tasks =
            session_events.iter().map(|event| event.task_id.clone()).collect::<Vec<_>>();
        let last_event_timestamp =
            session_events.iter().filter_map(|event| event.completed_at).max();

        let (scope, expected_tasks) = match schedule.tasks_for(session_name) {
            Some(tasks) => (DiscrepancyScope::Session(session_name.to_string()), tasks.to_vec()),
            None => (DiscrepancyScope::UnrecognizedSession(session_name.to_string()), Vec::new()),
        };

        let result = compare(&observed_tasks, &expected_tasks);
        if result.is_match {
            continue;
        }

        discrepancies.push(Discrepancy {
            participant_id: participant_id.to_string(),
            study_id: study_id.clone(),
            scope,
            length_delta: result.length_delta,
            extra: result.extra,
            missing: result.missing,
            unscheduled: result.unscheduled,
            last_event_timestamp,
            expected_sequence: expected_tasks,
            observed_sequence: observed_tasks,
        });
    }

    discrepancies
}

fn group_by_participant(
    events: &[TaskCompletionEvent],
) -> Vec<(&str, Vec<&TaskCompletionEvent>)> {
    let mut ordered = events.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|event| event.sequence);

    let mut index_by_participant: BTreeMap<&str, usize> = BTreeMap::new();
    let mut groups: Vec<(&str, Vec<&TaskCompletionEvent>)> = Vec::new();
    for event in ordered {
        let participant_id = event.participant_id.as_str();
        let index = *index_by_participant.entry(participant_id).or_insert_with(|| {
            groups.push((participant_id, Vec::new()));
            groups.len() - 1
        });
        groups[index].1.push(event);
    }
    groups
}

fn first_seen_sessions<'a>(events: &[&'a TaskCompletionEvent]) -> Vec<&'a str> {
    let mut seen = BTreeSet::new();
    let mut sessions = Vec::new();
    for &event in events {
        let name = event.session_name.as_str();
        if seen.insert(name) {
            sessions.push(name);
        }
    }
    sessions
}

/// Completion time ascending with untimed events last; ingestion order
/// breaks ties.
fn completion_order(lhs: &TaskCompletionEvent, rhs: &TaskCompletionEvent) -> Ordering {
    let by_time = match (lhs.completed_at, rhs.completed_at) {
        (Some(lhs_at), Some(rhs_at)) => lhs_at.cmp(&rhs_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time.then_with(|| lhs.sequence.cmp(&rhs.sequence))
}

/// A participant is attributed to the greatest study id among their events.
fn participant_study_id(events: &[&TaskCompletionEvent]) -> Option<String> {
    events
        .iter()
        .filter_map(|event| event.study_id.as_deref())
        .max_by(|lhs, rhs| compare_study_ids(lhs, rhs))
        .map(str::to_string)
}

fn compare_study_ids(lhs: &str, rhs: &str) -> Ordering {
    match (lhs.parse::<i64>(), rhs.parse::<i64>()) {
        (Ok(lhs_num), Ok(rhs_num)) => lhs_num.cmp(&rhs_num),
        _ => lhs.cmp(rhs),
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::schedule::{ScheduleRegistry, SessionSchedule, StudyVariant};

    struct LogBuilder {
        events: Vec<TaskCompletionEvent>,
    }

    impl LogBuilder {
        fn new() -> Self {
            Self { events: Vec::new() }
        }

        fn push(
            &mut self,
            participant: &str,
            session: &str,
            task: &str,
            at: Option<PrimitiveDateTime>,
        ) -> &mut Self {
            let sequence = u64::try_from(self.events.len()).unwrap_or(u64::MAX);
            self.events.push(TaskCompletionEvent {
                sequence,
                participant_id: participant.to_string(),
                study_id: Some(format!("study-{participant}")),
                session_name: session.to_string(),
                task_id: task.to_string(),
                completed_at: at,
            });
            self
        }

        fn tasks(&mut self, participant: &str, session: &str, tasks: &[&str]) -> &mut Self {
            for task in tasks {
                self.push(participant, session, task, None);
            }
            self
        }
    }

    fn small_schedule() -> StudySchedule {
        StudySchedule {
            variant: StudyVariant::Tet,
            sessions: vec![
                SessionSchedule { name: "preTest".to_string(), tasks: strings(&["Credibility"]) },
                SessionSchedule {
                    name: "firstSession".to_string(),
                    tasks: strings(&["preAffect", "1", "postAffect"]),
                },
            ],
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    #[test]
    fn in_progress_participant_is_not_flagged() {
        let mut log = LogBuilder::new();
        log.tasks("2010", "preTest", &["Credibility"]);
        assert!(scan(&log.events, &small_schedule()).is_empty());
    }

    #[test]
    fn skipped_task_flags_the_session_only() {
        let mut log = LogBuilder::new();
        log.tasks("2010", "preTest", &["Credibility"]).tasks(
            "2010",
            "firstSession",
            &["preAffect", "postAffect"],
        );

        let found = scan(&log.events, &small_schedule());
        assert_eq!(found.len(), 1);
        let discrepancy = &found[0];
        assert_eq!(discrepancy.scope, DiscrepancyScope::Session("firstSession".to_string()));
        assert_eq!(discrepancy.scope.label(), "firstSession");
        assert_eq!(discrepancy.missing, set(&["1"]));
        assert_eq!(discrepancy.expected_sequence, strings(&["preAffect", "1", "postAffect"]));
        assert_eq!(discrepancy.observed_sequence, strings(&["preAffect", "postAffect"]));
        assert_eq!(discrepancy.study_id.as_deref(), Some("study-2010"));
    }

    #[test]
    fn skipped_session_emits_session_order_record_without_timestamp() {
        let registry = ScheduleRegistry::builtin();
        let Some(schedule) = registry.get(StudyVariant::Tet) else {
            panic!("TET must be registered");
        };
        let mut log = LogBuilder::new();
        log.push("2010", "preTest", "Credibility", Some(datetime!(2020-06-01 09:00:00)))
            .push("2010", "firstSession", "preAffect", Some(datetime!(2020-06-02 09:00:00)))
            .push("2010", "thirdSession", "preAffect", Some(datetime!(2020-06-20 09:00:00)));

        let found = scan(&log.events, schedule);
        let session_order = &found[0];
        assert_eq!(session_order.scope, DiscrepancyScope::SessionOrder);
        assert_eq!(session_order.scope.label(), "SessionOrder");
        assert_eq!(session_order.missing, set(&["secondSession"]));
        assert_eq!(session_order.extra, set(&["thirdSession"]));
        assert_eq!(session_order.last_event_timestamp, None);
        assert_eq!(session_order.expected_sequence.len(), 7);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn tasks_are_ordered_by_completion_time_with_untimed_last() {
        let mut log = LogBuilder::new();
        log.push("2010", "preTest", "Credibility", Some(datetime!(2020-06-01 09:00:00)))
            .push("2010", "firstSession", "postAffect", None)
            .push("2010", "firstSession", "1", Some(datetime!(2020-06-02 09:05:00)))
            .push("2010", "firstSession", "preAffect", Some(datetime!(2020-06-02 09:00:00)));

        assert!(scan(&log.events, &small_schedule()).is_empty());
    }

    #[test]
    fn equal_timestamps_keep_ingestion_order() {
        let at = Some(datetime!(2020-06-02 09:00:00));
        let mut log = LogBuilder::new();
        log.push("2010", "firstSession", "1", at).push("2010", "firstSession", "preAffect", at);

        let found = scan(&log.events, &small_schedule());
        let first_session = DiscrepancyScope::Session("firstSession".into());
        let task_level = found.iter().find(|discrepancy| discrepancy.scope == first_session);
        let Some(task_level) = task_level else {
            panic!("expected a firstSession finding, got {found:?}");
        };
        assert_eq!(task_level.observed_sequence, strings(&["1", "preAffect"]));
        assert_eq!(task_level.last_event_timestamp, at);
    }

    #[test]
    fn unrecognized_session_is_reported_with_empty_expected_sequence() {
        let mut log = LogBuilder::new();
        log.tasks("2010", "preTest", &["Credibility"]).tasks("2010", "bonusSession", &["Extra"]);

        let found = scan(&log.events, &small_schedule());
        let unrecognized = found
            .iter()
            .find(|discrepancy| {
                discrepancy.scope == DiscrepancyScope::UnrecognizedSession("bonusSession".into())
            })
            .cloned();
        let Some(unrecognized) = unrecognized else {
            panic!("expected an unrecognized-session finding, got {found:?}");
        };
        assert!(unrecognized.expected_sequence.is_empty());
        assert_eq!(unrecognized.extra, set(&["Extra"]));
        assert_eq!(unrecognized.length_delta, 1);
        assert_eq!(unrecognized.scope.label(), "bonusSession");
    }

    #[test]
    fn participants_keep_first_seen_order_and_summary_counts() {
        let mut log = LogBuilder::new();
        log.tasks("3000", "firstSession", &["1"])
            .tasks("1000", "preTest", &["Wrong"])
            .tasks("3000", "bonusSession", &["X"]);

        let (found, summary) = scan_with_summary(&log.events, &small_schedule());
        let participants = found.iter().map(|d| d.participant_id.as_str()).collect::<Vec<_>>();
        assert_eq!(participants, vec!["3000", "3000", "3000", "1000"]);
        assert_eq!(
            summary,
            ScanSummary {
                participants: 2,
                session_order_flags: 1,
                task_order_flags: 2,
                unrecognized_sessions: 1,
            }
        );
    }

    #[test]
    fn scan_is_deterministic_across_runs() {
        let mut log = LogBuilder::new();
        for participant in ["9", "10", "2", "77", "5"] {
            log.tasks(participant, "firstSession", &["postAffect", "preAffect"]);
            log.tasks(participant, "preTest", &["Credibility"]);
        }
        let first = scan(&log.events, &small_schedule());
        for _ in 0..5 {
            assert_eq!(scan(&log.events, &small_schedule()), first);
        }
    }

    #[test]
    fn study_id_prefers_numerically_greatest() {
        let mut log = LogBuilder::new();
        log.tasks("2010", "firstSession", &["1"]);
        log.tasks("2010", "firstSession", &["2"]);
        log.events[0].study_id = Some("9".to_string());
        log.events[1].study_id = Some("10".to_string());

        let found = scan(&log.events, &small_schedule());
        assert!(found.iter().all(|d| d.study_id.as_deref() == Some("10")));
    }
}
