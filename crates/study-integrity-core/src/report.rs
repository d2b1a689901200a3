use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, PrimitiveDateTime};

use crate::scan::Discrepancy;
use crate::schedule::StudyVariant;

/// Header of the report file, in column order.
pub const REPORT_COLUMNS: [&str; 9] = [
    "ParticipantID",
    "StudyID",
    "Session",
    "PTaskLength",
    "Diff_P_S",
    "Diff_S_P",
    "Last_Date",
    "SessionOrder",
    "ParticipantOrder",
];

/// One line of the integrity report. Column names are shared with reports
/// produced by earlier tooling and must not change.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportRow {
    #[serde(rename = "ParticipantID")]
    pub participant_id: String,
    #[serde(rename = "StudyID")]
    pub study_id: String,
    #[serde(rename = "Session")]
    pub session: String,
    #[serde(rename = "PTaskLength")]
    pub length_delta: i64,
    /// Observed but not expected at that point.
    #[serde(rename = "Diff_P_S")]
    pub extra: String,
    /// Expected at that point but not observed.
    #[serde(rename = "Diff_S_P")]
    pub missing: String,
    #[serde(rename = "Last_Date")]
    pub last_date: String,
    #[serde(rename = "SessionOrder")]
    pub expected_sequence: String,
    #[serde(rename = "ParticipantOrder")]
    pub observed_sequence: String,
}

impl From<&Discrepancy> for ReportRow {
    fn from(discrepancy: &Discrepancy) -> Self {
        Self {
            participant_id: discrepancy.participant_id.clone(),
            study_id: discrepancy.study_id.clone().unwrap_or_default(),
            session: discrepancy.scope.label().to_string(),
            length_delta: discrepancy.length_delta,
            extra: render_set(&discrepancy.extra),
            missing: render_set(&discrepancy.missing),
            last_date: discrepancy.last_event_timestamp.map(format_timestamp).unwrap_or_default(),
            expected_sequence: render_sequence(&discrepancy.expected_sequence),
            observed_sequence: render_sequence(&discrepancy.observed_sequence),
        }
    }
}

/// Shape discrepancies into report rows, preserving their order.
#[must_use]
pub fn assemble(discrepancies: &[Discrepancy]) -> Vec<ReportRow> {
    discrepancies.iter().map(ReportRow::from).collect()
}

/// `YYYY-MM-DD HH:MM:SS`; fractional seconds are dropped.
#[must_use]
pub fn format_timestamp(timestamp: PrimitiveDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    timestamp.format(&format).unwrap_or_else(|_| timestamp.to_string())
}

/// `{VARIANT}_{YYYYMMDD}_DataIntegrityS2_Report.csv`
#[must_use]
pub fn default_report_file_name(variant: StudyVariant, run_date: Date) -> String {
    format!(
        "{}_{:04}{:02}{:02}_DataIntegrityS2_Report.csv",
        variant.as_str(),
        run_date.year(),
        u8::from(run_date.month()),
        run_date.day()
    )
}

fn render_set(items: &BTreeSet<String>) -> String {
    render_items(items.iter().map(String::as_str))
}

fn render_sequence(items: &[String]) -> String {
    render_items(items.iter().map(String::as_str))
}

// Array rendering of the historical reports: `['a' 'b']`, `[]` when empty.
fn render_items<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let quoted = items.map(|item| format!("'{}'", item.replace('\'', "\\'"))).collect::<Vec<_>>();
    format!("[{}]", quoted.join(" "))
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;
    use crate::scan::DiscrepancyScope;

    fn discrepancy(scope: DiscrepancyScope) -> Discrepancy {
        Discrepancy {
            participant_id: "2010".to_string(),
            study_id: Some("15".to_string()),
            scope,
            length_delta: 1,
            extra: ["postAffect".to_string()].into_iter().collect(),
            missing: ["1".to_string()].into_iter().collect(),
            unscheduled: BTreeSet::new(),
            last_event_timestamp: Some(datetime!(2020-09-01 10:15:30.250)),
            expected_sequence: vec!["preAffect".to_string(), "1".to_string()],
            observed_sequence: vec!["preAffect".to_string(), "postAffect".to_string()],
        }
    }

    #[test]
    fn row_carries_every_column() {
        let row = ReportRow::from(&discrepancy(DiscrepancyScope::Session("secondSession".into())));
        assert_eq!(row.participant_id, "2010");
        assert_eq!(row.study_id, "15");
        assert_eq!(row.session, "secondSession");
        assert_eq!(row.length_delta, 1);
        assert_eq!(row.extra, "['postAffect']");
        assert_eq!(row.missing, "['1']");
        assert_eq!(row.last_date, "2020-09-01 10:15:30");
        assert_eq!(row.expected_sequence, "['preAffect' '1']");
        assert_eq!(row.observed_sequence, "['preAffect' 'postAffect']");
    }

    #[test]
    fn session_order_row_has_marker_and_empty_date() {
        let mut record = discrepancy(DiscrepancyScope::SessionOrder);
        record.last_event_timestamp = None;
        record.study_id = None;
        record.missing.clear();
        let row = ReportRow::from(&record);
        assert_eq!(row.session, "SessionOrder");
        assert_eq!(row.last_date, "");
        assert_eq!(row.study_id, "");
        assert_eq!(row.missing, "[]");
    }

    #[test]
    fn assemble_preserves_order() {
        let first = discrepancy(DiscrepancyScope::Session("preTest".into()));
        let mut second = discrepancy(DiscrepancyScope::SessionOrder);
        second.participant_id = "1999".to_string();
        let rows = assemble(&[first, second]);
        let ids = rows.iter().map(|row| row.participant_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["2010", "1999"]);
    }

    #[test]
    fn report_file_name_is_dated() {
        assert_eq!(
            default_report_file_name(StudyVariant::Tet, date!(2021 - 03 - 04)),
            "TET_20210304_DataIntegrityS2_Report.csv"
        );
    }

    #[test]
    fn serialized_column_names_match_historical_reports() {
        let row = ReportRow::from(&discrepancy(DiscrepancyScope::SessionOrder));
        let value = match serde_json::to_value(&row) {
            Ok(value) => value,
            Err(err) => panic!("row must serialize: {err}"),
        };
        let Some(object) = value.as_object() else {
            panic!("row must serialize as an object");
        };
        let columns = object.keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(columns, REPORT_COLUMNS.to_vec());
    }
}
