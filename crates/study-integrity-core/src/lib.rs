pub mod check;
pub mod compare;
pub mod config;
pub mod exceptions;
pub mod normalize;
pub mod report;
pub mod scan;
pub mod schedule;

pub use check::{run_check, CheckOptions, CheckOutcome};
pub use compare::{compare, ComparisonResult};
pub use config::{Config, ConfigError, VariantRules};
pub use exceptions::{
    CutoverDirection, CutoverRule, CutoverRules, FilterOutcome, SetMatcher, Suppression,
};
pub use normalize::{
    normalize, normalize_all, normalize_event, parse_timestamp, MalformedField, NormalizationStats,
    NormalizeOutcome, NormalizedBatch, RawTaskEvent, TaskCompletionEvent,
    ADMINISTRATIVE_TASK_ID, EXCLUDED_SESSION,
};
pub use report::{
    assemble, default_report_file_name, format_timestamp, ReportRow, REPORT_COLUMNS,
};
pub use scan::{
    scan, scan_participant, scan_with_summary, Discrepancy, DiscrepancyScope, ScanSummary,
};
pub use schedule::{ScheduleRegistry, SessionSchedule, StudySchedule, StudyVariant};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IntegrityError {
    #[error("unknown study variant: {0}")]
    UnknownStudyVariant(String),
    #[error("validation error: {0}")]
    Validation(String),
}
