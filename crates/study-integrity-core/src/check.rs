use std::collections::BTreeMap;

use serde::Serialize;

use crate::exceptions::{count_by_rule, CutoverRules, FilterOutcome, Suppression};
use crate::normalize::{normalize_all, NormalizationStats, RawTaskEvent};
use crate::report::{assemble, ReportRow};
use crate::scan::{scan_with_summary, Discrepancy, ScanSummary};
use crate::schedule::{ScheduleRegistry, StudyVariant};
use crate::IntegrityError;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CheckOptions {
    pub apply_cutover_rules: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self { apply_cutover_rules: true }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct CheckOutcome {
    pub variant: StudyVariant,
    pub normalization: NormalizationStats,
    pub scan: ScanSummary,
    /// Discrepancies found before cutover rules were applied.
    pub flagged: usize,
    pub suppressed: Vec<Suppression>,
    pub discrepancies: Vec<Discrepancy>,
    pub rows: Vec<ReportRow>,
}

/// Run the conformance check for one study over an already-fetched log.
///
/// The variant is resolved before any row is looked at, so an unknown key
/// fails without doing work.
///
/// # Errors
/// Returns [`IntegrityError::UnknownStudyVariant`] when `variant_key` does not
/// name a registered schedule.
pub fn run_check(
    registry: &ScheduleRegistry,
    rules: &CutoverRules,
    variant_key: &str,
    raw_events: &[RawTaskEvent],
    options: CheckOptions,
) -> Result<CheckOutcome, IntegrityError> {
    let schedule = registry.get_schedule(variant_key)?;
    let variant = schedule.variant;

    let batch = normalize_all(raw_events);
    tracing::info!(
        study = variant.as_str(),
        total = batch.stats.total,
        accepted = batch.stats.accepted,
        malformed = batch.stats.malformed_total(),
        "normalized task log"
    );

    let (found, scan) = scan_with_summary(&batch.events, schedule);
    let flagged = found.len();

    let filtered = if options.apply_cutover_rules {
        rules.partition(found, variant)
    } else {
        FilterOutcome { retained: found, suppressed: Vec::new() }
    };
    tracing::info!(
        study = variant.as_str(),
        participants = scan.participants,
        flagged,
        suppressed = filtered.suppressed.len(),
        reported = filtered.retained.len(),
        "conformance check finished"
    );

    let rows = assemble(&filtered.retained);
    Ok(CheckOutcome {
        variant,
        normalization: batch.stats,
        scan,
        flagged,
        suppressed: filtered.suppressed,
        discrepancies: filtered.retained,
        rows,
    })
}

impl CheckOutcome {
    #[must_use]
    pub fn suppressed_by_rule(&self) -> BTreeMap<&str, usize> {
        count_by_rule(&self.suppressed)
    }
}
