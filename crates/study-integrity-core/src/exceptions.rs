use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::macros::date;
use time::Date;

use crate::scan::Discrepancy;
use crate::schedule::StudyVariant;
use crate::IntegrityError;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(from = "Option<BTreeSet<String>>", into = "Option<BTreeSet<String>>")]
pub enum SetMatcher {
    #[default]
    Any,
    Exactly(BTreeSet<String>),
}

impl SetMatcher {
    #[must_use]
    pub fn exactly(items: &[&str]) -> Self {
        Self::Exactly(items.iter().map(|item| (*item).to_string()).collect())
    }

    #[must_use]
    pub fn matches(&self, actual: &BTreeSet<String>) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(expected) => expected == actual,
        }
    }
}

impl From<Option<BTreeSet<String>>> for SetMatcher {
    fn from(value: Option<BTreeSet<String>>) -> Self {
        value.map_or(Self::Any, Self::Exactly)
    }
}

impl From<SetMatcher> for Option<BTreeSet<String>> {
    fn from(value: SetMatcher) -> Self {
        match value {
            SetMatcher::Any => None,
            SetMatcher::Exactly(items) => Some(items),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CutoverDirection {
    Before,
    After,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CutoverRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Matched against observed elements outside the expected prefix.
    #[serde(default)]
    pub extra: SetMatcher,
    /// Matched against expected prefix elements the participant never did.
    #[serde(default)]
    pub missing: SetMatcher,
    /// Compared at midnight; the comparison is strict in both directions.
    #[serde(with = "iso_date")]
    pub boundary: Date,
    pub direction: CutoverDirection,
}

impl CutoverRule {
    /// Discrepancies without a last event timestamp never match.
    #[must_use]
    pub fn matches(&self, discrepancy: &Discrepancy) -> bool {
        let Some(last_event) = discrepancy.last_event_timestamp else {
            return false;
        };
        let boundary = self.boundary.midnight();
        let on_side = match self.direction {
            CutoverDirection::Before => last_event < boundary,
            CutoverDirection::After => last_event > boundary,
        };

        on_side
            && self.extra.matches(&discrepancy.extra)
            && self.missing.matches(&discrepancy.missing)
    }

    fn validate(&self, variant: StudyVariant) -> Result<(), IntegrityError> {
        if self.id.trim().is_empty() {
            return Err(IntegrityError::Validation(format!(
                "cutover rule for {variant} MUST have an id"
            )));
        }
        if self.extra == SetMatcher::Any && self.missing == SetMatcher::Any {
            return Err(IntegrityError::Validation(format!(
                "cutover rule `{}` for {variant} MUST constrain extra or missing",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Suppression {
    pub rule_id: String,
    pub discrepancy: Discrepancy,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct FilterOutcome {
    pub retained: Vec<Discrepancy>,
    pub suppressed: Vec<Suppression>,
}

impl FilterOutcome {
    #[must_use]
    pub fn suppressed_by_rule(&self) -> BTreeMap<&str, usize> {
        count_by_rule(&self.suppressed)
    }
}

/// Number of suppressions attributed to each rule id.
#[must_use]
pub fn count_by_rule(suppressed: &[Suppression]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for suppression in suppressed {
        *counts.entry(suppression.rule_id.as_str()).or_insert(0) += 1;
    }
    counts
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CutoverRules {
    by_variant: BTreeMap<StudyVariant, Vec<CutoverRule>>,
}

impl CutoverRules {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Amendments recorded in the TET issues and changes log. The other
    /// variants ran without schedule changes.
    #[must_use]
    pub fn builtin() -> Self {
        let gidi_pair =
            || (SetMatcher::exactly(&["ReturnIntention"]), SetMatcher::exactly(&["Gidi"]));
        let (gidi_extra, gidi_missing) = gidi_pair();
        let (late_extra, late_missing) = gidi_pair();
        let tet = vec![
            CutoverRule {
                id: "gidi-not-yet-launched".to_string(),
                description: "firstSession finished before the Gidi module launched".to_string(),
                extra: gidi_extra,
                missing: gidi_missing,
                boundary: date!(2020 - 08 - 10),
                direction: CutoverDirection::Before,
            },
            CutoverRule {
                id: "gidi-disabled".to_string(),
                description: "firstSession finished after the Gidi study was disabled".to_string(),
                extra: late_extra,
                missing: late_missing,
                boundary: date!(2020 - 12 - 07),
                direction: CutoverDirection::After,
            },
            CutoverRule {
                id: "covid19-not-yet-added".to_string(),
                description: "preTest taken with OA and before the Covid19 questionnaire existed"
                    .to_string(),
                extra: SetMatcher::exactly(&["OA"]),
                missing: SetMatcher::exactly(&["Covid19"]),
                boundary: date!(2020 - 04 - 23),
                direction: CutoverDirection::Before,
            },
            CutoverRule {
                id: "oa-still-in-pretest".to_string(),
                description: "preTest taken before OA moved to eligibility".to_string(),
                extra: SetMatcher::exactly(&["OA"]),
                missing: SetMatcher::Any,
                boundary: date!(2020 - 05 - 12),
                direction: CutoverDirection::Before,
            },
        ];

        let mut by_variant = BTreeMap::new();
        by_variant.insert(StudyVariant::Tet, tet);
        Self { by_variant }
    }

    #[must_use]
    pub fn for_variant(&self, variant: StudyVariant) -> &[CutoverRule] {
        self.by_variant.get(&variant).map_or(&[], Vec::as_slice)
    }

    /// Replace every rule registered for `variant`.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Validation`] when a rule lacks an id, repeats
    /// an id, or constrains neither set.
    pub fn with_variant_rules(
        mut self,
        variant: StudyVariant,
        rules: Vec<CutoverRule>,
    ) -> Result<Self, IntegrityError> {
        let mut ids = BTreeSet::new();
        for rule in &rules {
            rule.validate(variant)?;
            if !ids.insert(rule.id.as_str()) {
                return Err(IntegrityError::Validation(format!(
                    "cutover rule id `{}` is repeated for {variant}",
                    rule.id
                )));
            }
        }
        self.by_variant.insert(variant, rules);
        Ok(self)
    }

    /// Split `discrepancies` into those that survive and those explained by a
    /// rule. Each suppression names the first rule that matched; rule order
    /// does not change which discrepancies are removed.
    #[must_use]
    pub fn partition(
        &self,
        discrepancies: Vec<Discrepancy>,
        variant: StudyVariant,
    ) -> FilterOutcome {
        let rules = self.for_variant(variant);
        if rules.is_empty() {
            return FilterOutcome { retained: discrepancies, suppressed: Vec::new() };
        }

        let mut outcome = FilterOutcome::default();
        for discrepancy in discrepancies {
            match rules.iter().find(|rule| rule.matches(&discrepancy)) {
                Some(rule) => outcome
                    .suppressed
                    .push(Suppression { rule_id: rule.id.clone(), discrepancy }),
                None => outcome.retained.push(discrepancy),
            }
        }

        for (rule_id, count) in outcome.suppressed_by_rule() {
            tracing::info!(study = variant.as_str(), rule_id, count, "suppressed by cutover rule");
        }
        outcome
    }

    #[must_use]
    pub fn filter(
        &self,
        discrepancies: Vec<Discrepancy>,
        variant: StudyVariant,
    ) -> Vec<Discrepancy> {
        self.partition(discrepancies, variant).retained
    }
}
