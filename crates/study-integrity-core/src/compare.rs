use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComparisonResult<T: Ord> {
    pub is_match: bool,
    /// Observed elements absent from the compared prefix of the expected sequence.
    pub extra: BTreeSet<T>,
    pub missing: BTreeSet<T>,
    /// `observed.len() - prefix.len()`; never negative.
    pub length_delta: i64,
    /// Observed elements absent from the whole expected sequence. Always a
    /// subset of `extra`.
    pub unscheduled: BTreeSet<T>,
}

impl<T: Ord> ComparisonResult<T> {
    fn matched() -> Self {
        Self {
            is_match: true,
            extra: BTreeSet::new(),
            missing: BTreeSet::new(),
            length_delta: 0,
            unscheduled: BTreeSet::new(),
        }
    }
}

/// Compare `observed` against the first `observed.len()` elements of
/// `expected`. Repeated elements are compared by position.
#[must_use]
pub fn compare<T>(observed: &[T], expected: &[T]) -> ComparisonResult<T>
where
    T: Ord + Clone,
{
    let prefix = &expected[..observed.len().min(expected.len())];
    if observed == prefix {
        return ComparisonResult::matched();
    }

    let observed_set: BTreeSet<&T> = observed.iter().collect();
    let prefix_set: BTreeSet<&T> = prefix.iter().collect();
    let expected_set: BTreeSet<&T> = expected.iter().collect();

    let extra = observed_set.difference(&prefix_set).map(|item| (*item).clone()).collect();
    let missing = prefix_set.difference(&observed_set).map(|item| (*item).clone()).collect();
    let unscheduled =
        observed_set.difference(&expected_set).map(|item| (*item).clone()).collect();

    ComparisonResult {
        is_match: false,
        extra,
        missing,
        length_delta: signed_len(observed.len()) - signed_len(prefix.len()),
        unscheduled,
    }
}

fn signed_len(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}
