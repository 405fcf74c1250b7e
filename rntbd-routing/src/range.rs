//! Key ranges and partition key ranges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A range with independently inclusive or exclusive bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range<T> {
    pub min: T,
    pub max: T,
    pub is_min_inclusive: bool,
    pub is_max_inclusive: bool,
}

impl<T: Ord + Clone> Range<T> {
    pub fn new(min: T, max: T, is_min_inclusive: bool, is_max_inclusive: bool) -> Self {
        Self {
            min,
            max,
            is_min_inclusive,
            is_max_inclusive,
        }
    }

    /// `[value, value]`.
    pub fn point(value: T) -> Self {
        Self::new(value.clone(), value, true, true)
    }

    /// `[min, max)`.
    pub fn half_open(min: T, max: T) -> Self {
        Self::new(min, max, true, false)
    }

    pub fn is_single_value(&self) -> bool {
        self.is_min_inclusive && self.is_max_inclusive && self.min == self.max
    }

    pub fn is_empty(&self) -> bool {
        match self.min.cmp(&self.max) {
            Ordering::Equal => !(self.is_min_inclusive && self.is_max_inclusive),
            Ordering::Greater => true,
            Ordering::Less => false,
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        let above_min = match self.min.cmp(value) {
            Ordering::Less => true,
            Ordering::Equal => self.is_min_inclusive,
            Ordering::Greater => false,
        };
        let below_max = match self.max.cmp(value) {
            Ordering::Greater => true,
            Ordering::Equal => self.is_max_inclusive,
            Ordering::Less => false,
        };
        above_min && below_max
    }

    /// Returns whether two ranges share at least one value. Touching bounds
    /// overlap only when both touching ends are inclusive.
    pub fn check_overlapping(a: &Range<T>, b: &Range<T>) -> bool {
        if a.is_empty() || b.is_empty() {
            return false;
        }
        let a_min_vs_b_max = a.min.cmp(&b.max);
        let b_min_vs_a_max = b.min.cmp(&a.max);
        if a_min_vs_b_max == Ordering::Greater || b_min_vs_a_max == Ordering::Greater {
            return false;
        }
        if a_min_vs_b_max == Ordering::Equal && !(a.is_min_inclusive && b.is_max_inclusive) {
            return false;
        }
        if b_min_vs_a_max == Ordering::Equal && !(b.is_min_inclusive && a.is_max_inclusive) {
            return false;
        }
        true
    }
}

/// A contiguous slice of the effective partition key space owned by one
/// physical partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    /// Ids of the ranges this one was split or merged from.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_range(&self) -> Range<String> {
        Range::half_open(self.min_inclusive.clone(), self.max_exclusive.clone())
    }

    pub fn contains(&self, effective_partition_key: &str) -> bool {
        self.min_inclusive.as_str() <= effective_partition_key
            && effective_partition_key < self.max_exclusive.as_str()
    }
}
