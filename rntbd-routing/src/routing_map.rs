//! Complete routing map from effective partition keys to partition key
//! ranges.
//!
//! A map only exists when its ranges form a gapless, non-overlapping cover
//! of `["", "FF")`. Lookups binary-search the ranges ordered by their
//! minimum, relying on effective partition keys comparing ordinally.

use crate::error::RoutingError;
use crate::partition_key::{
    MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY, MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};
use crate::range::{PartitionKeyRange, Range};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Routing map for one collection. `T` is the per-range service identity
/// handed to address resolution.
#[derive(Debug, Clone)]
pub struct CollectionRoutingMap<T> {
    range_by_id: HashMap<String, (PartitionKeyRange, T)>,
    ordered_ranges: Vec<PartitionKeyRange>,
    gone_ranges: HashSet<String>,
    collection_unique_id: String,
    change_feed_next_if_none_match: Option<String>,
}

impl<T: Clone> CollectionRoutingMap<T> {
    /// Builds a map from a full set of ranges.
    ///
    /// Returns `Ok(None)` when the ranges leave a gap or do not span the
    /// whole key space, and an error when two ranges overlap or share an id.
    pub fn try_create_complete_routing_map(
        ranges: Vec<(PartitionKeyRange, T)>,
        collection_unique_id: impl Into<String>,
        change_feed_next_if_none_match: Option<String>,
    ) -> Result<Option<Self>, RoutingError> {
        let mut range_by_id = HashMap::with_capacity(ranges.len());
        for (range, info) in ranges {
            let id = range.id.clone();
            if range_by_id.insert(id.clone(), (range, info)).is_some() {
                return Err(RoutingError::DuplicateRangeId(id));
            }
        }
        Self::build(
            range_by_id,
            HashSet::new(),
            collection_unique_id.into(),
            change_feed_next_if_none_match,
        )
    }

    fn build(
        range_by_id: HashMap<String, (PartitionKeyRange, T)>,
        gone_ranges: HashSet<String>,
        collection_unique_id: String,
        change_feed_next_if_none_match: Option<String>,
    ) -> Result<Option<Self>, RoutingError> {
        let mut ordered_ranges: Vec<PartitionKeyRange> =
            range_by_id.values().map(|(range, _)| range.clone()).collect();
        ordered_ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));

        if !is_complete_set_of_ranges(&ordered_ranges)? {
            tracing::debug!(
                collection = %collection_unique_id,
                ranges = ordered_ranges.len(),
                "partition key ranges do not form a complete cover"
            );
            return Ok(None);
        }

        Ok(Some(Self {
            range_by_id,
            ordered_ranges,
            gone_ranges,
            collection_unique_id,
            change_feed_next_if_none_match,
        }))
    }

    /// Ranges sorted by minimum.
    pub fn ordered_ranges(&self) -> &[PartitionKeyRange] {
        &self.ordered_ranges
    }

    pub fn collection_unique_id(&self) -> &str {
        &self.collection_unique_id
    }

    pub fn change_feed_next_if_none_match(&self) -> Option<&str> {
        self.change_feed_next_if_none_match.as_deref()
    }

    /// Returns the range containing `effective_partition_key`, or `None` for
    /// keys at or past the end of the key space.
    pub fn get_range_by_effective_partition_key(
        &self,
        effective_partition_key: &str,
    ) -> Option<&PartitionKeyRange> {
        if effective_partition_key >= MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY {
            return None;
        }
        if effective_partition_key == MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY {
            return self.ordered_ranges.first();
        }
        let after = self
            .ordered_ranges
            .partition_point(|range| range.min_inclusive.as_str() <= effective_partition_key);
        self.ordered_ranges.get(after.checked_sub(1)?)
    }

    /// Returns every range overlapping any of `provided`, sorted by minimum
    /// and without duplicates.
    pub fn get_overlapping_ranges(&self, provided: &[Range<String>]) -> Vec<&PartitionKeyRange> {
        let mut found: BTreeMap<&str, &PartitionKeyRange> = BTreeMap::new();
        let Some(last) = self.ordered_ranges.len().checked_sub(1) else {
            return Vec::new();
        };

        for query in provided {
            let start = self
                .ordered_ranges
                .partition_point(|range| range.min_inclusive <= query.min)
                .saturating_sub(1);
            // Owned ranges are max-exclusive, so they sort before an
            // inclusive query bound with the same value.
            let end = self
                .ordered_ranges
                .partition_point(|range| {
                    range.max_exclusive < query.max
                        || (range.max_exclusive == query.max && query.is_max_inclusive)
                })
                .min(last);

            for range in &self.ordered_ranges[start..=end.max(start)] {
                if Range::check_overlapping(&range.to_range(), query) {
                    found.insert(range.min_inclusive.as_str(), range);
                }
            }
        }

        found.into_values().collect()
    }

    pub fn get_range_by_id(&self, id: &str) -> Option<&PartitionKeyRange> {
        self.range_by_id.get(id).map(|(range, _)| range)
    }

    pub fn try_get_info_by_id(&self, id: &str) -> Option<&T> {
        self.range_by_id.get(id).map(|(_, info)| info)
    }

    /// Returns whether `id` was replaced by a split or merge.
    pub fn is_gone(&self, id: &str) -> bool {
        self.gone_ranges.contains(id)
    }

    /// Applies a change set of ranges. Parents of the new ranges are
    /// retired; the result must still be a complete cover.
    pub fn try_combine(
        &self,
        ranges: Vec<(PartitionKeyRange, T)>,
        change_feed_next_if_none_match: Option<String>,
    ) -> Result<Option<Self>, RoutingError> {
        let mut gone_ranges = self.gone_ranges.clone();
        gone_ranges.extend(
            ranges
                .iter()
                .flat_map(|(range, _)| range.parents.iter().cloned()),
        );

        let mut range_by_id: HashMap<String, (PartitionKeyRange, T)> = self
            .range_by_id
            .iter()
            .filter(|(id, _)| !gone_ranges.contains(id.as_str()))
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        for (range, info) in ranges {
            if !gone_ranges.contains(&range.id) {
                range_by_id.insert(range.id.clone(), (range, info));
            }
        }

        Self::build(
            range_by_id,
            gone_ranges,
            self.collection_unique_id.clone(),
            change_feed_next_if_none_match,
        )
    }
}

/// Checks ordered ranges for a complete cover. Overlap is an error; a gap
/// or a missing end is `Ok(false)`.
fn is_complete_set_of_ranges(ordered: &[PartitionKeyRange]) -> Result<bool, RoutingError> {
    for pair in ordered.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if previous.max_exclusive > current.min_inclusive {
            return Err(RoutingError::OverlappingRanges {
                previous: previous.id.clone(),
                previous_max: previous.max_exclusive.clone(),
                current: current.id.clone(),
                current_min: current.min_inclusive.clone(),
            });
        }
    }

    let (Some(first), Some(last)) = (ordered.first(), ordered.last()) else {
        return Ok(false);
    };
    if first.min_inclusive != MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY
        || last.max_exclusive != MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY
    {
        return Ok(false);
    }
    Ok(ordered
        .windows(2)
        .all(|pair| pair[0].max_exclusive == pair[1].min_inclusive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Map = CollectionRoutingMap<u32>;

    fn pkr(id: &str, min: &str, max: &str) -> (PartitionKeyRange, u32) {
        (PartitionKeyRange::new(id, min, max), id.parse().unwrap_or(0))
    }

    fn sample() -> Map {
        Map::try_create_complete_routing_map(
            vec![
                pkr("2", "0000000050", "0000000070"),
                pkr("0", "", "0000000030"),
                pkr("1", "0000000030", "0000000050"),
                pkr("3", "0000000070", "FF"),
            ],
            "coll1",
            None,
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_ordered_ranges() {
        let map = sample();
        let ids: Vec<_> = map.ordered_ranges().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
        assert_eq!(map.collection_unique_id(), "coll1");
        assert_eq!(map.try_get_info_by_id("2"), Some(&2));
        assert_eq!(map.get_range_by_id("1").unwrap().min_inclusive, "0000000030");
        assert!(map.get_range_by_id("9").is_none());
    }

    #[test]
    fn test_lookup_by_effective_partition_key() {
        let map = sample();
        let id = |epk: &str| map.get_range_by_effective_partition_key(epk).map(|r| r.id.clone());
        assert_eq!(id("").as_deref(), Some("0"));
        assert_eq!(id("0000000010").as_deref(), Some("0"));
        assert_eq!(id("0000000030").as_deref(), Some("1"));
        assert_eq!(id("0000000069").as_deref(), Some("2"));
        assert_eq!(id("0000000070").as_deref(), Some("3"));
        assert_eq!(id("EEEE").as_deref(), Some("3"));
        assert_eq!(id("FF"), None);
        assert_eq!(id("FF00"), None);
    }

    #[test]
    fn test_overlapping_ranges() {
        let map = sample();
        let ids = |queries: &[Range<String>]| -> Vec<String> {
            map.get_overlapping_ranges(queries)
                .into_iter()
                .map(|r| r.id.clone())
                .collect()
        };

        assert_eq!(
            ids(&[Range::half_open("".to_string(), "FF".to_string())]),
            vec!["0", "1", "2", "3"]
        );
        assert_eq!(
            ids(&[Range::half_open("0000000040".to_string(), "0000000050".to_string())]),
            vec!["1"]
        );
        assert_eq!(
            ids(&[Range::new(
                "0000000040".to_string(),
                "0000000050".to_string(),
                true,
                true
            )]),
            vec!["1", "2"]
        );
        assert_eq!(ids(&[Range::point("0000000070".to_string())]), vec!["3"]);
        assert_eq!(
            ids(&[
                Range::point("0000000010".to_string()),
                Range::point("0000000020".to_string()),
                Range::point("0000000060".to_string()),
            ]),
            vec!["0", "2"]
        );
    }

    #[test]
    fn test_gap_returns_none() {
        let map = Map::try_create_complete_routing_map(
            vec![pkr("0", "", "0000000030"), pkr("1", "0000000040", "FF")],
            "c",
            None,
        )
        .unwrap();
        assert!(map.is_none());
    }

    #[test]
    fn test_missing_ends_return_none() {
        let map = Map::try_create_complete_routing_map(
            vec![pkr("0", "00", "FF")],
            "c",
            None,
        )
        .unwrap();
        assert!(map.is_none());

        let map = Map::try_create_complete_routing_map(vec![pkr("0", "", "EE")], "c", None)
            .unwrap();
        assert!(map.is_none());

        let map = Map::try_create_complete_routing_map(Vec::new(), "c", None).unwrap();
        assert!(map.is_none());
    }

    #[test]
    fn test_overlap_is_error() {
        let err = Map::try_create_complete_routing_map(
            vec![
                pkr("0", "", "0000000040"),
                pkr("1", "0000000030", "FF"),
            ],
            "c",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RoutingError::OverlappingRanges { .. }));
    }

    #[test]
    fn test_duplicate_id_is_error() {
        let err = Map::try_create_complete_routing_map(
            vec![pkr("0", "", "80"), pkr("0", "80", "FF")],
            "c",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateRangeId(id) if id == "0"));
    }

    #[test]
    fn test_try_combine_split() {
        let map = sample();
        let children = vec![
            (
                PartitionKeyRange::new("4", "0000000030", "0000000040").with_parents(["1"]),
                4,
            ),
            (
                PartitionKeyRange::new("5", "0000000040", "0000000050").with_parents(["1"]),
                5,
            ),
        ];
        let combined = map
            .try_combine(children, Some("etag-2".to_string()))
            .unwrap()
            .unwrap();

        assert!(combined.is_gone("1"));
        assert!(!combined.is_gone("0"));
        assert!(combined.get_range_by_id("1").is_none());
        assert_eq!(combined.ordered_ranges().len(), 5);
        assert_eq!(combined.change_feed_next_if_none_match(), Some("etag-2"));
        assert_eq!(
            combined
                .get_range_by_effective_partition_key("0000000045")
                .unwrap()
                .id,
            "5"
        );
        assert!(!map.is_gone("1"));
    }

    #[test]
    fn test_try_combine_incomplete() {
        let map = sample();
        let partial = vec![(
            PartitionKeyRange::new("4", "0000000030", "0000000040").with_parents(["1"]),
            4,
        )];
        assert!(map.try_combine(partial, None).unwrap().is_none());
    }

    #[test]
    fn test_try_combine_ignores_gone_ranges() {
        let map = sample()
            .try_combine(
                vec![
                    (
                        PartitionKeyRange::new("4", "0000000030", "0000000040").with_parents(["1"]),
                        4,
                    ),
                    (
                        PartitionKeyRange::new("5", "0000000040", "0000000050").with_parents(["1"]),
                        5,
                    ),
                ],
                None,
            )
            .unwrap()
            .unwrap();

        // A stale copy of the retired parent must not reappear.
        let stale = vec![pkr("1", "0000000030", "0000000050")];
        let combined = map.try_combine(stale, None).unwrap().unwrap();
        assert!(combined.get_range_by_id("1").is_none());
        assert_eq!(combined.ordered_ranges().len(), 5);
    }

    fn boundaries() -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set(1u32..0xFF00_0000, 0..12)
            .prop_map(|set| set.into_iter().map(|b| format!("{b:08X}")).collect())
    }

    proptest! {
        #[test]
        fn prop_complete_cover_lookup(bounds in boundaries(), probe in 0u32..0xFF00_0000) {
            let mut edges = vec![String::new()];
            edges.extend(bounds);
            edges.push("FF".to_string());
            let ranges: Vec<_> = edges
                .windows(2)
                .enumerate()
                .map(|(i, w)| (PartitionKeyRange::new(i.to_string(), w[0].clone(), w[1].clone()), i as u32))
                .collect();
            let count = ranges.len();

            let map = Map::try_create_complete_routing_map(ranges, "c", None).unwrap().unwrap();
            prop_assert_eq!(map.ordered_ranges().len(), count);
            for pair in map.ordered_ranges().windows(2) {
                prop_assert_eq!(&pair[0].max_exclusive, &pair[1].min_inclusive);
            }

            let epk = format!("{probe:08X}");
            let owner = map.get_range_by_effective_partition_key(&epk).unwrap();
            prop_assert!(owner.contains(&epk));
        }

        #[test]
        fn prop_removing_a_range_leaves_gap(bounds in boundaries(), drop in any::<prop::sample::Index>()) {
            let mut edges = vec![String::new()];
            edges.extend(bounds);
            edges.push("FF".to_string());
            let mut ranges: Vec<_> = edges
                .windows(2)
                .enumerate()
                .map(|(i, w)| (PartitionKeyRange::new(i.to_string(), w[0].clone(), w[1].clone()), i as u32))
                .collect();
            ranges.remove(drop.index(ranges.len()));

            let map = Map::try_create_complete_routing_map(ranges, "c", None).unwrap();
            prop_assert!(map.is_none());
        }
    }
}
