//! Duplicate grouping over a built fingerprint index
//!
//! [`DuplicateGrouper`] turns "within-threshold" query results into disjoint
//! groups. Membership is the transitive closure of the relation: if A is near
//! B and B is near C, all three share a group even when A and C alone are too
//! far apart. A union-find structure merges the query hits.
//!
//! Each group gets a [`Severity`] from its largest pairwise distance and a
//! representative (the copy to keep) from
//! [`RepresentativeRank`](crate::index::RepresentativeRank). The grouper
//! is a pure function of the index; nothing on disk changes.
//!
//! Queries run in parallel on the rayon pool since the index is read-only
//! once built. Results are merged in slot order, so output never depends on
//! thread scheduling.

use crate::config::DeclutterConfig;
use crate::error::{DeclutterError, Result};
use crate::index::FingerprintIndex;
use crate::types::PhotoId;
use crate::utils::format_bytes;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// How close the members of a duplicate group are
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Every pairwise distance is within the near threshold
    Identical,
    /// At least one pair is beyond the near threshold
    Similar,
}

/// A set of photos that are copies or near-copies of each other
///
/// Always holds at least two members; deserializing a smaller group fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GroupRecord")]
pub struct DuplicateGroup {
    /// Members ordered best-first; the first is the representative
    members: Vec<PhotoId>,
    /// Severity tier
    pub severity: Severity,
    /// Largest pairwise combined distance
    pub max_distance: u32,
    /// Mean pairwise combined distance
    pub mean_distance: f64,
    /// Bytes freed if every non-representative copy were removed
    pub recoverable_bytes: u64,
}

/// Serialized form of [`DuplicateGroup`], checked before use
#[derive(Deserialize)]
struct GroupRecord {
    members: Vec<PhotoId>,
    severity: Severity,
    max_distance: u32,
    mean_distance: f64,
    recoverable_bytes: u64,
}

impl TryFrom<GroupRecord> for DuplicateGroup {
    type Error = DeclutterError;

    fn try_from(record: GroupRecord) -> Result<Self> {
        if record.members.len() < 2 {
            return Err(DeclutterError::internal(format!(
                "duplicate group needs at least two members, got {}",
                record.members.len()
            )));
        }
        Ok(Self {
            members: record.members,
            severity: record.severity,
            max_distance: record.max_distance,
            mean_distance: record.mean_distance,
            recoverable_bytes: record.recoverable_bytes,
        })
    }
}

impl DuplicateGroup {
    /// The copy suggested to keep
    pub fn representative(&self) -> &PhotoId {
        &self.members[0]
    }

    /// Members other than the representative, best-first
    pub fn duplicates(&self) -> &[PhotoId] {
        &self.members[1..]
    }

    /// All members, representative first
    pub fn members(&self) -> &[PhotoId] {
        &self.members
    }

    /// Number of members (always at least two)
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether a photo belongs to this group
    pub fn contains(&self, id: &PhotoId) -> bool {
        self.members.contains(id)
    }
}

/// Builds duplicate groups from a fingerprint index
#[derive(Debug, Clone, Copy)]
pub struct DuplicateGrouper {
    near_threshold: u32,
    similar_threshold: u32,
}

impl DuplicateGrouper {
    /// Create a grouper
    ///
    /// # Errors
    ///
    /// - [`DeclutterError::InvalidConfiguration`] if `near_threshold` exceeds
    ///   `similar_threshold`
    pub fn new(near_threshold: u32, similar_threshold: u32) -> Result<Self> {
        if near_threshold > similar_threshold {
            return Err(DeclutterError::InvalidConfiguration(format!(
                "near_threshold ({}) must not exceed similar_threshold ({})",
                near_threshold, similar_threshold
            )));
        }
        Ok(Self {
            near_threshold,
            similar_threshold,
        })
    }

    /// Grouper using the configured thresholds
    pub fn from_config(config: &DeclutterConfig) -> Result<Self> {
        Self::new(config.near_threshold, config.similar_threshold)
    }

    /// Group every indexed photo that has at least one neighbor
    ///
    /// Photos with no neighbor within `similar_threshold` belong to no group.
    /// Groups come back ordered by representative path.
    #[instrument(skip(self, index), fields(photos = index.len()))]
    pub fn group(&self, index: &FingerprintIndex) -> Vec<DuplicateGroup> {
        let n = index.len();
        let radius = self.similar_threshold;

        let edges: Vec<Vec<usize>> = (0..n)
            .into_par_iter()
            .map(|slot| {
                index
                    .query_slots(&index.slot(slot).fingerprint, radius)
                    .into_iter()
                    .filter_map(|(other, _)| (other > slot).then_some(other))
                    .collect()
            })
            .collect();

        let mut sets = UnionFind::new(n);
        let mut edge_count = 0usize;
        for (slot, neighbors) in edges.iter().enumerate() {
            for &other in neighbors {
                sets.union(slot, other);
                edge_count += 1;
            }
        }
        debug!("Found {} within-threshold pairs", edge_count);

        let mut components: Vec<Vec<usize>> = vec![Vec::new(); n];
        for slot in 0..n {
            let root = sets.find(slot);
            components[root].push(slot);
        }

        let mut groups: Vec<DuplicateGroup> = components
            .into_par_iter()
            .filter(|members| members.len() >= 2)
            .map(|members| self.describe(index, members))
            .collect();
        groups.sort_by(|a, b| a.representative().cmp(b.representative()));

        info!(
            "Grouped {} photos into {} duplicate groups",
            groups.iter().map(DuplicateGroup::len).sum::<usize>(),
            groups.len()
        );
        groups
    }

    fn describe(&self, index: &FingerprintIndex, mut slots: Vec<usize>) -> DuplicateGroup {
        let mut max_distance = 0;
        let mut total: u64 = 0;
        let mut pairs: u64 = 0;
        for (i, &a) in slots.iter().enumerate() {
            for &b in &slots[i + 1..] {
                let d = index.slot_distance(a, b);
                max_distance = max_distance.max(d);
                total += u64::from(d);
                pairs += 1;
            }
        }

        slots.sort_by(|&a, &b| index.slot(a).rank.cmp(&index.slot(b).rank));
        let recoverable_bytes = slots[1..].iter().map(|&s| index.slot(s).size_bytes).sum();
        let severity = if max_distance <= self.near_threshold {
            Severity::Identical
        } else {
            Severity::Similar
        };

        DuplicateGroup {
            members: slots.iter().map(|&s| index.slot(s).id().clone()).collect(),
            severity,
            max_distance,
            mean_distance: if pairs == 0 { 0.0 } else { total as f64 / pairs as f64 },
            recoverable_bytes,
        }
    }
}

/// Group an index with explicit thresholds
pub fn group(
    index: &FingerprintIndex,
    near_threshold: u32,
    similar_threshold: u32,
) -> Result<Vec<DuplicateGroup>> {
    Ok(DuplicateGrouper::new(near_threshold, similar_threshold)?.group(index))
}

/// Totals over a set of duplicate groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupSummary {
    /// Photos that entered the index
    pub indexed_photos: usize,
    /// Number of groups
    pub groups: usize,
    /// Groups tiered identical
    pub identical_groups: usize,
    /// Groups tiered similar
    pub similar_groups: usize,
    /// Non-representative members across all groups
    pub duplicate_photos: usize,
    /// Indexed photos minus duplicates
    pub unique_photos: usize,
    /// Bytes freed if every duplicate were removed
    pub recoverable_bytes: u64,
}

impl DedupSummary {
    /// Summarise groups built over an index of `indexed_photos` photos
    pub fn from_groups(indexed_photos: usize, groups: &[DuplicateGroup]) -> Self {
        let identical_groups = groups
            .iter()
            .filter(|g| g.severity == Severity::Identical)
            .count();
        let duplicate_photos = groups.iter().map(|g| g.duplicates().len()).sum();
        Self {
            indexed_photos,
            groups: groups.len(),
            identical_groups,
            similar_groups: groups.len() - identical_groups,
            duplicate_photos,
            unique_photos: indexed_photos.saturating_sub(duplicate_photos),
            recoverable_bytes: groups.iter().map(|g| g.recoverable_bytes).sum(),
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        format!(
            "{} groups ({} identical, {} similar), {} duplicates of {} photos, {} recoverable",
            self.groups,
            self.identical_groups,
            self.similar_groups,
            self.duplicate_photos,
            self.indexed_photos,
            format_bytes(self.recoverable_bytes)
        )
    }
}

/// Disjoint-set forest with path halving and union by size
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{CombineMode, Fingerprint, PerceptualHash};
    use crate::types::PhotoRecord;
    use chrono::{TimeZone, Utc};
    use tracing_test::traced_test;

    /// Fingerprint whose gradient hash has the lowest `bits` bits set
    fn fp(bits: u32) -> Fingerprint {
        let g = if bits == 0 { 0 } else { u64::MAX >> (64 - bits) };
        Fingerprint::new(
            PerceptualHash::from_bytes(g.to_be_bytes().to_vec()),
            PerceptualHash::from_bytes(0u64.to_be_bytes().to_vec()),
        )
    }

    fn record(name: &str, bits: u32) -> PhotoRecord {
        PhotoRecord::new(PhotoId::new(format!("/photos/{}", name))).with_fingerprint(fp(bits))
    }

    fn index_of(records: &[PhotoRecord]) -> FingerprintIndex {
        let (index, report) = FingerprintIndex::build(records, CombineMode::Sum);
        assert!(report.is_empty());
        index
    }

    #[test]
    fn test_transitive_closure_across_chain() {
        // a-b = 8, b-c = 8, a-c = 16: only the chain links a to c
        let records = vec![record("a.jpg", 0), record("b.jpg", 8), record("c.jpg", 16)];
        let groups = group(&index_of(&records), 4, 10).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[0].max_distance, 16);
        assert_eq!(groups[0].severity, Severity::Similar);
    }

    #[test]
    fn test_severity_and_singletons() {
        let records = vec![
            record("a.jpg", 0),
            record("a_copy.jpg", 1),
            record("far.jpg", 40),
        ];
        let groups = group(&index_of(&records), 4, 10).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].severity, Severity::Identical);
        assert!(!groups[0].contains(&PhotoId::new("/photos/far.jpg")));
    }

    #[test]
    fn test_representative_prefers_resolution_then_time() {
        let t0 = Utc.with_ymd_and_hms(2023, 8, 14, 9, 0, 0).unwrap();
        let records = vec![
            record("small.jpg", 0).with_resolution(800, 600).with_captured_at(t0),
            record("large_late.jpg", 1)
                .with_resolution(4032, 3024)
                .with_captured_at(t0 + chrono::Duration::hours(1)),
            record("large_early.jpg", 2)
                .with_resolution(4032, 3024)
                .with_captured_at(t0),
        ];
        let groups = group(&index_of(&records), 10, 20).unwrap();

        assert_eq!(
            groups[0].representative(),
            &PhotoId::new("/photos/large_early.jpg")
        );
        assert_eq!(groups[0].duplicates()[0], PhotoId::new("/photos/large_late.jpg"));
    }

    #[test]
    fn test_groups_are_disjoint() {
        let records: Vec<PhotoRecord> = (0..40)
            .map(|n| record(&format!("{:02}.jpg", n), (n % 4) * 16 + (n % 3) as u32))
            .collect();
        let groups = group(&index_of(&records), 2, 4).unwrap();

        let mut seen = std::collections::HashSet::new();
        for g in &groups {
            assert!(g.len() >= 2);
            for m in g.members() {
                assert!(seen.insert(m.clone()), "{} appears in two groups", m);
            }
        }
    }

    #[test]
    fn test_deserialized_group_needs_two_members() {
        let group = |members: &[&str]| {
            serde_json::from_value::<DuplicateGroup>(serde_json::json!({
                "members": members,
                "severity": "identical",
                "max_distance": 0,
                "mean_distance": 0.0,
                "recoverable_bytes": 0,
            }))
        };
        assert!(group(&[]).is_err());
        assert!(group(&["/p/a.jpg"]).is_err());

        let pair = group(&["/p/a.jpg", "/p/b.jpg"]).unwrap();
        assert_eq!(pair.representative(), &PhotoId::new("/p/a.jpg"));
        assert_eq!(pair.duplicates(), &[PhotoId::new("/p/b.jpg")]);
        let round_trip: DuplicateGroup =
            serde_json::from_str(&serde_json::to_string(&pair).unwrap()).unwrap();
        assert_eq!(round_trip, pair);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        assert!(DuplicateGrouper::new(10, 5).is_err());
    }

    #[test]
    fn test_dedup_summary() {
        let records = vec![
            record("a.jpg", 0),
            record("b.jpg", 1),
            record("c.jpg", 2),
            record("d.jpg", 50),
        ]
        .into_iter()
        .map(|mut r| {
            r.size_bytes = 1024;
            r
        })
        .collect::<Vec<_>>();
        let index = index_of(&records);
        let groups = group(&index, 4, 10).unwrap();
        let summary = DedupSummary::from_groups(index.len(), &groups);

        assert_eq!(summary.duplicate_photos, 2);
        assert_eq!(summary.unique_photos, 2);
        assert_eq!(summary.recoverable_bytes, 2048);
        assert!(summary.summary().contains("2.00 KB"));
    }

    #[test]
    #[traced_test]
    fn test_grouping_logs_totals() {
        let records = vec![record("a.jpg", 0), record("b.jpg", 0)];
        group(&index_of(&records), 0, 0).unwrap();
        assert!(logs_contain("Grouped 2 photos into 1 duplicate groups"));
    }
}
