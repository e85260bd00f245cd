//! BK-tree index over perceptual fingerprints
//!
//! This module provides [`FingerprintIndex`], which answers "every photo within
//! distance `d` of this fingerprint" without comparing against the whole set.
//!
//! ## How it works
//!
//! Each node stores one photo and a map from distance to child. A child stored
//! under key `k` sits at distance exactly `k` from its parent. Because the
//! combined distance is a metric, a query `q` at radius `r` that measures
//! `d = dist(q, node)` can only find matches in children keyed within
//! `[d - r, d + r]`; every other subtree is skipped unvisited. The child map is
//! a `BTreeMap`, so the band is a single range scan.
//!
//! Nodes live in one arena (`Vec`) and children refer to arena slots, which
//! keeps insert and query iterative and the tree free of `Box` chains.
//!
//! Insertion order affects only the tree shape. Identical fingerprints are
//! stored under key `0` and both come back from a query; resolving them is the
//! grouper's job.
//!
//! ## Example
//!
//! ```rust
//! use declutter::fingerprint::{CombineMode, Fingerprint};
//! use declutter::index::FingerprintIndex;
//! use declutter::types::PhotoId;
//!
//! # fn main() -> declutter::Result<()> {
//! let mut index = FingerprintIndex::new(CombineMode::Sum);
//! index.insert(Fingerprint::from_hex("ff00ff00ff00ff00", "0f0f0f0f0f0f0f0f")?, PhotoId::new("/p/a.jpg"))?;
//! index.insert(Fingerprint::from_hex("ff00ff00ff00ff01", "0f0f0f0f0f0f0f0f")?, PhotoId::new("/p/b.jpg"))?;
//! index.insert(Fingerprint::from_hex("00ff00ff00ff00ff", "f0f0f0f0f0f0f0f0")?, PhotoId::new("/p/c.jpg"))?;
//!
//! let query = Fingerprint::from_hex("ff00ff00ff00ff00", "0f0f0f0f0f0f0f0f")?;
//! let hits = index.query(&query, 4);
//! assert_eq!(hits.len(), 2);
//! assert_eq!(hits[0], (PhotoId::new("/p/a.jpg"), 0));
//! # Ok(())
//! # }
//! ```

use crate::collections::{map_with_capacity, HashMap};
use crate::error::{DeclutterError, Result};
use crate::fingerprint::{CombineMode, Fingerprint};
use crate::types::{BatchReport, IssueStage, PhotoId, PhotoRecord};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Ordering key deciding which copy of a duplicate group to keep
///
/// Compares so that the preferred photo sorts first: highest resolution, then
/// earliest capture time, then the lexicographically smallest path. Unknown
/// resolution ranks below any known one and unknown time after any known one.
/// The path component makes the order total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepresentativeRank {
    /// Pixel count, if known
    pub pixels: Option<u64>,
    /// Capture time, if known
    pub captured_at: Option<DateTime<Utc>>,
    /// Photo identity
    pub id: PhotoId,
}

impl RepresentativeRank {
    /// Rank for a bare identity with no metadata
    pub fn bare(id: PhotoId) -> Self {
        Self {
            pixels: None,
            captured_at: None,
            id,
        }
    }

    /// Rank built from a photo record
    pub fn from_record(record: &PhotoRecord) -> Self {
        Self {
            pixels: record.resolution.map(|r| r.pixels()),
            captured_at: record.captured_at,
            id: record.id.clone(),
        }
    }
}

impl Ord for RepresentativeRank {
    fn cmp(&self, other: &Self) -> Ordering {
        // Larger resolution first; Some beats None
        other
            .pixels
            .cmp(&self.pixels)
            .then_with(|| match (self.captured_at, other.captured_at) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for RepresentativeRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One photo stored in the index
#[derive(Debug, Clone)]
pub struct IndexedPhoto {
    /// Combined fingerprint
    pub fingerprint: Fingerprint,
    /// Representative ordering key (carries the identity)
    pub rank: RepresentativeRank,
    /// File size, used by dedup summaries
    pub size_bytes: u64,
}

impl IndexedPhoto {
    /// Photo identity
    pub fn id(&self) -> &PhotoId {
        &self.rank.id
    }
}

#[derive(Debug)]
struct Node {
    entry: IndexedPhoto,
    children: BTreeMap<u32, usize>,
}

/// BK-tree of photo fingerprints
///
/// All insertions complete before any grouping query; the index is then shared
/// read-only (it is `Sync`), so queries may run on many threads at once.
#[derive(Debug)]
pub struct FingerprintIndex {
    nodes: Vec<Node>,
    positions: HashMap<PhotoId, usize>,
    widths: Option<(usize, usize)>,
    mode: CombineMode,
}

impl FingerprintIndex {
    /// Create an empty index
    pub fn new(mode: CombineMode) -> Self {
        Self::with_capacity(mode, 0)
    }

    /// Create an empty index sized for `capacity` photos
    pub fn with_capacity(mode: CombineMode, capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            positions: map_with_capacity(capacity),
            widths: None,
            mode,
        }
    }

    /// Build an index from photo records, isolating per-photo failures
    ///
    /// Records without a fingerprint or with a malformed one are skipped and
    /// reported; they never abort the build.
    pub fn build<'a, I>(records: I, mode: CombineMode) -> (Self, BatchReport)
    where
        I: IntoIterator<Item = &'a PhotoRecord>,
    {
        let records = records.into_iter();
        let mut index = Self::with_capacity(mode, records.size_hint().0);
        let mut report = BatchReport::default();

        for record in records {
            if let Err(e) = index.insert_record(record) {
                warn!("Excluding {} from duplicate detection: {}", record.id, e);
                report.push_error(record.id.path(), IssueStage::Dedup, &e);
            }
        }

        debug!(
            "Built fingerprint index: {} photos, {} excluded",
            index.len(),
            report.count(IssueStage::Dedup)
        );
        (index, report)
    }

    /// Insert a fingerprint for a photo with no extra metadata
    ///
    /// # Errors
    ///
    /// - [`DeclutterError::CorruptFingerprint`] if a component is empty or its
    ///   width differs from the fingerprints already indexed
    /// - [`DeclutterError::DuplicatePhoto`] if the identity is already present
    pub fn insert(&mut self, fingerprint: Fingerprint, photo_id: PhotoId) -> Result<()> {
        self.insert_entry(IndexedPhoto {
            fingerprint,
            rank: RepresentativeRank::bare(photo_id),
            size_bytes: 0,
        })
    }

    /// Insert a photo record, keeping its resolution and timestamp for ranking
    pub fn insert_record(&mut self, record: &PhotoRecord) -> Result<()> {
        let fingerprint = record.fingerprint.clone().ok_or_else(|| {
            DeclutterError::corrupt_fingerprint(record.id.path(), "no fingerprint")
        })?;
        self.insert_entry(IndexedPhoto {
            fingerprint,
            rank: RepresentativeRank::from_record(record),
            size_bytes: record.size_bytes,
        })
    }

    fn insert_entry(&mut self, entry: IndexedPhoto) -> Result<()> {
        let photo = entry.id().path().to_path_buf();
        entry.fingerprint.validate(&photo)?;

        let widths = entry.fingerprint.widths();
        match self.widths {
            Some(expected) if expected != widths => {
                return Err(DeclutterError::corrupt_fingerprint(
                    photo,
                    format!(
                        "width {}+{} bits does not match indexed width {}+{} bits",
                        widths.0, widths.1, expected.0, expected.1
                    ),
                ));
            }
            _ => {}
        }
        if self.positions.contains_key(entry.id()) {
            return Err(DeclutterError::DuplicatePhoto(photo));
        }

        let slot = self.nodes.len();
        if slot > 0 {
            let mut current = 0;
            loop {
                let d = self.nodes[current]
                    .entry
                    .fingerprint
                    .distance(&entry.fingerprint, self.mode);
                match self.nodes[current].children.get(&d) {
                    Some(&child) => current = child,
                    None => {
                        self.nodes[current].children.insert(d, slot);
                        break;
                    }
                }
            }
        }

        trace!("Indexed {:?} at slot {}", photo, slot);
        self.widths = Some(widths);
        self.positions.insert(entry.id().clone(), slot);
        self.nodes.push(Node {
            entry,
            children: BTreeMap::new(),
        });
        Ok(())
    }

    /// Every indexed photo within `max_distance` of `fingerprint`
    ///
    /// Results are sorted by distance, then by identity.
    pub fn query(&self, fingerprint: &Fingerprint, max_distance: u32) -> Vec<(PhotoId, u32)> {
        self.query_slots(fingerprint, max_distance)
            .into_iter()
            .map(|(slot, d)| (self.nodes[slot].entry.id().clone(), d))
            .collect()
    }

    /// Like [`query`](Self::query) but returns arena slots, for grouping
    pub(crate) fn query_slots(&self, fingerprint: &Fingerprint, max_distance: u32) -> Vec<(usize, u32)> {
        let mut hits = Vec::new();
        if self.nodes.is_empty() {
            return hits;
        }

        let mut stack = vec![0usize];
        while let Some(slot) = stack.pop() {
            let node = &self.nodes[slot];
            let d = node.entry.fingerprint.distance(fingerprint, self.mode);
            if d <= max_distance {
                hits.push((slot, d));
            }
            let low = d.saturating_sub(max_distance);
            let high = d.saturating_add(max_distance);
            stack.extend(node.children.range(low..=high).map(|(_, &child)| child));
        }

        hits.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| self.nodes[a.0].entry.id().cmp(self.nodes[b.0].entry.id()))
        });
        hits
    }

    /// Distance between two indexed slots
    pub(crate) fn slot_distance(&self, a: usize, b: usize) -> u32 {
        self.nodes[a]
            .entry
            .fingerprint
            .distance(&self.nodes[b].entry.fingerprint, self.mode)
    }

    /// Entry stored in a slot
    pub(crate) fn slot(&self, slot: usize) -> &IndexedPhoto {
        &self.nodes[slot].entry
    }

    /// Look up an indexed photo by identity
    pub fn get(&self, id: &PhotoId) -> Option<&IndexedPhoto> {
        self.positions.get(id).map(|&slot| &self.nodes[slot].entry)
    }

    /// Whether a photo is indexed
    pub fn contains(&self, id: &PhotoId) -> bool {
        self.positions.contains_key(id)
    }

    /// Indexed photos in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &IndexedPhoto> {
        self.nodes.iter().map(|n| &n.entry)
    }

    /// Number of indexed photos
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Distance combination this index was built with
    pub fn mode(&self) -> CombineMode {
        self.mode
    }

    /// Component widths every indexed fingerprint shares
    pub fn widths(&self) -> Option<(usize, usize)> {
        self.widths
    }

    /// Depth of the deepest node, for diagnostics and benchmarks
    pub fn depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut deepest = 0;
        let mut stack = vec![(0usize, 1usize)];
        while let Some((slot, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(self.nodes[slot].children.values().map(|&c| (c, depth + 1)));
        }
        deepest
    }
}
