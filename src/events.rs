//! Event segmentation: temporal gaps first, visual sub-clusters second
//!
//! ## Phase 1: temporal
//!
//! Photos are sorted by capture time (ties broken by path, so the order is
//! total) and cut wherever two consecutive timestamps are more than the gap
//! threshold apart. This pass is linear after the sort and runs before any
//! visual comparison. Photos without a timestamp cannot be placed on the
//! timeline; they are listed in [`Segmentation::undated`] and reported.
//!
//! ## Phase 2: visual
//!
//! A segment holding more than `min_cluster_size * subdivide_multiplier`
//! photos is handed to a [`Clusterer`] over the photos' feature vectors.
//! Dense groups become sub-clusters, emitted by earliest member timestamp;
//! everything else (outliers, photos without usable features) lands in one
//! unclustered bucket that is always emitted last. If the clusterer finds no
//! dense group at all the segment stays whole.
//!
//! ## Labels
//!
//! Every segment and sub-cluster gets an advisory label: its date range,
//! followed by the dominant place name (or rounded coordinates) when any
//! member has a location, otherwise by the caption of its most central photo
//! when one was supplied.

use crate::clustering::{cosine_distance, Clusterer, DensityClusterer};
use crate::collections::{map_with_capacity, HashMap};
use crate::config::DeclutterConfig;
use crate::error::DeclutterError;
use crate::types::{BatchReport, GeoPoint, IssueStage, PhotoId, PhotoRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Feature vectors by photo, borrowed from the records
pub type FeatureMap<'a> = HashMap<&'a PhotoId, &'a [f32]>;

/// Externally supplied captions by photo
pub type CaptionMap = HashMap<PhotoId, String>;

/// Borrow the feature vectors of every record that has one
pub fn feature_map(records: &[PhotoRecord]) -> FeatureMap<'_> {
    let mut map = map_with_capacity(records.len());
    for record in records {
        if let Some(features) = &record.features {
            map.insert(&record.id, features.as_slice());
        }
    }
    map
}

/// A photo placed on the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPhoto {
    /// Photo identity
    pub id: PhotoId,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// GPS position, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

/// Whether a sub-cluster is a dense group or the outlier bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubClusterKind {
    /// Visually coherent group
    Cluster,
    /// Photos that met no density requirement
    Unclustered,
}

/// Part of an oversized segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCluster {
    /// Dense group or outlier bucket
    pub kind: SubClusterKind,
    /// Members in timeline order
    pub photos: Vec<PhotoId>,
    /// Earliest member timestamp
    pub earliest: DateTime<Utc>,
    /// Suggested label; advisory only
    pub label: String,
}

/// A gap-bounded run of photos
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSegment {
    /// Members in timeline order
    pub photos: Vec<SegmentPhoto>,
    /// Suggested label; advisory only
    pub label: String,
    /// Partition of the members when the segment was subdivided
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_clusters: Vec<SubCluster>,
}

impl EventSegment {
    fn from_photos(photos: Vec<SegmentPhoto>) -> Self {
        let mut segment = Self {
            photos,
            label: String::new(),
            sub_clusters: Vec::new(),
        };
        segment.label = suggest_label(
            segment.start(),
            segment.end(),
            segment.photos.iter().filter_map(|p| p.location.as_ref()),
            None,
        );
        segment
    }

    /// Timestamp of the first member
    pub fn start(&self) -> DateTime<Utc> {
        self.photos[0].captured_at
    }

    /// Timestamp of the last member
    pub fn end(&self) -> DateTime<Utc> {
        self.photos[self.photos.len() - 1].captured_at
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.photos.len()
    }

    /// Segments always hold at least one photo
    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    /// Member identities in timeline order
    pub fn ids(&self) -> impl Iterator<Item = &PhotoId> {
        self.photos.iter().map(|p| &p.id)
    }

    /// Whether the segment was split into sub-clusters
    pub fn is_subdivided(&self) -> bool {
        !self.sub_clusters.is_empty()
    }
}

/// Output of a segmentation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    /// Segments in timeline order
    pub segments: Vec<EventSegment>,
    /// Photos without a capture timestamp, sorted by path
    pub undated: Vec<PhotoId>,
    /// Per-photo issues raised along the way
    pub report: BatchReport,
}

/// Splits a photo timeline into events
#[derive(Debug, Clone)]
pub struct EventSegmenter {
    gap: Duration,
    min_cluster_size: usize,
    subdivide_multiplier: usize,
    clusterer: Arc<dyn Clusterer>,
}

impl EventSegmenter {
    /// Segmenter with the default multiplier and a density clusterer
    pub fn new(gap: Duration, min_cluster_size: usize) -> Self {
        Self {
            gap,
            min_cluster_size: min_cluster_size.max(2),
            subdivide_multiplier: 4,
            clusterer: Arc::new(DensityClusterer::new()),
        }
    }

    /// Segmenter configured from a [`DeclutterConfig`]
    pub fn from_config(config: &DeclutterConfig) -> Self {
        Self::new(config.gap_threshold(), config.min_cluster_size)
            .with_subdivide_multiplier(config.subdivide_multiplier)
            .with_clusterer(Arc::new(DensityClusterer::from_option(config.cluster_epsilon)))
    }

    /// Replace the clustering algorithm
    pub fn with_clusterer(mut self, clusterer: Arc<dyn Clusterer>) -> Self {
        self.clusterer = clusterer;
        self
    }

    /// Change how oversized a segment must be before it is subdivided
    pub fn with_subdivide_multiplier(mut self, multiplier: usize) -> Self {
        self.subdivide_multiplier = multiplier.max(1);
        self
    }

    /// Temporal phase only
    pub fn segment(&self, photos: &[PhotoRecord]) -> Segmentation {
        let mut report = BatchReport::default();
        let mut undated = Vec::new();
        let mut timeline: Vec<SegmentPhoto> = Vec::with_capacity(photos.len());

        for record in photos {
            match record.captured_at {
                Some(captured_at) => timeline.push(SegmentPhoto {
                    id: record.id.clone(),
                    captured_at,
                    location: record.location.clone(),
                }),
                None => {
                    let err = DeclutterError::MissingTimestamp {
                        photo: record.id.path().to_path_buf(),
                    };
                    report.push_error(record.id.path(), IssueStage::Timeline, &err);
                    undated.push(record.id.clone());
                }
            }
        }
        if !undated.is_empty() {
            warn!("{} photos have no capture time and were left off the timeline", undated.len());
        }
        undated.sort();

        timeline.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.id.cmp(&b.id)));

        let mut segments = Vec::new();
        let mut current: Vec<SegmentPhoto> = Vec::new();
        for photo in timeline {
            if let Some(last) = current.last() {
                if photo.captured_at - last.captured_at > self.gap {
                    segments.push(EventSegment::from_photos(std::mem::take(&mut current)));
                }
            }
            current.push(photo);
        }
        if !current.is_empty() {
            segments.push(EventSegment::from_photos(current));
        }

        debug!("Temporal pass produced {} segments", segments.len());
        Segmentation {
            segments,
            undated,
            report,
        }
    }

    /// Whether a segment is large enough to be subdivided
    pub fn needs_subdivision(&self, segment: &EventSegment) -> bool {
        segment.len() > self.min_cluster_size * self.subdivide_multiplier
    }

    /// Visual phase for one segment
    ///
    /// Clusters smaller than `min_cluster_size` are not formed. Returns an
    /// empty list when the clusterer finds no dense group. [`Self::run`]
    /// passes the segmenter's own minimum.
    pub fn subdivide(
        &self,
        segment: &EventSegment,
        min_cluster_size: usize,
        features: &FeatureMap<'_>,
    ) -> Vec<SubCluster> {
        self.subdivide_with_captions(
            segment,
            min_cluster_size,
            features,
            &CaptionMap::default(),
            &mut BatchReport::default(),
        )
    }

    fn subdivide_with_captions(
        &self,
        segment: &EventSegment,
        min_cluster_size: usize,
        features: &FeatureMap<'_>,
        captions: &CaptionMap,
        report: &mut BatchReport,
    ) -> Vec<SubCluster> {
        let dimension = dominant_dimension(segment, features);
        let mut usable: Vec<usize> = Vec::new();
        let mut outliers: Vec<usize> = Vec::new();
        for (pos, photo) in segment.photos.iter().enumerate() {
            match features.get(&photo.id) {
                Some(v) if Some(v.len()) == dimension && v.iter().all(|x| x.is_finite()) => {
                    usable.push(pos)
                }
                Some(_) => {
                    report.push(
                        photo.id.path(),
                        IssueStage::Clustering,
                        "feature vector is malformed or of a different dimension",
                    );
                    outliers.push(pos);
                }
                None => outliers.push(pos),
            }
        }

        let vectors: Vec<&[f32]> = usable
            .iter()
            .filter_map(|&pos| features.get(&segment.photos[pos].id).copied())
            .collect();
        let partition = self.clusterer.cluster(&vectors, min_cluster_size.max(2));

        // Indices a clusterer made up are dropped; empty clusters vanish
        let mut groups: Vec<Vec<usize>> = partition
            .clusters
            .iter()
            .map(|cluster| {
                let mut positions: Vec<usize> =
                    cluster.iter().filter_map(|&i| usable.get(i).copied()).collect();
                positions.sort_unstable();
                positions
            })
            .filter(|positions| !positions.is_empty())
            .collect();
        if groups.is_empty() {
            debug!("No dense sub-cluster in segment {:?}", segment.label);
            return Vec::new();
        }
        groups.sort_by_key(|positions| positions.first().copied());

        outliers.extend(partition.noise.iter().filter_map(|&i| usable.get(i).copied()));
        outliers.sort_unstable();

        let mut sub_clusters: Vec<SubCluster> = groups
            .into_iter()
            .map(|positions| {
                let caption = central_member(&positions, segment, features)
                    .and_then(|id| captions.get(id))
                    .map(String::as_str);
                build_sub_cluster(SubClusterKind::Cluster, &positions, segment, caption)
            })
            .collect();
        if !outliers.is_empty() {
            sub_clusters.push(build_sub_cluster(SubClusterKind::Unclustered, &outliers, segment, None));
        }
        sub_clusters
    }

    /// Both phases plus caption-aware labels
    #[instrument(skip_all, fields(photos = photos.len()))]
    pub fn run(&self, photos: &[PhotoRecord], captions: &CaptionMap) -> Segmentation {
        let features = feature_map(photos);
        let mut segmentation = self.segment(photos);
        let mut report = std::mem::take(&mut segmentation.report);

        for segment in &mut segmentation.segments {
            if self.needs_subdivision(segment) {
                segment.sub_clusters = self.subdivide_with_captions(
                    segment,
                    self.min_cluster_size,
                    &features,
                    captions,
                    &mut report,
                );
            }
            let all: Vec<usize> = (0..segment.len()).collect();
            let caption = central_member(&all, segment, &features)
                .and_then(|id| captions.get(id))
                .or_else(|| most_common_caption(segment, captions))
                .map(String::as_str);
            segment.label = suggest_label(
                segment.start(),
                segment.end(),
                segment.photos.iter().filter_map(|p| p.location.as_ref()),
                caption,
            );
        }

        info!(
            "Segmented {} photos into {} events ({} subdivided, {} undated)",
            photos.len(),
            segmentation.segments.len(),
            segmentation.segments.iter().filter(|s| s.is_subdivided()).count(),
            segmentation.undated.len()
        );
        segmentation.report = report;
        segmentation
    }
}

/// Temporal segmentation with an explicit gap in seconds
pub fn segment(photos: &[PhotoRecord], gap_threshold_seconds: i64) -> Segmentation {
    EventSegmenter::new(Duration::seconds(gap_threshold_seconds), 2).segment(photos)
}

/// Suggested label for a run of photos
///
/// The date range always leads so folders sort chronologically. Location wins
/// over caption; with neither, the date range stands alone.
pub fn suggest_label<'a>(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    locations: impl IntoIterator<Item = &'a GeoPoint>,
    caption: Option<&str>,
) -> String {
    let dates = date_range(start, end);
    let place = dominant_place(locations);
    match place
        .or_else(|| caption.map(str::trim).filter(|c| !c.is_empty()).map(str::to_string))
    {
        Some(detail) => format!("{} {}", dates, detail),
        None => dates,
    }
}

/// `2024-06-01` for one day, `2024-06-01 to 2024-06-03` otherwise
pub fn date_range(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let (a, b) = (start.date_naive(), end.date_naive());
    if a == b {
        a.format("%Y-%m-%d").to_string()
    } else {
        format!("{} to {}", a.format("%Y-%m-%d"), b.format("%Y-%m-%d"))
    }
}

fn dominant_place<'a>(locations: impl IntoIterator<Item = &'a GeoPoint>) -> Option<String> {
    let mut names: BTreeMap<&str, usize> = BTreeMap::new();
    let mut lat = 0.0;
    let mut lon = 0.0;
    let mut count = 0usize;
    for point in locations {
        if let Some(name) = point.place_name.as_deref() {
            *names.entry(name).or_default() += 1;
        }
        lat += point.latitude;
        lon += point.longitude;
        count += 1;
    }

    // Highest count; BTreeMap order makes the alphabetically first name win ties
    let mut best: Option<(&str, usize)> = None;
    for (name, n) in names {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((name, n));
        }
    }
    if let Some((name, _)) = best {
        return Some(name.to_string());
    }
    (count > 0).then(|| {
        GeoPoint {
            latitude: lat / count as f64,
            longitude: lon / count as f64,
            place_name: None,
        }
        .label()
    })
}

fn dominant_dimension(segment: &EventSegment, features: &FeatureMap<'_>) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for photo in &segment.photos {
        if let Some(v) = features.get(&photo.id) {
            if !v.is_empty() {
                *counts.entry(v.len()).or_default() += 1;
            }
        }
    }
    let mut best: Option<(usize, usize)> = None;
    for (dim, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((dim, n));
        }
    }
    best.map(|(dim, _)| dim)
}

/// Member whose vector is closest to the mean of the members' vectors
fn central_member<'s>(
    positions: &[usize],
    segment: &'s EventSegment,
    features: &FeatureMap<'_>,
) -> Option<&'s PhotoId> {
    let members: Vec<(&PhotoId, &[f32])> = positions
        .iter()
        .filter_map(|&pos| {
            let id = &segment.photos[pos].id;
            features.get(id).map(|v| (id, *v))
        })
        .collect();
    let dim = members.first()?.1.len();
    let members: Vec<_> = members.into_iter().filter(|(_, v)| v.len() == dim).collect();

    let mut mean = vec![0.0f32; dim];
    for (_, v) in &members {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let norm = mean.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        mean.iter_mut().for_each(|m| *m /= norm);
    }

    let mut best: Option<(&PhotoId, f32)> = None;
    for (id, v) in members {
        let vnorm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        let unit: Vec<f32> = if vnorm > 0.0 {
            v.iter().map(|x| x / vnorm).collect()
        } else {
            v.to_vec()
        };
        let d = cosine_distance(&unit, &mean);
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((id, d));
        }
    }
    best.map(|(id, _)| id)
}

fn most_common_caption<'c>(segment: &EventSegment, captions: &'c CaptionMap) -> Option<&'c String> {
    let mut counts: BTreeMap<&'c String, usize> = BTreeMap::new();
    for id in segment.ids() {
        if let Some(caption) = captions.get(id) {
            *counts.entry(caption).or_default() += 1;
        }
    }
    let mut best: Option<(&String, usize)> = None;
    for (caption, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((caption, n));
        }
    }
    best.map(|(c, _)| c)
}

fn build_sub_cluster(
    kind: SubClusterKind,
    positions: &[usize],
    segment: &EventSegment,
    caption: Option<&str>,
) -> SubCluster {
    let members: Vec<&SegmentPhoto> = positions.iter().map(|&p| &segment.photos[p]).collect();
    let earliest = members[0].captured_at;
    let latest = members[members.len() - 1].captured_at;
    let label = match kind {
        SubClusterKind::Cluster => suggest_label(
            earliest,
            latest,
            members.iter().filter_map(|p| p.location.as_ref()),
            caption,
        ),
        SubClusterKind::Unclustered => "unclustered".to_string(),
    };
    SubCluster {
        kind,
        photos: members.iter().map(|p| p.id.clone()).collect(),
        earliest,
        label,
    }
}
