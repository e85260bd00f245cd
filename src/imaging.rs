//! Photo analysis: fingerprints, metadata and feature vectors
//!
//! The planning engines take [`PhotoRecord`]s as input. They can come from an
//! external pipeline as a JSON [`PhotoManifest`], or from [`Analyzer`], which
//! builds them from the files themselves:
//!
//! - a gradient hash (dHash) and a DCT-mean hash (pHash), 64 bits each, via
//!   `image_hasher`
//! - pixel dimensions via `image`
//! - capture time (`DateTimeOriginal`, falling back to `DateTime`) and GPS
//!   position via EXIF
//! - a coarse RGB histogram as the clustering feature vector
//!
//! Decoding runs on a dedicated rayon pool of `parallel_workers` threads, one
//! batch of `batch_size` photos at a time, which bounds how many decoded
//! images are alive at once.
//!
//! A photo that cannot be decoded keeps its record (metadata may still place
//! it on the timeline) but has no fingerprint; the failure is reported as a
//! per-photo issue. RAW and HEIC files are not decoded at all.

use crate::config::DeclutterConfig;
use crate::events::CaptionMap;
use crate::error::{DeclutterError, Result};
use crate::fingerprint::{Fingerprint, PerceptualHash};
use crate::plan::LabelMap;
use crate::scanner::ScannedFile;
use crate::types::{
    BatchReport, Classification, GeoPoint, IssueStage, PhotoId, PhotoRecord, ProgressCallback,
    ProgressInfo,
};
use crate::utils;
use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{Exif, In, Reader, Tag, Value};
use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, instrument, trace, warn};

/// Hash side length; 8x8 gives 64-bit hashes
const HASH_SIZE: u32 = 8;

/// Histogram bins per colour channel
const HISTOGRAM_BINS: usize = 4;

/// Records plus the issues raised while building them
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    /// One record per input file, in input order
    pub records: Vec<PhotoRecord>,
    /// Per-photo failures
    pub report: BatchReport,
}

/// Builds photo records from image files
pub struct Analyzer {
    pool: rayon::ThreadPool,
    batch_size: usize,
    progress: Option<ProgressCallback>,
}

impl Analyzer {
    /// Analyzer sized by `parallel_workers` and `batch_size`
    pub fn new(config: &DeclutterConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel_workers.max(1))
            .thread_name(|i| format!("declutter-imaging-{}", i))
            .build()
            .map_err(|e| DeclutterError::internal(format!("cannot build worker pool: {}", e)))?;
        Ok(Self {
            pool,
            batch_size: config.batch_size.max(1),
            progress: None,
        })
    }

    /// Report progress after every batch
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Analyse every file
    #[instrument(skip_all, fields(files = files.len()))]
    pub fn analyze(&self, files: &[ScannedFile]) -> AnalysisResult {
        let mut result = AnalysisResult::default();
        let mut processed = 0;

        for batch in files.chunks(self.batch_size) {
            let outcomes: Vec<(PhotoRecord, BatchReport)> = self
                .pool
                .install(|| batch.par_iter().map(analyze_file).collect());
            for (record, report) in outcomes {
                result.records.push(record);
                result.report.extend(report);
            }

            processed += batch.len();
            if let Some(progress) = &self.progress {
                progress(ProgressInfo {
                    operation: "Analysing photos".to_string(),
                    current_item: batch.last().map(|f| f.id.to_string()),
                    processed,
                    total: Some(files.len()),
                });
            }
            debug!("Analysed {}/{} photos", processed, files.len());
        }

        info!(
            "Analysed {} photos ({} with fingerprints, {} dated, {} issues)",
            result.records.len(),
            result.records.iter().filter(|r| r.fingerprint.is_some()).count(),
            result.records.iter().filter(|r| r.captured_at.is_some()).count(),
            result.report.issues.len()
        );
        result
    }
}

/// Build one record; never fails, problems go to the report
fn analyze_file(file: &ScannedFile) -> (PhotoRecord, BatchReport) {
    let path = file.id.path();
    let mut report = BatchReport::default();
    let mut record = PhotoRecord::new(file.id.clone());
    record.size_bytes = file.size_bytes;

    match read_exif(path) {
        Some(exif) => {
            record.captured_at = capture_time(&exif);
            record.location = gps_position(&exif);
        }
        None => trace!("No EXIF in {:?}", path),
    }

    if file.is_raw() || file.is_heic() {
        let err = DeclutterError::corrupt_fingerprint(path, "RAW and HEIC decoding is not supported");
        report.push_error(path, IssueStage::Scan, &err);
        return (record, report);
    }

    match image::open(path) {
        Ok(img) => {
            record.resolution = Some(crate::types::Resolution {
                width: img.width(),
                height: img.height(),
            });
            record.fingerprint = Some(fingerprint_image(&img));
            record.features = Some(colour_histogram(&img));
        }
        Err(e) => {
            warn!("Cannot decode {:?}: {}", path, e);
            let err = DeclutterError::corrupt_fingerprint(path, e.to_string());
            report.push_error(path, IssueStage::Scan, &err);
        }
    }
    (record, report)
}

fn hasher(alg: HashAlg, dct: bool) -> Hasher {
    let config = HasherConfig::new().hash_size(HASH_SIZE, HASH_SIZE).hash_alg(alg);
    if dct {
        config.preproc_dct().to_hasher()
    } else {
        config.to_hasher()
    }
}

/// Gradient + DCT-mean fingerprint of a decoded image
pub fn fingerprint_image(img: &DynamicImage) -> Fingerprint {
    let gradient = hasher(HashAlg::Gradient, false).hash_image(img);
    let frequency = hasher(HashAlg::Mean, true).hash_image(img);
    Fingerprint::new(
        PerceptualHash::from_bytes(gradient.as_bytes().to_vec()),
        PerceptualHash::from_bytes(frequency.as_bytes().to_vec()),
    )
}

/// Normalised RGB histogram of a thumbnail, `HISTOGRAM_BINS^3` values
pub fn colour_histogram(img: &DynamicImage) -> Vec<f32> {
    let thumb = img.thumbnail(64, 64).to_rgb8();
    let mut bins = vec![0f32; HISTOGRAM_BINS * HISTOGRAM_BINS * HISTOGRAM_BINS];
    let bin = |v: u8| (v as usize * HISTOGRAM_BINS) / 256;
    for pixel in thumb.pixels() {
        let [r, g, b] = pixel.0;
        bins[(bin(r) * HISTOGRAM_BINS + bin(g)) * HISTOGRAM_BINS + bin(b)] += 1.0;
    }
    let total: f32 = bins.iter().sum();
    if total > 0.0 {
        bins.iter_mut().for_each(|b| *b /= total);
    }
    bins
}

fn read_exif(path: &Path) -> Option<Exif> {
    let file = File::open(path).ok()?;
    Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()
}

fn ascii(exif: &Exif, tag: Tag) -> Option<String> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Ascii(values) => values
            .first()
            .map(|v| String::from_utf8_lossy(v).trim_end_matches('\0').trim().to_string()),
        _ => None,
    }
}

fn capture_time(exif: &Exif) -> Option<DateTime<Utc>> {
    ascii(exif, Tag::DateTimeOriginal)
        .and_then(|s| parse_exif_datetime(&s))
        .or_else(|| ascii(exif, Tag::DateTime).and_then(|s| parse_exif_datetime(&s)))
}

/// Parse `YYYY:MM:DD HH:MM:SS`; EXIF carries no zone, the value is taken as UTC
pub fn parse_exif_datetime(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|dt| dt.and_utc())
}

fn gps_position(exif: &Exif) -> Option<GeoPoint> {
    let coordinate = |tag: Tag, reference: Tag, negative: &str| -> Option<f64> {
        let degrees = match &exif.get_field(tag, In::PRIMARY)?.value {
            Value::Rational(parts) if parts.len() >= 3 => dms_to_degrees(
                parts[0].to_f64(),
                parts[1].to_f64(),
                parts[2].to_f64(),
            ),
            _ => return None,
        };
        let sign = match ascii(exif, reference) {
            Some(r) if r.eq_ignore_ascii_case(negative) => -1.0,
            _ => 1.0,
        };
        degrees.is_finite().then_some(sign * degrees)
    };

    let latitude = coordinate(Tag::GPSLatitude, Tag::GPSLatitudeRef, "S")?;
    let longitude = coordinate(Tag::GPSLongitude, Tag::GPSLongitudeRef, "W")?;
    Some(GeoPoint {
        latitude,
        longitude,
        place_name: None,
    })
}

/// Degrees, minutes, seconds to decimal degrees
pub fn dms_to_degrees(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

/// Photo records, labels and captions supplied by an external pipeline
///
/// ```json
/// {
///   "photos": [{"id": "/p/a.jpg", "fingerprint": {"gradient": "ff00..", "frequency": "0f0f.."},
///               "captured_at": "2024-06-01T10:00:00Z", "size_bytes": 1024}],
///   "labels": {"/p/a.jpg": {"category": "screenshot", "confidence": 0.93}},
///   "captions": {"/p/a.jpg": "beach at sunset"}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoManifest {
    /// Photo records
    #[serde(default)]
    pub photos: Vec<PhotoRecord>,
    /// Classification labels by photo
    #[serde(default)]
    pub labels: BTreeMap<PhotoId, Classification>,
    /// Captions by photo
    #[serde(default)]
    pub captions: BTreeMap<PhotoId, String>,
    /// Entries whose fingerprint could not be read
    #[serde(skip)]
    pub report: BatchReport,
}

/// Manifest as written, with photo entries left unparsed
#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    photos: Vec<serde_json::Value>,
    #[serde(default)]
    labels: BTreeMap<PhotoId, Classification>,
    #[serde(default)]
    captions: BTreeMap<PhotoId, String>,
}

impl PhotoManifest {
    /// Read a manifest, rejecting repeated photos and out-of-range confidences
    ///
    /// A photo whose fingerprint is malformed is kept without one, so it
    /// stays out of duplicate detection, and the problem lands in
    /// [`PhotoManifest::report`]. Any other malformed field rejects the file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut report = BatchReport::default();
        let photos = raw
            .photos
            .into_iter()
            .map(|entry| parse_photo(entry, &mut report))
            .collect::<Result<Vec<_>>>()?;

        let manifest = Self {
            photos,
            labels: raw.labels,
            captions: raw.captions,
            report,
        };
        manifest.validate()?;
        debug!(
            "Loaded manifest with {} photos, {} labels, {} captions, {} unreadable fingerprints",
            manifest.photos.len(),
            manifest.labels.len(),
            manifest.captions.len(),
            manifest.report.issues.len()
        );
        Ok(manifest)
    }

    /// Write the manifest atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        utils::atomic_write(path, &serde_json::to_vec_pretty(self)?)
    }

    /// Check the manifest for repeated photos and invalid labels
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for photo in &self.photos {
            if !seen.insert(&photo.id) {
                return Err(DeclutterError::DuplicatePhoto(photo.id.path().to_path_buf()));
            }
        }
        for label in self.labels.values() {
            Classification::new(label.category, label.confidence)?;
        }
        Ok(())
    }

    /// Labels in the form the plan builder takes
    pub fn label_map(&self) -> LabelMap {
        self.labels.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Captions in the form the segmenter takes
    pub fn caption_map(&self) -> CaptionMap {
        self.captions.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Parse one manifest photo, retrying without a fingerprint that will not parse
fn parse_photo(mut entry: serde_json::Value, report: &mut BatchReport) -> Result<PhotoRecord> {
    let err = match serde_json::from_value::<PhotoRecord>(entry.clone()) {
        Ok(record) => return Ok(record),
        Err(e) => e,
    };
    let Some(fingerprint) = entry.as_object_mut().and_then(|o| o.remove("fingerprint")) else {
        return Err(err.into());
    };
    let record: PhotoRecord = serde_json::from_value(entry).map_err(|_| err)?;

    let problem = DeclutterError::corrupt_fingerprint(record.id.path(), fingerprint_problem(fingerprint));
    warn!("{}", problem);
    report.push_error(record.id.path(), IssueStage::Scan, &problem);
    Ok(record)
}

fn fingerprint_problem(value: serde_json::Value) -> String {
    #[derive(Deserialize)]
    struct HexPair {
        gradient: String,
        frequency: String,
    }

    match serde_json::from_value::<HexPair>(value) {
        Ok(pair) => match Fingerprint::from_hex(&pair.gradient, &pair.frequency) {
            Err(DeclutterError::CorruptFingerprint { reason, .. }) => reason,
            Err(e) => e.to_string(),
            Ok(_) => "unreadable fingerprint".to_string(),
        },
        Err(e) => format!("malformed fingerprint: {}", e),
    }
}
