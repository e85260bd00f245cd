//! Integration tests for realistic declutter sessions
//!
//! Each test builds a small library on disk, describes it with records the
//! way the imaging pipeline (or a manifest) would, and checks where the plan
//! puts things and what apply and undo do to the tree.

use crate::support::*;
use ::declutter::config::DeclutterConfig;
use ::declutter::plan::ReasonTag;
use ::declutter::types::{Category, Classification, GeoPoint};
use ::declutter::*;
use chrono::Duration;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Library {
    _dir: TempDir,
    declutter: Declutter,
}

impl Library {
    fn new() -> Self {
        Self::with_config(DeclutterConfig::default())
    }

    fn with_config(config: DeclutterConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let declutter = DeclutterBuilder::new()
            .config(config)
            .build(dir.path().to_path_buf())
            .unwrap();
        Self { _dir: dir, declutter }
    }

    fn root(&self) -> PathBuf {
        self.declutter.root().to_path_buf()
    }

    fn staged(&self, relative: &str) -> PathBuf {
        self.declutter.staging_root().join(relative)
    }

    fn plan(&self, inputs: &PlanInputs) -> Plan {
        self.declutter.plan(inputs).unwrap().plan
    }
}

fn destination_of<'a>(plan: &'a Plan, path: &Path) -> &'a ProposedMove {
    plan.move_for(&PhotoId::new(path)).unwrap()
}

#[test]
fn test_confidence_bands_route_labelled_photos() {
    let lib = Library::new();
    let root = lib.root();
    let records = vec![
        photo(&root, "shot.png", 0xffff_ffff_0000_0000, Some(0)),
        photo(&root, "bill.jpg", 0x0000_0000_ffff_ffff, Some(1)),
        photo(&root, "page.jpg", 0x00ff_00ff_00ff_00ff, Some(2)),
        photo(&root, "beach.jpg", 0xff00_ff00_ff00_ff00, Some(3)),
        photo(&root, "maybe.jpg", 0x0f0f_0f0f_0f0f_0f0f, Some(4)),
    ];
    let label = |name: &str, category, confidence| {
        (
            PhotoId::new(root.join(name)),
            Classification::new(category, confidence).unwrap(),
        )
    };
    let inputs = PlanInputs {
        records,
        labels: [
            label("shot.png", Category::Screenshot, 0.97),
            label("bill.jpg", Category::Receipt, 0.60),
            label("page.jpg", Category::Document, 0.20),
            label("beach.jpg", Category::Photo, 0.99),
            label("maybe.jpg", Category::Photo, 0.70),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let plan = lib.plan(&inputs);

    let shot = destination_of(&plan, &root.join("shot.png"));
    assert_eq!(shot.reason, ReasonTag::Classified(Category::Screenshot));
    assert_eq!(shot.destination_folder, lib.staged("classified/screenshots"));

    let bill = destination_of(&plan, &root.join("bill.jpg"));
    assert_eq!(bill.reason, ReasonTag::Review(Category::Receipt));
    assert_eq!(bill.destination_folder, lib.staged("review/receipts"));

    let page = destination_of(&plan, &root.join("page.jpg"));
    assert_eq!(page.reason, ReasonTag::CatchAll);
    assert_eq!(page.destination_folder, lib.staged("misc/unsorted"));

    // A confident "photo" label leaves the photo to event placement
    let beach = destination_of(&plan, &root.join("beach.jpg"));
    assert_eq!(beach.reason, ReasonTag::Event);
    assert!(beach.destination_folder.starts_with(lib.staged("events")));

    let maybe = destination_of(&plan, &root.join("maybe.jpg"));
    assert_eq!(maybe.reason, ReasonTag::Review(Category::Photo));
}

#[test]
fn test_duplicate_placement_wins_over_label() {
    let lib = Library::new();
    let root = lib.root();
    let records = vec![
        photo(&root, "a.png", 0xffff_ffff_0000_0000, Some(0)),
        photo(&root, "a_again.png", 0xffff_ffff_0000_0001, Some(0)),
    ];
    let labels = [(
        PhotoId::new(root.join("a_again.png")),
        Classification::new(Category::Screenshot, 0.99).unwrap(),
    )]
    .into_iter()
    .collect();
    let plan = lib.plan(&PlanInputs {
        records,
        labels,
        ..Default::default()
    });

    let copy = destination_of(&plan, &root.join("a_again.png"));
    assert_eq!(copy.reason, ReasonTag::IdenticalDuplicate);
    assert_eq!(copy.destination_folder, lib.staged("duplicates/identical"));
    // The representative still goes to its event
    assert_eq!(destination_of(&plan, &root.join("a.png")).reason, ReasonTag::Event);
    assert_eq!(plan.len(), 2);
}

#[test]
fn test_similar_tier_is_graded() {
    let lib = Library::new();
    let root = lib.root();
    let records = vec![
        photo(&root, "big.jpg", 0xffff_ffff_0000_0000, Some(0)),
        // 16 bits away: similar, not identical
        photo(&root, "edit.jpg", 0xffff_ffff_ffff_0000, Some(0)),
    ];
    let outcome = lib
        .declutter
        .plan(&PlanInputs {
            records,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.groups[0].severity, Severity::Similar);
    assert_eq!(outcome.dedup.similar_groups, 1);
    assert_eq!(outcome.dedup.duplicate_photos, 1);
    let edit = destination_of(&outcome.plan, &root.join("edit.jpg"));
    assert_eq!(edit.destination_folder, lib.staged("duplicates/similar"));
}

#[test]
fn test_gap_splits_events_and_names_them() {
    let lib = Library::new();
    let root = lib.root();
    let mut records = vec![
        photo(&root, "trip/1.jpg", 0xffff_ffff_0000_0000, Some(0)),
        photo(&root, "trip/2.jpg", 0x0000_0000_ffff_ffff, Some(5)),
        // Three days later
        photo(&root, "party/1.jpg", 0x00ff_00ff_00ff_00ff, Some(72)),
        photo(&root, "party/2.jpg", 0xff00_ff00_ff00_ff00, Some(73)),
    ];
    records[0].location = Some(GeoPoint {
        latitude: 38.72,
        longitude: -9.14,
        place_name: Some("Lisbon".to_string()),
    });
    let undated = photo(&root, "scan.jpg", 0x0f0f_0f0f_f0f0_f0f0, None);
    records.push(undated);

    let outcome = lib
        .declutter
        .plan(&PlanInputs {
            records,
            ..Default::default()
        })
        .unwrap();
    let labels: Vec<&str> = outcome
        .segmentation
        .segments
        .iter()
        .map(|s| s.label.as_str())
        .collect();
    assert_eq!(labels, vec!["2024-06-01 Lisbon", "2024-06-04"]);

    let trip = destination_of(&outcome.plan, &root.join("trip/2.jpg"));
    assert_eq!(trip.destination_folder, lib.staged("events/2024-06-01 Lisbon"));
    let scan = destination_of(&outcome.plan, &root.join("scan.jpg"));
    assert_eq!(scan.reason, ReasonTag::Undated);
    assert_eq!(scan.destination_folder, lib.staged("undated"));
    assert_eq!(outcome.report.count(types::IssueStage::Timeline), 1);
}

#[test]
fn test_large_event_is_split_into_visual_sub_clusters() {
    let lib = Library::with_config(DeclutterConfig {
        cluster_epsilon: Some(0.2),
        ..Default::default()
    });
    let root = lib.root();

    // 25 photos in one afternoon: half "sea", half "indoors", one odd one out
    let mut records = Vec::new();
    for i in 0..25u64 {
        let mut record = photo(&root, &format!("day/{:02}.jpg", i), 0, None);
        record.fingerprint = None;
        record.captured_at = Some(base_time() + Duration::minutes(i as i64 * 5));
        let features = match i {
            24 => vec![0.0, 0.0, 1.0],
            i if i % 2 == 0 => vec![1.0, 0.05 * (i % 3) as f32, 0.0],
            _ => vec![0.05 * (i % 3) as f32, 1.0, 0.0],
        };
        records.push(record.with_features(features));
    }

    let outcome = lib
        .declutter
        .plan(&PlanInputs {
            records,
            ..Default::default()
        })
        .unwrap();
    assert!(outcome.groups.is_empty());
    assert_eq!(outcome.segmentation.segments.len(), 1);
    let segment = &outcome.segmentation.segments[0];
    assert!(segment.is_subdivided());

    let event = lib.staged("events/2024-06-01");
    let mut folders: Vec<PathBuf> = outcome
        .plan
        .iter()
        .filter(|m| matches!(m.reason, ReasonTag::Event | ReasonTag::Unclustered))
        .map(|m| m.destination_folder.clone())
        .collect();
    folders.sort();
    folders.dedup();
    assert!(folders.contains(&event.join("unclustered")));
    assert!(folders.contains(&event.join("2024-06-01")));
    assert!(folders.contains(&event.join("2024-06-01 (2)")));

    let odd = destination_of(&outcome.plan, &root.join("day/24.jpg"));
    assert_eq!(odd.reason, ReasonTag::Unclustered);
}

#[test]
fn test_existing_staging_content_is_never_overwritten() {
    let lib = Library::new();
    let root = lib.root();
    fs::create_dir_all(lib.staged("undated")).unwrap();
    fs::write(lib.staged("undated/old.jpg"), b"from last time").unwrap();
    fs::write(lib.staged("undated/old_1.jpg"), b"from the time before").unwrap();

    let records = vec![photo(&root, "old.jpg", 0xffff_ffff_0000_0000, None)];
    let plan = lib.plan(&PlanInputs {
        records,
        ..Default::default()
    });
    assert_eq!(plan.moves[0].destination, lib.staged("undated/old_2.jpg"));

    lib.declutter.apply(&plan).unwrap();
    assert_eq!(fs::read(lib.staged("undated/old.jpg")).unwrap(), b"from last time");
    assert_eq!(fs::read(lib.staged("undated/old_2.jpg")).unwrap(), b"old.jpg");
}

#[test]
fn test_manifest_round_trip_drives_planning() {
    let lib = Library::new();
    let root = lib.root();
    let manifest = PhotoManifest {
        photos: vec![
            photo(&root, "a.jpg", 0xffff_ffff_0000_0000, Some(0)),
            photo(&root, "b.jpg", 0xffff_ffff_0000_0000, Some(1)),
        ],
        labels: Default::default(),
        captions: [(PhotoId::new(root.join("a.jpg")), "harbour walk".to_string())]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    let path = root.join("manifest.json");
    manifest.save(&path).unwrap();

    let loaded = PhotoManifest::load(&path).unwrap();
    assert_eq!(loaded, manifest);
    let outcome = lib.declutter.plan(&PlanInputs::from_manifest(&loaded)).unwrap();
    assert_eq!(outcome.groups.len(), 1);
    assert_eq!(outcome.segmentation.segments[0].label, "2024-06-01 harbour walk");
}

#[test]
fn test_manifest_with_unreadable_fingerprint_still_plans() {
    let lib = Library::new();
    let root = lib.root();
    let entry = |name: &str, gradient: &str| {
        format!(
            r#"{{"id": {:?}, "fingerprint": {{"gradient": {:?}, "frequency": "0f0f0f0f0f0f0f0f"}},
               "captured_at": "2024-06-01T10:00:00Z"}}"#,
            root.join(name).to_str().unwrap(),
            gradient
        )
    };
    let path = root.join("manifest.json");
    fs::write(
        &path,
        format!(
            r#"{{"photos": [{}, {}, {}]}}"#,
            entry("a.jpg", "ff00ff00ff00ff00"),
            entry("b.jpg", "ff00ff00ff00ff00"),
            entry("c.jpg", "xyz")
        ),
    )
    .unwrap();

    let manifest = PhotoManifest::load(&path).unwrap();
    assert_eq!(manifest.photos.len(), 3);
    assert!(manifest.photos[2].fingerprint.is_none());
    assert_eq!(manifest.report.issues.len(), 1);
    assert_eq!(manifest.report.issues[0].photo, root.join("c.jpg"));
    assert!(manifest.report.issues[0].message.contains("invalid hex"));

    let outcome = lib.declutter.plan(&PlanInputs::from_manifest(&manifest)).unwrap();
    assert_eq!(outcome.groups.len(), 1);
    assert!(!outcome.groups[0].contains(&PhotoId::new(root.join("c.jpg"))));
    assert!(outcome.report.issues.iter().any(|i| i.message.contains("invalid hex")));
    assert_eq!(outcome.plan.len(), 3);
}

#[test]
fn test_undo_single_record_and_history() {
    let lib = Library::new();
    let root = lib.root();
    let records = vec![
        photo(&root, "a.jpg", 0xffff_ffff_0000_0000, Some(0)),
        photo(&root, "b.jpg", 0x0000_0000_ffff_ffff, Some(1)),
    ];
    let plan = lib.plan(&PlanInputs {
        records,
        ..Default::default()
    });
    let report = lib.declutter.apply(&plan).unwrap();
    let first = report.applied[0].clone();

    let inverse = lib.declutter.undo(first.seq).unwrap();
    assert_eq!(inverse.kind, OperationKind::Undo);
    assert_eq!(inverse.reverses, Some(first.seq));
    assert!(first.source.exists());
    assert!(!first.destination.exists());

    // Undoing the same record again is refused and changes nothing
    assert!(matches!(
        lib.declutter.undo(first.seq),
        Err(DeclutterError::UndoRejected(_))
    ));
    assert!(matches!(
        lib.declutter.undo(999),
        Err(DeclutterError::RecordNotFound(999))
    ));
    assert_eq!(lib.declutter.history().len(), 3);
    assert_eq!(lib.declutter.journal().active_moves().len(), 1);
}

#[test]
fn test_resume_after_cancel() {
    let lib = Library::new();
    let root = lib.root();
    let records: Vec<_> = (0..6u64)
        .map(|i| photo(&root, &format!("{}.jpg", i), (i + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15), None))
        .collect();
    let plan = lib.plan(&PlanInputs {
        records,
        ..Default::default()
    });

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = lib.declutter.apply_with_cancel(&plan, cancel).unwrap();
    assert!(report.cancelled);
    assert!(report.applied.is_empty());

    let first_half = Plan {
        staging_root: plan.staging_root.clone(),
        moves: plan.moves[..3].to_vec(),
    };
    lib.declutter.apply(&first_half).unwrap();

    let rest = lib.declutter.resume(&plan, CancelToken::new()).unwrap();
    assert!(rest.is_success(), "{}", rest.summary());
    assert_eq!(rest.applied.len(), 3);
    assert_eq!(lib.declutter.journal().active_moves().len(), 6);
}

#[test]
fn test_prune_makes_old_moves_permanent() {
    let lib = Library::new();
    let root = lib.root();
    let records = vec![
        photo(&root, "a.jpg", 0xffff_ffff_0000_0000, None),
        photo(&root, "b.jpg", 0x0000_0000_ffff_ffff, None),
    ];
    let plan = lib.plan(&PlanInputs {
        records,
        ..Default::default()
    });
    let report = lib.declutter.apply(&plan).unwrap();

    let removed = lib.declutter.prune_through(report.applied[0].seq).unwrap();
    assert_eq!(removed, 1);
    assert!(lib.declutter.undo(report.applied[0].seq).is_err());

    // Only the second move is left to undo
    let undone = lib.declutter.undo_all().unwrap();
    assert_eq!(undone.len(), 1);
    assert!(root.join("b.jpg").exists());
    assert!(!root.join("a.jpg").exists());
}

#[test]
fn test_config_file_is_honoured() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("declutter.json");
    fs::write(&config_path, r#"{ "staging_dir_name": "Sorted", "gap_threshold_secs": 3600 }"#).unwrap();
    let config = DeclutterConfig::load(&config_path).unwrap();

    let declutter = DeclutterBuilder::new()
        .config(config)
        .build(dir.path().to_path_buf())
        .unwrap();
    assert!(declutter.staging_root().ends_with("Sorted"));

    let root = declutter.root().to_path_buf();
    let records = vec![
        photo(&root, "a.jpg", 0xffff_ffff_0000_0000, Some(0)),
        photo(&root, "b.jpg", 0x0000_0000_ffff_ffff, Some(2)),
    ];
    let outcome = declutter
        .plan(&PlanInputs {
            records,
            ..Default::default()
        })
        .unwrap();
    // One hour gap threshold: two hours apart is two events
    assert_eq!(outcome.segmentation.segments.len(), 2);
}
