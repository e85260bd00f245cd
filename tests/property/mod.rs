//! Property-based testing for Declutter
//!
//! Uses proptest to check invariants across randomly generated fingerprint
//! sets, timelines and plans.

use ::declutter::fingerprint::{CombineMode, Fingerprint, PerceptualHash};
use ::declutter::grouping;
use ::declutter::plan::{ExistingLayout, LabelMap, PlanBuilder};
use ::declutter::types::{PhotoId, PhotoRecord};
use ::declutter::utils;
use ::declutter::*;
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// 16-bit components keep neighbourhoods dense enough to be interesting
fn fingerprint_strategy() -> impl Strategy<Value = Fingerprint> {
    (any::<u16>(), any::<u16>()).prop_map(|(g, f)| {
        Fingerprint::new(
            PerceptualHash::from_bytes(g.to_be_bytes().to_vec()),
            PerceptualHash::from_bytes(f.to_be_bytes().to_vec()),
        )
    })
}

fn mode_strategy() -> impl Strategy<Value = CombineMode> {
    prop_oneof![Just(CombineMode::Sum), Just(CombineMode::Max)]
}

/// Photo records with optional timestamps (hour offsets) under `/photos`
fn records_strategy(max: usize) -> impl Strategy<Value = Vec<PhotoRecord>> {
    prop::collection::vec((fingerprint_strategy(), prop::option::weighted(0.8, 0i64..500)), 0..max).prop_map(
        |entries| {
            entries
                .into_iter()
                .enumerate()
                .map(|(i, (fp, hours))| {
                    // A handful of shared file names to force collisions
                    let name = format!("/photos/dir{}/IMG_{:03}.jpg", i, i % 4);
                    let mut record = PhotoRecord::new(PhotoId::new(name)).with_fingerprint(fp);
                    if let Some(h) = hours {
                        let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
                        record = record.with_captured_at(base + Duration::hours(h));
                    }
                    record
                })
                .collect()
        },
    )
}

fn index_of(fingerprints: &[Fingerprint], mode: CombineMode) -> FingerprintIndex {
    let mut index = FingerprintIndex::new(mode);
    for (i, fp) in fingerprints.iter().enumerate() {
        index
            .insert(fp.clone(), PhotoId::new(format!("/p/{:04}.jpg", i)))
            .unwrap();
    }
    index
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_index_query_matches_brute_force(
        fingerprints in prop::collection::vec(fingerprint_strategy(), 1..120),
        target in fingerprint_strategy(),
        radius in 0u32..20,
        mode in mode_strategy(),
    ) {
        let index = index_of(&fingerprints, mode);
        let found: BTreeSet<(PhotoId, u32)> = index.query(&target, radius).into_iter().collect();

        let expected: BTreeSet<(PhotoId, u32)> = fingerprints
            .iter()
            .enumerate()
            .map(|(i, fp)| (PhotoId::new(format!("/p/{:04}.jpg", i)), target.distance(fp, mode)))
            .filter(|(_, d)| *d <= radius)
            .collect();
        prop_assert_eq!(found, expected);
    }

    #[test]
    fn prop_groups_are_the_transitive_closure(
        fingerprints in prop::collection::vec(fingerprint_strategy(), 0..80),
        near in 0u32..6,
        extra in 0u32..6,
        mode in mode_strategy(),
    ) {
        let similar = near + extra;
        let index = index_of(&fingerprints, mode);
        let groups = grouping::group(&index, near, similar).unwrap();

        let mut owner: BTreeMap<PhotoId, usize> = BTreeMap::new();
        for (g, group) in groups.iter().enumerate() {
            prop_assert!(group.len() >= 2);
            prop_assert_eq!(group.representative(), &group.members()[0]);
            for member in group.members() {
                prop_assert!(owner.insert(member.clone(), g).is_none(), "{} in two groups", member);
            }
        }

        // Every pair within the similar threshold shares a group
        for (i, a) in fingerprints.iter().enumerate() {
            for (j, b) in fingerprints.iter().enumerate().skip(i + 1) {
                if a.distance(b, mode) <= similar {
                    let ia = PhotoId::new(format!("/p/{:04}.jpg", i));
                    let ib = PhotoId::new(format!("/p/{:04}.jpg", j));
                    prop_assert!(owner.contains_key(&ia));
                    prop_assert_eq!(owner.get(&ia), owner.get(&ib));
                }
            }
        }

        for group in &groups {
            let tier = if group.max_distance <= near { Severity::Identical } else { Severity::Similar };
            prop_assert_eq!(group.severity, tier);
        }
    }

    #[test]
    fn prop_plans_are_deterministic_and_collision_free(
        records in records_strategy(40),
        occupied in prop::collection::btree_set(0usize..4, 0..4),
    ) {
        let staging = PathBuf::from("/photos/_declutter");
        let existing = ExistingLayout::from_paths(
            &staging,
            occupied.iter().map(|i| staging.join("undated").join(format!("IMG_{:03}.jpg", i))),
        );

        let build = || {
            let (index, _) = FingerprintIndex::build(&records, CombineMode::Sum);
            let groups = grouping::group(&index, 2, 4).unwrap();
            let segmentation = EventSegmenter::new(Duration::hours(6), 3).run(&records, &Default::default());
            PlanBuilder::default()
                .build(&groups, &segmentation, &LabelMap::default(), &existing)
                .unwrap()
        };
        let plan = build();
        prop_assert_eq!(&plan, &build());
        prop_assert!(plan::validate_plan(&plan).is_ok());

        // Every record is placed exactly once, never onto an occupied path
        prop_assert_eq!(plan.len(), records.len());
        for m in plan.iter() {
            prop_assert!(!existing.contains(&m.destination));
            prop_assert!(m.destination.starts_with(&staging));
            prop_assert_eq!(m.destination.parent(), Some(m.destination_folder.as_path()));
        }
    }

    #[test]
    fn prop_segments_respect_the_gap(
        records in records_strategy(60),
        gap_hours in 1i64..48,
    ) {
        let segmentation = EventSegmenter::new(Duration::hours(gap_hours), 2).segment(&records);
        let dated = records.iter().filter(|r| r.captured_at.is_some()).count();
        let placed: usize = segmentation.segments.iter().map(|s| s.len()).sum();
        prop_assert_eq!(placed, dated);
        prop_assert_eq!(segmentation.undated.len(), records.len() - dated);

        for segment in &segmentation.segments {
            for pair in segment.photos.windows(2) {
                prop_assert!(pair[0].captured_at <= pair[1].captured_at);
                prop_assert!(pair[1].captured_at - pair[0].captured_at <= Duration::hours(gap_hours));
            }
        }
        for pair in segmentation.segments.windows(2) {
            prop_assert!(pair[1].start() - pair[0].end() > Duration::hours(gap_hours));
        }
    }

    #[test]
    fn prop_folder_names_are_single_components(label in "\\PC{0,200}") {
        let name = utils::sanitize_folder_name(&label);
        prop_assert!(!name.is_empty());
        prop_assert!(!name.contains('/') && !name.contains('\\'));
        prop_assert!(!name.starts_with('.'));
        prop_assert!(name.chars().count() <= utils::MAX_FOLDER_NAME_CHARS);
        prop_assert_eq!(Path::new(&name).components().count(), 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_apply_then_undo_all_restores_the_tree(
        names in prop::collection::btree_set("[a-z]{1,6}", 1..12),
        hours in prop::collection::vec(prop::option::of(0i64..200), 12),
    ) {
        let dir = TempDir::new().unwrap();
        let declutter = Declutter::open(dir.path().to_path_buf()).unwrap();
        let root = declutter.root().to_path_buf();
        let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

        let mut before = BTreeMap::new();
        let records: Vec<PhotoRecord> = names
            .iter()
            .zip(&hours)
            .enumerate()
            .map(|(i, (name, hour))| {
                let path = root.join(format!("{}.jpg", name));
                fs::write(&path, name.as_bytes()).unwrap();
                before.insert(path.clone(), name.clone());
                let fp = Fingerprint::new(
                    PerceptualHash::from_bytes(vec![i as u8, !(i as u8)]),
                    PerceptualHash::from_bytes(vec![0u8, 0u8]),
                );
                let mut record = PhotoRecord::new(PhotoId::new(path)).with_fingerprint(fp);
                record.captured_at = hour.map(|h| base + Duration::hours(h));
                record
            })
            .collect();

        let outcome = declutter.plan(&PlanInputs { records, ..Default::default() }).unwrap();
        let report = declutter.apply(&outcome.plan).unwrap();
        prop_assert!(report.is_success(), "{}", report.summary());
        prop_assert!(before.keys().all(|p| !p.exists()));

        declutter.undo_all().unwrap();
        for (path, content) in &before {
            prop_assert_eq!(fs::read_to_string(path).unwrap(), content.clone());
        }
        prop_assert!(declutter.journal().active_moves().is_empty());
        prop_assert!(declutter.reconcile().unwrap().is_consistent());
    }
}
