//! Main test module for Declutter
//!
//! This module includes all test suites:
//! - Integration tests for planning and execution scenarios
//! - Chaos tests for crashes and tampering between runs
//! - Property-based tests for the index, grouping, plans and undo

pub mod chaos;
pub mod integration;
pub mod property;

/// Fixtures shared by the suites
pub mod support {
    use ::declutter::fingerprint::Fingerprint;
    use ::declutter::types::{PhotoId, PhotoRecord};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::fs;
    use std::path::Path;

    /// Noon on 2024-06-01, the base of every test timeline
    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// 64-bit fingerprint from two integers
    pub fn fingerprint(gradient: u64, frequency: u64) -> Fingerprint {
        Fingerprint::from_hex(&format!("{:016x}", gradient), &format!("{:016x}", frequency)).unwrap()
    }

    /// Create `name` under `root` (with parent folders) and return its record
    pub fn photo(root: &Path, name: &str, gradient: u64, offset_hours: Option<i64>) -> PhotoRecord {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, name.as_bytes()).unwrap();
        let mut record = PhotoRecord::new(PhotoId::new(path)).with_fingerprint(fingerprint(gradient, 0x0f0f_0f0f_0f0f_0f0f));
        record.size_bytes = name.len() as u64;
        if let Some(hours) = offset_hours {
            record = record.with_captured_at(base_time() + Duration::hours(hours));
        }
        record
    }

    /// Files under `dir`, relative and sorted
    pub fn tree(dir: &Path) -> Vec<String> {
        let mut files: Vec<String> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(dir).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        files.sort();
        files
    }
}

#[cfg(test)]
mod edge_cases {
    use super::support::*;
    use ::declutter::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let declutter = Declutter::open(temp_dir.path().to_path_buf()).unwrap();

        let outcome = declutter.plan_directory().unwrap();
        assert!(outcome.plan.is_empty());
        assert!(outcome.groups.is_empty());
        assert!(outcome.segmentation.segments.is_empty());

        let report = declutter.apply(&outcome.plan).unwrap();
        assert!(report.is_success());
        assert!(declutter.history().is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let declutter = Declutter::open(temp_dir.path().to_path_buf()).unwrap();
        let root = declutter.root().to_path_buf();

        let special_names = [
            "photo with spaces.jpg",
            "photo-with-dashes.jpg",
            "photo.with.dots.jpg",
            "photo(with)parens.jpg",
            "photo[with]brackets.jpg",
            "fotó ünïcödé.jpg",
        ];
        let records: Vec<_> = special_names
            .iter()
            .enumerate()
            .map(|(i, name)| photo(&root, name, 0xffff_0000_ffff_0000 ^ (0xff << (i * 8)), Some(i as i64)))
            .collect();

        let outcome = declutter
            .plan(&PlanInputs {
                records,
                ..Default::default()
            })
            .unwrap();
        let report = declutter.apply(&outcome.plan).unwrap();
        assert!(report.is_success(), "{}", report.summary());

        declutter.undo_all().unwrap();
        for name in &special_names {
            assert!(root.join(name).exists(), "{} was not restored", name);
        }
    }

    #[test]
    fn test_same_file_name_in_different_folders() {
        let temp_dir = TempDir::new().unwrap();
        let declutter = Declutter::open(temp_dir.path().to_path_buf()).unwrap();
        let root = declutter.root().to_path_buf();

        // Three cameras all call it IMG_0001.jpg; same event, distinct images
        let records = vec![
            photo(&root, "phone/IMG_0001.jpg", 0xffff_ffff_0000_0000, Some(0)),
            photo(&root, "camera/IMG_0001.jpg", 0x0000_0000_ffff_ffff, Some(1)),
            photo(&root, "tablet/IMG_0001.jpg", 0x00ff_00ff_00ff_00ff, Some(2)),
        ];
        let outcome = declutter
            .plan(&PlanInputs {
                records,
                ..Default::default()
            })
            .unwrap();

        let mut names: Vec<String> = outcome
            .plan
            .iter()
            .map(|m| m.destination.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["IMG_0001.jpg", "IMG_0001_1.jpg", "IMG_0001_2.jpg"]);

        declutter.apply(&outcome.plan).unwrap();
        assert_eq!(tree(&root.join("phone")), Vec::<String>::new());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = Declutter::open(temp_dir.path().join("does-not-exist"));
        assert!(matches!(result, Err(DeclutterError::Io(_))));
    }

    #[test]
    fn test_file_vanishing_between_plan_and_apply() {
        let temp_dir = TempDir::new().unwrap();
        let declutter = Declutter::open(temp_dir.path().to_path_buf()).unwrap();
        let root = declutter.root().to_path_buf();

        let records = vec![
            photo(&root, "a.jpg", 0xffff_0000_ffff_0000, Some(0)),
            photo(&root, "b.jpg", 0x0000_ffff_0000_ffff, Some(1)),
        ];
        let outcome = declutter
            .plan(&PlanInputs {
                records,
                ..Default::default()
            })
            .unwrap();
        fs::remove_file(root.join("a.jpg")).unwrap();

        let report = declutter.apply(&outcome.plan).unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("a.jpg"));
        assert!(declutter.reconciliation().is_consistent());
    }
}
