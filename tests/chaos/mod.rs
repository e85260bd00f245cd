//! Chaos testing for the move journal
//!
//! Simulates what goes wrong between runs: a crash after the journal append
//! but before the rename, a torn final line, a user moving or deleting staged
//! files by hand, and several threads executing at once. After each, the
//! journal must notice, block further moves, and recover once acknowledged.

use ::declutter::reconcile::DiscrepancyKind;
use ::declutter::*;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// A photo folder with a handful of loose files and an open instance
struct ChaosLibrary {
    dir: TempDir,
    declutter: Declutter,
    files: Vec<PathBuf>,
}

impl ChaosLibrary {
    fn new(count: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let declutter = Declutter::open(dir.path().to_path_buf()).unwrap();
        let files = (0..count)
            .map(|i| {
                let path = declutter.root().join(format!("IMG_{:04}.jpg", i));
                fs::write(&path, format!("photo {}", i)).unwrap();
                path
            })
            .collect();
        Self {
            dir,
            declutter,
            files,
        }
    }

    fn reopen(&mut self) {
        self.declutter = Declutter::open(self.dir.path().to_path_buf()).unwrap();
    }

    fn staged(&self, file: &Path) -> PathBuf {
        self.declutter
            .staging_root()
            .join("misc")
            .join(file.file_name().unwrap())
    }

    fn move_one(&self, file: &Path) -> Result<MoveRecord> {
        let destination = self.staged(file);
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        self.declutter.journal().propose_move(file, &destination)
    }

    fn append_raw(&self, line: &str) {
        let mut journal = OpenOptions::new()
            .append(true)
            .open(self.declutter.journal().journal_path())
            .unwrap();
        journal.write_all(line.as_bytes()).unwrap();
    }

    /// Journal a move as if the process died right before the rename
    fn crash_before_rename(&self, file: &Path) {
        let seq = self.declutter.history().iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        let record = MoveRecord {
            seq,
            kind: OperationKind::Move,
            source: file.to_path_buf(),
            destination: self.staged(file),
            timestamp: Utc::now(),
            reverses: None,
        };
        self.append_raw(&format!("{}\n", serde_json::to_string(&record).unwrap()));
    }
}

#[test]
fn test_crash_between_append_and_rename_blocks_until_acknowledged() {
    let mut lib = ChaosLibrary::new(3);
    lib.move_one(&lib.files[0]).unwrap();
    lib.crash_before_rename(&lib.files[1]);
    lib.reopen();

    let report = lib.declutter.reconciliation();
    assert!(report.blocks_mutation());
    assert_eq!(report.discrepancies.len(), 1);
    assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::NotApplied);
    assert_eq!(report.discrepancies[0].seq, Some(2));

    // Everything that would move a file is refused
    let err = lib.move_one(&lib.files[2]).unwrap_err();
    assert!(matches!(err, DeclutterError::LogInconsistency(_)));
    assert!(lib.declutter.undo_last().is_err());
    assert!(lib.files[2].exists());

    // Acknowledging unblocks, and survives a restart
    let acknowledged = lib.declutter.acknowledge_inconsistencies().unwrap();
    assert!(!acknowledged.blocks_mutation());
    lib.reopen();
    assert!(!lib.declutter.reconciliation().blocks_mutation());
    lib.move_one(&lib.files[2]).unwrap();
}

#[test]
fn test_torn_final_line_is_reported_and_appends_continue() {
    let mut lib = ChaosLibrary::new(2);
    lib.move_one(&lib.files[0]).unwrap();
    lib.append_raw(r#"{"seq":2,"kind":"mo"#);
    lib.reopen();

    let report = lib.declutter.reconciliation();
    assert!(report.blocks_mutation());
    assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::Unparsable);
    assert_eq!(lib.declutter.history().len(), 1);

    lib.declutter.acknowledge_inconsistencies().unwrap();
    let record = lib.move_one(&lib.files[1]).unwrap();
    assert_eq!(record.seq, 2);

    // The new record starts on its own line and is readable after a restart
    lib.reopen();
    assert_eq!(lib.declutter.history().len(), 2);
    assert!(lib.declutter.reconciliation().unacknowledged().next().is_none());
}

#[test]
fn test_user_tampering_is_detected() {
    let mut lib = ChaosLibrary::new(3);
    let moved: Vec<MoveRecord> = lib.files.iter().map(|f| lib.move_one(f).unwrap()).collect();

    // Put one back by hand, delete one, and copy one back
    fs::rename(&moved[0].destination, &moved[0].source).unwrap();
    fs::remove_file(&moved[1].destination).unwrap();
    fs::copy(&moved[2].destination, &moved[2].source).unwrap();
    lib.reopen();

    let mut kinds: Vec<DiscrepancyKind> = lib
        .declutter
        .reconciliation()
        .discrepancies
        .iter()
        .map(|d| d.kind)
        .collect();
    kinds.sort();
    assert_eq!(
        kinds,
        vec![
            DiscrepancyKind::NotApplied,
            DiscrepancyKind::Lost,
            DiscrepancyKind::BothPresent
        ]
    );

    // A fresh reconcile agrees with the one taken at open
    let again = lib.declutter.reconcile().unwrap();
    assert_eq!(again.discrepancies.len(), 3);
}

#[test]
fn test_concurrent_executors_never_share_a_destination() {
    let lib = ChaosLibrary::new(16);
    let destination = lib.declutter.staging_root().join("misc").join("winner.jpg");
    fs::create_dir_all(destination.parent().unwrap()).unwrap();

    let outcomes: Vec<Result<MoveRecord>> = std::thread::scope(|scope| {
        let handles: Vec<_> = lib
            .files
            .iter()
            .map(|file| {
                let journal = lib.declutter.journal();
                let destination = &destination;
                scope.spawn(move || journal.propose_move(file, destination))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(outcomes
        .iter()
        .filter_map(|o| o.as_ref().err())
        .all(|e| matches!(e, DeclutterError::DestinationConflict { .. })));
    assert_eq!(lib.files.iter().filter(|f| f.exists()).count(), 15);
    assert!(lib.declutter.reconcile().unwrap().is_consistent());
}

#[test]
fn test_random_moves_and_undos_stay_consistent() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut lib = ChaosLibrary::new(24);

    for round in 0..200 {
        let op = rng.random_range(0..10);
        let file = lib.files[rng.random_range(0..lib.files.len())].clone();
        match op {
            0..=5 => {
                // Fails harmlessly if already moved
                let _ = lib.move_one(&file);
            }
            6..=7 => {
                let _ = lib.declutter.undo_last();
            }
            8 => {
                let history = lib.declutter.history();
                if !history.is_empty() {
                    let seq = history[rng.random_range(0..history.len())].seq;
                    // Rejected when already undone or not a move
                    let _ = lib.declutter.undo(seq);
                }
            }
            _ => {
                if rng.random::<bool>() {
                    info!("Round {}: reopening", round);
                    lib.reopen();
                }
            }
        }
    }

    // Each photo exists in exactly one place
    for file in &lib.files {
        let staged = lib.staged(file);
        assert!(file.exists() ^ staged.exists(), "{:?} is in two places or none", file);
    }
    assert!(lib.declutter.reconcile().unwrap().is_consistent());

    let seqs: Vec<u64> = lib.declutter.history().iter().map(|r| r.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    lib.declutter.undo_all().unwrap();
    assert!(lib.files.iter().all(|f| f.exists()));
}
