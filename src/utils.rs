//! Utility functions for declutter
//!
//! Small filesystem and path helpers shared by the journal, the plan builder
//! and the CLI.
//!
//! ## Categories of Utilities
//!
//! ### Durable File Operations
//! - Atomic file writing (temp file, fsync, rename)
//! - Directory fsync so a rename survives a crash
//! - Same-filesystem detection for rename-only moves
//!
//! ### Path Manipulation
//! - Lexical normalization without touching the filesystem
//! - Containment checks against the staging root
//! - Refusing destinations that pass through a symlink
//! - Turning free-form labels into safe folder names
//!
//! ### Display
//! - Byte formatting (human-readable sizes)
//!
//! ## Example Usage
//!
//! ```rust
//! use declutter::utils::{normalize_lexically, sanitize_folder_name};
//! use std::path::{Path, PathBuf};
//!
//! assert_eq!(
//!     normalize_lexically(Path::new("/stage/events/../misc/./a.jpg")),
//!     PathBuf::from("/stage/misc/a.jpg")
//! );
//! assert_eq!(sanitize_folder_name("Lisbon / Porto: day 1"), "Lisbon - Porto - day 1");
//! ```

use crate::error::{DeclutterError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Longest folder name produced by [`sanitize_folder_name`], in characters
pub const MAX_FOLDER_NAME_CHARS: usize = 96;

/// Atomic file write (write to temp file, fsync, then rename)
///
/// The target is never observed half written: readers see either the old
/// content or the new content. The temp file lives next to the target so the
/// rename stays on one filesystem.
///
/// # Errors
///
/// - [`DeclutterError::Io`] if writing, syncing or renaming fails
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path);

    let write = || -> Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Flush a directory entry table to disk
///
/// A rename is only durable once its parent directory has been synced. On
/// platforms where directories cannot be opened this is a no-op.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Whether two paths live on the same filesystem
///
/// `destination_dir` must exist. Returns `true` on platforms without device
/// numbers and lets the rename itself report a cross-device failure.
pub fn same_device(source: &Path, destination_dir: &Path) -> Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let src = fs::metadata(source)?.dev();
        let dst = fs::metadata(destination_dir)?.dev();
        Ok(src == dst)
    }
    #[cfg(not(unix))]
    {
        let _ = (source, destination_dir);
        Ok(true)
    }
}

/// Resolve `.` and `..` components without consulting the filesystem
///
/// `..` never climbs above the root of an absolute path.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute, lexically normalized form of `path`
///
/// Relative paths are joined onto the current directory. Symlinks are not
/// resolved, so a path that does not exist yet can still be absolutized.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize_lexically(path))
    } else {
        Ok(normalize_lexically(&std::env::current_dir()?.join(path)))
    }
}

/// Check that `path` stays inside `root` after lexical normalization
///
/// # Errors
///
/// - [`DeclutterError::PathEscape`] if the normalized path is outside `root`
pub fn ensure_within(path: &Path, root: &Path) -> Result<PathBuf> {
    let normalized = normalize_lexically(path);
    let root = normalize_lexically(root);
    if normalized.starts_with(&root) && normalized != root {
        Ok(normalized)
    } else {
        Err(DeclutterError::PathEscape {
            path: path.to_path_buf(),
            root,
        })
    }
}

/// Check that no existing directory between `root` and `path` is a symlink
///
/// [`ensure_within`] only compares text; this makes sure the parts of `path`
/// that already exist also resolve inside `root`. The final component is not
/// inspected.
///
/// # Errors
///
/// - [`DeclutterError::PathEscape`] if `path` is not under `root` or passes
///   through a symlink
pub fn ensure_no_symlinks(path: &Path, root: &Path) -> Result<()> {
    let escape = || DeclutterError::PathEscape {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };
    let relative = path.strip_prefix(root).map_err(|_| escape())?;
    let mut components: Vec<Component<'_>> = relative.components().collect();
    components.pop();

    let mut current = root.to_path_buf();
    for component in components {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                trace!("{:?} is a symlink", current);
                return Err(escape());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Turn a free-form label into a single, portable folder name
///
/// Path separators and characters reserved on common filesystems become
/// ` - `, runs of whitespace collapse, leading dots are dropped so the folder
/// is never hidden (or `..`), and the result is capped at
/// [`MAX_FOLDER_NAME_CHARS`]. An empty result becomes `"untitled"`.
pub fn sanitize_folder_name(label: &str) -> String {
    let mut replaced = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => replaced.push_str(" - "),
            c if c.is_control() => replaced.push(' '),
            c => replaced.push(c),
        }
    }

    let mut words: Vec<&str> = replaced.split_whitespace().collect();
    words.dedup_by(|a, b| *a == "-" && *b == "-");
    let joined = words.join(" ");
    let trimmed = joined
        .trim_start_matches(['.', '-', ' '])
        .trim_end_matches(['.', '-', ' ']);

    let capped: String = trimmed.chars().take(MAX_FOLDER_NAME_CHARS).collect();
    let capped = capped.trim_end().to_string();
    if capped.is_empty() {
        "untitled".to_string()
    } else {
        capped
    }
}

/// Whether a file or folder name starts with a dot
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove empty directories from `start` upward, stopping at `stop` (exclusive)
pub fn prune_empty_parents(start: &Path, stop: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        if !remove_dir_if_empty(&current)? {
            break;
        }
        removed += 1;
        if !current.pop() {
            break;
        }
    }
    Ok(removed)
}

/// Format bytes in human-readable form
///
/// Uses binary (1024-based) units; values under 1 KB print as whole bytes.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("journal.jsonl");

        atomic_write(&file_path, b"first").unwrap();
        atomic_write(&file_path, b"second").unwrap();

        assert_eq!(fs::read(&file_path).unwrap(), b"second");
        assert!(!temp_sibling(&file_path).exists());
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d.jpg")),
            PathBuf::from("/a/c/d.jpg")
        );
        assert_eq!(normalize_lexically(Path::new("/../../x")), PathBuf::from("/x"));
        assert_eq!(normalize_lexically(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn test_ensure_within() {
        let root = Path::new("/photos/_declutter");
        assert!(ensure_within(Path::new("/photos/_declutter/events/a.jpg"), root).is_ok());

        let escaped = ensure_within(Path::new("/photos/_declutter/../a.jpg"), root);
        assert!(matches!(escaped, Err(DeclutterError::PathEscape { .. })));

        // A sibling sharing the prefix as a string is still outside
        assert!(ensure_within(Path::new("/photos/_declutter2/a.jpg"), root).is_err());
        // The root itself is not a valid file destination
        assert!(ensure_within(root, root).is_err());
    }

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("2024-06-01 Lisbon"), "2024-06-01 Lisbon");
        assert_eq!(sanitize_folder_name("../../etc"), "etc");
        assert_eq!(sanitize_folder_name("a/b"), "a - b");
        assert_eq!(sanitize_folder_name("   "), "untitled");
        assert_eq!(sanitize_folder_name(".hidden"), "hidden");
        assert_eq!(sanitize_folder_name(&"x".repeat(300)).chars().count(), MAX_FOLDER_NAME_CHARS);
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_no_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = temp_dir.path().join("stage");
        fs::create_dir_all(root.join("events")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        assert!(ensure_no_symlinks(&root.join("events/a.jpg"), &root).is_ok());
        assert!(ensure_no_symlinks(&root.join("new/deeper/a.jpg"), &root).is_ok());
        assert!(matches!(
            ensure_no_symlinks(&root.join("link/a.jpg"), &root),
            Err(DeclutterError::PathEscape { .. })
        ));
        assert!(matches!(
            ensure_no_symlinks(&root.join("link/sub/a.jpg"), &root),
            Err(DeclutterError::PathEscape { .. })
        ));
        assert!(ensure_no_symlinks(&temp_dir.path().join("a.jpg"), &root).is_err());
    }

    #[test]
    fn test_prune_empty_parents() {
        let temp_dir = TempDir::new().unwrap();
        let stop = temp_dir.path().join("stage");
        let deep = stop.join("events").join("trip");
        fs::create_dir_all(&deep).unwrap();
        fs::write(stop.join("keep.txt"), b"x").unwrap();

        assert_eq!(prune_empty_parents(&deep, &stop).unwrap(), 2);
        assert!(!stop.join("events").exists());
        assert!(stop.exists());
    }

    #[test]
    fn test_same_device_for_siblings() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.jpg");
        fs::write(&file, b"x").unwrap();
        assert!(same_device(&file, temp_dir.path()).unwrap());
    }
}
