//! Where text units come from: a project tree or a memory-notes file.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::semantic::chunker::content_hash;

/// Extra ignore file honored next to `.gitignore`
pub const IGNORE_FILE_NAME: &str = ".gendexignore";

/// Files above this size are not indexed
const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextUnit {
    /// Relative path or note id
    pub unit_id: String,
    /// SHA-256 of the whole content
    pub fingerprint: String,
    /// Opaque marker compared against the last indexed revision
    pub revision: String,
}

#[derive(Debug, Clone)]
pub struct UnitInput {
    pub unit: TextUnit,
    pub content: String,
}

impl UnitInput {
    pub fn new(unit_id: &str, revision: &str, content: &str) -> Self {
        Self {
            unit: TextUnit {
                unit_id: unit_id.to_string(),
                fingerprint: content_hash(content),
                revision: revision.to_string(),
            },
            content: content.to_string(),
        }
    }
}

pub trait UnitSource: Send + Sync {
    fn units(&self) -> Result<Vec<UnitInput>>;
}

/// Fixed set of units, handy for callers that already hold the text.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    units: Vec<UnitInput>,
}

impl StaticSource {
    pub fn new(units: Vec<UnitInput>) -> Self {
        Self { units }
    }
}

impl UnitSource for StaticSource {
    fn units(&self) -> Result<Vec<UnitInput>> {
        Ok(self.units.clone())
    }
}

/// Text files under a project root, honoring `.gitignore` and
/// `.gendexignore`.
pub struct FsTreeSource {
    root: PathBuf,
    index_dir: PathBuf,
    max_file_bytes: u64,
}

impl FsTreeSource {
    pub fn new(root: &Path, index_dir: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            index_dir: index_dir.to_path_buf(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, max: u64) -> Self {
        self.max_file_bytes = max;
        self
    }

    fn should_skip(&self, root: &Path, index_dir: &Path, path: &Path) -> bool {
        if path.starts_with(index_dir) {
            return true;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == "Cargo.lock" || name.ends_with(".log") {
                return true;
            }
        }
        path.strip_prefix(root)
            .unwrap_or(path)
            .components()
            .any(|comp| {
                matches!(
                    comp.as_os_str().to_str(),
                    Some(".git") | Some("target") | Some("node_modules")
                )
            })
    }
}

impl UnitSource for FsTreeSource {
    fn units(&self) -> Result<Vec<UnitInput>> {
        // walked paths and the index dir must share one spelling to compare
        let root = absolute(&self.root)?;
        let index_dir = absolute(&self.index_dir)?;

        let mut builder = WalkBuilder::new(&root);
        builder
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .add_custom_ignore_filename(IGNORE_FILE_NAME);

        let mut units = Vec::new();
        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("skipping unreadable entry: {err}");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                || self.should_skip(&root, &index_dir, path)
            {
                continue;
            }

            let metadata = match std::fs::metadata(path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    log::warn!("skipping {:?}: {err}", path);
                    continue;
                }
            };
            if metadata.len() > self.max_file_bytes {
                log::debug!("skipping {:?}: {} bytes", path, metadata.len());
                continue;
            }

            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::warn!("skipping {:?}: {err}", path);
                    continue;
                }
            };
            let Ok(content) = String::from_utf8(bytes) else {
                log::debug!("skipping non-utf8 file {:?}", path);
                continue;
            };

            let mtime_ns = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);

            let relative = path.strip_prefix(&root).unwrap_or(path);
            let unit_id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            units.push(UnitInput::new(
                &unit_id,
                &format!("{mtime_ns}:{}", metadata.len()),
                &content,
            ));
        }

        units.sort_by(|a, b| a.unit.unit_id.cmp(&b.unit.unit_id));
        log::debug!("found {} units under {:?}", units.len(), self.root);
        Ok(units)
    }
}

/// Canonical form of `path`, or of its nearest existing ancestor when the
/// path itself does not exist yet.
fn absolute(path: &Path) -> Result<PathBuf> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = path.as_path();
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                return Ok(missing.iter().rev().fold(canonical, |acc, part| acc.join(part)));
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Ok(path),
            },
        }
    }
}

/// One line of a memory-notes file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    #[serde(alias = "record_id")]
    pub id: String,
    #[serde(alias = "summary")]
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

/// Memory notes stored one JSON object per line.
pub struct NoteSource {
    path: PathBuf,
}

impl NoteSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl UnitSource for NoteSource {
    fn units(&self) -> Result<Vec<UnitInput>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut seen = HashSet::new();
        let mut units = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let note: Note = match serde_json::from_str(&line) {
                Ok(note) => note,
                Err(err) => {
                    log::warn!("skipping malformed note on line {} of {:?}: {err}", number + 1, self.path);
                    continue;
                }
            };
            if !seen.insert(note.id.clone()) {
                log::warn!("duplicate note id {} in {:?}", note.id, self.path);
                continue;
            }
            units.push(UnitInput::new(&note.id, &note.updated_at.to_rfc3339(), &note.text));
        }

        units.sort_by(|a, b| a.unit.unit_id.cmp(&b.unit.unit_id));
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_ids(units: &[UnitInput]) -> Vec<&str> {
        units.iter().map(|u| u.unit.unit_id.as_str()).collect()
    }

    #[test]
    fn test_fs_source_walks_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::create_dir_all(root.join(".gendex")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn add() {}\n").unwrap();
        std::fs::write(root.join("src/nested/util.rs"), "fn util() {}\n").unwrap();
        std::fs::write(root.join("target/debug/out.rs"), "generated").unwrap();
        std::fs::write(root.join(".gendex/CURRENT"), "1").unwrap();
        std::fs::write(root.join("build.log"), "noise").unwrap();
        std::fs::write(root.join("binary.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let source = FsTreeSource::new(root, &root.join(".gendex"));
        let units = source.units().unwrap();

        assert_eq!(unit_ids(&units), vec!["src/lib.rs", "src/nested/util.rs"]);
        assert_eq!(units[0].content, "pub fn add() {}\n");
        assert_eq!(units[0].unit.fingerprint, content_hash("pub fn add() {}\n"));
        assert!(units[0].unit.revision.ends_with(":16"));
    }

    #[test]
    fn test_fs_source_skips_index_dir_spelled_differently() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::create_dir_all(root.join(".gendex")).unwrap();
        std::fs::write(root.join(".gendex/config.yaml"), "model: x\n").unwrap();
        std::fs::write(root.join("a.txt"), "alpha").unwrap();

        // root reached through `..`, index dir named directly
        let source = FsTreeSource::new(&root.join("sub").join(".."), &root.join(".gendex"));
        assert_eq!(unit_ids(&source.units().unwrap()), vec!["a.txt"]);

        // and the other way round
        let source = FsTreeSource::new(root, &root.join("sub").join("..").join(".gendex"));
        assert_eq!(unit_ids(&source.units().unwrap()), vec!["a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_source_skips_index_dir_behind_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("project");
        std::fs::create_dir_all(real.join(".gendex")).unwrap();
        std::fs::write(real.join(".gendex/CURRENT"), "1").unwrap();
        std::fs::write(real.join("a.txt"), "alpha").unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let source = FsTreeSource::new(&link, &real.join(".gendex"));
        assert_eq!(unit_ids(&source.units().unwrap()), vec!["a.txt"]);
    }

    #[test]
    fn test_absolute_keeps_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        let canonical = tmp.path().canonicalize().unwrap();
        let resolved = absolute(&tmp.path().join("sub").join("..").join("not-yet")).unwrap();
        assert_eq!(resolved, canonical.join("not-yet"));
    }

    #[test]
    fn test_fs_source_honors_ignore_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join(".gitignore"), "secret.txt\n").unwrap();
        std::fs::write(root.join(IGNORE_FILE_NAME), "*.md\n").unwrap();
        std::fs::write(root.join("secret.txt"), "hidden").unwrap();
        std::fs::write(root.join("README.md"), "docs").unwrap();
        std::fs::write(root.join("main.rs"), "fn main() {}").unwrap();

        let source = FsTreeSource::new(root, &root.join(".gendex"));
        let ids: Vec<String> = source
            .units()
            .unwrap()
            .into_iter()
            .map(|u| u.unit.unit_id)
            .collect();

        assert!(ids.contains(&"main.rs".to_string()));
        assert!(!ids.contains(&"secret.txt".to_string()));
        assert!(!ids.contains(&"README.md".to_string()));
    }

    #[test]
    fn test_fs_source_skips_large_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("big.txt"), "x".repeat(100)).unwrap();
        std::fs::write(tmp.path().join("small.txt"), "x").unwrap();

        let source = FsTreeSource::new(tmp.path(), &tmp.path().join(".gendex")).with_max_file_bytes(10);
        assert_eq!(unit_ids(&source.units().unwrap()), vec!["small.txt"]);
    }

    #[test]
    fn test_note_source_reads_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("notes.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"id":"b","text":"second note","updated_at":"2024-01-02T00:00:00Z"}"#,
                "\n",
                "not json\n",
                r#"{"record_id":"a","summary":"first note","updated_at":"2024-01-01T00:00:00Z"}"#,
                "\n",
                r#"{"id":"a","text":"duplicate","updated_at":"2024-01-03T00:00:00Z"}"#,
                "\n",
            ),
        )
        .unwrap();

        let units = NoteSource::new(&path).units().unwrap();
        assert_eq!(unit_ids(&units), vec!["a", "b"]);
        assert_eq!(units[0].content, "first note");
        assert_eq!(units[0].unit.revision, "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_note_source_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let units = NoteSource::new(&tmp.path().join("missing.jsonl")).units().unwrap();
        assert!(units.is_empty());
    }
}
