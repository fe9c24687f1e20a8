//! Upload ingest
//!
//! Accepts uploaded volumes and study archives, expands archives into
//! per-study working directories, and reports what was found. Each
//! ingest targets a unique folder, so concurrent uploads never share
//! mutable state.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::modality::{self, ValidationReport};
use crate::volume::is_volume_file;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Ingest error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Upload rejected before any bytes were written
    #[error("Invalid upload: {0}")]
    BadInput(String),
    /// Referenced file or folder does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ingest result type
pub type Result<T> = std::result::Result<T, IngestError>;

// ============================================================================
// OUTCOME TYPES
// ============================================================================

/// What an accepted upload turned into.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A single volume written directly into the upload directory
    SingleVolume { filename: String, size: u64 },
    /// An archive expanded into a freshly created study folder
    Archive {
        filename: String,
        size: u64,
        folder: String,
        extracted_files: Vec<String>,
        nifti_count: usize,
        validation: ValidationReport,
    },
    /// Archive detected but expansion failed; the raw upload is kept
    ArchiveFailed {
        filename: String,
        size: u64,
        reason: String,
    },
}

/// One top-level entry of the upload directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub modified_secs: Option<u64>,
    /// Volume files inside a study folder (empty for plain files)
    pub nifti_files: Vec<String>,
    pub files_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Deletion report for a removed file or folder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub freed_bytes: u64,
    pub files_deleted: usize,
}

// ============================================================================
// INGESTOR
// ============================================================================

/// Owns the upload directory and its admission policy.
#[derive(Debug, Clone)]
pub struct Ingestor {
    upload_dir: PathBuf,
    max_bytes: u64,
}

impl Ingestor {
    pub fn new(upload_dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            max_bytes,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Admission check: extension, size, and name safety. A size exactly
    /// at the limit passes; one byte over does not.
    pub fn validate_upload(&self, declared_name: &str, size: u64) -> Result<()> {
        if declared_name.trim().is_empty() {
            return Err(IngestError::BadInput("upload has no filename".into()));
        }
        if declared_name.contains('/')
            || declared_name.contains('\\')
            || declared_name.contains("..")
        {
            return Err(IngestError::BadInput(format!(
                "unsafe filename: {}",
                declared_name
            )));
        }
        let lower = declared_name.to_lowercase();
        if !(is_volume_file(&lower) || lower.ends_with(".zip")) {
            return Err(IngestError::BadInput(format!(
                "extension not allowed: {} (accepted: .nii, .nii.gz, .zip)",
                declared_name
            )));
        }
        if size == 0 {
            return Err(IngestError::BadInput("upload is empty".into()));
        }
        if size > self.max_bytes {
            return Err(IngestError::BadInput(format!(
                "upload too large: {} bytes (max {})",
                size, self.max_bytes
            )));
        }
        Ok(())
    }

    /// Persist an accepted upload. Archives are expanded in place and
    /// removed on success; a failed expansion keeps the raw archive.
    pub fn ingest(&self, declared_name: &str, bytes: &[u8]) -> Result<IngestOutcome> {
        self.validate_upload(declared_name, bytes.len() as u64)?;
        fs::create_dir_all(&self.upload_dir)?;

        let target = self.upload_dir.join(declared_name);
        let size = bytes.len() as u64;

        if let Err(e) = write_all(&target, bytes) {
            // never leave a truncated upload behind
            let _ = fs::remove_file(&target);
            return Err(e.into());
        }

        if !declared_name.to_lowercase().ends_with(".zip") {
            tracing::info!(file = declared_name, size, "volume uploaded");
            return Ok(IngestOutcome::SingleVolume {
                filename: declared_name.to_string(),
                size,
            });
        }

        match self.extract_archive(&target) {
            Ok((folder, extracted_files, nifti_count)) => {
                fs::remove_file(&target)?;
                let validation = modality::resolve(&self.upload_dir.join(&folder));
                tracing::info!(
                    archive = declared_name,
                    folder = %folder,
                    files = extracted_files.len(),
                    nifti_count,
                    eligible = validation.inference_eligible,
                    "archive expanded"
                );
                Ok(IngestOutcome::Archive {
                    filename: declared_name.to_string(),
                    size,
                    folder,
                    extracted_files,
                    nifti_count,
                    validation,
                })
            }
            Err(reason) => {
                tracing::warn!(archive = declared_name, %reason, "archive expansion failed");
                Ok(IngestOutcome::ArchiveFailed {
                    filename: declared_name.to_string(),
                    size,
                    reason: reason.to_string(),
                })
            }
        }
    }

    /// Expand a zip archive into a fresh folder named after its stem.
    ///
    /// Hidden entries and directories are skipped, entry paths are
    /// flattened to their basename, and collisions get numeric suffixes.
    /// A partially extracted folder is removed before the error returns.
    fn extract_archive(&self, archive_path: &Path) -> std::result::Result<(String, Vec<String>, usize), IngestError> {
        let base = archive_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::BadInput("archive has no base name".into()))?;

        let extract_dir = unique_dir(&self.upload_dir, &base);
        fs::create_dir_all(&extract_dir)?;

        let result = self.extract_into(archive_path, &extract_dir);
        match result {
            Ok((files, nifti_count)) => {
                let folder = extract_dir
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(base);
                Ok((folder, files, nifti_count))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&extract_dir);
                Err(e)
            }
        }
    }

    fn extract_into(
        &self,
        archive_path: &Path,
        extract_dir: &Path,
    ) -> std::result::Result<(Vec<String>, usize), IngestError> {
        let file = File::open(archive_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| IngestError::BadInput(format!("corrupt or invalid archive: {}", e)))?;

        let mut extracted = Vec::new();
        let mut nifti_count = 0usize;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| IngestError::BadInput(format!("unreadable archive entry: {}", e)))?;
            if entry.is_dir() {
                continue;
            }

            let raw_name = entry.name().to_string();
            let basename = raw_name
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or("")
                .to_string();
            if basename.is_empty() || basename.starts_with('.') || basename.starts_with("__") {
                continue;
            }

            let out_path = unique_file(extract_dir, &basename);
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| IngestError::BadInput(format!("archive entry read failed: {}", e)))?;
            write_all(&out_path, &data)?;

            let out_name = out_path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or(basename);
            if is_volume_file(&out_name) {
                nifti_count += 1;
            }
            extracted.push(out_name);
        }

        Ok((extracted, nifti_count))
    }

    /// List top-level volumes and study folders, newest first.
    pub fn list_entries(&self) -> Vec<UploadEntry> {
        let mut items = Vec::new();
        let Ok(entries) = fs::read_dir(&self.upload_dir) else {
            return items;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = entry.metadata() else { continue };
            let modified_secs = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs());

            if path.is_file() {
                if !is_volume_file(&name) {
                    continue;
                }
                items.push(UploadEntry {
                    name,
                    kind: EntryKind::File,
                    size: meta.len(),
                    modified_secs,
                    nifti_files: Vec::new(),
                    files_count: 1,
                });
            } else if path.is_dir() {
                let mut nifti_files = Vec::new();
                let mut files_count = 0usize;
                let mut size = 0u64;
                if let Ok(children) = fs::read_dir(&path) {
                    for child in children.filter_map(|e| e.ok()) {
                        let Ok(child_meta) = child.metadata() else {
                            continue;
                        };
                        if !child_meta.is_file() {
                            continue;
                        }
                        files_count += 1;
                        size += child_meta.len();
                        let child_name = child.file_name().to_string_lossy().into_owned();
                        if is_volume_file(&child_name) {
                            nifti_files.push(child_name);
                        }
                    }
                }
                nifti_files.sort();
                items.push(UploadEntry {
                    name,
                    kind: EntryKind::Folder,
                    size,
                    modified_secs,
                    nifti_files,
                    files_count,
                });
            }
        }

        items.sort_by(|a, b| b.modified_secs.cmp(&a.modified_secs).then(a.name.cmp(&b.name)));
        items
    }

    /// Remove an uploaded file or an entire study folder.
    pub fn delete_entry(&self, name: &str) -> Result<DeletedEntry> {
        let path = resolve_inside(&self.upload_dir, name)?;
        if !path.exists() {
            return Err(IngestError::NotFound(name.to_string()));
        }

        if path.is_file() {
            let freed_bytes = path.metadata().map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path)?;
            Ok(DeletedEntry {
                name: name.to_string(),
                kind: EntryKind::File,
                freed_bytes,
                files_deleted: 1,
            })
        } else {
            let (freed_bytes, files_deleted) = dir_stats(&path);
            fs::remove_dir_all(&path)?;
            Ok(DeletedEntry {
                name: name.to_string(),
                kind: EntryKind::Folder,
                freed_bytes,
                files_deleted,
            })
        }
    }

    /// Resolve a name (possibly `folder/file`) to a path inside the
    /// upload directory, refusing traversal.
    pub fn resolve_path(&self, name: &str) -> Result<PathBuf> {
        resolve_inside(&self.upload_dir, name)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn write_all(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()
}

fn resolve_inside(root: &Path, name: &str) -> Result<PathBuf> {
    if name.trim().is_empty()
        || name.contains("..")
        || name.contains('\\')
        || name.starts_with('/')
    {
        return Err(IngestError::BadInput(format!("unsafe path: {}", name)));
    }
    Ok(root.join(name))
}

fn dir_stats(path: &Path) -> (u64, usize) {
    let mut size = 0u64;
    let mut count = 0usize;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_dir() {
                stack.push(p);
            } else if let Ok(meta) = entry.metadata() {
                size += meta.len();
                count += 1;
            }
        }
    }
    (size, count)
}

/// First free directory name among `base`, `base_1`, `base_2`, ...
fn unique_dir(root: &Path, base: &str) -> PathBuf {
    let mut candidate = root.join(base);
    let mut counter = 1;
    while candidate.exists() {
        candidate = root.join(format!("{}_{}", base, counter));
        counter += 1;
    }
    candidate
}

/// First free file name, suffixing before the first extension dot so
/// `a.nii.gz` becomes `a_1.nii.gz`.
fn unique_file(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.find('.') {
        Some(pos) => (&name[..pos], &name[pos..]),
        None => (name, ""),
    };
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        counter += 1;
    }
    candidate
}

/// Write a whole directory as a zip archive (used by the folder
/// download endpoint). Only regular files at the top level are packed.
pub fn zip_directory(dir: &Path, writer: impl Write + std::io::Seek) -> Result<usize> {
    use zip::write::SimpleFileOptions;

    if !dir.is_dir() {
        return Err(IngestError::NotFound(dir.display().to_string()));
    }

    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();

    let mut zip = zip::ZipWriter::new(writer);
    let options = SimpleFileOptions::default();
    for name in &names {
        zip.start_file(name.clone(), options)
            .map_err(|e| IngestError::BadInput(format!("zip write failed: {}", e)))?;
        let data = fs::read(dir.join(name))?;
        zip.write_all(&data)?;
    }
    zip.finish()
        .map_err(|e| IngestError::BadInput(format!("zip finalize failed: {}", e)))?;
    Ok(names.len())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        use zip::write::SimpleFileOptions;
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            for (name, data) in entries {
                zip.start_file(name.to_string(), SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn size_limit_is_inclusive() {
        let ingestor = Ingestor::new("/tmp/unused", 100);
        assert!(ingestor.validate_upload("v.nii.gz", 100).is_ok());
        assert!(matches!(
            ingestor.validate_upload("v.nii.gz", 101),
            Err(IngestError::BadInput(_))
        ));
    }

    #[test]
    fn rejects_bad_names_and_extensions() {
        let ingestor = Ingestor::new("/tmp/unused", 100);
        assert!(ingestor.validate_upload("scan.dcm", 10).is_err());
        assert!(ingestor.validate_upload("../evil.nii", 10).is_err());
        assert!(ingestor.validate_upload("", 10).is_err());
        assert!(ingestor.validate_upload("v.nii.gz", 0).is_err());
    }

    #[test]
    fn single_volume_is_written_directly() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), 1 << 20);

        let outcome = ingestor.ingest("scan.nii.gz", b"fake-volume").unwrap();
        match outcome {
            IngestOutcome::SingleVolume { filename, size } => {
                assert_eq!(filename, "scan.nii.gz");
                assert_eq!(size, 11);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(dir.path().join("scan.nii.gz").exists());
    }

    #[test]
    fn archive_expands_and_zip_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), 1 << 20);

        let data = make_zip(&[
            ("t1n.nii.gz", b"a"),
            ("t1c.nii.gz", b"b"),
            ("t2w.nii.gz", b"c"),
            ("t2f.nii.gz", b"d"),
            (".DS_Store", b"junk"),
            ("__MACOSX/._t1n.nii.gz", b"junk"),
            ("notes/readme.txt", b"hello"),
        ]);

        let outcome = ingestor.ingest("study.zip", &data).unwrap();
        match outcome {
            IngestOutcome::Archive {
                folder,
                extracted_files,
                nifti_count,
                validation,
                ..
            } => {
                assert_eq!(folder, "study");
                assert_eq!(nifti_count, 4);
                // hidden entries skipped, nested paths flattened
                assert_eq!(extracted_files.len(), 5);
                assert!(extracted_files.contains(&"readme.txt".to_string()));
                assert!(validation.inference_eligible);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!dir.path().join("study.zip").exists());
        assert!(dir.path().join("study/t1n.nii.gz").exists());
    }

    #[test]
    fn repeated_archive_names_get_numeric_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), 1 << 20);
        let data = make_zip(&[("t1n.nii.gz", b"a")]);

        ingestor.ingest("study.zip", &data).unwrap();
        let second = ingestor.ingest("study.zip", &data).unwrap();
        match second {
            IngestOutcome::Archive { folder, .. } => assert_eq!(folder, "study_1"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(dir.path().join("study").is_dir());
        assert!(dir.path().join("study_1").is_dir());
    }

    #[test]
    fn colliding_entries_inside_archive_are_suffixed() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), 1 << 20);
        let data = make_zip(&[("a/t1n.nii.gz", b"a"), ("b/t1n.nii.gz", b"b")]);

        let outcome = ingestor.ingest("dup.zip", &data).unwrap();
        match outcome {
            IngestOutcome::Archive {
                mut extracted_files,
                ..
            } => {
                extracted_files.sort();
                assert_eq!(extracted_files, vec!["t1n.nii.gz", "t1n_1.nii.gz"]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn corrupt_archive_is_kept_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), 1 << 20);

        let outcome = ingestor.ingest("broken.zip", b"this is not a zip").unwrap();
        assert!(matches!(outcome, IngestOutcome::ArchiveFailed { .. }));
        // raw upload preserved, no partial folder left behind
        assert!(dir.path().join("broken.zip").exists());
        assert!(!dir.path().join("broken").exists());
    }

    #[test]
    fn delete_entry_reports_freed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), 1 << 20);
        let data = make_zip(&[("t1n.nii.gz", b"abcdef")]);
        ingestor.ingest("study.zip", &data).unwrap();

        let deleted = ingestor.delete_entry("study").unwrap();
        assert_eq!(deleted.kind, EntryKind::Folder);
        assert_eq!(deleted.files_deleted, 1);
        assert_eq!(deleted.freed_bytes, 6);
        assert!(!dir.path().join("study").exists());

        assert!(matches!(
            ingestor.delete_entry("study"),
            Err(IngestError::NotFound(_))
        ));
    }

    #[test]
    fn zip_directory_round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1n.nii.gz"), b"a").unwrap();
        std::fs::write(dir.path().join("t2w.nii.gz"), b"b").unwrap();

        let mut buf = std::io::Cursor::new(Vec::new());
        let count = zip_directory(dir.path(), &mut buf).unwrap();
        assert_eq!(count, 2);

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(buf.into_inner())).unwrap();
        assert_eq!(archive.len(), 2);
        assert!(archive.by_name("t1n.nii.gz").is_ok());
    }
}
