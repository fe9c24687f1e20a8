//! Modality resolution
//!
//! Classifies the volumes of a study folder into the four MRI pulse
//! sequences the segmentation model expects, by filename convention.
//! Classification is deliberately filename-based: the clinical corpus
//! this service ingests follows the BraTS naming scheme, and an
//! out-of-band metadata source could replace this module without
//! touching the rest of the pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::volume::is_volume_file;

// ============================================================================
// MODALITY
// ============================================================================

/// One of the four required MRI pulse sequences.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// T1-weighted, native (no contrast agent)
    T1n,
    /// T1-weighted, contrast enhanced
    T1c,
    /// T2-weighted
    T2w,
    /// T2-weighted fluid-attenuated (FLAIR)
    T2f,
}

impl Modality {
    /// All modalities in canonical channel order.
    pub const CHANNEL_ORDER: [Modality; 4] =
        [Modality::T1n, Modality::T1c, Modality::T2w, Modality::T2f];

    /// Channel index of this modality in the preprocessed tensor.
    pub fn channel(self) -> usize {
        match self {
            Modality::T1n => 0,
            Modality::T1c => 1,
            Modality::T2w => 2,
            Modality::T2f => 3,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::T1n => write!(f, "t1n"),
            Modality::T1c => write!(f, "t1c"),
            Modality::T2w => write!(f, "t2w"),
            Modality::T2f => write!(f, "t2f"),
        }
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "t1n" => Ok(Modality::T1n),
            "t1c" => Ok(Modality::T1c),
            "t2w" => Ok(Modality::T2w),
            "t2f" => Ok(Modality::T2f),
            _ => Err(format!("Unknown modality: {}", s)),
        }
    }
}

// ============================================================================
// FILENAME PATTERNS
// ============================================================================

/// Ordered pattern stems per modality. The first match wins, and
/// modalities are tried in this order so that e.g. `t1c.nii.gz` never
/// falls through to the bare `t1` stem.
const PATTERN_STEMS: [(Modality, &[&str]); 4] = [
    (
        Modality::T1c,
        &[
            "t1c",
            "t1_c",
            "t1-c",
            "t1ce",
            "t1_ce",
            "t1-ce",
            "t1_contrast",
            "t1_gd",
        ],
    ),
    (Modality::T1n, &["t1n", "t1_n", "t1-n", "t1", "t1_native"]),
    (Modality::T2w, &["t2w", "t2_w", "t2-w", "t2", "t2_weighted"]),
    (
        Modality::T2f,
        &["t2f", "t2_f", "t2-f", "t2_flair", "t2-flair", "flair", "t2_fluid"],
    ),
];

static PATTERNS: LazyLock<Vec<(Modality, Vec<Regex>)>> = LazyLock::new(|| {
    PATTERN_STEMS
        .iter()
        .map(|(modality, stems)| {
            let regexes = stems
                .iter()
                .map(|stem| {
                    // Anchored to the filename suffix, extension included
                    Regex::new(&format!(r"{}\.nii(\.gz)?$", regex::escape(stem)))
                        .expect("static modality pattern")
                })
                .collect();
            (*modality, regexes)
        })
        .collect()
});

/// Identify the modality of a single filename, or `None`.
pub fn identify_modality(filename: &str) -> Option<Modality> {
    let lower = filename.to_lowercase();
    for (modality, regexes) in PATTERNS.iter() {
        if regexes.iter().any(|re| re.is_match(&lower)) {
            return Some(*modality);
        }
    }
    None
}

// ============================================================================
// VALIDATION REPORT
// ============================================================================

/// Outcome of resolving a study folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Modality -> filename for every uniquely identified modality
    pub found_modalities: BTreeMap<Modality, String>,
    /// Required modalities with no matching file
    pub missing_modalities: Vec<Modality>,
    /// Volume files that matched no pattern
    pub unidentified_files: Vec<String>,
    /// Number of volume files seen in the folder
    pub nifti_count: usize,
    /// Human-readable validation failures (duplicates, empty folder, ...)
    pub errors: Vec<String>,
    /// True when exactly one file exists per required modality
    pub inference_eligible: bool,
}

impl ValidationReport {
    fn empty() -> Self {
        Self {
            found_modalities: BTreeMap::new(),
            missing_modalities: Modality::CHANNEL_ORDER.to_vec(),
            unidentified_files: Vec::new(),
            nifti_count: 0,
            errors: Vec::new(),
            inference_eligible: false,
        }
    }
}

/// Resolve the modalities of a study folder.
///
/// Directory entries are visited in sorted order so that two calls over
/// the same folder contents always produce the same report.
pub fn resolve(folder: &Path) -> ValidationReport {
    let mut report = ValidationReport::empty();

    if !folder.is_dir() {
        report
            .errors
            .push(format!("{} is not a directory", folder.display()));
        return report;
    }

    let mut names: Vec<String> = match std::fs::read_dir(folder) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_volume_file(name))
            .collect(),
        Err(e) => {
            report.errors.push(format!("cannot list folder: {}", e));
            return report;
        }
    };
    names.sort();
    report.nifti_count = names.len();

    if names.is_empty() {
        report.errors.push("no volume files in folder".to_string());
        return report;
    }

    let mut duplicate = false;
    for name in &names {
        match identify_modality(name) {
            Some(modality) => {
                if let Some(existing) = report.found_modalities.get(&modality) {
                    report.errors.push(format!(
                        "modality {} matched more than once: {} and {}",
                        modality, existing, name
                    ));
                    duplicate = true;
                } else {
                    report.found_modalities.insert(modality, name.clone());
                }
            }
            None => report.unidentified_files.push(name.clone()),
        }
    }

    report.missing_modalities = Modality::CHANNEL_ORDER
        .iter()
        .copied()
        .filter(|m| !report.found_modalities.contains_key(m))
        .collect();

    if !report.missing_modalities.is_empty() {
        let missing: Vec<String> = report
            .missing_modalities
            .iter()
            .map(|m| m.to_string())
            .collect();
        report
            .errors
            .push(format!("missing modalities: {}", missing.join(", ")));
    }

    report.inference_eligible = report.missing_modalities.is_empty() && !duplicate;
    report
}

/// Build the modality -> path mapping for an eligible study folder.
///
/// Returns `None` when the folder does not validate.
pub fn modality_mapping(folder: &Path) -> Option<BTreeMap<Modality, PathBuf>> {
    let report = resolve(folder);
    if !report.inference_eligible {
        return None;
    }
    Some(
        report
            .found_modalities
            .into_iter()
            .map(|(modality, name)| (modality, folder.join(name)))
            .collect(),
    )
}

/// An inference-eligible study discovered under the upload directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibleStudy {
    pub name: String,
    pub found_modalities: BTreeMap<Modality, String>,
}

/// Scan the upload directory for study folders that validate.
pub fn find_eligible(upload_dir: &Path) -> Vec<EligibleStudy> {
    let mut folders: Vec<PathBuf> = match std::fs::read_dir(upload_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => return Vec::new(),
    };
    folders.sort();

    folders
        .into_iter()
        .filter_map(|folder| {
            let report = resolve(&folder);
            if !report.inference_eligible {
                return None;
            }
            Some(EligibleStudy {
                name: folder.file_name()?.to_string_lossy().into_owned(),
                found_modalities: report.found_modalities,
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn identifies_canonical_names() {
        assert_eq!(identify_modality("t1n.nii.gz"), Some(Modality::T1n));
        assert_eq!(identify_modality("t1c.nii.gz"), Some(Modality::T1c));
        assert_eq!(identify_modality("t2w.nii"), Some(Modality::T2w));
        assert_eq!(identify_modality("t2f.nii.gz"), Some(Modality::T2f));
    }

    #[test]
    fn identifies_alternate_spellings() {
        assert_eq!(
            identify_modality("BraTS-GLI-0001_t1ce.nii.gz"),
            Some(Modality::T1c)
        );
        assert_eq!(identify_modality("sub-01_flair.nii.gz"), Some(Modality::T2f));
        assert_eq!(identify_modality("case_t1_native.nii"), Some(Modality::T1n));
        assert_eq!(
            identify_modality("case_T2_WEIGHTED.NII.GZ"),
            Some(Modality::T2w)
        );
    }

    #[test]
    fn bare_t1_does_not_shadow_contrast() {
        // t1c must win before the bare t1 stem is tried
        assert_eq!(identify_modality("patient_t1c.nii.gz"), Some(Modality::T1c));
        assert_eq!(identify_modality("patient_t1.nii.gz"), Some(Modality::T1n));
    }

    #[test]
    fn suffix_anchoring_rejects_mid_name_matches() {
        assert_eq!(identify_modality("t1n_mask.nii.gz"), None);
        assert_eq!(identify_modality("report.txt"), None);
    }

    fn touch(dir: &Path, name: &str) {
        File::create(dir.join(name)).unwrap();
    }

    #[test]
    fn complete_folder_is_eligible() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t1n.nii.gz", "t1c.nii.gz", "t2w.nii.gz", "t2f.nii.gz"] {
            touch(dir.path(), name);
        }

        let report = resolve(dir.path());
        assert!(report.inference_eligible);
        assert_eq!(report.found_modalities.len(), 4);
        assert_eq!(report.nifti_count, 4);
        assert!(report.missing_modalities.is_empty());
    }

    #[test]
    fn missing_modality_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t1n.nii.gz", "t1c.nii.gz", "t2w.nii.gz"] {
            touch(dir.path(), name);
        }

        let report = resolve(dir.path());
        assert!(!report.inference_eligible);
        assert_eq!(report.missing_modalities, vec![Modality::T2f]);
    }

    #[test]
    fn duplicate_modality_is_ineligible() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "a_t1n.nii.gz",
            "b_t1_native.nii.gz",
            "t1c.nii.gz",
            "t2w.nii.gz",
            "t2f.nii.gz",
        ] {
            touch(dir.path(), name);
        }

        let report = resolve(dir.path());
        assert!(!report.inference_eligible);
        assert!(report.errors.iter().any(|e| e.contains("more than once")));
    }

    #[test]
    fn empty_folder_reports_all_missing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "notes.txt");

        let report = resolve(dir.path());
        assert!(!report.inference_eligible);
        assert_eq!(report.missing_modalities.len(), 4);
    }

    #[test]
    fn resolution_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t1n.nii.gz", "t1c.nii.gz", "t2w.nii.gz", "extra.nii.gz"] {
            touch(dir.path(), name);
        }

        assert_eq!(resolve(dir.path()), resolve(dir.path()));
    }

    #[test]
    fn mapping_exists_only_for_eligible_folders() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t1n.nii.gz", "t1c.nii.gz", "t2w.nii.gz", "t2f.nii.gz"] {
            touch(dir.path(), name);
        }

        let mapping = modality_mapping(dir.path()).unwrap();
        assert_eq!(mapping.len(), 4);
        assert!(mapping[&Modality::T1n].ends_with("t1n.nii.gz"));

        std::fs::remove_file(dir.path().join("t2f.nii.gz")).unwrap();
        assert!(modality_mapping(dir.path()).is_none());
    }
}
