use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hrsync_core::StageId;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

const METADATA_SUFFIX: &str = "_metadata.json";

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("subject directory {0} does not exist")]
    MissingRoot(PathBuf),
    #[error("reading subject {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// File naming convention for each mapping stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    /// `{id}_*` anywhere under the resume directory, except `FAILED_*` and
    /// `*_metadata.json`.
    Resume,
    /// `{id}_*` directly in the flat AI-access directory, except `_*` and
    /// `*_metadata.json`.
    AiResume,
    /// `{id}_*_metadata.json` directly in the flat AI-access directory.
    Metadata,
}

impl SubjectKind {
    pub fn for_stage(stage: StageId) -> Self {
        match stage {
            StageId::SharePoint => SubjectKind::Resume,
            StageId::AiAccess => SubjectKind::AiResume,
            StageId::Metadata => SubjectKind::Metadata,
        }
    }

    fn recursive(self) -> bool {
        matches!(self, SubjectKind::Resume)
    }

    fn accepts(self, file_name: &str) -> bool {
        match self {
            SubjectKind::Resume => {
                !file_name.starts_with("FAILED_") && !file_name.ends_with(METADATA_SUFFIX)
            }
            SubjectKind::AiResume => {
                !file_name.starts_with('_') && !file_name.ends_with(METADATA_SUFFIX)
            }
            SubjectKind::Metadata => file_name.ends_with(METADATA_SUFFIX),
        }
    }

    /// Candidate id encoded in `file_name`, when the name follows this convention.
    pub fn candidate_id(self, file_name: &str) -> Option<i64> {
        if !self.accepts(file_name) {
            return None;
        }
        let (prefix, _) = file_name.split_once('_')?;
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        prefix.parse().ok()
    }
}

/// A located file for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub candidate_id: i64,
    pub local_path: PathBuf,
    pub file_name: String,
    /// Path handed to the reference resolver, `/`-separated.
    pub remote_path: String,
}

pub trait SubjectLocator: Send + Sync {
    fn locate(&self, candidate_id: i64) -> Result<Option<Subject>, LocateError>;
}

/// One directory scan, indexed by candidate id.
#[derive(Debug, Clone)]
pub struct FileIndex {
    root: PathBuf,
    remote_prefix: String,
    entries: BTreeMap<i64, PathBuf>,
}

impl FileIndex {
    /// Scan `root` for files following `kind`'s naming convention. When several
    /// files match one id, the lexicographically first relative path wins.
    pub fn scan(
        root: impl Into<PathBuf>,
        kind: SubjectKind,
        remote_prefix: impl Into<String>,
    ) -> Result<Self, LocateError> {
        Self::scan_excluding(root, kind, remote_prefix, &[])
    }

    /// Like [`FileIndex::scan`], but never descends into the `excluded`
    /// directories. Excluded paths that do not exist are ignored.
    pub fn scan_excluding(
        root: impl Into<PathBuf>,
        kind: SubjectKind,
        remote_prefix: impl Into<String>,
        excluded: &[PathBuf],
    ) -> Result<Self, LocateError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(LocateError::MissingRoot(root));
        }
        let canonical_root = std::fs::canonicalize(&root).map_err(|source| LocateError::Io {
            path: root.clone(),
            source,
        })?;
        let excluded: Vec<PathBuf> = excluded
            .iter()
            .filter_map(|dir| std::fs::canonicalize(dir).ok())
            .collect();

        let mut walker = WalkDir::new(&root).min_depth(1).sort_by_file_name();
        if !kind.recursive() {
            walker = walker.max_depth(1);
        }
        let walker = walker.into_iter().filter_entry(|entry| {
            if excluded.is_empty() || !entry.file_type().is_dir() {
                return true;
            }
            match entry.path().strip_prefix(&root) {
                Ok(relative) => !excluded.contains(&canonical_root.join(relative)),
                Err(_) => true,
            }
        });

        let mut entries: BTreeMap<i64, PathBuf> = BTreeMap::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry during subject scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(candidate_id) = kind.candidate_id(file_name) else {
                continue;
            };
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let relative = relative.to_path_buf();
            match entries.get(&candidate_id) {
                Some(existing) if existing <= &relative => {}
                _ => {
                    entries.insert(candidate_id, relative);
                }
            }
        }

        debug!(root = %root.display(), files = entries.len(), ?kind, "subject scan complete");
        Ok(Self {
            root,
            remote_prefix: remote_prefix.into().trim_matches('/').to_string(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Indexed candidate ids in ascending order.
    pub fn candidate_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.keys().copied()
    }

    fn remote_path(&self, relative: &Path) -> String {
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if self.remote_prefix.is_empty() {
            relative
        } else {
            format!("{}/{}", self.remote_prefix, relative)
        }
    }
}

impl SubjectLocator for FileIndex {
    fn locate(&self, candidate_id: i64) -> Result<Option<Subject>, LocateError> {
        let Some(relative) = self.entries.get(&candidate_id) else {
            return Ok(None);
        };
        let local_path = self.root.join(relative);
        std::fs::metadata(&local_path).map_err(|source| LocateError::Io {
            path: local_path.clone(),
            source,
        })?;

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(Subject {
            candidate_id,
            remote_path: self.remote_path(relative),
            local_path,
            file_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, b"x").expect("write");
    }

    #[test]
    fn naming_conventions() {
        assert_eq!(SubjectKind::Resume.candidate_id("123_Jane_Doe.pdf"), Some(123));
        assert_eq!(SubjectKind::Resume.candidate_id("FAILED_123_Jane.pdf"), None);
        assert_eq!(SubjectKind::Resume.candidate_id("1234.pdf"), None);
        assert_eq!(SubjectKind::Resume.candidate_id("6_bob_metadata.json"), None);
        assert_eq!(SubjectKind::AiResume.candidate_id("55_resume.pdf"), Some(55));
        assert_eq!(SubjectKind::AiResume.candidate_id("55_resume_metadata.json"), None);
        assert_eq!(SubjectKind::AiResume.candidate_id("_index.json"), None);
        assert_eq!(SubjectKind::Metadata.candidate_id("55_resume_metadata.json"), Some(55));
        assert_eq!(SubjectKind::Metadata.candidate_id("55_resume.pdf"), None);
    }

    #[test]
    fn resume_scan_is_recursive_and_deterministic() {
        let dir = tempdir().expect("tempdir");
        touch(&dir.path().join("2024/b/10_second.pdf"));
        touch(&dir.path().join("2024/a/10_first.pdf"));
        touch(&dir.path().join("2023/FAILED_11_x.pdf"));
        touch(&dir.path().join("12_top.docx"));

        let index =
            FileIndex::scan(dir.path(), SubjectKind::Resume, "").expect("scan");
        assert_eq!(index.len(), 2);

        let subject = index.locate(10).expect("locate").expect("present");
        assert_eq!(subject.file_name, "10_first.pdf");
        assert_eq!(subject.remote_path, "2024/a/10_first.pdf");
        assert!(index.locate(11).expect("locate").is_none());
    }

    #[test]
    fn resume_scan_skips_nested_ai_access_copies() {
        let dir = tempdir().expect("tempdir");
        touch(&dir.path().join("resumes_2024/5_jane.pdf"));
        touch(&dir.path().join("AI_Access/5_jane.pdf"));
        touch(&dir.path().join("AI_Access/6_bob.pdf"));
        touch(&dir.path().join("AI_Access/6_bob_metadata.json"));

        let index = FileIndex::scan_excluding(
            dir.path(),
            SubjectKind::Resume,
            "",
            &[dir.path().join("AI_Access")],
        )
        .expect("scan");

        assert_eq!(index.len(), 1);
        assert_eq!(
            index.locate(5).expect("locate").expect("present").remote_path,
            "resumes_2024/5_jane.pdf"
        );
        assert!(index.locate(6).expect("locate").is_none());
    }

    #[test]
    fn missing_excluded_dir_is_ignored() {
        let dir = tempdir().expect("tempdir");
        touch(&dir.path().join("2024/7_kim.pdf"));

        let index = FileIndex::scan_excluding(
            dir.path(),
            SubjectKind::Resume,
            "",
            &[dir.path().join("AI_Access")],
        )
        .expect("scan");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn ai_scan_is_flat_and_prefixed() {
        let dir = tempdir().expect("tempdir");
        touch(&dir.path().join("20_resume.pdf"));
        touch(&dir.path().join("20_resume_metadata.json"));
        touch(&dir.path().join("nested/21_resume.pdf"));

        let resumes =
            FileIndex::scan(dir.path(), SubjectKind::AiResume, "AI_Access/").expect("scan");
        assert_eq!(
            resumes.locate(20).expect("locate").expect("present").remote_path,
            "AI_Access/20_resume.pdf"
        );
        assert!(resumes.locate(21).expect("locate").is_none());

        let metadata =
            FileIndex::scan(dir.path(), SubjectKind::Metadata, "AI_Access").expect("scan");
        assert_eq!(
            metadata.locate(20).expect("locate").expect("present").file_name,
            "20_resume_metadata.json"
        );
    }

    #[test]
    fn vanished_file_is_an_io_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("30_gone.pdf");
        touch(&path);
        let index = FileIndex::scan(dir.path(), SubjectKind::AiResume, "").expect("scan");
        fs::remove_file(&path).expect("remove");
        assert!(matches!(index.locate(30), Err(LocateError::Io { .. })));
    }

    #[test]
    fn missing_root_is_reported() {
        let dir = tempdir().expect("tempdir");
        let err = FileIndex::scan(dir.path().join("nope"), SubjectKind::Resume, "")
            .expect_err("missing");
        assert!(matches!(err, LocateError::MissingRoot(_)));
    }
}
