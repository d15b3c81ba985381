//! Core domain model for candidate sync and link mapping.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hrsync-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("attachment columns are misaligned: {links} links vs {filenames} filenames")]
pub struct MisalignedColumns {
    pub links: usize,
    pub filenames: usize,
}

/// Resume attachments as two index-aligned columns.
///
/// Entries can only be added in pairs, so `links[i]` and `filenames[i]` always
/// come from the same source attachment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "AttachmentColumns", into = "AttachmentColumns")]
pub struct AttachmentGroup {
    links: Vec<String>,
    filenames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttachmentColumns {
    links: Vec<String>,
    filenames: Vec<String>,
}

impl TryFrom<AttachmentColumns> for AttachmentGroup {
    type Error = MisalignedColumns;

    fn try_from(value: AttachmentColumns) -> Result<Self, Self::Error> {
        Self::from_columns(value.links, value.filenames)
    }
}

impl From<AttachmentGroup> for AttachmentColumns {
    fn from(value: AttachmentGroup) -> Self {
        Self {
            links: value.links,
            filenames: value.filenames,
        }
    }
}

impl AttachmentGroup {
    pub fn single(link: impl Into<String>, filename: impl Into<String>) -> Self {
        let mut group = Self::default();
        group.push(link, filename);
        group
    }

    pub fn from_columns(
        links: Vec<String>,
        filenames: Vec<String>,
    ) -> Result<Self, MisalignedColumns> {
        if links.len() != filenames.len() {
            return Err(MisalignedColumns {
                links: links.len(),
                filenames: filenames.len(),
            });
        }
        Ok(Self { links, filenames })
    }

    pub fn push(&mut self, link: impl Into<String>, filename: impl Into<String>) {
        self.links.push(link.into());
        self.filenames.push(filename.into());
    }

    pub fn links(&self) -> &[String] {
        &self.links
    }

    pub fn filenames(&self) -> &[String] {
        &self.filenames
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.links
            .iter()
            .map(String::as_str)
            .zip(self.filenames.iter().map(String::as_str))
    }
}

/// Employment history. Alignment between the two columns depends on the
/// flattener's alignment policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmploymentGroup {
    pub titles: Vec<String>,
    pub companies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EducationGroup {
    pub degrees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplicationGroup {
    pub job_names: Vec<String>,
}

/// Flattened candidate row as stored in the primary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub attachments: AttachmentGroup,
    pub employment: EmploymentGroup,
    pub education: EducationGroup,
    pub applications: ApplicationGroup,
    pub resume_content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

impl CandidateRecord {
    /// Empty record for `candidate_id`, every text field blank.
    pub fn blank(candidate_id: i64) -> Self {
        Self {
            candidate_id,
            first_name: String::new(),
            last_name: String::new(),
            full_name: String::new(),
            email: String::new(),
            phone: String::new(),
            address: String::new(),
            attachments: AttachmentGroup::default(),
            employment: EmploymentGroup::default(),
            education: EducationGroup::default(),
            applications: ApplicationGroup::default(),
            resume_content: String::new(),
            created_at: None,
            updated_at: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Conflict rule for upserts: incoming values win, except that
    /// `created_at` keeps the earliest and `updated_at` the latest known value.
    pub fn merge_from(&mut self, incoming: CandidateRecord) {
        let created_at = earliest(self.created_at, incoming.created_at);
        let updated_at = latest(self.updated_at, incoming.updated_at);
        *self = incoming;
        self.created_at = created_at;
        self.updated_at = updated_at;
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Collapse duplicate ids within one batch using [`CandidateRecord::merge_from`].
/// First-seen order is kept.
pub fn merge_batch(rows: Vec<CandidateRecord>) -> Vec<CandidateRecord> {
    let mut index: HashMap<i64, usize> = HashMap::with_capacity(rows.len());
    let mut merged: Vec<CandidateRecord> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.candidate_id) {
            Some(&pos) => merged[pos].merge_from(row),
            None => {
                index.insert(row.candidate_id, merged.len());
                merged.push(row);
            }
        }
    }
    merged
}

/// Projection of a candidate held by a secondary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRow {
    pub candidate: CandidateRecord,
    pub resolved_link: Option<String>,
    pub metadata_link: Option<String>,
}

impl DerivedRow {
    pub fn projection(candidate: CandidateRecord) -> Self {
        Self {
            candidate,
            resolved_link: None,
            metadata_link: None,
        }
    }

    pub fn candidate_id(&self) -> i64 {
        self.candidate.candidate_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseNameError {
    pub kind: &'static str,
    pub value: String,
}

/// Link-mapping pipeline stages, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Resume file -> document-library link, written to the browsable store.
    SharePoint,
    /// Flat AI-access copy -> link, written to the machine-friendly store.
    AiAccess,
    /// Companion metadata file -> link on the machine-friendly store.
    Metadata,
}

impl StageId {
    pub const ALL: [StageId; 3] = [StageId::SharePoint, StageId::AiAccess, StageId::Metadata];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::SharePoint => "sharepoint",
            StageId::AiAccess => "ai_access",
            StageId::Metadata => "metadata",
        }
    }

    /// Stage whose SUCCESS outcome makes an id eligible here.
    pub fn prior(self) -> Option<StageId> {
        match self {
            StageId::SharePoint => None,
            StageId::AiAccess => Some(StageId::SharePoint),
            StageId::Metadata => Some(StageId::AiAccess),
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sharepoint" => Ok(StageId::SharePoint),
            "ai_access" => Ok(StageId::AiAccess),
            "metadata" => Ok(StageId::Metadata),
            _ => Err(ParseNameError {
                kind: "stage",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Pending,
    Success,
    NoSubject,
    Failed,
}

impl MappingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Success => "success",
            MappingStatus::NoSubject => "no_subject",
            MappingStatus::Failed => "failed",
        }
    }

    /// Terminal outcomes exclude an id from later runs of the same stage.
    pub fn is_terminal(self) -> bool {
        matches!(self, MappingStatus::Success | MappingStatus::NoSubject)
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MappingStatus::Pending),
            "success" => Ok(MappingStatus::Success),
            "no_subject" | "no_resume" => Ok(MappingStatus::NoSubject),
            "failed" => Ok(MappingStatus::Failed),
            _ => Err(ParseNameError {
                kind: "mapping status",
                value: s.to_string(),
            }),
        }
    }
}

/// Latest mapping attempt for one (candidate, stage) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingAuditRecord {
    pub candidate_id: i64,
    pub stage: StageId,
    pub status: MappingStatus,
    pub resolved_reference: Option<String>,
    pub error_detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl MappingAuditRecord {
    pub fn success(
        candidate_id: i64,
        stage: StageId,
        reference: impl Into<String>,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            candidate_id,
            stage,
            status: MappingStatus::Success,
            resolved_reference: Some(reference.into()),
            error_detail: None,
            attempted_at,
        }
    }

    pub fn no_subject(candidate_id: i64, stage: StageId, attempted_at: DateTime<Utc>) -> Self {
        Self {
            candidate_id,
            stage,
            status: MappingStatus::NoSubject,
            resolved_reference: None,
            error_detail: None,
            attempted_at,
        }
    }

    pub fn failed(
        candidate_id: i64,
        stage: StageId,
        detail: impl Into<String>,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            candidate_id,
            stage,
            status: MappingStatus::Failed,
            resolved_reference: None,
            error_detail: Some(detail.into()),
            attempted_at,
        }
    }
}


/// File steps that run before link mapping: fetching resume attachments and
/// flattening them into the AI-access directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStep {
    ResumeDownload,
    AiAccessCopy,
}

impl TransferStep {
    pub const ALL: [TransferStep; 2] = [TransferStep::ResumeDownload, TransferStep::AiAccessCopy];

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStep::ResumeDownload => "resume_download",
            TransferStep::AiAccessCopy => "ai_access_copy",
        }
    }

    /// Step whose SUCCESS outcome makes an id eligible here.
    pub fn prior(self) -> Option<TransferStep> {
        match self {
            TransferStep::ResumeDownload => None,
            TransferStep::AiAccessCopy => Some(TransferStep::ResumeDownload),
        }
    }
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStep {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "resume_download" | "download" => Ok(TransferStep::ResumeDownload),
            "ai_access_copy" | "ai_copy" => Ok(TransferStep::AiAccessCopy),
            _ => Err(ParseNameError {
                kind: "transfer step",
                value: s.to_string(),
            }),
        }
    }
}

/// Latest attempt of one transfer step for one candidate. `source_ref` is the
/// attachment URL or local source path, `saved_path` where the file landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAuditRecord {
    pub candidate_id: i64,
    pub step: TransferStep,
    pub status: MappingStatus,
    pub source_ref: Option<String>,
    pub saved_path: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub error_detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl TransferAuditRecord {
    pub fn success(
        candidate_id: i64,
        step: TransferStep,
        source_ref: impl Into<String>,
        saved_path: impl Into<String>,
        file_size_bytes: i64,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            candidate_id,
            step,
            status: MappingStatus::Success,
            source_ref: Some(source_ref.into()),
            saved_path: Some(saved_path.into()),
            file_size_bytes: Some(file_size_bytes),
            error_detail: None,
            attempted_at,
        }
    }

    pub fn no_subject(candidate_id: i64, step: TransferStep, attempted_at: DateTime<Utc>) -> Self {
        Self {
            candidate_id,
            step,
            status: MappingStatus::NoSubject,
            source_ref: None,
            saved_path: None,
            file_size_bytes: None,
            error_detail: None,
            attempted_at,
        }
    }

    pub fn failed(
        candidate_id: i64,
        step: TransferStep,
        source_ref: Option<String>,
        detail: impl Into<String>,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            candidate_id,
            step,
            status: MappingStatus::Failed,
            source_ref,
            saved_path: None,
            file_size_bytes: None,
            error_detail: Some(detail.into()),
            attempted_at,
        }
    }
}
