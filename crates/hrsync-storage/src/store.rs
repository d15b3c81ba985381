use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrsync_core::{
    CandidateRecord, DerivedRow, MappingAuditRecord, StageId, TransferAuditRecord, TransferStep,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row for candidate {candidate_id}: {detail}")]
    Corrupt { candidate_id: i64, detail: String },
    #[error("no {stage} source row for candidate {candidate_id}")]
    MissingSource { stage: StageId, candidate_id: i64 },
}

/// Primary candidate table.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    async fn max_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Idempotent merge of `rows`, committed once. Returns the number of
    /// distinct ids written.
    async fn upsert_batch(&self, rows: &[CandidateRecord]) -> Result<usize, StoreError>;

    async fn candidate_count(&self) -> Result<i64, StoreError>;
}

/// Everything one mapper page writes, committed atomically.
#[derive(Debug, Clone)]
pub struct PageCommit {
    pub stage: StageId,
    pub audits: Vec<MappingAuditRecord>,
    /// Target writes for ids that resolved successfully.
    pub rows: Vec<DerivedRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub source_rows: i64,
    pub success: i64,
    pub no_subject: i64,
    pub failed: i64,
}

impl StageStatus {
    /// Source rows with no recorded attempt.
    pub fn unattempted(&self) -> i64 {
        (self.source_rows - self.success - self.no_subject - self.failed).max(0)
    }
}

/// Rows touched by one projection refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionRefresh {
    pub sp_rows: u64,
    pub ai_rows: u64,
}

/// Secondary stores and the per-stage audit tables.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Up to `limit` source rows for `stage` with id greater than `after`,
    /// ordered by id. Rows need a SUCCESS audit for the prior stage and,
    /// unless `reprocess_terminal`, no terminal audit for `stage`.
    async fn eligible_page(
        &self,
        stage: StageId,
        after: Option<i64>,
        limit: usize,
        reprocess_terminal: bool,
    ) -> Result<Vec<DerivedRow>, StoreError>;

    async fn commit_page(&self, commit: &PageCommit) -> Result<(), StoreError>;

    /// Copy the primary row's scalar and list columns into every existing
    /// derived row. Attachment columns, `raw` and both link columns keep their
    /// mapped values. Returns the rows whose content changed.
    async fn refresh_projections(&self) -> Result<ProjectionRefresh, StoreError>;

    /// Overwrites any earlier attempt for the same id and stage.
    async fn record_attempt(&self, record: &MappingAuditRecord) -> Result<(), StoreError>;

    async fn is_terminal(&self, candidate_id: i64, stage: StageId) -> Result<bool, StoreError>;

    async fn audit_record(
        &self,
        candidate_id: i64,
        stage: StageId,
    ) -> Result<Option<MappingAuditRecord>, StoreError>;

    async fn status_counts(&self, stage: StageId) -> Result<StageStatus, StoreError>;

    /// Most recent FAILED attempts first.
    async fn failed_records(
        &self,
        stage: StageId,
        limit: usize,
    ) -> Result<Vec<MappingAuditRecord>, StoreError>;
}

/// Audit tables of the download and AI-access copy steps.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Up to `limit` primary rows with at least one resume attachment and id
    /// greater than `after`, ordered by id. A copy needs a SUCCESS download
    /// audit first. Unless `reprocess_terminal`, ids with a terminal audit for
    /// `step` are skipped. `updated_since` drops rows last updated earlier.
    async fn transfer_page(
        &self,
        step: TransferStep,
        after: Option<i64>,
        limit: usize,
        reprocess_terminal: bool,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CandidateRecord>, StoreError>;

    /// Overwrites any earlier attempt for the same id and step.
    async fn record_transfer(&self, record: &TransferAuditRecord) -> Result<(), StoreError>;

    async fn transfer_record(
        &self,
        candidate_id: i64,
        step: TransferStep,
    ) -> Result<Option<TransferAuditRecord>, StoreError>;

    /// `source_rows` counts primary rows with resume attachments.
    async fn transfer_counts(&self, step: TransferStep) -> Result<StageStatus, StoreError>;

    /// Most recent FAILED attempts first.
    async fn failed_transfers(
        &self,
        step: TransferStep,
        limit: usize,
    ) -> Result<Vec<TransferAuditRecord>, StoreError>;
}
