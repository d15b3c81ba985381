use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrsync_core::{
    merge_batch, CandidateRecord, DerivedRow, MappingAuditRecord, MappingStatus, StageId,
    TransferAuditRecord, TransferStep,
};
use tokio::sync::Mutex;

use crate::store::{
    CandidateStore, MappingStore, PageCommit, ProjectionRefresh, StageStatus, StoreError,
    TransferStore,
};

/// In-process store with the same semantics as [`crate::PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    candidates: BTreeMap<i64, CandidateRecord>,
    sp_candidates: BTreeMap<i64, DerivedRow>,
    ai_candidates: BTreeMap<i64, DerivedRow>,
    audits: HashMap<StageId, BTreeMap<i64, MappingAuditRecord>>,
    transfers: HashMap<TransferStep, BTreeMap<i64, TransferAuditRecord>>,
}

impl MemoryState {
    fn source_ids_after(&self, stage: StageId, after: Option<i64>) -> Vec<i64> {
        match stage {
            StageId::SharePoint => keys_after(&self.candidates, after),
            StageId::AiAccess => keys_after(&self.sp_candidates, after),
            StageId::Metadata => keys_after(&self.ai_candidates, after),
        }
    }

    fn has_source(&self, stage: StageId, candidate_id: i64) -> bool {
        match stage {
            StageId::SharePoint => self.candidates.contains_key(&candidate_id),
            StageId::AiAccess => self.sp_candidates.contains_key(&candidate_id),
            StageId::Metadata => self.ai_candidates.contains_key(&candidate_id),
        }
    }

    fn source_row(&self, stage: StageId, candidate_id: i64) -> Option<DerivedRow> {
        match stage {
            StageId::SharePoint => self
                .candidates
                .get(&candidate_id)
                .cloned()
                .map(DerivedRow::projection),
            StageId::AiAccess => self.sp_candidates.get(&candidate_id).cloned(),
            StageId::Metadata => self.ai_candidates.get(&candidate_id).cloned(),
        }
    }

    fn status_of(&self, stage: StageId, candidate_id: i64) -> Option<MappingStatus> {
        self.audits
            .get(&stage)
            .and_then(|audits| audits.get(&candidate_id))
            .map(|record| record.status)
    }

    fn is_eligible(&self, stage: StageId, candidate_id: i64, reprocess_terminal: bool) -> bool {
        if let Some(prior) = stage.prior() {
            if self.status_of(prior, candidate_id) != Some(MappingStatus::Success) {
                return false;
            }
        }
        reprocess_terminal
            || !self
                .status_of(stage, candidate_id)
                .is_some_and(MappingStatus::is_terminal)
    }

    fn write_target(&mut self, stage: StageId, row: &DerivedRow) {
        let id = row.candidate_id();
        match stage {
            StageId::SharePoint => {
                self.sp_candidates.insert(
                    id,
                    DerivedRow {
                        metadata_link: None,
                        ..row.clone()
                    },
                );
            }
            StageId::AiAccess => {
                let metadata_link = self
                    .ai_candidates
                    .get(&id)
                    .and_then(|existing| existing.metadata_link.clone());
                self.ai_candidates.insert(
                    id,
                    DerivedRow {
                        metadata_link,
                        ..row.clone()
                    },
                );
            }
            StageId::Metadata => {
                if let Some(existing) = self.ai_candidates.get_mut(&id) {
                    existing.metadata_link = row.metadata_link.clone();
                }
            }
        }
    }
}

/// Copy everything but the id, attachment columns and `raw` from `primary`.
/// Returns whether `derived` changed.
fn refresh_row(derived: &mut DerivedRow, primary: &CandidateRecord) -> bool {
    let refreshed = CandidateRecord {
        attachments: derived.candidate.attachments.clone(),
        raw: derived.candidate.raw.clone(),
        ..primary.clone()
    };
    if derived.candidate == refreshed {
        return false;
    }
    derived.candidate = refreshed;
    true
}

fn keys_after<V>(map: &BTreeMap<i64, V>, after: Option<i64>) -> Vec<i64> {
    let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
    map.range((lower, Bound::Unbounded)).map(|(id, _)| *id).collect()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn candidate(&self, candidate_id: i64) -> Option<CandidateRecord> {
        self.state.lock().await.candidates.get(&candidate_id).cloned()
    }

    pub async fn sp_candidate(&self, candidate_id: i64) -> Option<DerivedRow> {
        self.state.lock().await.sp_candidates.get(&candidate_id).cloned()
    }

    pub async fn ai_candidate(&self, candidate_id: i64) -> Option<DerivedRow> {
        self.state.lock().await.ai_candidates.get(&candidate_id).cloned()
    }

    /// Every audit record for `step`, ordered by id.
    pub async fn transfers(&self, step: TransferStep) -> Vec<TransferAuditRecord> {
        self.state
            .lock()
            .await
            .transfers
            .get(&step)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every audit record for `stage`, ordered by id.
    pub async fn audits(&self, stage: StageId) -> Vec<MappingAuditRecord> {
        self.state
            .lock()
            .await
            .audits
            .get(&stage)
            .map(|audits| audits.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CandidateStore for MemoryStore {
    async fn max_updated_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.candidates.values().filter_map(|c| c.updated_at).max())
    }

    async fn upsert_batch(&self, rows: &[CandidateRecord]) -> Result<usize, StoreError> {
        let merged = merge_batch(rows.to_vec());
        let written = merged.len();
        let mut state = self.state.lock().await;
        for row in merged {
            match state.candidates.get_mut(&row.candidate_id) {
                Some(existing) => existing.merge_from(row),
                None => {
                    state.candidates.insert(row.candidate_id, row);
                }
            }
        }
        Ok(written)
    }

    async fn candidate_count(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.candidates.len() as i64)
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn eligible_page(
        &self,
        stage: StageId,
        after: Option<i64>,
        limit: usize,
        reprocess_terminal: bool,
    ) -> Result<Vec<DerivedRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .source_ids_after(stage, after)
            .into_iter()
            .filter(|id| state.is_eligible(stage, *id, reprocess_terminal))
            .take(limit)
            .filter_map(|id| state.source_row(stage, id))
            .collect())
    }

    async fn commit_page(&self, commit: &PageCommit) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stage = commit.stage;
        let ids = commit
            .audits
            .iter()
            .map(|a| a.candidate_id)
            .chain(commit.rows.iter().map(DerivedRow::candidate_id));
        for candidate_id in ids {
            if !state.has_source(stage, candidate_id) {
                return Err(StoreError::MissingSource {
                    stage,
                    candidate_id,
                });
            }
        }

        for row in &commit.rows {
            state.write_target(stage, row);
        }
        let audits = state.audits.entry(stage).or_default();
        for record in &commit.audits {
            audits.insert(record.candidate_id, record.clone());
        }
        Ok(())
    }

    async fn refresh_projections(&self) -> Result<ProjectionRefresh, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut refresh = ProjectionRefresh::default();
        for (id, row) in state.sp_candidates.iter_mut() {
            if let Some(primary) = state.candidates.get(id) {
                refresh.sp_rows += u64::from(refresh_row(row, primary));
            }
        }
        for (id, row) in state.ai_candidates.iter_mut() {
            if let Some(primary) = state.candidates.get(id) {
                refresh.ai_rows += u64::from(refresh_row(row, primary));
            }
        }
        Ok(refresh)
    }

    async fn record_attempt(&self, record: &MappingAuditRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.has_source(record.stage, record.candidate_id) {
            return Err(StoreError::MissingSource {
                stage: record.stage,
                candidate_id: record.candidate_id,
            });
        }
        state
            .audits
            .entry(record.stage)
            .or_default()
            .insert(record.candidate_id, record.clone());
        Ok(())
    }

    async fn is_terminal(&self, candidate_id: i64, stage: StageId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .status_of(stage, candidate_id)
            .is_some_and(MappingStatus::is_terminal))
    }

    async fn audit_record(
        &self,
        candidate_id: i64,
        stage: StageId,
    ) -> Result<Option<MappingAuditRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audits
            .get(&stage)
            .and_then(|audits| audits.get(&candidate_id))
            .cloned())
    }

    async fn status_counts(&self, stage: StageId) -> Result<StageStatus, StoreError> {
        let state = self.state.lock().await;
        let mut status = StageStatus {
            source_rows: state.source_ids_after(stage, None).len() as i64,
            ..StageStatus::default()
        };
        for record in state.audits.get(&stage).into_iter().flat_map(|a| a.values()) {
            match record.status {
                MappingStatus::Success => status.success += 1,
                MappingStatus::NoSubject => status.no_subject += 1,
                MappingStatus::Failed => status.failed += 1,
                MappingStatus::Pending => {}
            }
        }
        Ok(status)
    }

    async fn failed_records(
        &self,
        stage: StageId,
        limit: usize,
    ) -> Result<Vec<MappingAuditRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut failed: Vec<MappingAuditRecord> = state
            .audits
            .get(&stage)
            .into_iter()
            .flat_map(|a| a.values())
            .filter(|r| r.status == MappingStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| {
            b.attempted_at
                .cmp(&a.attempted_at)
                .then(a.candidate_id.cmp(&b.candidate_id))
        });
        failed.truncate(limit);
        Ok(failed)
    }
}

impl MemoryState {
    fn transfer_status(&self, step: TransferStep, candidate_id: i64) -> Option<MappingStatus> {
        self.transfers
            .get(&step)
            .and_then(|records| records.get(&candidate_id))
            .map(|record| record.status)
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn transfer_page(
        &self,
        step: TransferStep,
        after: Option<i64>,
        limit: usize,
        reprocess_terminal: bool,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CandidateRecord>, StoreError> {
        let state = self.state.lock().await;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(state
            .candidates
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| !record.attachments.is_empty())
            .filter(|record| match updated_since {
                Some(since) => record.updated_at.is_some_and(|updated| updated >= since),
                None => true,
            })
            .filter(|record| match step.prior() {
                Some(prior) => {
                    state.transfer_status(prior, record.candidate_id) == Some(MappingStatus::Success)
                }
                None => true,
            })
            .filter(|record| {
                reprocess_terminal
                    || !state
                        .transfer_status(step, record.candidate_id)
                        .is_some_and(MappingStatus::is_terminal)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_transfer(&self, record: &TransferAuditRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.candidates.contains_key(&record.candidate_id) {
            return Err(StoreError::Corrupt {
                candidate_id: record.candidate_id,
                detail: format!("no candidate row for {} audit", record.step),
            });
        }
        state
            .transfers
            .entry(record.step)
            .or_default()
            .insert(record.candidate_id, record.clone());
        Ok(())
    }

    async fn transfer_record(
        &self,
        candidate_id: i64,
        step: TransferStep,
    ) -> Result<Option<TransferAuditRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .get(&step)
            .and_then(|records| records.get(&candidate_id))
            .cloned())
    }

    async fn transfer_counts(&self, step: TransferStep) -> Result<StageStatus, StoreError> {
        let state = self.state.lock().await;
        let mut status = StageStatus {
            source_rows: state
                .candidates
                .values()
                .filter(|c| !c.attachments.is_empty())
                .count() as i64,
            ..StageStatus::default()
        };
        for record in state.transfers.get(&step).into_iter().flat_map(|r| r.values()) {
            match record.status {
                MappingStatus::Success => status.success += 1,
                MappingStatus::NoSubject => status.no_subject += 1,
                MappingStatus::Failed => status.failed += 1,
                MappingStatus::Pending => {}
            }
        }
        Ok(status)
    }

    async fn failed_transfers(
        &self,
        step: TransferStep,
        limit: usize,
    ) -> Result<Vec<TransferAuditRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut failed: Vec<TransferAuditRecord> = state
            .transfers
            .get(&step)
            .into_iter()
            .flat_map(|r| r.values())
            .filter(|r| r.status == MappingStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| {
            b.attempted_at
                .cmp(&a.attempted_at)
                .then(a.candidate_id.cmp(&b.candidate_id))
        });
        failed.truncate(limit);
        Ok(failed)
    }
}
