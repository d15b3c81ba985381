use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use hrsync_adapters::{ReferenceResolver, SubjectLocator};
use hrsync_core::{AttachmentGroup, DerivedRow, MappingAuditRecord, MappingStatus, StageId};
use hrsync_storage::{MappingStore, PageCommit};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, DEFAULT_BATCH_SIZE};

#[derive(Debug, Clone)]
pub struct MapperOptions {
    pub batch_size: usize,
    pub call_delay: Duration,
    /// Revisit ids that already reached SUCCESS or NO_SUBJECT.
    pub reprocess_terminal: bool,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            call_delay: Duration::ZERO,
            reprocess_terminal: false,
        }
    }
}

impl MapperOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            call_delay: config.map_call_delay,
            reprocess_terminal: !config.skip_if_already_mapped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingRunSummary {
    pub run_id: Uuid,
    pub stage: StageId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub no_subject: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub(crate) pages: usize,
    pub(crate) processed: usize,
    pub(crate) succeeded: usize,
    pub(crate) no_subject: usize,
    pub(crate) failed: usize,
}

impl Tally {
    pub(crate) fn count(&mut self, status: MappingStatus) {
        self.processed += 1;
        match status {
            MappingStatus::Success => self.succeeded += 1,
            MappingStatus::NoSubject => self.no_subject += 1,
            MappingStatus::Failed | MappingStatus::Pending => self.failed += 1,
        }
    }
}

/// Drives one stage of the link-mapping cascade over its eligible rows.
pub struct LinkMapper<'a> {
    store: &'a dyn MappingStore,
    locator: &'a dyn SubjectLocator,
    resolver: &'a dyn ReferenceResolver,
    options: MapperOptions,
}

impl<'a> LinkMapper<'a> {
    pub fn new(
        store: &'a dyn MappingStore,
        locator: &'a dyn SubjectLocator,
        resolver: &'a dyn ReferenceResolver,
        options: MapperOptions,
    ) -> Self {
        Self {
            store,
            locator,
            resolver,
            options,
        }
    }

    pub async fn run(&self, stage: StageId) -> anyhow::Result<MappingRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = Instant::now();
        let span = info_span!(
            "map_run",
            %run_id,
            %stage,
            reprocess = self.options.reprocess_terminal
        );

        let tally = self.drain(stage).instrument(span).await?;

        let summary = MappingRunSummary {
            run_id,
            stage,
            started_at,
            finished_at: Utc::now(),
            pages: tally.pages,
            processed: tally.processed,
            succeeded: tally.succeeded,
            no_subject: tally.no_subject,
            failed: tally.failed,
            elapsed_ms: timer.elapsed().as_millis(),
        };
        info!(
            %run_id,
            %stage,
            processed = summary.processed,
            succeeded = summary.succeeded,
            no_subject = summary.no_subject,
            failed = summary.failed,
            "mapping run finished"
        );
        Ok(summary)
    }

    async fn drain(&self, stage: StageId) -> anyhow::Result<Tally> {
        let mut tally = Tally::default();
        let mut after = None;
        let batch_size = self.options.batch_size.max(1);

        loop {
            let rows = self
                .store
                .eligible_page(stage, after, batch_size, self.options.reprocess_terminal)
                .await
                .with_context(|| format!("loading {stage} page after {after:?}"))?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.candidate_id());

            let mut commit = PageCommit {
                stage,
                audits: Vec::with_capacity(rows.len()),
                rows: Vec::new(),
            };
            for row in rows {
                let (audit, target) = self.map_one(stage, row).await;
                tally.count(audit.status);
                commit.audits.push(audit);
                commit.rows.extend(target);
            }

            self.store
                .commit_page(&commit)
                .await
                .with_context(|| format!("committing {stage} page ending at {after:?}"))?;
            tally.pages += 1;
            debug!(page = tally.pages, written = commit.rows.len(), "mapping page committed");
        }

        Ok(tally)
    }

    async fn map_one(&self, stage: StageId, row: DerivedRow) -> (MappingAuditRecord, Option<DerivedRow>) {
        let candidate_id = row.candidate_id();

        let subject = match self.locator.locate(candidate_id) {
            Ok(Some(subject)) => subject,
            Ok(None) => {
                return (MappingAuditRecord::no_subject(candidate_id, stage, Utc::now()), None);
            }
            Err(err) => {
                warn!(candidate_id, %stage, error = %err, "subject lookup failed");
                return (
                    MappingAuditRecord::failed(candidate_id, stage, err.to_string(), Utc::now()),
                    None,
                );
            }
        };

        let resolved = self.resolver.resolve(&subject).await;
        if !self.options.call_delay.is_zero() {
            tokio::time::sleep(self.options.call_delay).await;
        }

        let now = Utc::now();
        match resolved {
            Ok(Some(link)) => {
                let target = apply_resolution(stage, row, &link, &subject.file_name, now);
                (MappingAuditRecord::success(candidate_id, stage, link, now), Some(target))
            }
            Ok(None) => {
                let detail = format!("no remote item at {}", subject.remote_path);
                warn!(candidate_id, %stage, %detail, "mapping failed");
                (MappingAuditRecord::failed(candidate_id, stage, detail, now), None)
            }
            Err(err) => {
                warn!(candidate_id, %stage, error = %err, "mapping failed");
                (MappingAuditRecord::failed(candidate_id, stage, err.to_string(), now), None)
            }
        }
    }
}

/// Target row for a successful resolution of `row` at `stage`.
pub fn apply_resolution(
    stage: StageId,
    mut row: DerivedRow,
    link: &str,
    file_name: &str,
    mapped_at: DateTime<Utc>,
) -> DerivedRow {
    match stage {
        StageId::SharePoint | StageId::AiAccess => {
            row.candidate.attachments = AttachmentGroup::single(link, file_name);
            rewrite_raw_resume(&mut row.candidate.raw, link, file_name, mapped_at);
            row.resolved_link = Some(link.to_string());
        }
        StageId::Metadata => {
            row.metadata_link = Some(link.to_string());
        }
    }
    row
}

/// Point the first resume attachment of a raw Harvest payload at `link`.
pub fn rewrite_raw_resume(raw: &mut Value, link: &str, file_name: &str, mapped_at: DateTime<Utc>) {
    let Some(attachments) = raw.get_mut("attachments").and_then(Value::as_array_mut) else {
        return;
    };
    let resume = attachments
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|a| a.get("type").and_then(Value::as_str) == Some("resume"));
    if let Some(resume) = resume {
        resume.insert("url".into(), json!(link));
        resume.insert("filename".into(), json!(file_name));
        resume.insert("source".into(), json!("sharepoint"));
        resume.insert(
            "mapped_at".into(),
            json!(mapped_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }
}
