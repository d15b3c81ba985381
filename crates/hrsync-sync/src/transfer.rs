//! File steps ahead of link mapping: resume downloads into the resume tree and
//! the flat AI-access copy. Both keep one audit row per candidate with the same
//! PENDING -> SUCCESS | NO_SUBJECT | FAILED outcomes as the mapping stages.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hrsync_adapters::{
    candidate_display_name, choose_resume, dated_subdir, detect_extension, resume_file_name,
    unique_path, AttachmentSource, FileIndex, SubjectKind, SubjectLocator,
};
use hrsync_core::{CandidateRecord, TransferAuditRecord, TransferStep};
use hrsync_storage::TransferStore;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, DEFAULT_BATCH_SIZE};
use crate::mapper::Tally;

pub const MASTER_INDEX_FILE: &str = "_master_index.json";

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub batch_size: usize,
    /// Revisit ids that already reached SUCCESS or NO_SUBJECT.
    pub reprocess_terminal: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            reprocess_terminal: false,
        }
    }
}

impl TransferOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            reprocess_terminal: !config.skip_if_already_downloaded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRunSummary {
    pub run_id: Uuid,
    pub step: TransferStep,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub no_subject: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

/// One file step applied to a single candidate at a time.
#[async_trait]
pub trait TransferWorker: Send + Sync {
    fn step(&self) -> TransferStep;

    /// Lower bound on `updated_at` for eligible rows.
    fn updated_since(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }

    /// Never fails; problems become a FAILED record.
    async fn attempt(&self, candidate: &CandidateRecord) -> TransferAuditRecord;

    /// Runs once after every page was processed.
    async fn finish(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Walks the eligible rows of one step in id order and records each outcome.
pub struct TransferRunner<'a> {
    store: &'a dyn TransferStore,
    options: TransferOptions,
}

impl<'a> TransferRunner<'a> {
    pub fn new(store: &'a dyn TransferStore, options: TransferOptions) -> Self {
        Self { store, options }
    }

    pub async fn run(&self, worker: &dyn TransferWorker) -> anyhow::Result<TransferRunSummary> {
        let run_id = Uuid::new_v4();
        let step = worker.step();
        let started_at = Utc::now();
        let timer = Instant::now();
        let span = info_span!(
            "transfer_run",
            %run_id,
            %step,
            reprocess = self.options.reprocess_terminal
        );

        let tally = async {
            let tally = self.drain(worker).await?;
            worker
                .finish()
                .await
                .with_context(|| format!("finishing {step}"))?;
            anyhow::Ok(tally)
        }
        .instrument(span)
        .await?;

        let summary = TransferRunSummary {
            run_id,
            step,
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
            %step,
            processed = summary.processed,
            succeeded = summary.succeeded,
            no_subject = summary.no_subject,
            failed = summary.failed,
            "transfer run finished"
        );
        Ok(summary)
    }

    async fn drain(&self, worker: &dyn TransferWorker) -> anyhow::Result<Tally> {
        let step = worker.step();
        let updated_since = worker.updated_since(Utc::now());
        let batch_size = self.options.batch_size.max(1);
        let mut tally = Tally::default();
        let mut after = None;

        loop {
            let rows = self
                .store
                .transfer_page(
                    step,
                    after,
                    batch_size,
                    self.options.reprocess_terminal,
                    updated_since,
                )
                .await
                .with_context(|| format!("loading {step} page after {after:?}"))?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.candidate_id);

            for candidate in &rows {
                let record = worker.attempt(candidate).await;
                tally.count(record.status);
                self.store
                    .record_transfer(&record)
                    .await
                    .with_context(|| {
                        format!("recording {step} for candidate {}", candidate.candidate_id)
                    })?;
            }
            tally.pages += 1;
            debug!(page = tally.pages, rows = rows.len(), "transfer page recorded");
        }

        Ok(tally)
    }
}

fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub prefer_pdf: bool,
    pub max_age: Option<Duration>,
    pub call_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            prefer_pdf: true,
            max_age: None,
            call_delay: Duration::ZERO,
        }
    }
}

impl DownloadOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            prefer_pdf: config.prefer_pdf,
            max_age: config.download_max_age,
            call_delay: config.download_call_delay,
        }
    }
}

/// Saves each candidate's preferred resume attachment as
/// `{resume_dir}/YYYY/MM_Month/{id}_{name}_{YYYYMMDD}{ext}`.
pub struct ResumeDownloader<'a> {
    source: &'a dyn AttachmentSource,
    resume_dir: PathBuf,
    options: DownloadOptions,
}

impl<'a> ResumeDownloader<'a> {
    pub fn new(
        source: &'a dyn AttachmentSource,
        resume_dir: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            source,
            resume_dir: resume_dir.into(),
            options,
        }
    }

    async fn save(&self, dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = unique_path(&dir.join(file_name));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[async_trait]
impl TransferWorker for ResumeDownloader<'_> {
    fn step(&self) -> TransferStep {
        TransferStep::ResumeDownload
    }

    fn updated_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let max_age = chrono::Duration::from_std(self.options.max_age?).ok()?;
        now.checked_sub_signed(max_age)
    }

    async fn attempt(&self, candidate: &CandidateRecord) -> TransferAuditRecord {
        let candidate_id = candidate.candidate_id;
        let step = self.step();

        let Some(resume) = choose_resume(&candidate.raw, self.options.prefer_pdf) else {
            return TransferAuditRecord::no_subject(candidate_id, step, Utc::now());
        };
        let Some(url) = resume.url.clone() else {
            warn!(candidate_id, filename = %resume.filename, "resume attachment has no url");
            return TransferAuditRecord::failed(
                candidate_id,
                step,
                None,
                "resume attachment has no url",
                Utc::now(),
            );
        };

        let fetched = self.source.download(&url).await;
        if !self.options.call_delay.is_zero() {
            tokio::time::sleep(self.options.call_delay).await;
        }
        let now = Utc::now();
        let file = match fetched {
            Ok(file) => file,
            Err(err) => {
                warn!(candidate_id, error = %err, "resume download failed");
                return TransferAuditRecord::failed(candidate_id, step, Some(url), err.to_string(), now);
            }
        };

        let extension = detect_extension(&file, &url, &resume.filename);
        let dated = resume.created_at.or(candidate.created_at);
        let file_name = resume_file_name(
            candidate_id,
            &candidate_display_name(candidate),
            dated,
            &extension,
        );
        let dir = self.resume_dir.join(dated_subdir(dated.unwrap_or(now)));

        match self.save(&dir, &file_name, &file.bytes).await {
            Ok(path) => {
                let relative = path.strip_prefix(&self.resume_dir).unwrap_or(&path);
                let saved = slash_path(relative);
                debug!(candidate_id, %saved, bytes = file.bytes.len(), "resume saved");
                TransferAuditRecord::success(
                    candidate_id,
                    step,
                    url,
                    saved,
                    i64::try_from(file.bytes.len()).unwrap_or(i64::MAX),
                    now,
                )
            }
            Err(err) => {
                let detail = format!("writing {}: {err}", dir.join(&file_name).display());
                warn!(candidate_id, %detail, "resume download failed");
                TransferAuditRecord::failed(candidate_id, step, Some(url), detail, now)
            }
        }
    }
}

/// Copies each downloaded resume flat into the AI-access directory and writes
/// a `{stem}_metadata.json` companion next to it.
pub struct AiAccessCopier<'a> {
    resumes: &'a dyn SubjectLocator,
    ai_dir: PathBuf,
    ai_prefix: String,
}

impl<'a> AiAccessCopier<'a> {
    /// `resumes` must not index the AI-access directory itself.
    pub fn new(
        resumes: &'a dyn SubjectLocator,
        ai_dir: impl Into<PathBuf>,
        ai_prefix: impl Into<String>,
    ) -> Self {
        Self {
            resumes,
            ai_dir: ai_dir.into(),
            ai_prefix: ai_prefix.into().trim_matches('/').to_string(),
        }
    }

    fn ai_access_path(&self, file_name: &str) -> String {
        if self.ai_prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.ai_prefix, file_name)
        }
    }

    async fn copy_one(
        &self,
        candidate: &CandidateRecord,
        source: &Path,
        file_name: &str,
    ) -> std::io::Result<u64> {
        tokio::fs::create_dir_all(&self.ai_dir).await?;
        let size = tokio::fs::metadata(source).await?.len();
        let dest = self.ai_dir.join(file_name);
        let current = tokio::fs::metadata(&dest).await.ok().map(|m| m.len());
        if current != Some(size) {
            tokio::fs::copy(source, &dest).await?;
        }

        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());
        let metadata = self.metadata_document(candidate, file_name, size);
        let body = serde_json::to_vec_pretty(&metadata).map_err(std::io::Error::other)?;
        tokio::fs::write(self.ai_dir.join(format!("{stem}_metadata.json")), body).await?;
        Ok(size)
    }

    fn metadata_document(&self, candidate: &CandidateRecord, file_name: &str, size: u64) -> Value {
        let extension = Path::new(file_name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        let content = candidate.resume_content.trim();
        json!({
            "candidate_id": candidate.candidate_id,
            "candidate_name": candidate_display_name(candidate),
            "original_filename": file_name,
            "file_extension": extension,
            "file_size_bytes": size,
            "created_at": candidate
                .created_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            "extracted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "text_extracted": !content.is_empty(),
            "text_content": (!content.is_empty()).then_some(content),
            "ai_access_path": self.ai_access_path(file_name),
        })
    }

    /// `_master_index.json`: every flat resume with its metadata companion.
    fn master_index(&self) -> anyhow::Result<Value> {
        let resumes = FileIndex::scan(&self.ai_dir, SubjectKind::AiResume, "")?;
        let metadata = FileIndex::scan(&self.ai_dir, SubjectKind::Metadata, "")?;
        let mut entries = Vec::with_capacity(resumes.len());
        for candidate_id in resumes.candidate_ids() {
            let Some(resume) = resumes.locate(candidate_id)? else {
                continue;
            };
            let metadata_file = metadata.locate(candidate_id)?.map(|m| m.file_name);
            entries.push(json!({
                "candidate_id": candidate_id,
                "filename": resume.file_name,
                "metadata_file": metadata_file,
                "ai_access_path": self.ai_access_path(&resume.file_name),
            }));
        }
        Ok(json!({
            "created_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "total_resumes": entries.len(),
            "resumes": entries,
        }))
    }
}

#[async_trait]
impl TransferWorker for AiAccessCopier<'_> {
    fn step(&self) -> TransferStep {
        TransferStep::AiAccessCopy
    }

    async fn attempt(&self, candidate: &CandidateRecord) -> TransferAuditRecord {
        let candidate_id = candidate.candidate_id;
        let step = self.step();

        let subject = match self.resumes.locate(candidate_id) {
            Ok(Some(subject)) => subject,
            Ok(None) => return TransferAuditRecord::no_subject(candidate_id, step, Utc::now()),
            Err(err) => {
                warn!(candidate_id, error = %err, "resume lookup failed");
                return TransferAuditRecord::failed(candidate_id, step, None, err.to_string(), Utc::now());
            }
        };

        let source_ref = subject.local_path.display().to_string();
        let copied = self
            .copy_one(candidate, &subject.local_path, &subject.file_name)
            .await;
        let now = Utc::now();
        match copied {
            Ok(size) => TransferAuditRecord::success(
                candidate_id,
                step,
                source_ref,
                self.ai_access_path(&subject.file_name),
                i64::try_from(size).unwrap_or(i64::MAX),
                now,
            ),
            Err(err) => {
                warn!(candidate_id, error = %err, "ai-access copy failed");
                TransferAuditRecord::failed(candidate_id, step, Some(source_ref), err.to_string(), now)
            }
        }
    }

    async fn finish(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.ai_dir)
            .await
            .with_context(|| format!("creating {}", self.ai_dir.display()))?;
        let index = self.master_index()?;
        let path = self.ai_dir.join(MASTER_INDEX_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&index)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "master index written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hrsync_core::MappingStatus;
    use hrsync_storage::{
        CandidateStore, FetchError, FetchedFile, HttpClientConfig, HttpFetcher, MemoryStore,
        RetryPolicy,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).single().expect("ts")
    }

    fn candidate(id: i64, url: &str) -> CandidateRecord {
        let mut record = CandidateRecord::blank(id);
        record.first_name = "Jane".into();
        record.last_name = "Doe".into();
        record.full_name = "Jane Doe".into();
        record.created_at = Some(at(1));
        record.updated_at = Some(at(2));
        record.resume_content = "Rust, Postgres".into();
        record.attachments.push(url, "cv.pdf");
        record.raw = json!({
            "id": id,
            "attachments": [
                {"type": "resume", "url": url, "filename": "cv.pdf", "created_at": "2024-02-10T08:00:00Z"}
            ]
        });
        record
    }

    async fn seeded(rows: &[CandidateRecord]) -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_batch(rows).await.expect("seed");
        store
    }

    /// Serves a fixed body for every url and counts calls.
    #[derive(Default)]
    struct CannedAttachments {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AttachmentSource for CannedAttachments {
        async fn download(&self, url: &str) -> Result<FetchedFile, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("expired") {
                return Err(FetchError::HttpStatus {
                    status: 403,
                    url: url.to_string(),
                });
            }
            Ok(FetchedFile {
                url: url.to_string(),
                bytes: b"%PDF".to_vec(),
                content_type: Some("application/pdf".into()),
                content_disposition: None,
            })
        }
    }

    #[tokio::test]
    async fn downloads_are_saved_by_date_and_audited() {
        let dir = tempdir().expect("tempdir");
        let mut no_resume = candidate(3, "https://s3/three");
        no_resume.raw = json!({"id": 3, "attachments": [{"type": "offer_letter", "url": "https://s3/o"}]});
        let store = seeded(&[
            candidate(1, "https://s3/one"),
            candidate(2, "https://s3/expired"),
            no_resume,
        ])
        .await;
        let source = CannedAttachments::default();
        let downloader = ResumeDownloader::new(&source, dir.path(), DownloadOptions::default());

        let summary = TransferRunner::new(&store, TransferOptions { batch_size: 2, ..Default::default() })
            .run(&downloader)
            .await
            .expect("run");

        assert_eq!(summary.pages, 2);
        assert_eq!(
            (summary.succeeded, summary.failed, summary.no_subject),
            (1, 1, 1)
        );
        let saved = dir.path().join("2024/02_February/1_Jane Doe_20240210.pdf");
        assert_eq!(std::fs::read(&saved).expect("saved file"), b"%PDF");

        let audits = store.transfers(TransferStep::ResumeDownload).await;
        assert_eq!(audits[0].saved_path.as_deref(), Some("2024/02_February/1_Jane Doe_20240210.pdf"));
        assert_eq!(audits[0].file_size_bytes, Some(4));
        assert_eq!(audits[1].status, MappingStatus::Failed);
        assert_eq!(audits[1].source_ref.as_deref(), Some("https://s3/expired"));
        assert_eq!(audits[2].status, MappingStatus::NoSubject);

        // Terminal ids are skipped next time; the failure is retried.
        let again = TransferRunner::new(&store, TransferOptions::default())
            .run(&downloader)
            .await
            .expect("second run");
        assert_eq!(again.processed, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stale_candidates_are_not_downloaded() {
        let dir = tempdir().expect("tempdir");
        let store = seeded(&[candidate(1, "https://s3/one")]).await;
        let source = CannedAttachments::default();
        let downloader = ResumeDownloader::new(
            &source,
            dir.path(),
            DownloadOptions {
                max_age: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
        );

        let summary = TransferRunner::new(&store, TransferOptions::default())
            .run(&downloader)
            .await
            .expect("run");
        assert_eq!(summary.processed, 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn signed_url_download_goes_through_http_fetcher() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"Resume.docx\"")
                    .set_body_bytes(b"docx".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempdir().expect("tempdir");
        let url = format!("{}/bucket/7?X-Amz-Signature=abc", server.uri());
        let mut record = candidate(7, &url);
        record.raw["attachments"][0]["filename"] = json!("Resume");
        let store = seeded(&[record]).await;
        let http = HttpFetcher::new(HttpClientConfig {
            retry: RetryPolicy {
                connection_retries: 0,
                ..RetryPolicy::default()
            },
            ..Default::default()
        })
        .expect("fetcher");
        let downloader = ResumeDownloader::new(&http, dir.path(), DownloadOptions::default());

        TransferRunner::new(&store, TransferOptions::default())
            .run(&downloader)
            .await
            .expect("run");

        let audit = store
            .transfer_record(7, TransferStep::ResumeDownload)
            .await
            .expect("audit")
            .expect("present");
        assert_eq!(audit.status, MappingStatus::Success);
        assert_eq!(
            audit.saved_path.as_deref(),
            Some("2024/02_February/7_Jane Doe_20240210.docx")
        );
    }

    #[tokio::test]
    async fn ai_copy_flattens_downloads_and_writes_metadata() {
        let root = tempdir().expect("tempdir");
        let ai_dir = root.path().join("AI_Access");
        std::fs::create_dir_all(root.path().join("2024/02_February")).expect("mkdir");
        std::fs::write(root.path().join("2024/02_February/1_Jane Doe_20240210.pdf"), b"%PDF-1").expect("write");
        std::fs::create_dir_all(&ai_dir).expect("mkdir");
        std::fs::write(ai_dir.join("2_stale.pdf"), b"old").expect("write");

        let store = seeded(&[candidate(1, "https://s3/one"), candidate(2, "https://s3/two")]).await;
        for id in [1, 2] {
            store
                .record_transfer(&TransferAuditRecord::success(
                    id,
                    TransferStep::ResumeDownload,
                    "https://s3",
                    "x",
                    1,
                    at(3),
                ))
                .await
                .expect("record");
        }

        let resumes = FileIndex::scan_excluding(root.path(), SubjectKind::Resume, "", &[ai_dir.clone()])
            .expect("scan");
        let copier = AiAccessCopier::new(&resumes, &ai_dir, "AI_Access");
        let summary = TransferRunner::new(&store, TransferOptions::default())
            .run(&copier)
            .await
            .expect("run");

        // The stray AI copy of id 2 is not a source file.
        assert_eq!((summary.succeeded, summary.no_subject), (1, 1));
        assert_eq!(
            std::fs::read(ai_dir.join("1_Jane Doe_20240210.pdf")).expect("copy"),
            b"%PDF-1"
        );

        let metadata: Value = serde_json::from_slice(
            &std::fs::read(ai_dir.join("1_Jane Doe_20240210_metadata.json")).expect("metadata"),
        )
        .expect("json");
        assert_eq!(metadata["candidate_id"], 1);
        assert_eq!(metadata["candidate_name"], "Jane Doe");
        assert_eq!(metadata["file_extension"], ".pdf");
        assert_eq!(metadata["file_size_bytes"], 6);
        assert_eq!(metadata["text_content"], "Rust, Postgres");
        assert_eq!(metadata["ai_access_path"], "AI_Access/1_Jane Doe_20240210.pdf");

        let audit = store
            .transfer_record(1, TransferStep::AiAccessCopy)
            .await
            .expect("audit")
            .expect("present");
        assert_eq!(audit.saved_path.as_deref(), Some("AI_Access/1_Jane Doe_20240210.pdf"));

        let index: Value = serde_json::from_slice(
            &std::fs::read(ai_dir.join(MASTER_INDEX_FILE)).expect("index"),
        )
        .expect("json");
        assert_eq!(index["total_resumes"], 2);
        assert_eq!(index["resumes"][0]["metadata_file"], "1_Jane Doe_20240210_metadata.json");
        assert_eq!(index["resumes"][1]["filename"], "2_stale.pdf");
        assert_eq!(index["resumes"][1]["metadata_file"], Value::Null);

        // The flat layout is exactly what the AI-access mapping stage scans.
        let flat = FileIndex::scan(&ai_dir, SubjectKind::AiResume, "AI_Access").expect("scan");
        assert_eq!(
            flat.locate(1).expect("locate").expect("present").remote_path,
            "AI_Access/1_Jane Doe_20240210.pdf"
        );
    }
}
