use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use hrsync_adapters::{
    AttachmentSource, CandidateSource, FileIndex, GraphResolver, HarvestSource, LocateError,
    ReferenceResolver, SubjectKind,
};
use hrsync_core::{StageId, TransferStep};
use hrsync_storage::{
    CandidateStore, HttpFetcher, MappingStore, PgStore, ProjectionRefresh, TransferStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

mod config;
mod coordinator;
mod mapper;
mod transfer;

pub use config::{ConfigError, SyncConfig};
pub use coordinator::{SyncCoordinator, SyncOptions, SyncRunSummary};
pub use mapper::{
    apply_resolution, rewrite_raw_resume, LinkMapper, MapperOptions, MappingRunSummary,
};
pub use transfer::{
    AiAccessCopier, DownloadOptions, ResumeDownloader, TransferOptions, TransferRunSummary,
    TransferRunner, TransferWorker, MASTER_INDEX_FILE,
};

pub const CRATE_NAME: &str = "hrsync-sync";

/// Local directories scanned for mapping subjects.
#[derive(Debug, Clone)]
pub struct SubjectDirs {
    pub resume_dir: PathBuf,
    pub ai_access_dir: PathBuf,
    /// Remote path of the AI-access directory below the resume folder.
    pub ai_remote_prefix: String,
}

impl SubjectDirs {
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            resume_dir: config.require_mapping()?.to_path_buf(),
            ai_access_dir: config.resolved_ai_access_dir()?,
            ai_remote_prefix: config.ai_remote_prefix()?,
        })
    }

    /// One scan of the directory holding `stage`'s subjects. The resume tree
    /// scan never descends into the AI-access copies.
    pub fn index_for(&self, stage: StageId) -> Result<FileIndex, LocateError> {
        let kind = SubjectKind::for_stage(stage);
        match stage {
            StageId::SharePoint => FileIndex::scan_excluding(
                &self.resume_dir,
                kind,
                "",
                std::slice::from_ref(&self.ai_access_dir),
            ),
            StageId::AiAccess | StageId::Metadata => {
                FileIndex::scan(&self.ai_access_dir, kind, self.ai_remote_prefix.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub succeeded: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub sync: Option<SyncRunSummary>,
    pub refresh: Option<ProjectionRefresh>,
    pub transfers: Vec<TransferRunSummary>,
    pub mappings: Vec<MappingRunSummary>,
    pub steps: Vec<StepReport>,
}

impl PipelineSummary {
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.succeeded)
            .map(|s| s.step.as_str())
            .collect()
    }

    fn record<T>(
        &mut self,
        step: impl Into<String>,
        outcome: &Result<T>,
        describe: impl Fn(&T) -> String,
    ) {
        let step = step.into();
        let (succeeded, detail) = match outcome {
            Ok(value) => (true, describe(value)),
            Err(err) => {
                error!(step = %step, error = %format!("{err:#}"), "pipeline step failed");
                (false, format!("{err:#}"))
            }
        };
        self.steps.push(StepReport {
            step,
            succeeded,
            detail,
        });
    }
}

/// Sync, projection refresh, the two file steps, then every mapping stage in
/// cascade order. A failed step is recorded and the next one still runs.
pub struct Pipeline<'a> {
    pub source: &'a dyn CandidateSource,
    pub candidates: &'a dyn CandidateStore,
    pub mappings: &'a dyn MappingStore,
    pub transfers: &'a dyn TransferStore,
    pub attachments: &'a dyn AttachmentSource,
    pub resolver: &'a dyn ReferenceResolver,
    pub dirs: SubjectDirs,
    pub sync_options: SyncOptions,
    pub transfer_options: TransferOptions,
    pub download_options: DownloadOptions,
    pub mapper_options: MapperOptions,
}

impl Pipeline<'_> {
    pub async fn transfer(&self, step: TransferStep) -> Result<TransferRunSummary> {
        let runner = TransferRunner::new(self.transfers, self.transfer_options.clone());
        match step {
            TransferStep::ResumeDownload => {
                let downloader = ResumeDownloader::new(
                    self.attachments,
                    &self.dirs.resume_dir,
                    self.download_options.clone(),
                );
                runner.run(&downloader).await
            }
            TransferStep::AiAccessCopy => {
                let resumes = self
                    .dirs
                    .index_for(StageId::SharePoint)
                    .context("scanning downloaded resumes")?;
                let copier = AiAccessCopier::new(
                    &resumes,
                    &self.dirs.ai_access_dir,
                    self.dirs.ai_remote_prefix.as_str(),
                );
                runner.run(&copier).await
            }
        }
    }

    pub async fn map_stage(&self, stage: StageId) -> Result<MappingRunSummary> {
        let index = self
            .dirs
            .index_for(stage)
            .with_context(|| format!("scanning subjects for {stage}"))?;
        LinkMapper::new(self.mappings, &index, self.resolver, self.mapper_options.clone())
            .run(stage)
            .await
    }

    pub async fn run(&self, force_full: bool) -> PipelineSummary {
        let mut summary = PipelineSummary::default();

        let sync = SyncCoordinator::new(self.source, self.candidates, self.sync_options.clone())
            .run(force_full)
            .await;
        summary.record("sync", &sync, |s| {
            format!("{} fetched, {} upserted, {} skipped", s.fetched, s.upserted, s.skipped)
        });
        summary.sync = sync.ok();

        let refresh = self
            .mappings
            .refresh_projections()
            .await
            .context("refreshing derived rows");
        summary.record("refresh projections", &refresh, |r| {
            format!("{} sharepoint rows, {} ai rows", r.sp_rows, r.ai_rows)
        });
        summary.refresh = refresh.ok();

        for step in TransferStep::ALL {
            let moved = self.transfer(step).await;
            summary.record(format!("transfer {step}"), &moved, |t| {
                format!(
                    "{} processed, {} succeeded, {} no subject, {} failed",
                    t.processed, t.succeeded, t.no_subject, t.failed
                )
            });
            if let Ok(moved) = moved {
                summary.transfers.push(moved);
            }
        }

        for stage in StageId::ALL {
            let mapped = self.map_stage(stage).await;
            summary.record(format!("map {stage}"), &mapped, |m| {
                format!(
                    "{} processed, {} succeeded, {} no subject, {} failed",
                    m.processed, m.succeeded, m.no_subject, m.failed
                )
            });
            if let Ok(mapped) = mapped {
                summary.mappings.push(mapped);
            }
        }

        let failed = summary.failed_steps();
        if failed.is_empty() {
            info!("pipeline finished");
        } else {
            warn!(failed = ?failed, "pipeline finished with failed steps");
        }
        summary
    }
}

/// Markdown overview of the primary store, the file steps and every mapping
/// stage.
pub async fn status_markdown(
    candidates: &dyn CandidateStore,
    mappings: &dyn MappingStore,
    transfers: &dyn TransferStore,
    failed_limit: usize,
) -> Result<String> {
    let count = candidates.candidate_count().await.context("counting candidates")?;
    let high_water = candidates
        .max_updated_at()
        .await
        .context("reading high-water mark")?
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "none".to_string());

    let mut lines = vec!["# Candidate Sync Status".to_string(), String::new()];
    lines.push(format!("- candidates: {count}"));
    lines.push(format!("- high-water mark: {high_water}"));

    for step in TransferStep::ALL {
        let status = transfers
            .transfer_counts(step)
            .await
            .with_context(|| format!("counting {step} audits"))?;
        lines.push(String::new());
        lines.push(format!("## Step `{step}`"));
        lines.push(format!("- candidates with resumes: {}", status.source_rows));
        lines.push(format!("- success: {}", status.success));
        lines.push(format!("- no subject: {}", status.no_subject));
        lines.push(format!("- failed: {}", status.failed));

        if failed_limit == 0 || status.failed == 0 {
            continue;
        }
        let failures = transfers
            .failed_transfers(step, failed_limit)
            .await
            .with_context(|| format!("listing {step} failures"))?;
        lines.push(String::new());
        lines.push("### Recent failures".to_string());
        for record in failures {
            lines.push(format!(
                "- `{}` at {}: {}",
                record.candidate_id,
                record.attempted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                record.error_detail.as_deref().unwrap_or("-")
            ));
        }
    }

    for stage in StageId::ALL {
        let status = mappings
            .status_counts(stage)
            .await
            .with_context(|| format!("counting {stage} audits"))?;
        lines.push(String::new());
        lines.push(format!("## Stage `{stage}`"));
        lines.push(format!("- source rows: {}", status.source_rows));
        lines.push(format!("- success: {}", status.success));
        lines.push(format!("- no subject: {}", status.no_subject));
        lines.push(format!("- failed: {}", status.failed));
        lines.push(format!("- unattempted: {}", status.unattempted()));

        if failed_limit == 0 || status.failed == 0 {
            continue;
        }
        let failures = mappings
            .failed_records(stage, failed_limit)
            .await
            .with_context(|| format!("listing {stage} failures"))?;
        lines.push(String::new());
        lines.push("### Recent failures".to_string());
        for record in failures {
            lines.push(format!(
                "- `{}` at {}: {}",
                record.candidate_id,
                record.attempted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                record.error_detail.as_deref().unwrap_or("-")
            ));
        }
    }

    Ok(lines.join("\n"))
}

/// Live collaborators built from one [`SyncConfig`].
pub struct Services {
    pub config: SyncConfig,
    pub store: PgStore,
}

impl Services {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url, config.database_max_connections)
            .await
            .context("connecting to database")?;
        Ok(Self { config, store })
    }

    pub fn harvest_source(&self) -> Result<HarvestSource> {
        let api_key = self.config.require_source()?.to_string();
        let fetcher = HttpFetcher::new(self.config.http_client_config(Some(api_key)))
            .context("building harvest client")?;
        Ok(HarvestSource::new(
            fetcher,
            self.config.greenhouse_base_url.as_str(),
            self.config.page_size,
        ))
    }

    pub fn graph_resolver(&self) -> Result<GraphResolver> {
        let graph = self.config.require_resolver()?;
        let http = HttpFetcher::new(self.config.http_client_config(None))
            .context("building graph client")?;
        Ok(GraphResolver::new(http, graph))
    }

    /// Plain client for signed attachment urls; no Harvest credentials.
    pub fn attachment_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(self.config.http_client_config(None)).context("building download client")
    }

    pub async fn sync(&self, force_full: bool) -> Result<SyncRunSummary> {
        let source = self.harvest_source()?;
        SyncCoordinator::new(&source, &self.store, SyncOptions::from_config(&self.config))
            .run(force_full)
            .await
    }

    pub async fn map(&self, stage: StageId, reprocess: bool) -> Result<MappingRunSummary> {
        let dirs = SubjectDirs::from_config(&self.config)?;
        let resolver = self.graph_resolver()?;
        let index = dirs
            .index_for(stage)
            .with_context(|| format!("scanning subjects for {stage}"))?;
        let mut options = MapperOptions::from_config(&self.config);
        options.reprocess_terminal |= reprocess;
        LinkMapper::new(&self.store, &index, &resolver, options)
            .run(stage)
            .await
    }

    pub async fn refresh(&self) -> Result<ProjectionRefresh> {
        self.store
            .refresh_projections()
            .await
            .context("refreshing derived rows")
    }

    fn transfer_options(&self, reprocess: bool) -> TransferOptions {
        let mut options = TransferOptions::from_config(&self.config);
        options.reprocess_terminal |= reprocess;
        options
    }

    pub async fn download(&self, reprocess: bool) -> Result<TransferRunSummary> {
        let dirs = SubjectDirs::from_config(&self.config)?;
        let fetcher = self.attachment_fetcher()?;
        let downloader = ResumeDownloader::new(
            &fetcher,
            &dirs.resume_dir,
            DownloadOptions::from_config(&self.config),
        );
        TransferRunner::new(&self.store, self.transfer_options(reprocess))
            .run(&downloader)
            .await
    }

    pub async fn copy_ai_access(&self, reprocess: bool) -> Result<TransferRunSummary> {
        let dirs = SubjectDirs::from_config(&self.config)?;
        let resumes = dirs
            .index_for(StageId::SharePoint)
            .context("scanning downloaded resumes")?;
        let copier = AiAccessCopier::new(
            &resumes,
            &dirs.ai_access_dir,
            dirs.ai_remote_prefix.as_str(),
        );
        TransferRunner::new(&self.store, self.transfer_options(reprocess))
            .run(&copier)
            .await
    }

    pub async fn pipeline(&self, force_full: bool) -> Result<PipelineSummary> {
        let source = self.harvest_source()?;
        let fetcher = self.attachment_fetcher()?;
        let resolver = self.graph_resolver()?;
        let pipeline = Pipeline {
            source: &source,
            candidates: &self.store,
            mappings: &self.store,
            transfers: &self.store,
            attachments: &fetcher,
            resolver: &resolver,
            dirs: SubjectDirs::from_config(&self.config)?,
            sync_options: SyncOptions::from_config(&self.config),
            transfer_options: TransferOptions::from_config(&self.config),
            download_options: DownloadOptions::from_config(&self.config),
            mapper_options: MapperOptions::from_config(&self.config),
        };
        Ok(pipeline.run(force_full).await)
    }

    pub async fn status(&self, failed_limit: usize) -> Result<String> {
        status_markdown(&self.store, &self.store, &self.store, failed_limit).await
    }
}

/// Connect with `config` and run the whole pipeline once.
pub async fn run_pipeline(config: SyncConfig, force_full: bool) -> Result<PipelineSummary> {
    config.require_source()?;
    SubjectDirs::from_config(&config)?;
    config.require_resolver()?;
    let services = Services::connect(config).await?;
    services.pipeline(force_full).await
}

/// Scheduled pipeline runs, when enabled in `config`.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(
            async move {
                match run_pipeline(config, false).await {
                    Ok(summary) => info!(failed = ?summary.failed_steps(), "scheduled pipeline run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled pipeline run failed"),
                }
            }
            .instrument(info_span!("scheduled_run")),
        )
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
