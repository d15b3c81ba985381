use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hrsync_core::StageId;
use hrsync_sync::{
    maybe_build_scheduler, run_pipeline, Services, SubjectDirs, SyncConfig, TransferRunSummary,
};
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "hrsync")]
#[command(about = "Greenhouse candidate sync and resume link mapping")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull candidates updated since the last run.
    Sync {
        /// Ignore the stored high-water mark and start from INITIAL_SINCE.
        #[arg(long)]
        full: bool,
    },
    /// Copy updated non-link columns into the derived tables.
    Refresh,
    /// Download each candidate's newest resume into the dated resume tree.
    Download {
        /// Download again even when a previous attempt finished.
        #[arg(long)]
        reprocess: bool,
    },
    /// Copy downloaded resumes flat into the AI-access directory.
    AiCopy {
        #[arg(long)]
        reprocess: bool,
    },
    /// Run one mapping stage: sharepoint, ai-access or metadata.
    Map {
        stage: StageId,
        /// Revisit ids that already succeeded or had no file.
        #[arg(long)]
        reprocess: bool,
    },
    /// Sync, refresh, download, AI-access copy, then every mapping stage.
    Pipeline {
        #[arg(long)]
        full: bool,
    },
    /// Print store and audit counts as markdown.
    Status {
        /// Recent failures to list per stage.
        #[arg(long, default_value_t = 10)]
        failed: usize,
    },
    /// Apply the bundled schema migrations.
    Migrate,
    /// Run the pipeline on SYNC_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging(logging::LogFormat::from_env()?)?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Sync { full } => {
            config.require_source()?;
            let services = Services::connect(config).await?;
            let summary = services.sync(full).await?;
            println!(
                "sync complete: run_id={} window={} pages={} fetched={} upserted={} skipped={} elapsed_ms={}",
                summary.run_id,
                summary.window.to_rfc3339(),
                summary.pages,
                summary.fetched,
                summary.upserted,
                summary.skipped,
                summary.elapsed_ms
            );
        }
        Commands::Refresh => {
            let services = Services::connect(config).await?;
            let refreshed = services.refresh().await?;
            println!(
                "refresh complete: sharepoint_rows={} ai_rows={}",
                refreshed.sp_rows, refreshed.ai_rows
            );
        }
        Commands::Download { reprocess } => {
            SubjectDirs::from_config(&config)?;
            let services = Services::connect(config).await?;
            print_transfer(&services.download(reprocess).await?);
        }
        Commands::AiCopy { reprocess } => {
            SubjectDirs::from_config(&config)?;
            let services = Services::connect(config).await?;
            print_transfer(&services.copy_ai_access(reprocess).await?);
        }
        Commands::Map { stage, reprocess } => {
            SubjectDirs::from_config(&config)?;
            config.require_resolver()?;
            let services = Services::connect(config).await?;
            let summary = services.map(stage, reprocess).await?;
            println!(
                "map {} complete: run_id={} processed={} succeeded={} no_subject={} failed={}",
                summary.stage,
                summary.run_id,
                summary.processed,
                summary.succeeded,
                summary.no_subject,
                summary.failed
            );
        }
        Commands::Pipeline { full } => {
            let summary = run_pipeline(config, full).await?;
            let failed = summary.failed_steps();
            println!(
                "pipeline complete: steps={} failed={}",
                summary.steps.len(),
                if failed.is_empty() { "none".to_string() } else { failed.join(",") }
            );
            if !failed.is_empty() {
                bail!("pipeline steps failed: {}", failed.join(", "));
            }
        }
        Commands::Status { failed } => {
            let services = Services::connect(config).await?;
            println!("{}", services.status(failed).await?);
        }
        Commands::Migrate => {
            let services = Services::connect(config).await?;
            services.store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            config.require_source()?;
            SubjectDirs::from_config(&config)?;
            config.require_resolver()?;
            let cron = config.sync_cron.clone();
            let Some(mut sched) = maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set HRSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            println!("scheduler stopped");
        }
    }

    Ok(())
}

fn print_transfer(summary: &TransferRunSummary) {
    println!(
        "{} complete: run_id={} processed={} succeeded={} no_subject={} failed={}",
        summary.step,
        summary.run_id,
        summary.processed,
        summary.succeeded,
        summary.no_subject,
        summary.failed
    );
}
