use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eduinfo_sync::{
    build_fetcher, build_pipeline, connect_database, load_registry, maybe_build_scheduler,
    render_check_details, render_pipeline_summary, render_update_summary, run_and_report,
    run_migrations, validate_sources, Pipeline, PipelineOptions, SyncConfig,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "eduinfo")]
#[command(about = "eduInfo data pipeline: update checks, downloads, imports and view refresh")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check sources for upstream changes and record what was seen.
    Check {
        /// Show every source with method-specific detail.
        #[arg(long)]
        detailed: bool,
        ids: Vec<String>,
    },
    /// Check, download, import and refresh views.
    Run {
        #[arg(long)]
        check_only: bool,
        #[arg(long)]
        dry_run: bool,
        ids: Vec<String>,
    },
    RefreshViews,
    /// Probe every enabled source and sample CSV headers.
    Validate,
    Migrate,
    /// Run the pipeline on `PIPELINE_CRON` until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match dispatch(cli.command.unwrap_or(Commands::Run {
        check_only: false,
        dry_run: false,
        ids: Vec::new(),
    }))
    .await
    {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// `Ok(false)` means the command ran but reported a failure.
async fn dispatch(command: Commands) -> Result<bool> {
    let config = SyncConfig::from_env();

    match command {
        Commands::Check { detailed, ids } => {
            let pipeline = build_pipeline(&config).await?;
            let ids = (!ids.is_empty()).then_some(ids);
            let results = pipeline.check(ids.as_deref()).await?;
            if detailed {
                println!("{}", render_check_details(&results));
            }
            let updates = results
                .iter()
                .filter(|r| r.has_update)
                .cloned()
                .collect::<Vec<_>>();
            print!("{}", render_update_summary(&updates));
            Ok(true)
        }
        Commands::Run {
            check_only,
            dry_run,
            ids,
        } => {
            let pipeline = build_pipeline(&config).await?;
            cancel_on_ctrl_c(&pipeline);
            let options = PipelineOptions {
                check_only,
                dry_run: dry_run || config.dry_run,
                source_ids: (!ids.is_empty()).then_some(ids),
            };
            let (report, written) =
                run_and_report(&pipeline, &options, config.reports_dir.as_deref()).await?;
            print!("{}", render_update_summary(&report.updates));
            println!();
            print!("{}", render_pipeline_summary(&report));
            if let Some(dir) = written {
                println!("\nreport written to {}", dir.display());
            }
            Ok(report.is_success())
        }
        Commands::RefreshViews => {
            let pipeline = build_pipeline(&config).await?;
            let timings = pipeline.refresh_views().await?;
            for timing in &timings {
                println!("refreshed {} in {} ms", timing.view, timing.duration_ms);
            }
            Ok(true)
        }
        Commands::Validate => {
            let registry = load_registry(&config).await?;
            let fetcher = build_fetcher(&config)?;
            let report = validate_sources(&fetcher, &registry.sources).await;
            print!("{}", report.render());
            Ok(report.is_ok())
        }
        Commands::Migrate => {
            let pool = connect_database(&config).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
            Ok(true)
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline(&config).await?);
            cancel_on_ctrl_c(&pipeline);
            let Some(mut sched) = maybe_build_scheduler(pipeline.clone(), &config).await? else {
                bail!("scheduler is disabled; set EDUINFO_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.pipeline_cron, "scheduler started");
            pipeline.cancellation_token().cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
            Ok(true)
        }
    }
}

fn cancel_on_ctrl_c(pipeline: &Pipeline) {
    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current step");
            token.cancel();
        }
    });
}
