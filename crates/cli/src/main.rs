//! `meshforge` -- submit one ComfyUI workflow and follow it to completion.
//!
//! ```text
//! meshforge <workflow.json> [light|heavy] [output_dir]
//! ```
//!
//! Progress, queue position and connection status are logged as the job
//! runs. On success the image outputs and mesh files are printed, and
//! images are downloaded into `output_dir` when one is given. Ctrl-C
//! abandons the job; the server keeps running it.
//!
//! Connection settings come from the `COMFYUI_*` environment variables
//! documented on [`ComfyUIConfig::from_env`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use meshforge_comfyui::queue::QueuePosition;
use meshforge_comfyui::tracker::{JobClass, JobObserver, JobOutcome, JobTrackerError};
use meshforge_comfyui::{ComfyUIConfig, ComfyUIController, JobResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: meshforge <workflow.json> [light|heavy] [output_dir]";

#[derive(Debug)]
struct Args {
    workflow: PathBuf,
    class: JobClass,
    output_dir: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let Some(workflow) = args.next() else {
        bail!(USAGE);
    };
    let class = match args.next().as_deref() {
        None | Some("light") => JobClass::Light,
        Some("heavy") => JobClass::Heavy,
        Some(other) => bail!("unknown job class {other:?}\n{USAGE}"),
    };
    Ok(Args {
        workflow: workflow.into(),
        class,
        output_dir: args.next().map(PathBuf::from),
    })
}

/// Reports job activity through `tracing`.
struct LogObserver;

impl JobObserver for LogObserver {
    fn on_status(&self, text: &str) {
        tracing::info!("{text}");
    }

    fn on_queue_depth(&self, queue_remaining: u32) {
        tracing::info!(queue_remaining, "Queue depth changed");
    }

    fn on_queue_position(&self, job_id: &str, position: QueuePosition) {
        tracing::info!(prompt_id = %job_id, "Job is {position}");
    }

    fn on_job_started(&self, job_id: &str) {
        tracing::info!(prompt_id = %job_id, "Execution started");
    }

    fn on_node_executing(&self, node_id: &str, job_id: &str) {
        tracing::info!(prompt_id = %job_id, node = %node_id, "Executing node");
    }

    fn on_progress(&self, value: u32, max: u32) {
        tracing::info!(
            "Progress {value}/{max} ({}%)",
            meshforge_comfyui::events::progress_percent(value, max)
        );
    }

    fn on_job_terminal(&self, outcome: &JobOutcome) {
        match outcome {
            Ok(result) => tracing::info!(prompt_id = %result.job_id, "Generation finished"),
            Err(JobTrackerError::Abandoned) => tracing::info!("Stopped tracking the job"),
            Err(e) => tracing::error!(error = %e, "Generation failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshforge_cli=info,meshforge_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = ComfyUIConfig::from_env()?;

    let raw = tokio::fs::read_to_string(&args.workflow)
        .await
        .with_context(|| format!("reading {}", args.workflow.display()))?;
    let workflow: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.workflow.display()))?;

    tracing::info!(
        workflow = %args.workflow.display(),
        class = ?args.class,
        api_url = %config.api_url,
        "Starting meshforge",
    );

    let controller = ComfyUIController::start(&config, Arc::new(LogObserver))?;

    let outcome = tokio::select! {
        outcome = controller.submit_and_track(&workflow, args.class) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, abandoning job");
            controller.abandon();
            Err(JobTrackerError::Abandoned)
        }
    };

    let report = match outcome {
        Ok(result) => report(&controller, &result, args.output_dir.as_deref(), &config).await,
        Err(e) => Err(e.into()),
    };

    controller.shutdown().await;
    report
}

/// Print what the job produced, downloading images into `output_dir`.
async fn report(
    controller: &ComfyUIController,
    result: &JobResult,
    output_dir: Option<&Path>,
    config: &ComfyUIConfig,
) -> anyhow::Result<()> {
    let images = result.images();
    let meshes = result.mesh_files();
    if images.is_empty() && meshes.is_empty() {
        println!("{}: finished with no image or mesh outputs", result.job_id);
    }

    for mesh in &meshes {
        println!("mesh  {mesh}");
    }

    for image in &images {
        let Some(dir) = output_dir else {
            println!("image {}/{}", image.subfolder, image.filename);
            continue;
        };
        let path = output_path(dir, &image.filename)?;
        let bytes = controller
            .api()
            .fetch_output(image, config.request_timeout)
            .await
            .with_context(|| format!("downloading {}", image.filename))?;
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("image {}", path.display());
    }

    Ok(())
}

/// Where a downloaded output lands. Only the final path component of the
/// server-supplied name is used, so nothing is written outside `dir`.
fn output_path(dir: &Path, filename: &str) -> anyhow::Result<PathBuf> {
    match Path::new(filename).file_name() {
        Some(name) => Ok(dir.join(name)),
        None => bail!("refusing to save output with unusable filename {filename:?}"),
    }
}
