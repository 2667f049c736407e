use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use anaglyph_client::config::Configuration;
use anaglyph_client::events::{
    PipelinePhase, PipelineSnapshot, UploadSource, UserAction, Viewport,
};
use anaglyph_client::processing::layout::plan_layout;
use anaglyph_client::remote::HttpStageClient;
use anaglyph_client::tasks::{console, coordinator, export};

#[derive(Debug, Parser)]
#[command(
    name = "anaglyph-client",
    version,
    about = "Turn photos into depth maps and red/cyan anaglyphs"
)]
struct Cli {
    /// Path to YAML config; defaults apply when omitted
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable); RUST_LOG wins when set
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one image through the pipeline and export the results
    Render(RenderArgs),
    /// Drive the pipeline from console commands
    Interactive {
        /// Export directory (overrides output-directory)
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Print the image/depth-map arrangement for a viewport
    Layout {
        #[arg(long, value_name = "RATIO")]
        aspect_ratio: f64,
        #[arg(long, value_name = "PX")]
        width: u32,
        #[arg(long, value_name = "PX")]
        height: u32,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["image", "random"])))]
struct RenderArgs {
    /// Local image to upload
    #[arg(long, value_name = "FILE")]
    image: Option<PathBuf>,
    /// Use one of the backend's sample images
    #[arg(long)]
    random: bool,
    #[arg(long, value_name = "BOOL")]
    pop_out: Option<bool>,
    /// Maximum disparity in percent of the image width (0-6)
    #[arg(long, value_name = "PERCENT")]
    strength: Option<f32>,
    #[arg(long, value_name = "BOOL")]
    minimize_rivalry: Option<bool>,
    #[arg(long, value_name = "WxH")]
    viewport: Option<Viewport>,
    /// Export directory (overrides output-directory)
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,
    /// Give up when the pipeline has not settled after this long
    #[arg(long, value_name = "DURATION", default_value = "5m", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

fn init_tracing(verbosity: u8) {
    let fallback = match verbosity {
        0 => "info",
        1 => "anaglyph_client=debug,info",
        _ => "anaglyph_client=trace,debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .compact()
        .init();
}

fn load_configuration(path: Option<&PathBuf>) -> Result<Configuration> {
    let cfg = match path {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    };
    cfg.with_env_overrides()?
        .validated()
        .context("invalid configuration values")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Layout {
            aspect_ratio,
            width,
            height,
        } => {
            let plan = plan_layout(aspect_ratio, Viewport { width, height });
            println!("layout: {:?}", plan.layout);
            println!(
                "pair: {:.1}x{:.1} at ({:.1}, {:.1})",
                plan.pair.width, plan.pair.height, plan.pair.x, plan.pair.y
            );
            for (label, rect) in ["source", "depth-map"].iter().zip(plan.images) {
                println!(
                    "{label}: {:.1}x{:.1} at ({:.1}, {:.1})",
                    rect.width, rect.height, rect.x, rect.y
                );
            }
            Ok(())
        }
        Command::Render(args) => {
            let cfg = load_configuration(cli.config.as_ref())?;
            render(cfg, args).await
        }
        Command::Interactive { out } => {
            let cfg = load_configuration(cli.config.as_ref())?;
            interactive(cfg, out).await
        }
    }
}

/// Running pipeline tasks plus the handles a front end needs.
struct Pipeline {
    actions: mpsc::Sender<UserAction>,
    snapshots: watch::Receiver<PipelineSnapshot>,
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

fn spawn_pipeline(cfg: &Configuration, out: Option<PathBuf>) -> Result<Pipeline> {
    let remote = Arc::new(HttpStageClient::new(&cfg.backend)?);
    tracing::info!(backend = %remote.base_url(), "using backend");

    let (actions_tx, actions_rx) = mpsc::channel::<UserAction>(cfg.action_queue_depth);
    let (snapshot_tx, snapshot_rx) = watch::channel(PipelineSnapshot::default());
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let mut tasks = JoinSet::new();

    // Coordinator
    tasks.spawn({
        let cancel = cancel.clone();
        let options = coordinator::PipelineOptions::from(&cfg.upload);
        let parameters = cfg.anaglyph;
        async move {
            coordinator::run(actions_rx, snapshot_tx, remote, options, parameters, cancel)
                .await
                .context("coordinator task failed")
        }
    });

    // Exporter
    tasks.spawn({
        let snapshots = snapshot_rx.clone();
        let dir = out.unwrap_or_else(|| cfg.output_directory.clone());
        async move {
            export::run(snapshots, dir)
                .await
                .context("export task failed")
        }
    });

    Ok(Pipeline {
        actions: actions_tx,
        snapshots: snapshot_rx,
        cancel,
        tasks,
    })
}

async fn shutdown(pipeline: Pipeline) -> PipelineSnapshot {
    let Pipeline {
        actions,
        snapshots,
        cancel,
        mut tasks,
    } = pipeline;
    cancel.cancel();
    drop(actions);
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }
    snapshots.borrow().clone()
}

async fn render(mut cfg: Configuration, args: RenderArgs) -> Result<()> {
    if let Some(pop_out) = args.pop_out {
        cfg.anaglyph = cfg.anaglyph.with_pop_out(pop_out);
    }
    if let Some(minimize_rivalry) = args.minimize_rivalry {
        cfg.anaglyph = cfg.anaglyph.with_minimize_rivalry(minimize_rivalry);
    }
    if let Some(strength) = args.strength {
        cfg.anaglyph = cfg
            .anaglyph
            .with_strength(strength)
            .with_context(|| format!("invalid --strength {strength}"))?;
    }

    let source = match &args.image {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            UploadSource::File {
                name: path.display().to_string(),
                bytes: Bytes::from(bytes),
            }
        }
        None => UploadSource::RandomSample,
    };

    let started = Instant::now();
    let mut pipeline = spawn_pipeline(&cfg, args.out)?;
    if let Some(viewport) = args.viewport {
        pipeline
            .actions
            .send(UserAction::ResizeViewport(viewport))
            .await
            .context("pipeline stopped before start")?;
    }
    pipeline
        .actions
        .send(UserAction::Upload(source))
        .await
        .context("pipeline stopped before start")?;

    let cancel = pipeline.cancel.clone();
    let settled = tokio::select! {
        _ = cancel.cancelled() => false,
        waited = tokio::time::timeout(args.timeout, pipeline.snapshots.wait_for(PipelineSnapshot::is_settled)) => {
            matches!(waited, Ok(Ok(_)))
        }
    };

    let snapshot = shutdown(pipeline).await;
    let elapsed = humantime::format_duration(Duration::from_millis(
        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    ));

    if !settled {
        bail!("pipeline did not settle (phase {:?} after {elapsed})", snapshot.phase);
    }
    match (snapshot.phase, &snapshot.last_error) {
        (PipelinePhase::AnaglyphReady, _) => {
            tracing::info!(%elapsed, "anaglyph ready");
            if let Some(plan) = snapshot.layout() {
                println!("layout: {:?}", plan.layout);
            }
            Ok(())
        }
        (phase, Some(err)) => bail!("pipeline ended in {phase:?} after {elapsed}: {err}"),
        (phase, None) => bail!("pipeline ended in {phase:?} after {elapsed}"),
    }
}

async fn interactive(cfg: Configuration, out: Option<PathBuf>) -> Result<()> {
    let pipeline = spawn_pipeline(&cfg, out)?;
    println!("{}", console::HELP);
    let result = console::run(
        pipeline.actions.clone(),
        pipeline.snapshots.clone(),
        pipeline.cancel.clone(),
    )
    .await;
    let snapshot = shutdown(pipeline).await;
    tracing::info!(phase = ?snapshot.phase, "interactive session finished");
    result
}
