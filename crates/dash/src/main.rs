//! `llwatch` -- follow Lucas-Lehmer block and job progress from a terminal.
//!
//! Configuration comes from the environment (see
//! [`DashConfig::from_env`](llwatch_dash::config::DashConfig::from_env));
//! a `.env` file in the working directory is loaded first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use llwatch_client::artifact::download_artifact;
use llwatch_client::poller::{poll_artifact, DigitsState, PollOutcome};
use llwatch_client::refresh::LoadState;
use llwatch_client::surfaces::{ActiveBlockPanel, BlockDrawer, BlockGrid, PrimeList, RunSurface};
use llwatch_client::{ComputeApi, ComputeService, ConnectionState, SurfaceContext};
use llwatch_core::digits::{estimated_digits, validate_digits_exponent};
use llwatch_core::listing::SortOrder;
use llwatch_core::models::{ArtifactDescriptor, SubmitDigits};
use llwatch_core::types::{BlockId, Exponent};
use llwatch_dash::config::DashConfig;
use llwatch_dash::render;
use llwatch_events::{FileStore, SelectionRegistry};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "llwatch")]
#[command(about = "Follow Lucas-Lehmer block and job progress")]
struct Cli {
    /// Print each view as one JSON line instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show recent blocks
    Blocks {
        /// Keep refreshing until interrupted
        #[arg(long)]
        follow: bool,
    },
    /// Follow the active block until it finishes
    Watch {
        /// Select this block first
        #[arg(long)]
        block: Option<BlockId>,
    },
    /// Start a block and make it the active one
    Start { block_id: BlockId },
    /// Stop the active block
    Stop,
    /// Show a block's exponents
    Drawer {
        block_id: BlockId,
        /// List primes first, then untested, then composites
        #[arg(long)]
        prime_first: bool,
        /// Keep following the block's channel
        #[arg(long)]
        follow: bool,
    },
    /// Run a Lucas-Lehmer test
    Run {
        p: Exponent,
        /// Iterations between progress frames
        #[arg(long)]
        stride: Option<u64>,
        /// Generate the decimal expansion if the result is prime
        #[arg(long)]
        digits: bool,
        /// Save the expansion into this directory (implies --digits)
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// List found primes
    Primes {
        /// Largest exponent first
        #[arg(long)]
        desc: bool,
    },
    /// Generate the decimal expansion of a Mersenne prime
    Digits {
        p: Exponent,
        /// Save the expansion into this directory
        #[arg(long)]
        download: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = DashConfig::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "llwatch_dash=info,llwatch_client=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let cli = Cli::parse();

    tracing::debug!(
        api_base = %config.client.api_base,
        state_dir = %config.state_dir.display(),
        "Starting llwatch",
    );

    let selection = Arc::new(SelectionRegistry::new(Box::new(FileStore::new(&config.state_dir))));
    let ctx = SurfaceContext::connect(config.client.clone(), selection)
        .context("failed to set up compute service client")?;

    let result = dispatch(&cli, &config, &ctx).await;
    ctx.shutdown();
    result
}

async fn dispatch(cli: &Cli, config: &DashConfig, ctx: &SurfaceContext) -> anyhow::Result<()> {
    let json = cli.json;
    match &cli.command {
        Command::Blocks { follow } => {
            let grid = BlockGrid::spawn(ctx);
            let follow = *follow;
            show(grid.watch(), json, render::grid, |v| !follow && v.load != LoadState::Loading).await?;
            grid.shutdown().await;
        }

        Command::Watch { block } => {
            if let Some(id) = block {
                ctx.registry.set(*id);
            }
            if ctx.registry.get().is_none() {
                bail!("no active block; pass --block or run `llwatch start`");
            }
            let panel = ActiveBlockPanel::spawn(ctx);
            // The first published view is the empty placeholder.
            let mut shown = false;
            let last = show(panel.watch(), json, |v| vec![render::panel(v)], |v| {
                shown |= !v.is_hidden();
                shown
                    && (v.is_hidden()
                        || v.block.as_ref().is_some_and(|b| b.finished)
                        || matches!(v.connection, ConnectionState::Lost(_)))
            })
            .await?;
            panel.shutdown().await;
            if let ConnectionState::Lost(reason) = last.connection {
                bail!("live channel lost: {reason}");
            }
        }

        Command::Start { block_id } => {
            let grid = BlockGrid::spawn(ctx);
            let ack = grid.start(*block_id).await?;
            grid.shutdown().await;
            println!(
                "block {block_id} started, {} exponents scheduled; now active",
                ack.scheduled
            );
        }

        Command::Stop => {
            let Some(id) = ctx.registry.get() else {
                bail!("no active block");
            };
            let panel = ActiveBlockPanel::spawn(ctx);
            panel.stop().await?;
            panel.shutdown().await;
            println!("block {id} stopped");
        }

        Command::Drawer {
            block_id,
            prime_first,
            follow,
        } => {
            let drawer = BlockDrawer::spawn(ctx, *block_id);
            if *prime_first {
                drawer.toggle_prime_first().await?;
            }
            let follow = *follow;
            let prime_first = *prime_first;
            show(drawer.watch(), json, render::drawer, |v| {
                v.seed != LoadState::Loading
                    && v.prime_first == prime_first
                    && (!follow || v.detail.progress.finished || matches!(v.connection, ConnectionState::Lost(_)))
            })
            .await?;
            drawer.shutdown().await;
        }

        Command::Run {
            p,
            stride,
            digits,
            download,
        } => {
            let runner = RunSurface::spawn(ctx);
            runner.start_with_stride(*p, *stride).await?;
            let finished = show(runner.watch(), json, |v| vec![render::runner(v)], |v| {
                v.run.as_ref().is_some_and(|r| r.status.is_terminal())
                    && !matches!(v.connection, ConnectionState::Live | ConnectionState::Connecting)
            })
            .await?;

            let want_digits = *digits || download.is_some();
            if want_digits && finished.run.as_ref().is_some_and(|r| r.is_prime()) {
                runner.generate_digits().await?;
                let view = show(runner.watch(), json, |v| vec![render::runner(v)], |v| {
                    !v.digits.is_preparing()
                })
                .await?;
                if let (Some(dir), DigitsState::Ready { artifact, .. }) = (download, &view.digits) {
                    save(config, artifact, dir).await?;
                }
            } else if want_digits {
                println!("M{p} is not prime; no digits to generate");
            }
            runner.shutdown().await;
        }

        Command::Primes { desc } => {
            let list = PrimeList::spawn(ctx);
            if *desc {
                list.toggle_sort().await?;
            }
            let order = if *desc {
                SortOrder::Descending
            } else {
                SortOrder::Ascending
            };
            show(list.watch(), json, render::primes, |v| {
                v.load != LoadState::Loading && v.order == order
            })
            .await?;
            list.shutdown().await;
        }

        Command::Digits { p, download } => {
            validate_digits_exponent(*p)?;
            let api = ComputeApi::from_config(&config.client)?;
            let created = api.submit_digits(&SubmitDigits { p: *p, filename: None }).await?;
            println!(
                "preparing ~{} digits of M{p} (job {})",
                estimated_digits(*p),
                created.id
            );

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });

            match poll_artifact(&api, &created.id, config.client.digits_poll, &cancel).await {
                Some(PollOutcome::Ready(artifact)) => {
                    println!("ready: {}", api.download_url(&artifact.job_id));
                    if let Some(dir) = download {
                        save(config, &artifact, dir).await?;
                    }
                }
                Some(PollOutcome::Failed(e)) => bail!("digits job {} failed: {e}", created.id),
                None => println!("interrupted"),
            }
        }
    }
    Ok(())
}

/// Print every published view until `done` holds or the user interrupts.
///
/// Returns the last view seen.
async fn show<V, R>(
    mut rx: watch::Receiver<V>,
    json: bool,
    render: R,
    mut done: impl FnMut(&V) -> bool,
) -> anyhow::Result<V>
where
    V: Clone + Serialize,
    R: Fn(&V) -> Vec<String>,
{
    loop {
        let view = rx.borrow_and_update().clone();
        if json {
            println!("{}", render::json_line(&view));
        } else {
            for line in render(&view) {
                println!("{line}");
            }
        }
        if done(&view) {
            return Ok(view);
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    bail!("surface stopped unexpectedly");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(view);
            }
        }
    }
}

async fn save(config: &DashConfig, artifact: &ArtifactDescriptor, dir: &Path) -> anyhow::Result<()> {
    let api = ComputeApi::from_config(&config.client)?;
    let path = download_artifact(&api, artifact, dir)
        .await
        .with_context(|| format!("failed to download {}", artifact.filename))?;
    println!("saved {} (sha256 {})", path.display(), artifact.sha256);
    Ok(())
}
