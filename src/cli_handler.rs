//! Subcommand handling for tankbot.
//!
//! Each subcommand builds its own tokio runtime and blocks on it.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::automation::{ChannelId, WebDriverProvider, WorkerPool};
use crate::cli::{Commands, RunArgs};
use crate::config::Config;
use crate::proxy::{CertificateAuthority, Frame, FrameQueue, ProxyService};
use crate::telemetry::{self, MetricsReporter, NullReporter, Reporter};

/// How often queue depths are sampled while the proxy runs.
const QUEUE_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Dispatch a parsed subcommand against the merged configuration.
pub fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Proxy(_) => block_on(run_proxy(config)),
        Commands::Run(args) => block_on(run_command(config, args)),
        Commands::Ca => print_ca(config),
        Commands::Config => {
            print!("{}", config.to_toml().context("Failed to render configuration")?);
            Ok(())
        }
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(future)
}

fn reporter(config: &Config) -> Result<Arc<dyn Reporter>> {
    match config.metrics.listen {
        Some(addr) => {
            telemetry::install_prometheus(addr).context("Failed to start metrics exporter")?;
            Ok(Arc::new(MetricsReporter))
        }
        None => Ok(Arc::new(NullReporter)),
    }
}

/// Run the proxy until Ctrl-C, draining both frame queues into the log.
async fn run_proxy(config: &Config) -> Result<()> {
    let proxy_config = config.proxy_config().context("Invalid proxy configuration")?;
    let service = ProxyService::new(proxy_config, reporter(config)?);

    service.start().await.context("Failed to start proxy")?;
    println!("{}", service.describe());
    if let Some(ca) = service.certificate_authority().await {
        println!("Trust {} in the browser to intercept TLS", ca.cert_path().display());
    }

    let inbound = service.inbound();
    let outbound = service.outbound();
    let mut sample = tokio::time::interval(QUEUE_SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            Some(frame) = inbound.recv() => log_frame(&frame),
            Some(frame) = outbound.recv() => log_frame(&frame),
            _ = sample.tick() => {
                service.report_queue_depths();
                log_dropped(&inbound);
                log_dropped(&outbound);
            }
        }
    }

    info!("Stopping proxy");
    service.stop().await;
    println!("{}", service.describe());
    Ok(())
}

fn log_frame(frame: &Frame) {
    match &frame.decoded {
        Some(decoded) => debug!(
            "{} frame, {} bytes at {}: {:?}",
            frame.direction,
            frame.payload.len(),
            frame.timestamp,
            decoded
        ),
        None => debug!(
            "{} frame, {} raw bytes at {}",
            frame.direction,
            frame.payload.len(),
            frame.timestamp
        ),
    }
}

fn log_dropped(queue: &FrameQueue) {
    let dropped = queue.dropped();
    if dropped > 0 {
        warn!("{} {} frame(s) dropped so far", dropped, queue.direction());
    }
}

/// Run one command on a channel's session and print the outcome.
async fn run_command(config: &Config, args: RunArgs) -> Result<()> {
    let settings = config
        .automation_settings()
        .context("Invalid automation configuration")?;
    let provider = Arc::new(WebDriverProvider::new(settings.webdriver));
    let pool = WorkerPool::new(provider, settings.worker, reporter(config)?);
    let channel = ChannelId::from(args.channel);

    let result = pool.enqueue(channel.clone(), &args.operation, &args.args).await;
    let readout = pool.status_readout();
    pool.close_all().await;

    let output = result.with_context(|| format!("{} failed on channel {}", args.operation, channel))?;
    println!("{}", output);
    for status in readout {
        println!("{}", status);
    }
    Ok(())
}

fn print_ca(config: &Config) -> Result<()> {
    let proxy_config = config.proxy_config().context("Invalid proxy configuration")?;
    let ca = CertificateAuthority::load_or_generate(&proxy_config.cert_dir)
        .context("Failed to load or generate CA")?;
    println!("{}", ca.cert_path().display());
    Ok(())
}
