// Camcast publisher binary

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use camcast::config::{FixedFormat, PublisherConfig};
use camcast::gstreamer_init;
use camcast::orchestrator::PublisherOrchestrator;
use camcast::preview::LogPreview;

#[derive(Parser, Debug)]
#[command(
    name = "camcast",
    about = "Publish a camera stream with strength-based failover between redundant publishers"
)]
struct Cli {
    /// Config file path (defaults to <config dir>/camcast/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ownership strength of this instance (must be unique per channel)
    #[arg(short, long)]
    strength: Option<i32>,

    /// Channel name shared by all redundant publishers
    #[arg(long)]
    channel: Option<String>,

    /// Liveliness timeout in milliseconds
    #[arg(long)]
    liveliness_ms: Option<u64>,

    /// Allow the synthetic test source
    #[arg(short = 't', long)]
    test_source: bool,

    /// Use the hardware-accelerated encoder (fails if unavailable)
    #[arg(short = 'x', long)]
    hardware_encoder: bool,

    /// Force 640x480 @ 30/1 instead of negotiating
    #[arg(short = 'f', long)]
    fixed_caps: bool,
}

impl Cli {
    fn apply(self, config: &mut PublisherConfig) {
        if let Some(strength) = self.strength {
            config.strength = strength;
        }
        if let Some(channel) = self.channel {
            config.channel_name = channel;
        }
        if let Some(liveliness) = self.liveliness_ms {
            config.liveliness_timeout_ms = liveliness;
        }
        if self.test_source {
            config.allow_test_source = true;
        }
        if self.hardware_encoder {
            config.use_hardware_encoder = true;
        }
        if self.fixed_caps {
            config.fixed_format = Some(FixedFormat {
                width: 640,
                height: 480,
                fps_num: 30,
                fps_den: 1,
                pixel_format: None,
            });
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let mut config = PublisherConfig::load_or_default(config_path.as_deref())
        .context("loading configuration")?;
    cli.apply(&mut config);

    gstreamer_init::init_gstreamer_env();

    let mut orchestrator = PublisherOrchestrator::start(&config, Box::new(LogPreview::default()))
        .context("starting publisher")?;
    log::info!(
        "publishing on {:?} with strength {}",
        config.channel_name,
        config.strength
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    while running.load(Ordering::Relaxed) {
        if let Some(error) = orchestrator.take_pipeline_error() {
            log::error!("pipeline failed: {}", error);
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    orchestrator.shutdown();
    Ok(())
}
