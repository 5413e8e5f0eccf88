//! Spectra-cam-capture headless front-end.
//!
//! Starts a capture session on the configured backend and drives it at the
//! session's tick period for a fixed number of ticks.

use std::error::Error;
use std::path::PathBuf;
use std::thread;

use clap::Parser;
use spectra_cam_capture::{
    BackendKind, CaptureSession, Config, EnviSink, SaveFormat, TickOutcome,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spectra-cam-capture")]
#[command(version, about = "Headless capture for hyperspectral and video cameras")]
struct Args {
    /// Config file (default: ~/.config/spectra-cam-capture/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend: mock, v4l2 or tis
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Target frame rate
    #[arg(long)]
    fps: Option<f64>,

    /// Number of ticks to run
    #[arg(short = 'n', long, default_value = "100")]
    frames: u32,

    /// Record every frame
    #[arg(short, long)]
    record: bool,

    /// Recording format: envi or raw
    #[arg(long)]
    format: Option<SaveFormat>,

    /// Run auto-exposure before capturing
    #[arg(short, long)]
    auto_exposure: bool,

    /// List backends compiled into this build and exit
    #[arg(long)]
    list_backends: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    if args.list_backends {
        for kind in BackendKind::ALL {
            let status = if kind.is_compiled() { "available" } else { "not compiled" };
            println!("{kind}: {status}");
        }
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.session.backend = backend;
    }
    if let Some(fps) = args.fps {
        config.session.fps = fps;
    }
    if let Some(format) = args.format {
        config.session.recording_format = format;
    }
    if !config.session.backend.is_compiled() {
        warn!(
            backend = %config.session.backend,
            "backend not compiled into this build, falling back to mock"
        );
        config.session.backend = BackendKind::Mock;
    }

    let mut session = CaptureSession::new(&config, Box::new(EnviSink))?;
    session.start()?;

    if args.auto_exposure {
        session.toggle_exposure_estimation()?;
        while session.is_estimating_exposure() {
            session.on_tick();
            thread::sleep(session.tick_period());
        }
        info!(exposure = session.published().exposure, "auto-exposure done");
    }

    if args.record {
        session.toggle_recording()?;
    }

    let mut missed = 0_u32;
    for _ in 0..args.frames {
        if session.on_tick() == TickOutcome::Missed {
            missed += 1;
        }
        thread::sleep(session.tick_period());
    }

    if let Some(device) = session.device() {
        info!(
            frames = args.frames,
            missed,
            saved = session.frame_counter(),
            folder = %device.save_folder().display(),
            "capture finished"
        );
    }
    session.stop()?;
    Ok(())
}
