//! Sky camera service: capture, fan-out and plate solving.

use anyhow::Context;
use clap::{Args, Parser, ValueEnum};
use shared::camera_interface::mock::MockCamera;
use shared::camera_interface::replay::ReplayCamera;
use shared::camera_interface::{CameraInterface, ImageFormat, Resolution};
use skysolve::config::ServiceConfig;
use skysolve::logging::init_tracing;
use skysolve::{Mode, SkyService};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, ValueEnum)]
enum CameraType {
    Mock,
    Replay,
}

#[derive(Args, Debug, Clone)]
struct CameraArgs {
    #[arg(
        short = 't',
        long,
        value_enum,
        default_value = "mock",
        help = "Camera backend",
        long_help = "Camera backend to capture from. 'mock' produces a generated test pattern; \
            'replay' cycles through recorded images from --replay-dir."
    )]
    camera_type: CameraType,

    #[arg(
        long,
        help = "Directory of recorded frames for the replay camera",
        long_help = "Directory of .jpg/.jpeg/.png files served by the replay camera, oldest \
            first by modification time. Required when --camera-type is 'replay'."
    )]
    replay_dir: Option<PathBuf>,

    #[arg(
        short = 'r',
        long,
        default_value = "2000x1500",
        help = "Capture resolution (WIDTHxHEIGHT)"
    )]
    resolution: Resolution,

    #[arg(long, default_value = "jpeg", help = "Capture format (jpeg or png)")]
    format: ImageFormat,

    #[arg(
        short = 'e',
        long,
        default_value = "1.0",
        help = "Exposure time in seconds",
        long_help = "Fixed exposure time in seconds. The capture loop is paced by the exposure, \
            so this is also the frame period."
    )]
    exposure: f64,

    #[arg(
        long,
        default_value = "800",
        help = "Sensor ISO",
        long_help = "Sensor sensitivity as ISO. Converted to analogue gain as ISO / 100."
    )]
    iso: u32,
}

#[derive(Args, Debug, Clone)]
struct ServiceArgs {
    #[arg(
        short = 'd',
        long,
        default_value = "solve",
        help = "Working directory for solve artifacts",
        long_help = "Directory holding the staged frame, radec.txt, obs.log and the history/ \
            image archive. Created if missing."
    )]
    solve_dir: PathBuf,

    #[arg(long, default_value = "solve-field", help = "Plate solver executable")]
    solver: PathBuf,

    #[arg(long, default_value = "20", help = "Solver detection depth (--depth)")]
    depth: u32,

    #[arg(long, default_value = "9", help = "Solver detection threshold (--sigma)")]
    sigma: f64,

    #[arg(
        long,
        default_value = "50",
        help = "Solver CPU time limit in seconds",
        long_help = "CPU time budget passed to the solver as --cpulimit. The service does not \
            kill the solver before this budget unless it is shutting down."
    )]
    cpu_limit: u64,

    #[arg(
        long,
        default_value = "30",
        help = "Upper bound on image scale in arcsec per pixel (-L)"
    )]
    scale_upper: f64,

    #[arg(
        long,
        help = "Use the previous solution as a search hint",
        long_help = "Pass the last solved RA/Dec with --search-radius to the solver. Has no \
            effect until the first successful solve."
    )]
    search: bool,

    #[arg(long, default_value = "90", help = "Search radius around the hint in degrees")]
    search_radius: f64,

    #[arg(
        long,
        default_value = "true",
        action = clap::ArgAction::Set,
        help = "Append each solution to obs.log"
    )]
    save_position: bool,

    #[arg(long, help = "Archive every solved image under history/")]
    save_image: bool,

    #[arg(
        short = 'm',
        long,
        value_enum,
        default_value = "align",
        help = "Initial mode"
    )]
    mode: Mode,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between status log lines (0 disables)"
    )]
    status_interval: u64,
}

#[derive(Parser, Debug)]
#[command(
    name = "skysolve",
    about = "Always-on sky camera with frame streaming and plate solving",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    camera: CameraArgs,

    #[command(flatten)]
    service: ServiceArgs,
}

impl Cli {
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        anyhow::ensure!(
            self.camera.exposure.is_finite() && self.camera.exposure > 0.0,
            "exposure must be a positive number of seconds"
        );

        let mut config = ServiceConfig {
            mode: self.service.mode,
            solve_dir: self.service.solve_dir.clone(),
            ..Default::default()
        };
        config.camera.resolution = self.camera.resolution;
        config.camera.format = self.camera.format;
        config.camera.exposure = Duration::from_secs_f64(self.camera.exposure);
        config.camera.gain = self.camera.iso as f64 / 100.0;
        config.solver.binary = self.service.solver.clone();
        config.solver.depth = self.service.depth;
        config.solver.sigma = self.service.sigma;
        config.solver.cpu_limit = Duration::from_secs(self.service.cpu_limit);
        config.solver.scale_upper = self.service.scale_upper;
        config.solver.search_enabled = self.service.search;
        config.solver.search_radius = self.service.search_radius;
        config.observing.save_position = self.service.save_position;
        config.observing.save_image = self.service.save_image;
        Ok(config)
    }
}

fn initialize_camera(args: &CameraArgs) -> anyhow::Result<Box<dyn CameraInterface>> {
    match args.camera_type {
        CameraType::Mock => {
            tracing::info!("Initializing mock camera ({})", args.resolution);
            let camera = MockCamera::with_test_pattern(args.resolution.width, args.resolution.height)
                .with_capture_delay(Duration::from_secs_f64(args.exposure));
            Ok(Box::new(camera))
        }
        CameraType::Replay => {
            let dir = args
                .replay_dir
                .as_ref()
                .context("--replay-dir is required for the replay camera")?;
            tracing::info!("Initializing replay camera from {}", dir.display());
            let camera = ReplayCamera::from_dir(dir)
                .with_context(|| format!("Failed to open replay directory {}", dir.display()))?;
            Ok(Box::new(camera))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = cli.service_config()?;
    let camera = initialize_camera(&cli.camera)?;
    let service = SkyService::start(camera, config).context("Failed to start sky service")?;

    let status_every = Duration::from_secs(cli.service.status_interval);
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = report_status(&service, status_every) => {}
    }

    service.shutdown().await;
    Ok(())
}

async fn report_status<C: CameraInterface + 'static>(service: &SkyService<C>, every: Duration) {
    if every.is_zero() {
        return std::future::pending().await;
    }
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        log_status(service);
    }
}

fn log_status<C: CameraInterface + 'static>(service: &SkyService<C>) {
    let status = service.status();
    tracing::info!(
        "Status: mode={} state={:?} frames={} solving={} focus={} text='{}'",
        status.mode,
        status.capture_state,
        status.frames_captured,
        status.solving,
        status
            .focus_std
            .map(|f| format!("{f:.2}"))
            .unwrap_or_else(|| "-".to_string()),
        status.status_text
    );
    if let Ok(json) = serde_json::to_string(&status.last_result) {
        tracing::debug!("Last result: {json}");
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
