use std::io::{self, BufRead, BufWriter};
use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use surface_track::{
    load_gray, save_gray, CancelToken, LogSink, OscSink, Pipeline, PoseSink, PoseSpace, Replay,
    TextSink, TrackerConfig, YAxis,
};

use log::LevelFilter;
#[cfg(not(feature = "tracing"))]
use log::{info, warn};
#[cfg(feature = "tracing")]
use tracing::{info, warn};

#[cfg(feature = "tracing")]
use surface_track_core::init_tracing;
#[cfg(not(feature = "tracing"))]
use surface_track_core::init_with_level;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SpaceArg {
    Camera,
    Projected,
    Rectified,
}

impl From<SpaceArg> for PoseSpace {
    fn from(arg: SpaceArg) -> Self {
        match arg {
            SpaceArg::Camera => PoseSpace::Camera,
            SpaceArg::Projected => PoseSpace::Projected,
            SpaceArg::Rectified => PoseSpace::Rectified,
        }
    }
}

/// Track fiducial marker poses on a calibrated surface.
///
/// Type `q` followed by Enter to stop a running session.
#[derive(Debug, Parser)]
#[command(name = "surface-track", version)]
struct Args {
    /// JSON-lines replay of per-cycle detections.
    #[arg(long)]
    replay: PathBuf,

    /// JSON tracker configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Send OSC datagrams to this address (host:port).
    #[arg(long, conflicts_with = "text")]
    osc: Option<String>,

    /// Print `id x y angle` lines to stdout.
    #[arg(long)]
    text: bool,

    #[arg(long, value_enum)]
    pose_space: Option<SpaceArg>,

    /// Report y growing upwards.
    #[arg(long)]
    y_up: bool,

    /// Target cycle rate in Hz.
    #[arg(long)]
    rate_hz: Option<f64>,

    /// Minimum milliseconds between detection runs.
    #[arg(long)]
    detection_interval_ms: Option<f64>,

    #[arg(long)]
    max_cycles: Option<u64>,

    /// Image used as the frame content instead of a blank raster.
    #[arg(long)]
    background: Option<PathBuf>,

    /// Save the last rectified frame here when the run ends.
    #[arg(long)]
    save_rectified: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug or trace.
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: LevelFilter,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse()
        .map_err(|_| format!("invalid log level `{s}`, expected off, error, warn, info, debug or trace"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    #[cfg(not(feature = "tracing"))]
    init_with_level(args.log_level)?;
    #[cfg(feature = "tracing")]
    init_tracing(args.log_level, false)?;

    run(args)
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all))]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let replay = Replay::open(&args.replay)?;
    info!("loaded {} replay records from {}", replay.len(), args.replay.display());

    let background = args.background.as_ref().map(load_gray).transpose()?;
    let sink = make_sink(&args)?;
    let mut pipeline = Pipeline::from_replay(config, replay, background, sink)?;

    let cancel = CancelToken::new();
    watch_stdin(cancel.clone());
    let summary = pipeline.run(&cancel, args.max_cycles);
    info!("processed {} cycles", summary.cycles);

    if let Some(path) = &args.save_rectified {
        match pipeline.rectified_frame() {
            Some(frame) => {
                save_gray(&frame, path)?;
                info!("wrote rectified frame to {}", path.display());
            }
            None => warn!("no rectified frame available, surface never calibrated"),
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<TrackerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load_json(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(space) = args.pose_space {
        config.pose_space = space.into();
    }
    if args.y_up {
        config.convention.y_axis = YAxis::Up;
    }
    if args.rate_hz.is_some() {
        config.cycle_rate_hz = args.rate_hz;
    }
    if args.detection_interval_ms.is_some() {
        config.detection_interval_ms = args.detection_interval_ms;
    }
    config.validate()?;
    Ok(config)
}

fn make_sink(args: &Args) -> Result<Box<dyn PoseSink>, Box<dyn std::error::Error>> {
    if let Some(addr) = &args.osc {
        info!("sending OSC to {addr}");
        return Ok(Box::new(OscSink::connect(addr.as_str())?));
    }
    if args.text {
        return Ok(Box::new(TextSink::new(BufWriter::new(io::stdout()))));
    }
    Ok(Box::new(LogSink))
}

/// Cancel on a `q` line. End of input leaves the run alone.
fn watch_stdin(cancel: CancelToken) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                    cancel.cancel();
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });
}
