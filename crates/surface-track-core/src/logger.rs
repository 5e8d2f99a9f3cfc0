//! Stderr logging for the tracking loop.
//!
//! Lines read `[  1.234s #42  WARN pipeline] message`: uptime, the cycle the
//! message belongs to, level, and the last segment of the module path. The
//! cycle tag comes from [`set_log_cycle`] and is left out before the first
//! cycle. Everything goes to stderr so stdout stays free for pose output.
//!
//! With the `tracing` feature, [`init_tracing`] installs a
//! `tracing-subscriber` instead; `log` records are bridged into it.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};

static CYCLE: AtomicU64 = AtomicU64::new(0);

/// Tag subsequent log lines with `cycle`. Zero clears the tag.
pub fn set_log_cycle(cycle: u64) {
    CYCLE.store(cycle, Ordering::Relaxed);
}

fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

fn format_line(
    elapsed_s: f64,
    cycle: u64,
    level: Level,
    target: &str,
    args: fmt::Arguments<'_>,
) -> String {
    let target = short_target(target);
    if cycle == 0 {
        format!("[{elapsed_s:8.3}s {level:>5} {target}] {args}")
    } else {
        format!("[{elapsed_s:8.3}s #{cycle} {level:>5} {target}] {args}")
    }
}

struct CycleLogger {
    level: LevelFilter,
    started: Instant,
}

impl Log for CycleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(
            self.started.elapsed().as_secs_f64(),
            CYCLE.load(Ordering::Relaxed),
            record.level(),
            record.target(),
            *record.args(),
        );
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<CycleLogger> = OnceLock::new();

/// Install the stderr logger at `level`.
///
/// Only the first call installs anything; later calls keep the original level.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = LOGGER.get_or_init(|| CycleLogger {
        level,
        started: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise both surface-track crates log at
/// `level` and everything else at `warn`. Pipeline cycles show up as spans
/// carrying a `cycle` field.
#[cfg(feature = "tracing")]
pub fn init_tracing(
    level: LevelFilter,
    json: bool,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.to_string().to_ascii_lowercase();
        EnvFilter::new(format!("warn,surface_track={level},surface_track_core={level}"))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);
    if json {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .finish()
            .try_init()
    } else {
        builder
            .compact()
            .with_timer(tracing_subscriber::fmt::time::Uptime::default())
            .finish()
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_shortened_to_the_module_name() {
        assert_eq!(short_target("surface_track::pipeline"), "pipeline");
        assert_eq!(short_target("surface_track"), "surface_track");
    }

    #[test]
    fn cycle_tag_appears_once_cycles_start() {
        let before = format_line(
            0.5,
            0,
            Level::Info,
            "surface_track::pipeline",
            format_args!("waiting"),
        );
        assert_eq!(before, "[   0.500s  INFO pipeline] waiting");

        let during = format_line(
            12.25,
            42,
            Level::Warn,
            "surface_track::rectifier",
            format_args!("rejected {}", 3),
        );
        assert_eq!(during, "[  12.250s #42  WARN rectifier] rejected 3");
    }
}
