//! One-time `fern` dispatch: timestamped, leveled, optionally colored lines
//! to stdout and to `segproxy.log`, with `ACCESS` lines (see
//! `handler::log_access`) additionally routed to their own
//! `segproxy-access.log` file so operators can tail traffic records
//! without the general log's noise.
//!
//! Grounded on the teacher's `rproxy::init::logger`, generalized to accept
//! a `log::LevelFilter` directly (callers already validated the CLI
//! string) rather than parsing it here, and split into two sub-dispatches
//! keyed on `target()` for the access-log routing above.

use anyhow::Result;
use fern::colors::{Color, ColoredLevelConfig};

/// `log::Record::target()` value `handler::log_access` uses for every
/// `ACCESS` line, so this module can route them independently of level.
pub const ACCESS_LOG_TARGET: &str = "segproxy::access";

pub fn init(level: log::LevelFilter, colored: bool) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .trace(Color::Magenta)
        .debug(Color::Blue)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    let general = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Utc::now().to_rfc3339(),
                if colored {
                    colors.color(record.level()).to_string()
                } else {
                    record.level().to_string()
                },
                record.target(),
                message
            ))
        })
        .level(level)
        .filter(|meta| meta.target() != ACCESS_LOG_TARGET)
        .chain(std::io::stdout())
        .chain(fern::log_file("segproxy.log")?);

    let access = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{} {}] {}", chrono::Utc::now().to_rfc3339(), record.target(), message))
        })
        .level(log::LevelFilter::Info)
        .filter(|meta| meta.target() == ACCESS_LOG_TARGET)
        .chain(fern::log_file("segproxy-access.log")?);

    fern::Dispatch::new().chain(general).chain(access).apply()?;
    Ok(())
}

pub fn parse_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse().map_err(|_| format!("invalid log level: {s}"))
}
