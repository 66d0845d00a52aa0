//! Forward HTTP/HTTPS proxy: per-host allow/deny policy plus optional
//! CONNECT-tunnel and HTTP-body traffic segmentation.
//!
//! Top-level orchestration mirrors the teacher's `rproxy`/`httproxy`
//! `run()`: parse args, init logging, init shutdown, hand off to the
//! accept loop.

use std::sync::Arc;

use anyhow::{Context, Result};

pub mod cmd;
pub mod config;
pub mod dns;
pub mod error;
pub mod handler;
pub mod httpcodec;
pub mod init;
pub mod net;
pub mod policy;
pub mod segmentation;
pub mod server;
pub mod tunnel;

pub async fn run() -> Result<()> {
    let (args, matches) = cmd::parse_args();

    let log_level = init::logger::parse_level(&args.log_level).map_err(anyhow::Error::msg)?;
    init::logger::init(log_level, args.log_color)?;

    let settings = cmd::build_settings(&args, &matches).context("invalid configuration")?;

    if args.validate_rules {
        for rule in &settings.segmentation_rules {
            println!("{}", segmentation::rules::format_rule(rule));
        }
        log::info!("{} rule(s) validated", settings.segmentation_rules.len());
        return Ok(());
    }

    let settings = Arc::new(settings);
    let resolver = settings.build_resolver();
    let engine = Arc::new(settings.build_segmentation_engine());

    let shutdown = init::shutdown::init()?;

    server::run(settings, resolver, engine, shutdown).await?;
    log::info!("shutdown complete");
    Ok(())
}
