//! Gateway daemon entry point.
//!
//! Initialises logging, loads the JSON configuration, then hands control
//! to the supervisor's cycle loop, which never returns.

use std::ops::Deref;
use std::panic;
use std::path::Path;

use anyhow::{Context, Result};
use flexi_logger::{Logger, LoggerHandle};
use log::{error, info};

use bscgw::config::GatewayConfig;
use bscgw::io::{OutputPort, SensorPort, SimOutputs, SimSensors};
use bscgw::supervisor;

const DEFAULT_CONFIG_PATH: &str = "/etc/bscgw.json";

fn logging_init() -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str("info")
        .context("cannot init logging")?
        .start()
        .context("cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn main() -> Result<()> {
    let _log_handle = logging_init()?;

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let cfg = GatewayConfig::load(Path::new(&path))
        .with_context(|| format!("cannot load configuration from {path}"))?;

    info!(
        "bscgw starting as {} against {}:{}",
        cfg.credentials.uid, cfg.broker_host, cfg.broker_port
    );

    supervisor::run(
        cfg,
        Box::new(|| -> (Box<dyn SensorPort>, Box<dyn OutputPort>) {
            (Box::new(SimSensors::new()), Box::new(SimOutputs::new()))
        }),
    )
}
