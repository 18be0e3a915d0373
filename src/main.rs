use std::env::{self, args};
use std::str::FromStr;
use std::time::Duration;

use log::info;
use strum::IntoEnumIterator;

use rwpq_locks::{
    driver::{DriverConfig, LoadDriver},
    logging, ConfigError, LockConfig, Variant,
};

const DEFAULT_SECONDS: u64 = 30;

fn main() -> Result<(), String> {
    let mut args = args().skip(1);
    let variant = args
        .next()
        .ok_or(format!(
            "no lock variant supplied, use one of {}",
            Variant::iter()
                .map(|v| v.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ))
        .and_then(|selector| {
            Variant::from_str(&selector).map_err(|e| ConfigError::from(e).to_string())
        })?;
    let seconds = args
        .next()
        .map(|s| {
            s.parse::<u64>()
                .map_err(|e| format!("bad number of seconds {s}: {e}"))
        })
        .transpose()?
        .unwrap_or(DEFAULT_SECONDS);

    let config = LockConfig::from_env().map_err(|e| e.to_string())?;
    let logger = logging::init(logging::level_from_env()).map_err(|e| e.to_string())?;
    logger.set_silent(env::var("RWPQ_SILENT").is_ok_and(|v| v == "1" || v == "true"));

    let lock = variant.build(&config).map_err(|e| e.to_string())?;
    info!("{variant} lock under load for {seconds}s, {config:?}");
    let report = LoadDriver::run_for(lock, DriverConfig::default(), Duration::from_secs(seconds));

    logger.flush_all();
    println!("{report}");
    Ok(())
}
