//! Configuration for monitor_service

use anyhow::{anyhow, Result};
use spreadscan_core::config::CoreConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MonitorServiceConfig {
    /// Everything the aggregation core needs
    pub core: CoreConfig,

    /// Cadence of the stats heartbeat log line
    pub heartbeat_interval: Duration,

    /// Cadence of the idle-connection health sweep
    pub pool_sweep_interval: Duration,

    /// Capacity of the outbound candidate channel
    pub candidate_channel_capacity: usize,
}

impl MonitorServiceConfig {
    pub fn from_env() -> Result<Self> {
        let core = CoreConfig::from_env()?;

        let candidate_channel_capacity = parse_u64("MONITOR_CANDIDATE_CHANNEL_CAPACITY", 256)?;
        if candidate_channel_capacity == 0 {
            return Err(anyhow!("MONITOR_CANDIDATE_CHANNEL_CAPACITY must be > 0"));
        }

        Ok(Self {
            core,
            heartbeat_interval: Duration::from_secs(parse_u64(
                "MONITOR_HEARTBEAT_INTERVAL_SECS",
                15,
            )?),
            pool_sweep_interval: Duration::from_secs(parse_u64(
                "MONITOR_POOL_SWEEP_INTERVAL_SECS",
                60,
            )?),
            candidate_channel_capacity: candidate_channel_capacity as usize,
        })
    }
}

fn parse_u64(var_name: &str, default: u64) -> Result<u64> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid integer", var_name)),
        Err(_) => Ok(default),
    }
}
