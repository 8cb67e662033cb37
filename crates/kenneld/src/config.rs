//! kennel.toml configuration.
//!
//! Every key is optional. Durations are strings: `"500ms"`, `"30s"`,
//! `"5m"`, `"1h"`, or a bare number of seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use kennel_autoscale::AutoscaleConfig;
use kennel_cluster::{SimulationConfig, TaskDefinition};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KennelConfig {
    pub cluster_name: String,
    pub data_dir: PathBuf,
    pub api_port: u16,
    pub daemon_interval: String,
    pub lead_time: String,
    pub autoscale: AutoscaleSection,
    pub simulation: SimulationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSection {
    pub warm_instances: usize,
    pub idle_timeout: String,
    pub launch_timeout: String,
}

/// The in-process cluster `kenneld` runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub instance_cpu: i64,
    pub instance_memory: i64,
    pub auto_join: bool,
    pub task_definitions: Vec<TaskDefinition>,
}

impl Default for KennelConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            data_dir: PathBuf::from("/var/lib/kennel"),
            api_port: 3000,
            daemon_interval: "30s".to_string(),
            lead_time: "3m".to_string(),
            autoscale: AutoscaleSection::default(),
            simulation: SimulationSection::default(),
        }
    }
}

impl Default for AutoscaleSection {
    fn default() -> Self {
        Self {
            warm_instances: 1,
            idle_timeout: "10m".to_string(),
            launch_timeout: "5m".to_string(),
        }
    }
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            instance_cpu: 1024,
            instance_memory: 2048,
            auto_join: true,
            task_definitions: Vec::new(),
        }
    }
}

impl KennelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: KennelConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Fail early on values the daemon would otherwise trip over later.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster_name.trim().is_empty() {
            bail!("cluster_name must not be empty");
        }
        if self.interval()?.is_zero() {
            bail!("daemon_interval must be greater than zero");
        }
        self.lead()?;
        self.autoscale_config()?;
        Ok(())
    }

    pub fn interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.daemon_interval).context("daemon_interval")
    }

    pub fn lead(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.lead_time).context("lead_time")
    }

    pub fn autoscale_config(&self) -> anyhow::Result<AutoscaleConfig> {
        Ok(AutoscaleConfig {
            warm_instances: self.autoscale.warm_instances,
            idle_timeout: parse_duration(&self.autoscale.idle_timeout)
                .context("autoscale.idle_timeout")?,
            launch_timeout: parse_duration(&self.autoscale.launch_timeout)
                .context("autoscale.launch_timeout")?,
        })
    }

    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            instance_cpu: self.simulation.instance_cpu,
            instance_memory: self.simulation.instance_memory,
            auto_join: self.simulation.auto_join,
        }
    }
}

/// Parse `"500ms"`, `"30s"`, `"5m"`, `"1h"` or plain seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    };
    parsed.with_context(|| format!("invalid duration: {s:?}"))
}
