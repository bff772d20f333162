use std::{collections::HashMap, fmt, path::PathBuf};

use eyre::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::{plot::parse_color, run::RunSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub hosts: Vec<Host>,
    /// Remote user, defaults to the local user
    pub user: Option<String>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    pub dispatch: DispatchSettings,
    pub collect: CollectSettings,
    pub plot: PlotSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Long-lived command serving the result directory, never awaited
    pub server_cmd: String,
    pub build_cmd: String,
    #[serde(default = "default_runtime_secs")]
    pub runtime_secs: u64,
    #[serde(default)]
    pub completion: Completion,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    pub connect_timeout_secs: Option<u64>,
    pub runs: Vec<Box<dyn RunSet>>,
}

/// How the runner decides a benchmark command is done
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Completion {
    /// Issue the command and sleep for its runtime budget
    #[default]
    Fixed,
    /// Wait for the remote command to exit
    ExitStatus,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    Continue,
    AbortHost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectSettings {
    pub endpoints: Vec<String>,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

impl CollectSettings {
    /// Rows kept by the downsampling step, one every `sample_step` ticks
    pub fn sample_step(&self) -> usize {
        ((self.sample_interval_secs / self.tick_secs.max(1)) as usize).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotSettings {
    #[serde(default = "default_columns")]
    pub columns: usize,
    #[serde(default = "default_x_max")]
    pub x_max: i64,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    pub workloads: Vec<WorkloadStyle>,
    pub configurations: Vec<ConfigurationStyle>,
    pub display_names: HashMap<String, String>,
}

impl PlotSettings {
    pub fn workload_ids(&self) -> Vec<String> {
        self.workloads.iter().map(|w| w.id.clone()).collect()
    }

    pub fn configuration_ids(&self) -> Vec<String> {
        self.configurations.iter().map(|c| c.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadStyle {
    pub id: String,
    pub display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationStyle {
    pub id: String,
    pub color: String,
    pub marker: Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marker {
    Square,
    Triangle,
    Circle,
    Diamond,
}

/// Progress counter drawn on the y axis
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    TcTotal,
    PmTcTotal,
    TotalPath,
    TotalPmPath,
    ExecRate,
    ActualCases,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("At least one host is required");
        }
        if self.dispatch.runs.is_empty() {
            bail!("No run sets configured");
        }
        if self.collect.tick_secs == 0 {
            bail!("collect.tick_secs must be greater than zero");
        }
        if self.collect.delimiter.is_empty() {
            bail!("collect.delimiter must not be empty");
        }
        if self.plot.columns == 0 {
            bail!("plot.columns must be greater than zero");
        }
        if self.plot.workloads.is_empty() || self.plot.configurations.is_empty() {
            bail!("plot.workloads and plot.configurations must not be empty");
        }
        for style in &self.plot.configurations {
            parse_color(&style.color)?;
        }
        Ok(())
    }

    pub fn user(&self) -> String {
        self.user.clone().unwrap_or_else(whoami::username)
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/tmp/ae_log")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_runtime_secs() -> u64 {
    2 * 60 * 60
}

fn default_suffix() -> String {
    ".progress".to_owned()
}

fn default_delimiter() -> String {
    "%2C".to_owned()
}

fn default_tick_secs() -> u64 {
    1
}

fn default_sample_interval_secs() -> u64 {
    15 * 60
}

fn default_output() -> PathBuf {
    PathBuf::from("evaluation-perf-result.png")
}

fn default_columns() -> usize {
    4
}

fn default_x_max() -> i64 {
    4 * 60 * 60
}

fn default_width() -> u32 {
    2800
}

fn default_height() -> u32 {
    1000
}
