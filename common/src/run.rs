use core::fmt::Debug;
use std::time::Duration;

use dyn_clone::{DynClone, clone_trait_object};
use eyre::{Context, Result};
use handlebars::Handlebars;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::DispatchSettings;

/// One benchmark invocation, bound to a (workload, configuration) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub workload: String,
    pub configuration: String,
    pub cmd: String,
    pub runtime: Duration,
}

#[typetag::serde(tag = "type")]
pub trait RunSet: Debug + DynClone + Send + Sync {
    /// Name of the run set, for logs
    fn name(&self) -> &'static str;
    /// Expands the run set into concrete commands, in execution order
    fn commands(&self, settings: &DispatchSettings) -> Result<Vec<RunCommand>>;
}
clone_trait_object!(RunSet);

/// Every configuration of every workload, workload-major
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matrix {
    pub template: String,
    pub workloads: Vec<String>,
    pub configurations: Vec<String>,
    pub runtime_secs: Option<u64>,
}

#[typetag::serde]
impl RunSet for Matrix {
    fn name(&self) -> &'static str {
        "matrix"
    }

    fn commands(&self, settings: &DispatchSettings) -> Result<Vec<RunCommand>> {
        let renderer = CommandTemplate::new(&self.template)?;
        let runtime = runtime(self.runtime_secs, settings);
        self.workloads
            .iter()
            .cartesian_product(self.configurations.iter())
            .map(|(workload, configuration)| renderer.render(workload, configuration, runtime))
            .collect()
    }
}

/// A single fixed configuration label applied to each workload
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerWorkload {
    pub template: String,
    pub configuration: String,
    pub workloads: Vec<String>,
    pub runtime_secs: Option<u64>,
}

#[typetag::serde]
impl RunSet for PerWorkload {
    fn name(&self) -> &'static str {
        "per-workload"
    }

    fn commands(&self, settings: &DispatchSettings) -> Result<Vec<RunCommand>> {
        let renderer = CommandTemplate::new(&self.template)?;
        let runtime = runtime(self.runtime_secs, settings);
        self.workloads
            .iter()
            .map(|workload| renderer.render(workload, &self.configuration, runtime))
            .collect()
    }
}

/// Expands all run sets of the dispatch settings, in configuration order
pub fn expand_runs(settings: &DispatchSettings) -> Result<Vec<RunCommand>> {
    let mut cmds = Vec::new();
    for set in &settings.runs {
        cmds.extend(
            set.commands(settings)
                .context(format!("Expanding {} run set", set.name()))?,
        );
    }
    Ok(cmds)
}

fn runtime(runtime_secs: Option<u64>, settings: &DispatchSettings) -> Duration {
    Duration::from_secs(runtime_secs.unwrap_or(settings.runtime_secs))
}

#[derive(Serialize)]
struct TemplateContext<'a> {
    workload: &'a str,
    configuration: &'a str,
}

struct CommandTemplate<'a> {
    registry: Handlebars<'a>,
}

impl CommandTemplate<'_> {
    const NAME: &'static str = "run";

    fn new(template: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(Self::NAME, template)
            .context("Parse command template")?;
        Ok(Self { registry })
    }

    fn render(&self, workload: &str, configuration: &str, runtime: Duration) -> Result<RunCommand> {
        let cmd = self
            .registry
            .render(
                Self::NAME,
                &TemplateContext {
                    workload,
                    configuration,
                },
            )
            .context(format!("Render command for {workload},{configuration}"))?;
        Ok(RunCommand {
            workload: workload.to_owned(),
            configuration: configuration.to_owned(),
            cmd,
            runtime,
        })
    }
}
