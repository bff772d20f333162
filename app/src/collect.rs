use std::time::Duration;

use common::{
    aggregate::aggregate,
    config::Config,
    plot::render,
    source::{ResultSource, source_for},
};
use console::style;
use eyre::Result;
use tokio::task::spawn_blocking;
use tracing::info;

pub async fn run(config: Config) -> Result<()> {
    let timeout = config.collect.timeout_secs.map(Duration::from_secs);
    let sources = config
        .collect
        .endpoints
        .iter()
        .map(|endpoint| source_for(endpoint, timeout))
        .collect::<Result<Vec<Box<dyn ResultSource>>>>()?;

    let result = aggregate(
        &sources,
        &config.collect,
        &config.plot.workload_ids(),
        &config.plot.configuration_ids(),
    )
    .await;
    info!(
        "{} of {} series hold data",
        result.non_empty(),
        config.plot.workloads.len() * config.plot.configurations.len()
    );

    let output = config.collect.output.clone();
    spawn_blocking(move || render(&result, &config.plot, &config.collect.output)).await??;
    println!("{} {}", style("Plot written to").green().bold(), output.display());
    Ok(())
}
