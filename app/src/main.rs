use std::path::Path;

use clap::{Parser, Subcommand};
use common::{assignment::HostWorkAssignment, config::Config, run::expand_runs};
use eyre::{Context, Result};
use tokio::fs::read_to_string;
use tracing::error;
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod collect;
mod dispatch;

const MODULES: &[&str] = &["artifact_eval", "common"];

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    #[arg(short, long)]
    log: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the benchmarks on every host
    Dispatch {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
    /// Fetch progress files and plot them
    Collect {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
        /// Overrides the configured output image
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Print which host runs which commands
    Print {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!("artifact_eval={log_level}"));
    for log in &args.log {
        env_filter = env_filter.add_directive(log.parse()?);
    }
    for module in MODULES {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking))
        .init();

    let result = match args.command {
        Commands::Dispatch { config_file } => {
            dispatch::run(load_config(&config_file).await?, args.no_progress).await
        }
        Commands::Collect {
            config_file,
            output,
        } => {
            let mut config = load_config(&config_file).await?;
            if let Some(output) = output {
                config.collect.output = output.into();
            }
            collect::run(config).await
        }
        Commands::Print { config_file } => print_assignment(&load_config(&config_file).await?),
    };

    if let Err(err) = &result {
        error!("{err:#?}");
    }
    result
}

async fn load_config(config_file: impl AsRef<Path>) -> Result<Config> {
    let path = config_file.as_ref();
    let config: Config = serde_yml::from_str(
        &read_to_string(path)
            .await
            .context(format!("Reading {}", path.display()))?,
    )
    .context("Parsing config file")?;
    config.validate()?;
    Ok(config)
}

fn print_assignment(config: &Config) -> Result<()> {
    let commands = expand_runs(&config.dispatch)?;
    let assignment = HostWorkAssignment::new(&config.hosts, &commands)?;
    for work in &assignment.hosts {
        println!("{} ({} commands)", work.host, work.commands.len());
        for run in &work.commands {
            println!(
                "  [{},{}] {}s: {}",
                run.workload,
                run.configuration,
                run.runtime.as_secs(),
                run.cmd
            );
        }
    }
    Ok(())
}
