use std::time::Duration;

use chrono::Local;
use common::{
    assignment::HostWorkAssignment,
    config::Config,
    run::expand_runs,
    runner::{HostReport, run_host},
    ssh::SshConnector,
};
use console::style;
use eyre::{Context, Result, bail};
use flume::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rayon::ThreadPoolBuilder;
use tokio::{fs::create_dir_all, task::spawn_blocking};
use tracing::{debug, error, info, warn};

pub async fn run(config: Config, no_progress: bool) -> Result<()> {
    println!(
        "{} {} at {}",
        style("Dispatching").green().bold(),
        config.name,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  hosts: {}",
        config.hosts.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    );
    println!("  logs:  {}", config.log_dir.display());
    create_dir_all(&config.log_dir)
        .await
        .context(format!("Create {}", config.log_dir.display()))?;

    let commands = expand_runs(&config.dispatch)?;
    let assignment = HostWorkAssignment::new(&config.hosts, &commands)?;
    debug!(
        "{} commands over {} hosts",
        assignment.total_commands(),
        assignment.hosts.len()
    );
    tokio::fs::write(
        config.log_dir.join("assignment.json"),
        serde_json::to_string_pretty(&assignment)?,
    )
    .await?;

    let outcomes = spawn_blocking(move || run_pool(&config, &assignment, no_progress)).await??;

    let mut failed_hosts = Vec::new();
    for (host, outcome) in outcomes {
        match outcome {
            Ok(HostReport {
                completed, failed, ..
            }) if failed.is_empty() => {
                info!("{host}: {completed} commands completed");
            }
            Ok(report) => {
                warn!(
                    "{host}: {} completed, {} failed: {:?}",
                    report.completed,
                    report.failed.len(),
                    report.failed
                );
            }
            Err(err) => {
                error!("{host}: {err:#}");
                failed_hosts.push(host);
            }
        }
    }

    if !failed_hosts.is_empty() {
        bail!("Workers failed on {}", failed_hosts.join(", "));
    }
    println!("{}", style("All done").green().bold());
    Ok(())
}

/// One worker thread per host, joined before returning
fn run_pool(
    config: &Config,
    assignment: &HostWorkAssignment,
    no_progress: bool,
) -> Result<Vec<(String, Result<HostReport>)>> {
    let connector = SshConnector::new(
        config.user(),
        config.dispatch.connect_timeout_secs.map(Duration::from_secs),
    );
    let pool = ThreadPoolBuilder::new()
        .num_threads(assignment.hosts.len())
        .thread_name(|i| format!("host-{i}"))
        .build()
        .context("Build worker pool")?;

    let multi = MultiProgress::new();
    let bar_style = ProgressStyle::with_template(
        "{spinner:.green} {prefix:>12} [{wide_bar:.cyan/blue}] {pos}/{len} {msg}",
    )?
    .progress_chars("#>-");

    let (tx, rx) = unbounded();
    pool.scope(|s| {
        for work in &assignment.hosts {
            let tx = tx.clone();
            let bar = if no_progress {
                ProgressBar::hidden()
            } else {
                multi.add(ProgressBar::new(work.commands.len() as u64))
            };
            bar.set_style(bar_style.clone());
            bar.set_prefix(work.host.address.clone());
            let connector = &connector;
            s.spawn(move |_| {
                let outcome = run_host(
                    connector,
                    &work.host,
                    &work.commands,
                    &config.dispatch,
                    &config.log_dir,
                    Some(&bar),
                );
                if outcome.is_err() {
                    bar.abandon_with_message("failed");
                }
                _ = tx.send((work.host.address.clone(), outcome));
            });
        }
    });
    drop(tx);

    Ok(rx.iter().collect())
}
