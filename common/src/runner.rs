use std::{
    fs::{OpenOptions, create_dir_all},
    io::Write,
    path::{Path, PathBuf},
    thread::sleep,
};

use eyre::{Context, Result, bail};
use indicatif::ProgressBar;
use tracing::{debug, info, warn};

use crate::{
    config::{Completion, DispatchSettings, FailurePolicy, Host},
    remote::{CommandOutput, Connector, RemoteShell},
    run::RunCommand,
};

/// Outcome of one host's worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostReport {
    pub host: String,
    pub build_ok: bool,
    pub completed: usize,
    /// Commands that exited non-zero, only known with [`Completion::ExitStatus`]
    pub failed: Vec<String>,
}

/// Appends build and run output to `<log_dir>/<host>.stdout|.stderr`
#[derive(Debug, Clone)]
pub struct HostLog {
    stdout: PathBuf,
    stderr: PathBuf,
}

impl HostLog {
    pub fn new(log_dir: &Path, host: &Host) -> Self {
        Self {
            stdout: log_dir.join(format!("{}.stdout", host.address)),
            stderr: log_dir.join(format!("{}.stderr", host.address)),
        }
    }

    pub fn append(&self, output: &CommandOutput) -> Result<()> {
        append(&self.stdout, &output.stdout)?;
        append(&self.stderr, &output.stderr)?;
        Ok(())
    }
}

fn append(path: &Path, data: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Open {}", path.display()))?;
    file.write_all(data.as_bytes())?;
    Ok(())
}

/// Runs the full per-host sequence: connect, start the result server, build,
/// then every assigned command in order.
pub fn run_host<C: Connector>(
    connector: &C,
    host: &Host,
    commands: &[RunCommand],
    settings: &DispatchSettings,
    log_dir: &Path,
    progress: Option<&ProgressBar>,
) -> Result<HostReport> {
    let log = HostLog::new(log_dir, host);
    let mut report = HostReport {
        host: host.address.clone(),
        ..Default::default()
    };

    info!("Creating ssh session for {host}");
    let mut shell = connector
        .connect(host)
        .context(format!("Connect to {host}"))?;

    info!("Spinning up result server on {host}");
    let _server = shell
        .exec(&settings.server_cmd, false)
        .context(format!("Start result server on {host}"))?;

    info!("Building on {host}, this will take a couple of minutes");
    if let Some(bar) = progress {
        bar.set_message("building");
    }
    let build = shell
        .exec(&settings.build_cmd, true)
        .and_then(|process| process.wait())
        .context(format!("Build on {host}"))?;
    log.append(&build)?;
    report.build_ok = build.success();
    if !report.build_ok {
        match settings.on_failure {
            FailurePolicy::AbortHost => bail!(
                "Build on {host} exited with status {}, aborting host",
                build.exit_status
            ),
            FailurePolicy::Continue => warn!(
                "Build on {host} exited with status {}, continuing",
                build.exit_status
            ),
        }
    }
    info!("Done building on {host}");

    for run in commands {
        if let Some(bar) = progress {
            bar.set_message(format!("{},{}", run.workload, run.configuration));
        }
        info!("Running on {host}: {}", run.cmd);
        let ok = run_command(&mut shell, run, settings.completion, &log)
            .context(format!("Run {},{} on {host}", run.workload, run.configuration))?;
        if ok {
            report.completed += 1;
        } else {
            report.failed.push(run.cmd.clone());
            match settings.on_failure {
                FailurePolicy::AbortHost => bail!(
                    "{},{} failed on {host}, skipping {} remaining commands",
                    run.workload,
                    run.configuration,
                    commands.len() - report.completed - report.failed.len()
                ),
                FailurePolicy::Continue => {
                    warn!("{},{} failed on {host}", run.workload, run.configuration)
                }
            }
        }
        if let Some(bar) = progress {
            bar.inc(1);
        }
    }

    if let Some(bar) = progress {
        bar.finish_with_message("done");
    }
    debug!("Worker for {host} done: {report:?}");
    Ok(report)
}

/// Returns whether the command counts as successful
fn run_command<S: RemoteShell>(
    shell: &mut S,
    run: &RunCommand,
    completion: Completion,
    log: &HostLog,
) -> Result<bool> {
    match completion {
        Completion::Fixed => {
            let _process = shell.exec(&run.cmd, true)?;
            sleep(run.runtime);
            Ok(true)
        }
        Completion::ExitStatus => {
            let output = shell.exec(&run.cmd, true)?.wait()?;
            log.append(&output)?;
            Ok(output.success())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::remote::{RemoteError, RemoteProcess};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Issued {
        cmd: String,
        pty: bool,
        waited: bool,
    }

    #[derive(Default, Clone)]
    struct FakeConnector {
        issued: Arc<Mutex<Vec<Issued>>>,
        exit_codes: HashMap<String, i32>,
        unreachable: bool,
    }

    struct FakeShell {
        issued: Arc<Mutex<Vec<Issued>>>,
        exit_codes: HashMap<String, i32>,
    }

    struct FakeProcess {
        issued: Arc<Mutex<Vec<Issued>>>,
        index: usize,
        output: CommandOutput,
    }

    impl Connector for FakeConnector {
        type Shell = FakeShell;

        fn connect(&self, host: &Host) -> Result<FakeShell, RemoteError> {
            if self.unreachable {
                return Err(RemoteError::Connect {
                    host: host.address.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                });
            }
            Ok(FakeShell {
                issued: self.issued.clone(),
                exit_codes: self.exit_codes.clone(),
            })
        }
    }

    impl RemoteShell for FakeShell {
        fn exec(&mut self, cmd: &str, pty: bool) -> Result<Box<dyn RemoteProcess>, RemoteError> {
            let mut issued = self.issued.lock().unwrap();
            issued.push(Issued {
                cmd: cmd.to_owned(),
                pty,
                waited: false,
            });
            Ok(Box::new(FakeProcess {
                issued: self.issued.clone(),
                index: issued.len() - 1,
                output: CommandOutput {
                    stdout: format!("out of {cmd}\n"),
                    stderr: format!("err of {cmd}\n"),
                    exit_status: self.exit_codes.get(cmd).copied().unwrap_or(0),
                },
            }))
        }
    }

    impl RemoteProcess for FakeProcess {
        fn wait(self: Box<Self>) -> Result<CommandOutput, RemoteError> {
            self.issued.lock().unwrap()[self.index].waited = true;
            Ok(self.output)
        }
    }

    fn host() -> Host {
        Host {
            address: "node1".to_owned(),
            port: 22,
        }
    }

    fn settings(completion: Completion, on_failure: FailurePolicy) -> DispatchSettings {
        DispatchSettings {
            server_cmd: "serve".to_owned(),
            build_cmd: "make".to_owned(),
            runtime_secs: 0,
            completion,
            on_failure,
            connect_timeout_secs: None,
            runs: vec![],
        }
    }

    fn commands(n: usize) -> Vec<RunCommand> {
        (0..n)
            .map(|i| RunCommand {
                workload: format!("w{i}"),
                configuration: "cfg".to_owned(),
                cmd: format!("run {i}"),
                runtime: Duration::ZERO,
            })
            .collect()
    }

    #[test]
    fn fixed_mode_issues_everything_in_order_without_waiting_on_runs() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::default();
        let report = run_host(
            &connector,
            &host(),
            &commands(3),
            &settings(Completion::Fixed, FailurePolicy::Continue),
            dir.path(),
            None,
        )
        .unwrap();

        assert_eq!(report.completed, 3);
        assert!(report.build_ok);
        let issued = connector.issued.lock().unwrap().clone();
        let cmds = issued.iter().map(|i| i.cmd.as_str()).collect::<Vec<_>>();
        assert_eq!(cmds, ["serve", "make", "run 0", "run 1", "run 2"]);
        assert_eq!(
            issued[0],
            Issued {
                cmd: "serve".to_owned(),
                pty: false,
                waited: false
            }
        );
        assert!(issued[1].waited && issued[1].pty);
        assert!(issued[2..].iter().all(|i| i.pty && !i.waited));
    }

    #[test]
    fn build_output_is_appended_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::default();
        let settings = settings(Completion::Fixed, FailurePolicy::Continue);
        for _ in 0..2 {
            run_host(&connector, &host(), &[], &settings, dir.path(), None).unwrap();
        }
        let stdout = std::fs::read_to_string(dir.path().join("node1.stdout")).unwrap();
        let stderr = std::fs::read_to_string(dir.path().join("node1.stderr")).unwrap();
        assert_eq!(stdout, "out of make\nout of make\n");
        assert_eq!(stderr, "err of make\nerr of make\n");
    }

    #[test]
    fn exit_status_mode_continues_past_failures_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector {
            exit_codes: HashMap::from([("run 1".to_owned(), 2)]),
            ..Default::default()
        };
        let report = run_host(
            &connector,
            &host(),
            &commands(3),
            &settings(Completion::ExitStatus, FailurePolicy::Continue),
            dir.path(),
            None,
        )
        .unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, ["run 1"]);
        assert!(connector.issued.lock().unwrap()[2..].iter().all(|i| i.waited));
    }

    #[test]
    fn abort_host_stops_remaining_commands() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector {
            exit_codes: HashMap::from([("run 0".to_owned(), 1)]),
            ..Default::default()
        };
        let result = run_host(
            &connector,
            &host(),
            &commands(3),
            &settings(Completion::ExitStatus, FailurePolicy::AbortHost),
            dir.path(),
            None,
        );
        assert!(result.is_err());
        let issued = connector.issued.lock().unwrap();
        assert_eq!(issued.last().unwrap().cmd, "run 0");
    }

    #[test]
    fn failed_build_aborts_only_under_abort_host() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector {
            exit_codes: HashMap::from([("make".to_owned(), 2)]),
            ..Default::default()
        };
        let report = run_host(
            &connector,
            &host(),
            &commands(1),
            &settings(Completion::Fixed, FailurePolicy::Continue),
            dir.path(),
            None,
        )
        .unwrap();
        assert!(!report.build_ok);
        assert_eq!(report.completed, 1);

        let result = run_host(
            &connector,
            &host(),
            &commands(1),
            &settings(Completion::Fixed, FailurePolicy::AbortHost),
            dir.path(),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unreachable_host_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector {
            unreachable: true,
            ..Default::default()
        };
        let result = run_host(
            &connector,
            &host(),
            &commands(2),
            &settings(Completion::Fixed, FailurePolicy::Continue),
            dir.path(),
            None,
        );
        assert!(result.is_err());
        assert!(connector.issued.lock().unwrap().is_empty());
    }

    #[test]
    fn fixed_mode_sleeps_out_each_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::default();
        let runtime = Duration::from_millis(150);
        let mut runs = commands(2);
        for run in &mut runs {
            run.runtime = runtime;
        }

        let start = std::time::Instant::now();
        let report = run_host(
            &connector,
            &host(),
            &runs,
            &settings(Completion::Fixed, FailurePolicy::Continue),
            dir.path(),
            None,
        )
        .unwrap();

        assert!(start.elapsed() >= runtime * 2);
        assert_eq!(report.completed, 2);
        let issued = connector.issued.lock().unwrap();
        assert!(issued[2..].iter().all(|i| !i.waited));
    }
}
