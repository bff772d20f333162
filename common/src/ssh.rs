use std::{
    io::Read,
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use ssh2::{Channel, CheckResult, KnownHostFileKind, Session};
use tracing::{debug, warn};

use crate::{
    config::Host,
    remote::{CommandOutput, Connector, RemoteError, RemoteProcess, RemoteShell},
};

const DEFAULT_KEYS: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Opens ssh sessions using the local agent and default key files
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub user: String,
    pub connect_timeout: Option<Duration>,
}

impl SshConnector {
    pub fn new(user: String, connect_timeout: Option<Duration>) -> Self {
        Self {
            user,
            connect_timeout,
        }
    }

    fn tcp(&self, host: &Host) -> Result<TcpStream, RemoteError> {
        let connect_err = |source| RemoteError::Connect {
            host: host.address.clone(),
            source,
        };
        match self.connect_timeout {
            Some(timeout) => {
                let addr = (host.address.as_str(), host.port)
                    .to_socket_addrs()
                    .map_err(connect_err)?
                    .next()
                    .ok_or_else(|| {
                        connect_err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "address did not resolve",
                        ))
                    })?;
                TcpStream::connect_timeout(&addr, timeout).map_err(connect_err)
            }
            None => TcpStream::connect((host.address.as_str(), host.port)).map_err(connect_err),
        }
    }

    fn check_host_key(&self, session: &Session, host: &Host) -> Result<(), RemoteError> {
        let channel_err = |source| RemoteError::Channel {
            host: host.address.clone(),
            source,
        };
        let Some(known_hosts_file) = home_dir().map(|h| h.join(".ssh/known_hosts")) else {
            warn!("No home directory, skipping host key check for {host}");
            return Ok(());
        };
        let mut known_hosts = session.known_hosts().map_err(channel_err)?;
        if known_hosts_file.exists() {
            known_hosts
                .read_file(&known_hosts_file, KnownHostFileKind::OpenSSH)
                .map_err(channel_err)?;
        }
        let Some((key, _)) = session.host_key() else {
            return Err(RemoteError::HostKeyMismatch(host.address.clone()));
        };
        match known_hosts.check_port(&host.address, host.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => {
                warn!("{host} is not in known_hosts, accepting its key");
                Ok(())
            }
            CheckResult::Mismatch | CheckResult::Failure => {
                Err(RemoteError::HostKeyMismatch(host.address.clone()))
            }
        }
    }

    fn authenticate(&self, session: &Session, host: &Host) -> Result<(), RemoteError> {
        if let Ok(mut agent) = session.agent()
            && agent.connect().is_ok()
            && agent.list_identities().is_ok()
        {
            for identity in agent.identities().unwrap_or_default() {
                if agent.userauth(&self.user, &identity).is_ok() && session.authenticated() {
                    debug!("Authenticated to {host} with agent identity {}", identity.comment());
                    return Ok(());
                }
            }
        }

        if let Some(ssh_dir) = home_dir().map(|h| h.join(".ssh")) {
            for key in DEFAULT_KEYS {
                let private_key = ssh_dir.join(key);
                if !private_key.exists() {
                    continue;
                }
                if session
                    .userauth_pubkey_file(&self.user, None, &private_key, None)
                    .is_ok()
                    && session.authenticated()
                {
                    debug!("Authenticated to {host} with {}", private_key.display());
                    return Ok(());
                }
            }
        }

        Err(RemoteError::Auth {
            host: host.address.clone(),
            user: self.user.clone(),
        })
    }
}

impl Connector for SshConnector {
    type Shell = SshShell;

    fn connect(&self, host: &Host) -> Result<SshShell, RemoteError> {
        let tcp = self.tcp(host)?;
        let handshake_err = |source| RemoteError::Handshake {
            host: host.address.clone(),
            source,
        };
        let mut session = Session::new().map_err(handshake_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(handshake_err)?;

        self.check_host_key(&session, host)?;
        self.authenticate(&session, host)?;

        Ok(SshShell {
            host: host.address.clone(),
            session,
        })
    }
}

pub struct SshShell {
    host: String,
    session: Session,
}

impl RemoteShell for SshShell {
    fn exec(&mut self, cmd: &str, pty: bool) -> Result<Box<dyn RemoteProcess>, RemoteError> {
        let channel_err = |source| RemoteError::Channel {
            host: self.host.clone(),
            source,
        };
        let mut channel = self.session.channel_session().map_err(channel_err)?;
        if pty {
            channel
                .request_pty("xterm", None, None)
                .map_err(channel_err)?;
        }
        channel.exec(cmd).map_err(channel_err)?;
        Ok(Box::new(SshProcess {
            host: self.host.clone(),
            channel,
        }))
    }
}

struct SshProcess {
    host: String,
    channel: Channel,
}

impl RemoteProcess for SshProcess {
    fn wait(self: Box<Self>) -> Result<CommandOutput, RemoteError> {
        let SshProcess { host, mut channel } = *self;
        let io_err = |source| RemoteError::Io {
            host: host.clone(),
            source,
        };
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(io_err)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr).map_err(io_err)?;

        let channel_err = |source| RemoteError::Channel {
            host: host.clone(),
            source,
        };
        channel.wait_close().map_err(channel_err)?;
        let exit_status = channel.exit_status().map_err(channel_err)?;
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
