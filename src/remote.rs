use crate::config::SshConfig;
use ssh2::Session;
use std::io::Read;
use std::net::TcpStream;
use std::thread;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// Runs `command` on the SSH host and returns its stdout. Blocks until the
/// remote side closes the channel.
pub fn run_command(ssh: &SshConfig, command: &str) -> Result<String, RemoteError> {
    info!("Establishing SSH connection to {}:{}...", ssh.host, ssh.port);
    let tcp = TcpStream::connect((ssh.host.as_str(), ssh.port))?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_password(&ssh.user, &ssh.password)?;
    info!("SSH connection established.");

    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close()?;
    info!("Remote command exited with status {}.", channel.exit_status()?);

    Ok(output)
}

/// Starts the configured player command on a worker thread that is never
/// joined. Callers continue immediately and never observe the outcome.
pub fn launch_detached(ssh: SshConfig) {
    let command = ssh.command();
    let spawned = thread::Builder::new()
        .name("external-video".to_string())
        .spawn(move || match run_command(&ssh, &command) {
            Ok(output) => info!("Remote command '{}' finished: {}", command, output.trim()),
            Err(e) => error!("Remote command '{}' failed: {}", command, e),
        });

    if let Err(e) = spawned {
        error!("Failed to spawn external video worker: {}", e);
    }
}
