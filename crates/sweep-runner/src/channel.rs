use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// ssh reserves this exit status for its own (connection/auth) errors.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub name: String,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// What happened to one remote invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit status zero; stdout still has to be parsed.
    Success { stdout: String, stderr: String },
    Timeout,
    ProcessFailure {
        exit_code: Option<i32>,
        stderr: String,
    },
    TransportError { message: String },
}

impl ExecutionOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::ProcessFailure { .. } => "process_failure",
            ExecutionOutcome::TransportError { .. } => "transport_error",
        }
    }
}

/// Runs a command for a host with the given stdin and a wall-clock limit.
pub trait ExecutionChannel: Send + Sync {
    fn execute(
        &self,
        host: &Host,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> ExecutionOutcome;
}

#[derive(Debug)]
struct ProcessRun {
    status: Option<ExitStatus>,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> Option<Receiver<Vec<u8>>> {
    source.map(|mut reader| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
        rx
    })
}

/// `None` when the deadline passes before the value arrives.
fn receive_by<T>(pending: Option<Receiver<T>>, deadline: Instant) -> Option<Option<T>> {
    let Some(rx) = pending else {
        return Some(None);
    };
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(value) => Some(Some(value)),
        Err(RecvTimeoutError::Disconnected) => Some(None),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

fn lossy(bytes: Option<Vec<u8>>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn timed_out_run() -> ProcessRun {
    ProcessRun {
        status: None,
        stdout: String::new(),
        stderr: String::new(),
        timed_out: true,
    }
}

/// Spawns `cmd`, feeds `input` on a writer thread, and waits at most
/// `timeout`, including the time spent draining its pipes. Spawn and stdin
/// errors other than a closed pipe are `Err`.
fn run_process(mut cmd: Command, input: &[u8], timeout: Duration) -> std::io::Result<ProcessRun> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());
    let writer = child.stdin.take().map(|mut stdin| {
        let input = input.to_vec();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(stdin.write_all(&input).and_then(|_| stdin.flush()));
        });
        rx
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Output already written must not be lost to a deadline that
                // expires while the reader threads hand it over.
                let drain_deadline = deadline.max(Instant::now() + DRAIN_GRACE);
                // Background processes may inherit the pipes and keep them
                // open after the child exits; those are abandoned at the
                // deadline.
                let Some(written) = receive_by(writer, drain_deadline) else {
                    warn!("stdin still held open after exit; treating as timeout");
                    return Ok(timed_out_run());
                };
                if let Some(Err(e)) = written {
                    // A closed pipe only means the process stopped reading;
                    // its exit status tells the rest.
                    if e.kind() != ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                    debug!("stdin closed early by child");
                }
                let (Some(stdout), Some(stderr)) = (
                    receive_by(stdout_reader, drain_deadline),
                    receive_by(stderr_reader, drain_deadline),
                ) else {
                    warn!("output still held open after exit; treating as timeout");
                    return Ok(timed_out_run());
                };
                return Ok(ProcessRun {
                    status: Some(status),
                    stdout: lossy(stdout),
                    stderr: lossy(stderr),
                    timed_out: false,
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_and_reap(&mut child);
                    // Grandchildren may still hold the pipes open, so the
                    // reader threads are left to finish on their own.
                    return Ok(timed_out_run());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(e);
            }
        }
    }
}

fn classify(run: ProcessRun, transport_exit: Option<i32>) -> ExecutionOutcome {
    if run.timed_out {
        return ExecutionOutcome::Timeout;
    }
    let code = run.status.and_then(|s| s.code());
    match code {
        Some(0) => ExecutionOutcome::Success {
            stdout: run.stdout,
            stderr: run.stderr,
        },
        Some(c) if Some(c) == transport_exit => ExecutionOutcome::TransportError {
            message: last_line(&run.stderr)
                .unwrap_or("connection failed")
                .to_string(),
        },
        _ => ExecutionOutcome::ProcessFailure {
            exit_code: code,
            stderr: run.stderr.trim().to_string(),
        },
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Runs commands on this machine through `sh -c`, ignoring the host name.
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

impl ExecutionChannel for LocalChannel {
    fn execute(
        &self,
        host: &Host,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> ExecutionOutcome {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        match run_process(cmd, input, timeout) {
            Ok(run) => classify(run, None),
            Err(e) => {
                warn!(host = %host, error = %e, "local spawn failed");
                ExecutionOutcome::TransportError {
                    message: e.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SshOptions {
    #[serde(default = "SshOptions::default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "SshOptions::default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Also bound the command on the remote side so it dies when the local
    /// client is killed.
    #[serde(default = "SshOptions::default_remote_kill_guard")]
    pub remote_kill_guard: bool,
}

impl SshOptions {
    fn default_port() -> u16 {
        22
    }

    fn default_connect_timeout() -> u64 {
        10
    }

    fn default_remote_kill_guard() -> bool {
        true
    }
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            user: None,
            connect_timeout_seconds: Self::default_connect_timeout(),
            remote_kill_guard: Self::default_remote_kill_guard(),
        }
    }
}

/// Runs commands on remote hosts through the system `ssh` client.
#[derive(Debug, Clone, Default)]
pub struct SshChannel {
    options: SshOptions,
}

impl SshChannel {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn destination(&self, host: &Host) -> String {
        match &self.options.user {
            Some(user) => format!("{}@{}", user, host.name),
            None => host.name.clone(),
        }
    }

    pub fn build_command(&self, host: &Host, command: &str, timeout: Duration) -> Command {
        let remote = if self.options.remote_kill_guard {
            let secs = timeout.as_secs() + 1;
            format!("timeout -s KILL {} sh -c {}", secs, shell_quote(command))
        } else {
            command.to_string()
        };
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.options.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout_seconds
            ))
            .arg(self.destination(host))
            .arg(remote);
        cmd
    }
}

impl ExecutionChannel for SshChannel {
    fn execute(
        &self,
        host: &Host,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> ExecutionOutcome {
        let cmd = self.build_command(host, command, timeout);
        match run_process(cmd, input, timeout) {
            Ok(run) => classify(run, Some(SSH_TRANSPORT_EXIT)),
            Err(e) => {
                warn!(host = %host, error = %e, "ssh session failed");
                ExecutionOutcome::TransportError {
                    message: e.to_string(),
                }
            }
        }
    }
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
