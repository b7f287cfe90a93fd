use super::*;

use log::{debug, error};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Options specific to the pty-spawned `ssh` transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SystemTransportArgs {
    /// Private key passed to `ssh -i`.
    pub auth_private_key: Option<String>,
    /// Verify the remote host key. Enabled by default.
    pub auth_strict_key: bool,
    /// ssh client config file. When unset, `-F /dev/null` suppresses
    /// any system or user config.
    pub ssh_config_file: Option<String>,
    /// Known-hosts file used when strict checking is on.
    pub ssh_known_hosts_file: Option<String>,
}

impl Default for SystemTransportArgs {
    fn default() -> Self {
        Self {
            auth_private_key: None,
            auth_strict_key: true,
            ssh_config_file: None,
            ssh_known_hosts_file: None,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Builds the `ssh` argument vector for a session.
///
/// Order is fixed so the resulting command is reproducible.
pub fn build_open_cmd(base: &BaseTransportArgs, args: &SystemTransportArgs) -> Vec<String> {
    let mut cmd = vec![
        base.host.clone(),
        "-p".to_string(),
        base.port.to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", base.timeout_socket.get().as_secs()),
        "-o".to_string(),
        format!("ServerAliveInterval={}", base.timeout_transport.get().as_secs()),
    ];

    if let Some(key) = non_empty(&args.auth_private_key) {
        cmd.extend(["-i".to_string(), key.to_string()]);
    }

    if !base.auth_username.is_empty() {
        cmd.extend(["-l".to_string(), base.auth_username.clone()]);
    }

    if args.auth_strict_key {
        cmd.extend(["-o".to_string(), "StrictHostKeyChecking=yes".to_string()]);
        if let Some(known_hosts) = non_empty(&args.ssh_known_hosts_file) {
            cmd.extend(["-o".to_string(), format!("UserKnownHostsFile={known_hosts}")]);
        }
    } else {
        cmd.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", config::DEV_NULL),
        ]);
    }

    let config_file = non_empty(&args.ssh_config_file).unwrap_or(config::DEV_NULL);
    cmd.extend(["-F".to_string(), config_file.to_string()]);

    cmd
}

/// Same as [`build_open_cmd`] with a forced tty and the NETCONF subsystem
/// appended.
pub fn build_netconf_cmd(base: &BaseTransportArgs, args: &SystemTransportArgs) -> Vec<String> {
    let mut cmd = build_open_cmd(base, args);
    cmd.extend([
        "-tt".to_string(),
        "-s".to_string(),
        config::NETCONF_SUBSYSTEM.to_string(),
    ]);
    cmd
}

/// Read side of the pty, shared with timeout workers.
///
/// `pending` holds bytes a worker read after its caller had already timed
/// out; the next read returns them first.
struct PtyReader {
    inner: Box<dyn Read + Send>,
    pending: Vec<u8>,
}

struct PtySession {
    // Dropping the master closes the pty.
    _master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Arc<Mutex<PtyReader>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl PtySession {
    /// Closes the pty and terminates the child if it is still running.
    ///
    /// The child is reaped on the blocking pool without waiting for it.
    fn shutdown(self) -> Result<(), TransportError> {
        let PtySession {
            _master,
            mut child,
            reader,
            writer,
        } = self;
        drop(writer);
        drop(reader);
        drop(_master);

        let killed = match child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => child.kill(),
        };
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
        });
        killed.map_err(TransportError::from)
    }
}

fn read_chunk(
    reader: &Mutex<PtyReader>,
    n: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, TransportError> {
    let mut reader = reader
        .lock()
        .map_err(|_| TransportError::TransportFailure)?;

    // An earlier abandoned worker may have held the lock until now. Whatever
    // is pending stays for a caller that is still waiting.
    if cancel.is_cancelled() {
        return Err(TransportError::TransportTimeout);
    }
    if !reader.pending.is_empty() {
        let len = reader.pending.len();
        let rest = reader.pending.split_off(n.min(len));
        return Ok(std::mem::replace(&mut reader.pending, rest));
    }

    let mut buf = vec![0; n];
    match reader.inner.read(&mut buf) {
        Ok(0) | Err(_) => Err(TransportError::TransportFailure),
        Ok(len) => {
            buf.truncate(len);
            if cancel.is_cancelled() {
                reader.pending.extend_from_slice(&buf);
                return Err(TransportError::TransportTimeout);
            }
            Ok(buf)
        }
    }
}

fn write_all(writer: &Mutex<Box<dyn Write + Send>>, data: &[u8]) -> std::io::Result<()> {
    let mut writer = writer
        .lock()
        .map_err(|_| std::io::Error::other("pty writer lock poisoned"))?;
    writer.write_all(data)?;
    writer.flush()
}

/// Transport that runs `ssh` (or any program set with
/// [`with_exec_cmd`](Self::with_exec_cmd)) on a pseudo-terminal and
/// exchanges raw bytes with it.
///
/// An instance is single-use: once closed it cannot be reopened.
pub struct SystemTransport {
    base: BaseTransportArgs,
    args: SystemTransportArgs,
    exec_cmd: String,
    open_cmd: Option<Vec<String>>,
    state: SessionState<PtySession>,
}

impl SystemTransport {
    pub fn new(base: BaseTransportArgs, args: SystemTransportArgs) -> Self {
        Self {
            base,
            args,
            exec_cmd: config::DEFAULT_EXEC_CMD.to_string(),
            open_cmd: None,
            state: SessionState::Idle,
        }
    }

    /// Replaces the spawned program, e.g. a wrapper script around `ssh`.
    pub fn with_exec_cmd(mut self, exec_cmd: impl Into<String>) -> Self {
        self.exec_cmd = exec_cmd.into();
        self
    }

    pub fn exec_cmd(&self) -> &str {
        &self.exec_cmd
    }

    /// Argument vector of the current or last session, once built.
    pub fn open_cmd(&self) -> Option<&[String]> {
        self.open_cmd.as_deref()
    }

    pub fn base_args(&self) -> &BaseTransportArgs {
        &self.base
    }

    fn spawn(&self, open_cmd: &[String], size: PtySize) -> Result<PtySession, TransportError> {
        let pair = native_pty_system()
            .openpty(size)
            .map_err(TransportError::Pty)?;

        let mut cmd = CommandBuilder::new(&self.exec_cmd);
        cmd.args(open_cmd);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(TransportError::Pty)?;
        // Only the child may hold the slave side, otherwise EOF is never seen.
        drop(pair.slave);

        let handles = pair.master.try_clone_reader().and_then(|reader| {
            let writer = pair.master.take_writer()?;
            Ok((reader, writer))
        });
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(err) => {
                let _ = child.kill();
                return Err(TransportError::Pty(err));
            }
        };

        Ok(PtySession {
            _master: pair.master,
            child,
            reader: Arc::new(Mutex::new(PtyReader {
                inner: reader,
                pending: Vec::new(),
            })),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    fn start(
        &mut self,
        open_cmd: Vec<String>,
        size: PtySize,
        what: &str,
    ) -> Result<(), TransportError> {
        debug!(
            "{}",
            self.format_log_message(
                Level::Debug,
                &format!(
                    "attempting to open {what} connection with command: {} {open_cmd:?}",
                    self.exec_cmd
                ),
            )
        );

        let spawned = self.spawn(&open_cmd, size);
        self.open_cmd = Some(open_cmd);
        match spawned {
            Ok(session) => {
                self.state = SessionState::Open(session);
                debug!(
                    "{}",
                    self.format_log_message(
                        Level::Debug,
                        &format!("{what} connection to host opened"),
                    )
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "{}",
                    self.format_log_message(
                        Level::Error,
                        &format!("failed opening {what} connection to host: {err}"),
                    )
                );
                Err(err)
            }
        }
    }

    /// Reads at most `n` bytes, bounded by the transport timeout.
    ///
    /// End-of-stream and read errors are both reported as
    /// [`TransportError::TransportFailure`].
    pub async fn read_n(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let reader = Arc::clone(&self.state.session_mut()?.reader);
        if n == 0 {
            return Ok(Vec::new());
        }

        let timeout = self.base.timeout_transport.get();
        let result =
            run_with_timeout(timeout, move |cancel| read_chunk(&reader, n, cancel)).await;
        if let Err(err) = &result {
            error!(
                "{}",
                self.format_log_message(
                    Level::Error,
                    &format!("failed reading from transport: {err}"),
                )
            );
        }
        result
    }
}

impl Transport for SystemTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.state.ensure_openable()?;
        let open_cmd = match &self.open_cmd {
            Some(cmd) => cmd.clone(),
            None => build_open_cmd(&self.base, &self.args),
        };
        let size = PtySize {
            rows: self.base.pty_rows,
            cols: self.base.pty_cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.start(open_cmd, size, "transport")
    }

    async fn open_netconf(&mut self) -> Result<(), TransportError> {
        self.state.ensure_openable()?;
        let open_cmd = build_netconf_cmd(&self.base, &self.args);
        self.start(open_cmd, PtySize::default(), "netconf transport")
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.state.take() else {
            return Ok(());
        };

        let result = session.shutdown();
        match &result {
            Ok(()) => debug!(
                "{}",
                self.format_log_message(Level::Debug, "transport connection to host closed")
            ),
            Err(err) => error!(
                "{}",
                self.format_log_message(
                    Level::Error,
                    &format!("error closing transport connection to host: {err}"),
                )
            ),
        }
        result
    }

    fn is_alive(&self) -> bool {
        self.state.is_open()
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        self.read_n(config::READ_SIZE).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let writer = Arc::clone(&self.state.session_mut()?.writer);
        let data = data.to_vec();
        // Not deadline-bounded; a full pty buffer only parks a blocking-pool thread.
        let result = tokio::task::spawn_blocking(move || write_all(&writer, &data))
            .await
            .unwrap_or_else(|join_err| Err(std::io::Error::other(join_err)));

        if let Err(err) = result {
            error!(
                "{}",
                self.format_log_message(
                    Level::Error,
                    &format!("failed writing to transport: {err}"),
                )
            );
            return Err(err.into());
        }
        Ok(())
    }

    fn format_log_message(&self, level: Level, message: &str) -> String {
        format_log_message(&self.base, level, message)
    }
}
