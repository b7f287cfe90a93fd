use super::*;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use log::{debug, error};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};

/// Options specific to the native SSH transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StandardTransportArgs {
    pub auth_password: Option<String>,
    /// Private key file, used when no password is set.
    pub auth_private_key: Option<String>,
    pub auth_private_key_passphrase: Option<String>,
    /// Verify the remote host key. Enabled by default.
    pub auth_strict_key: bool,
    /// Known-hosts file used when strict checking is on. Falls back to the
    /// user's default known-hosts file.
    pub ssh_known_hosts_file: Option<String>,
    pub security_level: SecurityLevel,
}

impl Default for StandardTransportArgs {
    fn default() -> Self {
        Self {
            auth_password: None,
            auth_private_key: None,
            auth_private_key_passphrase: None,
            auth_strict_key: true,
            ssh_known_hosts_file: None,
            security_level: SecurityLevel::Secure,
        }
    }
}

impl StandardTransportArgs {
    fn auth_method(&self) -> Result<AuthMethod, TransportError> {
        if let Some(password) = self.auth_password.as_deref() {
            return Ok(AuthMethod::with_password(password));
        }
        match self.auth_private_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Ok(AuthMethod::with_key_file(
                key,
                self.auth_private_key_passphrase.as_deref(),
            )),
            None => Err(TransportError::MissingCredentials),
        }
    }

    fn server_check(&self) -> ServerCheckMethod {
        if !self.auth_strict_key {
            return ServerCheckMethod::NoCheck;
        }
        match self.ssh_known_hosts_file.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => ServerCheckMethod::KnownHostsFile(path.to_string()),
            None => ServerCheckMethod::DefaultKnownHostsFile,
        }
    }
}

struct SshSession {
    client: Client,
    channel: Channel<Msg>,
    /// Bytes received beyond what the last `read_n` asked for.
    pending: Vec<u8>,
}

fn take_front(buf: &mut Vec<u8>, n: usize) -> Vec<u8> {
    let rest = buf.split_off(n.min(buf.len()));
    std::mem::replace(buf, rest)
}

/// Waits for the next chunk of output. `wait` is cancel-safe, so the
/// caller may drop this future on timeout without losing messages.
async fn next_data(channel: &mut Channel<Msg>) -> Result<Vec<u8>, TransportError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => return Ok(data.to_vec()),
            Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(data.to_vec()),
            Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                return Err(TransportError::TransportFailure);
            }
            Some(_) => {}
        }
    }
}

async fn establish(
    base: &BaseTransportArgs,
    args: &StandardTransportArgs,
    netconf: bool,
) -> Result<SshSession, TransportError> {
    let auth = args.auth_method()?;
    let config = Config {
        preferred: args.security_level.preferred(),
        inactivity_timeout: None,
        keepalive_interval: Some(base.timeout_transport.get()),
        ..Default::default()
    };

    let connect = Client::connect_with_config(
        (base.host.clone(), base.port),
        &base.auth_username,
        auth,
        args.server_check(),
        config,
    );
    let client = match tokio::time::timeout(base.timeout_socket.get(), connect).await {
        Ok(Ok(client)) => client,
        Ok(Err(async_ssh2_tokio::Error::ServerCheckFailed)) => {
            return Err(TransportError::KeyVerificationFailed);
        }
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(TransportError::TransportTimeout),
    };

    match open_channel(&client, base, netconf).await {
        Ok(channel) => Ok(SshSession {
            client,
            channel,
            pending: Vec::new(),
        }),
        Err(err) => {
            let _ = client.disconnect().await;
            Err(err)
        }
    }
}

async fn open_channel(
    client: &Client,
    base: &BaseTransportArgs,
    netconf: bool,
) -> Result<Channel<Msg>, TransportError> {
    let mut channel = client.get_channel().await?;
    if netconf {
        channel
            .request_subsystem(true, config::NETCONF_SUBSYSTEM)
            .await?;
    } else {
        channel
            .request_pty(
                false,
                "xterm",
                u32::from(base.pty_cols),
                u32::from(base.pty_rows),
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(false).await?;
    }
    Ok(channel)
}

/// Transport speaking SSH directly through russh.
///
/// An instance is single-use: once closed it cannot be reopened.
pub struct StandardTransport {
    base: BaseTransportArgs,
    args: StandardTransportArgs,
    state: SessionState<SshSession>,
}

impl StandardTransport {
    pub fn new(base: BaseTransportArgs, args: StandardTransportArgs) -> Self {
        Self {
            base,
            args,
            state: SessionState::Idle,
        }
    }

    pub fn base_args(&self) -> &BaseTransportArgs {
        &self.base
    }

    async fn connect(&mut self, netconf: bool) -> Result<(), TransportError> {
        self.state.ensure_openable()?;
        let what = if netconf { "netconf transport" } else { "transport" };
        debug!(
            "{}",
            self.format_log_message(
                Level::Debug,
                &format!("attempting to open {what} connection"),
            )
        );

        let result = establish(&self.base, &self.args, netconf).await;
        match result {
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
    pub async fn read_n(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let timeout = self.base.timeout_transport.get();
        let session = self.state.session_mut()?;
        if n == 0 {
            return Ok(Vec::new());
        }
        if !session.pending.is_empty() {
            return Ok(take_front(&mut session.pending, n));
        }

        let result = if timeout.is_zero() {
            Err(TransportError::TransportTimeout)
        } else {
            tokio::time::timeout(timeout, next_data(&mut session.channel))
                .await
                .unwrap_or(Err(TransportError::TransportTimeout))
        };

        match result {
            Ok(data) => {
                session.pending = data;
                Ok(take_front(&mut session.pending, n))
            }
            Err(err) => {
                error!(
                    "{}",
                    self.format_log_message(
                        Level::Error,
                        &format!("failed reading from transport: {err}"),
                    )
                );
                Err(err)
            }
        }
    }
}

impl Transport for StandardTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.connect(false).await
    }

    async fn open_netconf(&mut self) -> Result<(), TransportError> {
        self.connect(true).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.state.take() else {
            return Ok(());
        };

        let _ = session.channel.eof().await;
        let result = session.client.disconnect().await.map_err(TransportError::from);
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
        let session = self.state.session_mut()?;
        if let Err(err) = session.channel.data(data).await {
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
