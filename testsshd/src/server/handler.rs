use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use russh::keys::ssh_key::HashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{self, Auth, Config as ServerConfig, Handle, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::auth::AuthorizedKeySet;
use crate::fault::FaultController;
use crate::session::{ScpSession, SessionControl, parse_command};

/// State shared read-only by every connection of one server, apart from the
/// connection counter inside the fault controller.
#[derive(Debug)]
pub struct ServerState {
    pub authorized: AuthorizedKeySet,
    pub faults: Arc<FaultController>,
}

/// Server-side SSH handler state.
///
/// One instance per TCP connection.
pub struct TestSshHandler {
    peer: Option<SocketAddr>,
    state: Arc<ServerState>,
    /// Label of the key the client authenticated with.
    key_label: Option<String>,
    /// Session channels waiting for an exec or shell request.
    session_channels: HashMap<ChannelId, Channel<Msg>>,
}

impl TestSshHandler {
    pub fn new(peer: Option<SocketAddr>, state: Arc<ServerState>) -> Self {
        Self {
            peer,
            state,
            key_label: None,
            session_channels: HashMap::new(),
        }
    }

    /// Hand a session channel over to its own task. Each delivered session
    /// takes exactly one ordinal, here, before any fault decision.
    fn deliver(
        &mut self,
        channel: ChannelId,
        argv: Vec<String>,
        session: &mut Session,
    ) -> Result<()> {
        let Some(ch) = self.session_channels.remove(&channel) else {
            warn!(?channel, "Request for unknown or already used channel");
            session.channel_failure(channel)?;
            return Ok(());
        };
        session.channel_success(channel)?;

        let ordinal = self.state.faults.admit();
        info!(
            ordinal,
            peer = ?self.peer,
            key = self.key_label.as_deref().unwrap_or("-"),
            command = ?argv,
            "Session delivered"
        );

        let control = ChannelControl {
            handle: session.handle(),
            channel,
        };
        let scp = ScpSession::new(ordinal, argv, self.state.faults.clone(), control);
        let span = info_span!("session", ordinal);
        tokio::spawn(
            async move {
                let outcome = scp.run(ch.into_stream()).await;
                info!(?outcome, "Session finished");
            }
            .instrument(span),
        );
        Ok(())
    }
}

/// [`SessionControl`] over a russh server channel.
struct ChannelControl {
    handle: Handle,
    channel: ChannelId,
}

impl SessionControl for ChannelControl {
    fn exit(&self, code: u32) -> impl Future<Output = ()> + Send {
        async move {
            if self
                .handle
                .exit_status_request(self.channel, code)
                .await
                .is_err()
            {
                debug!(channel = ?self.channel, "Exit status not delivered");
            }
            let _ = self.handle.eof(self.channel).await;
            let _ = self.handle.close(self.channel).await;
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.handle.close(self.channel).await;
        }
    }
}

/// Build a minimal SSH server config around `host_key`.
pub fn make_server_config(host_key: PrivateKey) -> Arc<ServerConfig> {
    let mut config = ServerConfig::default();
    config.server_id = russh::SshId::Standard(format!(
        "SSH-2.0-testsshd_{}",
        env!("CARGO_PKG_VERSION")
    ));
    config.inactivity_timeout = Some(Duration::from_secs(600));
    config.auth_rejection_time = Duration::from_millis(0);
    config.auth_rejection_time_initial = Some(Duration::from_millis(0));
    config.window_size = 4 * 1024 * 1024;
    config.channel_buffer_size = 4 * 1024 * 1024;
    config.maximum_packet_size = 65535; // MUST stay <= 65535
    config.keys.push(host_key);
    Arc::new(config)
}

impl server::Handler for TestSshHandler {
    type Error = anyhow::Error;

    // ------------------- AUTH -------------------

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let authorized = &self.state.authorized;
        if !authorized.authorize(key) {
            warn!(
                user,
                peer = ?self.peer,
                fingerprint = %key.fingerprint(HashAlg::Sha256),
                "Rejected unauthorized public key"
            );
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }

        let label = authorized.matching_label(key).unwrap_or("-");
        debug!(user, key = label, peer = ?self.peer, "Public key accepted");
        self.key_label = Some(label.to_string());
        Ok(Auth::Accept)
    }

    // ------------------- CHANNELS -------------------

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.session_channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.session_channels.remove(&channel);
        Ok(())
    }

    // ------------------- EXEC / SHELL -------------------

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let argv = parse_command(&String::from_utf8_lossy(data));
        self.deliver(channel, argv, session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.deliver(channel, Vec::new(), session)
    }
}
