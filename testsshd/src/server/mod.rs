mod handler;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Config as ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub use handler::{ServerState, TestSshHandler, make_server_config};

use crate::config::Config;
use crate::fault::FaultController;
use crate::keys::{TestKeys, load_host_key};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound SSH listener with its auth policy and fault controller installed.
pub struct SshServer {
    listener: TcpListener,
    ssh_config: Arc<ServerConfig>,
    state: Arc<ServerState>,
}

impl SshServer {
    /// Load the host key and bind `config.bind:config.port`. Any failure here
    /// is a startup error.
    pub async fn bind(config: &Config, keys: &TestKeys) -> Result<Self> {
        let host_key = load_host_key(config.host_key.as_deref())?;
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        let state = Arc::new(ServerState {
            authorized: keys.authorized(),
            faults: Arc::new(FaultController::new(config.fail_config())),
        });

        Ok(Self {
            listener,
            ssh_config: make_server_config(host_key),
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn faults(&self) -> Arc<FaultController> {
        self.state.faults.clone()
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Sessions already running
    /// are left to finish on their own tasks.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = TestSshHandler::new(Some(peer), self.state.clone());
                        tokio::spawn(handle_connection(self.ssh_config.clone(), stream, handler));
                    }
                    Err(e) => {
                        // e.g. EMFILE; retrying at once would spin
                        warn!("Failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

async fn handle_connection(config: Arc<ServerConfig>, stream: TcpStream, handler: TestSshHandler) {
    let _ = stream.set_nodelay(true);
    match server::run_stream(config, stream, handler).await {
        Ok(running) => {
            debug!("SSH handshake complete, session running");
            if let Err(e) = running.await {
                debug!("SSH connection closed: {:?}", e);
            }
        }
        Err(e) => {
            error!("SSH handshake aborted: {:?}", e);
        }
    }
}

/// Provision the test keys, bind, and serve until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let keys = TestKeys::provision()?;
    let server = SshServer::bind(&config, &keys).await?;
    let addr = server.local_addr()?;

    info!(
        fail_mode = %config.fail_mode,
        fail_after = config.fail_after,
        keys = ?keys.labels(),
        "starting ssh server for scp tests on {addr}"
    );

    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
