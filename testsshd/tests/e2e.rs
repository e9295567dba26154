use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use russh::client::{self, Config as ClientConfig, Handler};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg, ssh_key};
use russh::ChannelMsg;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use testsshd::config::Config;
use testsshd::fault::{FailMode, FaultController};
use testsshd::keys::TestKeys;
use testsshd::server::SshServer;

const COPY_SCRIPT: &str = r#": > "$0.started"; cat > "$0""#;

struct AcceptAnyHost;

impl Handler for AcceptAnyHost {
    type Error = anyhow::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }
}

struct Fixture {
    addr: SocketAddr,
    faults: Arc<FaultController>,
    keys: TestKeys,
    task: JoinHandle<Result<()>>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start_server(fail_mode: FailMode, fail_after: i64) -> Fixture {
    let config = Config {
        bind: "127.0.0.1".to_string(),
        port: 0,
        fail_mode,
        fail_after,
        ..Config::default()
    };
    let keys = TestKeys::provision().unwrap();
    let server = SshServer::bind(&config, &keys).await.unwrap();
    let addr = server.local_addr().unwrap();
    let faults = server.faults();
    let task = tokio::spawn(server.serve());
    Fixture {
        addr,
        faults,
        keys,
        task,
    }
}

async fn connect(addr: SocketAddr, key: &PrivateKey) -> Result<client::Handle<AcceptAnyHost>> {
    let config = Arc::new(ClientConfig::default());
    let mut session = client::connect(config, addr, AcceptAnyHost).await?;
    let hash_alg = session.best_supported_rsa_hash().await?.flatten();
    let auth = session
        .authenticate_publickey("tester", PrivateKeyWithHashAlg::new(Arc::new(key.clone()), hash_alg))
        .await?;
    ensure!(auth.success(), "public key rejected");
    Ok(session)
}

async fn connect_default(fixture: &Fixture) -> client::Handle<AcceptAnyHost> {
    let key = &fixture.keys.get("ed25519").unwrap().private_key;
    connect(fixture.addr, key).await.unwrap()
}

/// Run `command`, send `input` and EOF, and collect the exit status until
/// the server closes the channel.
async fn exec(session: &client::Handle<AcceptAnyHost>, command: &str, input: &[u8]) -> Option<u32> {
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();
    // the server may already have closed the channel
    let _ = channel.data(input).await;
    let _ = channel.eof().await;

    let mut exit_status = None;
    let drain = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    timeout(Duration::from_secs(10), drain)
        .await
        .expect("channel was not closed by the server");
    exit_status
}

/// `/bin/sh` linked as `<dir>/fake-scp`, plus an exec line that makes it copy
/// stdin into `<dir>/<name>`.
fn fake_scp_command(dir: &Path, name: &str) -> (String, PathBuf) {
    let link = dir.join("fake-scp");
    if !link.exists() {
        std::os::unix::fs::symlink("/bin/sh", &link).unwrap();
    }
    let out = dir.join(name);
    let command = shell_words::join([
        link.to_string_lossy().as_ref(),
        "-c",
        COPY_SCRIPT,
        out.to_string_lossy().as_ref(),
    ]);
    (command, out)
}

fn started(out: &Path) -> bool {
    PathBuf::from(format!("{}.started", out.display())).exists()
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_scp_forwards_input_and_closes_after_exit() {
    let fixture = start_server(FailMode::None, 0).await;
    let dir = tempfile::tempdir().unwrap();
    let (command, out) = fake_scp_command(dir.path(), "x");

    let session = connect_default(&fixture).await;
    let exit_status = exec(&session, &command, b"hello").await;

    assert_eq!(exit_status, Some(0));
    assert_eq!(std::fs::read(&out).unwrap(), b"hello");
    assert_eq!(fixture.faults.admitted(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_session_mode_fails_connections_after_threshold() {
    let fixture = start_server(FailMode::Session, 1).await;
    let dir = tempfile::tempdir().unwrap();

    let (command, first) = fake_scp_command(dir.path(), "first");
    let session = connect_default(&fixture).await;
    assert_eq!(exec(&session, &command, b"one").await, Some(0));
    assert_eq!(std::fs::read(&first).unwrap(), b"one");

    for name in ["second", "third"] {
        let (command, out) = fake_scp_command(dir.path(), name);
        let session = connect_default(&fixture).await;
        assert_eq!(exec(&session, &command, b"more").await, None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!started(&out));
        assert!(!out.exists());
    }
    assert_eq!(fixture.faults.admitted(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_pipe_mode_never_starts_process_after_threshold() {
    let fixture = start_server(FailMode::Pipe, 2).await;
    let dir = tempfile::tempdir().unwrap();

    for name in ["a", "b"] {
        let (command, out) = fake_scp_command(dir.path(), name);
        let session = connect_default(&fixture).await;
        assert_eq!(exec(&session, &command, name.as_bytes()).await, Some(0));
        assert!(started(&out));
    }

    let (command, out) = fake_scp_command(dir.path(), "c");
    let session = connect_default(&fixture).await;
    assert_eq!(exec(&session, &command, b"c").await, None);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!started(&out));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_pipe_mode_with_zero_threshold_is_disabled() {
    let fixture = start_server(FailMode::Pipe, 0).await;
    let dir = tempfile::tempdir().unwrap();

    for name in ["a", "b", "c"] {
        let (command, out) = fake_scp_command(dir.path(), name);
        let session = connect_default(&fixture).await;
        assert_eq!(exec(&session, &command, b"data").await, Some(0));
        assert_eq!(std::fs::read(&out).unwrap(), b"data");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_start_mode_starts_process_but_sends_nothing() {
    let fixture = start_server(FailMode::Start, 1).await;
    let dir = tempfile::tempdir().unwrap();

    let (command, first) = fake_scp_command(dir.path(), "first");
    let session = connect_default(&fixture).await;
    assert_eq!(exec(&session, &command, b"full stream").await, Some(0));
    assert_eq!(std::fs::read(&first).unwrap(), b"full stream");

    let (command, second) = fake_scp_command(dir.path(), "second");
    let session = connect_default(&fixture).await;
    assert_eq!(exec(&session, &command, b"dropped").await, None);
    assert!(eventually(|| started(&second)).await);
    assert!(eventually(|| second.exists()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(std::fs::read(&second).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_plain_command_exits_zero_in_every_mode() {
    for mode in [FailMode::None, FailMode::Session, FailMode::Pipe, FailMode::Start] {
        let fixture = start_server(mode, 1).await;
        for _ in 0..3 {
            let session = connect_default(&fixture).await;
            assert_eq!(exec(&session, "ls -la /", b"").await, Some(0), "mode {mode}");
        }
        assert_eq!(fixture.faults.admitted(), 3);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_shell_request_exits_zero() {
    let fixture = start_server(FailMode::None, 0).await;
    let session = connect_default(&fixture).await;
    let mut channel = session.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();

    let mut exit_status = None;
    let drain = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    timeout(Duration::from_secs(10), drain).await.unwrap();
    assert_eq!(exit_status, Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_every_test_key_authenticates() {
    let fixture = start_server(FailMode::None, 0).await;
    for entry in fixture.keys.iter() {
        let session = connect(fixture.addr, &entry.private_key).await;
        assert!(session.is_ok(), "key {} rejected: {:?}", entry.label, session.err());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_unauthorized_key_never_reaches_handler() {
    let fixture = start_server(FailMode::None, 0).await;
    let stranger = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();

    for _ in 0..3 {
        assert!(connect(fixture.addr, &stranger).await.is_err());
    }
    assert_eq!(fixture.faults.admitted(), 0);

    let session = connect_default(&fixture).await;
    assert_eq!(exec(&session, "true", b"").await, Some(0));
    assert_eq!(fixture.faults.admitted(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_concurrent_connections_each_get_one_ordinal() {
    let fixture = Arc::new(start_server(FailMode::None, 0).await);

    let clients: Vec<_> = (0..10)
        .map(|_| {
            let fixture = fixture.clone();
            tokio::spawn(async move {
                let session = connect_default(&fixture).await;
                exec(&session, "echo hi", b"").await
            })
        })
        .collect();

    for client in clients {
        assert_eq!(client.await.unwrap(), Some(0));
    }
    assert_eq!(fixture.faults.admitted(), 10);
}
