use std::path::PathBuf;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::config::Config;
use crate::fault::FailMode;
use crate::keys::TestKeys;
use crate::server;
use crate::util::logging;

#[derive(Parser, Debug)]
#[command(name = "testsshd")]
#[command(version, about = "Mini SSH server for scp client tests", long_about = None)]
struct Cli {
    /// Config file (default is $HOME/.testsshd.yaml)
    #[arg(long, global = true, env = "TESTSSHD_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SSH server (default)
    Serve,

    /// List the built-in test keys accepted by the server
    Keys {
        /// Print the OpenSSH private key with this label instead
        #[arg(long, value_name = "LABEL")]
        private: Option<String>,
    },

    /// Show version information
    Version,
}

/// Server settings that override the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Port to bind server on
    #[arg(short, long, global = true, env = "TESTSSHD_PORT")]
    pub port: Option<u16>,

    /// Address to bind server on
    #[arg(long, global = true, env = "TESTSSHD_BIND")]
    pub bind: Option<String>,

    /// Stage to inject failures at: "", session, pipe or start
    #[arg(long = "fail-mode", global = true, env = "TESTSSHD_FAIL_MODE")]
    pub fail_mode: Option<FailMode>,

    /// Fail connections whose ordinal is greater than this (0 disables)
    #[arg(
        long = "fail-after",
        global = true,
        env = "TESTSSHD_FAIL_AFTER",
        allow_negative_numbers = true
    )]
    pub fail_after: Option<i64>,

    /// OpenSSH private key used as host key (ephemeral if not set)
    #[arg(long = "host-key", global = true, env = "TESTSSHD_HOST_KEY")]
    pub host_key: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long = "log-level", global = true, env = "TESTSSHD_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ServeArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(mode) = self.fail_mode {
            config.fail_mode = mode;
        }
        if let Some(fail_after) = self.fail_after {
            config.fail_after = fail_after;
        }
        if let Some(host_key) = &self.host_key {
            config.host_key = Some(host_key.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

pub async fn cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let path = Config::resolve_path(cli.config.as_deref())?;
            let mut config = match &path {
                Some(path) => Config::from_file(path)?,
                None => Config::default(),
            };
            cli.serve.apply(&mut config);

            logging::init_logging(&config.log_level);
            if let Some(path) = &path {
                info!("Using config file: {}", path.display());
            }
            server::run(config).await?;
        }

        Commands::Keys { private } => {
            let keys = TestKeys::provision()?;
            match private {
                Some(label) => match keys.get(&label) {
                    Some(entry) => print!("{}", entry.private_openssh()?),
                    None => bail!(
                        "Unknown key label {:?} (available: {})",
                        label,
                        keys.labels().join(", ")
                    ),
                },
                None => {
                    for entry in keys.iter() {
                        println!("{} {}", entry.label, entry.public_openssh()?);
                    }
                }
            }
        }

        Commands::Version => {
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Build: {}", env!("GIT_COMMIT"));
            println!("Rust: {}", env!("RUSTC_VERSION"));
            println!(
                "Platform: {}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FailConfig;

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["testsshd"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.serve.port.is_none());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "testsshd",
            "-p",
            "2300",
            "--fail-mode",
            "start",
            "--fail-after",
            "3",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.serve.apply(&mut config);
        assert_eq!(config.port, 2300);
        assert_eq!(config.fail_config(), FailConfig::new(FailMode::Start, 3));
        assert_eq!(config.bind, "0.0.0.0");
    }

    #[test]
    fn test_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["testsshd", "serve", "--port", "0", "--bind", "127.0.0.1"])
            .unwrap();
        assert!(matches!(cli.command, Some(Commands::Serve)));
        assert_eq!(cli.serve.port, Some(0));
        assert_eq!(cli.serve.bind.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_empty_fail_mode_disables() {
        let cli = Cli::try_parse_from(["testsshd", "--fail-mode", "", "--fail-after", "-1"]).unwrap();
        assert_eq!(cli.serve.fail_mode, Some(FailMode::None));
        assert_eq!(cli.serve.fail_after, Some(-1));
    }

    #[test]
    fn test_unknown_fail_mode_is_rejected() {
        assert!(Cli::try_parse_from(["testsshd", "--fail-mode", "later"]).is_err());
    }

    #[test]
    fn test_keys_private_label() {
        let cli = Cli::try_parse_from(["testsshd", "keys", "--private", "rsa"]).unwrap();
        match cli.command {
            Some(Commands::Keys { private }) => assert_eq!(private.as_deref(), Some("rsa")),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
