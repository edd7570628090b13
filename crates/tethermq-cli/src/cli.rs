//! CLI argument parsing

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use tethermq_core::{ClientConfig, QoS};

use crate::error::{CliError, CliResult};

/// Main CLI application structure
#[derive(Parser, Debug)]
#[command(
    name = "tethermq",
    version,
    about = "Drive the tethermq connection manager from the command line",
    long_about = "Connects to an MQTT broker through the tethermq connection manager.\n\
                  Reconnection, backoff and resubscription follow the loaded configuration;\n\
                  deliveries are handed to this process's main loop every frame."
)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML, YAML or JSON); TETHERMQ_* variables override it
    #[arg(long, short = 'c', global = true, env = "TETHERMQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker host, overrides the configuration
    #[arg(long, short = 'H', global = true)]
    pub host: Option<String>,

    /// Broker port, overrides the configuration
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Subscribe to topics and print deliveries until Ctrl-C
    Listen(ListenArgs),

    /// Connect, publish one message and disconnect
    Publish(PublishArgs),

    /// Check whether the broker is reachable without a handshake
    Probe,
}

/// Arguments for `tethermq listen`
#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Topic filter to subscribe to (repeatable; `+` and `#` allowed)
    #[arg(long = "topic", short = 't', required = true)]
    pub topics: Vec<String>,

    /// Exit after this many messages
    #[arg(long, short = 'n')]
    pub count: Option<usize>,

    /// Owner loop period in milliseconds
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Print one JSON object per message
    #[arg(long)]
    pub json: bool,
}

impl ListenArgs {
    /// Owner loop period, at least one millisecond
    pub fn frame(&self) -> Duration {
        Duration::from_millis(self.frame_ms.max(1))
    }
}

/// Arguments for `tethermq publish`
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Topic to publish on
    #[arg(long, short = 't')]
    pub topic: String,

    /// Message payload
    #[arg(long = "message", short = 'm')]
    pub message: String,

    /// QoS level, defaults to the configured one
    #[arg(long, short = 'q', value_enum)]
    pub qos: Option<QosLevel>,

    /// Ask the broker to retain the message
    #[arg(long, short = 'r')]
    pub retain: bool,

    /// Seconds to wait for a connection
    #[arg(long, default_value_t = 10.0)]
    pub wait: f64,
}

impl PublishArgs {
    /// The connect wait as a duration. Zero, negative and non-finite
    /// values are rejected.
    pub fn wait(&self) -> CliResult<Duration> {
        Duration::try_from_secs_f64(self.wait)
            .ok()
            .filter(|wait| !wait.is_zero())
            .ok_or_else(|| {
                CliError::InvalidArguments(format!(
                    "--wait {} is not a positive duration",
                    self.wait
                ))
            })
    }
}

/// MQTT QoS level
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QosLevel {
    /// Fire and forget
    #[value(name = "0")]
    AtMostOnce,
    /// Acknowledged delivery, may duplicate
    #[value(name = "1")]
    AtLeastOnce,
    /// Exactly-once handshake
    #[value(name = "2")]
    ExactlyOnce,
}

impl From<QosLevel> for QoS {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl Cli {
    /// Resolve the client configuration: file (or defaults), then flags.
    ///
    /// The CLI starts the manager itself, so `auto_connect` is always off.
    pub fn client_config(&self) -> CliResult<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };

        if let Some(host) = &self.host {
            config.broker_address.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.auto_connect = false;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_parse_listen() {
        let cli = Cli::try_parse_from([
            "tethermq", "listen", "-t", "a/+", "-t", "b/#", "-n", "3", "--json",
        ])
        .unwrap();

        let Commands::Listen(args) = cli.command else {
            panic!("expected listen");
        };
        assert_eq!(args.topics, vec!["a/+", "b/#"]);
        assert_eq!(args.count, Some(3));
        assert!(args.json);
        assert_eq!(args.frame(), Duration::from_millis(16));
    }

    #[test]
    fn test_listen_requires_topic() {
        assert!(Cli::try_parse_from(["tethermq", "listen"]).is_err());
    }

    #[test]
    fn test_parse_publish_with_globals() {
        let cli = Cli::try_parse_from([
            "tethermq", "publish", "-t", "cmd", "-m", "go", "-q", "2", "--retain", "--host",
            "broker.lan", "-p", "1884", "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.host.as_deref(), Some("broker.lan"));
        let Commands::Publish(args) = &cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.qos.map(QoS::from), Some(QoS::ExactlyOnce));
        assert!(args.retain);
        assert_eq!(args.wait().unwrap(), Duration::from_secs(10));

        let config = cli.client_config().unwrap();
        assert_eq!(config.endpoint(), "broker.lan:1884");
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_rejects_bad_wait() {
        let cli =
            Cli::try_parse_from(["tethermq", "publish", "-t", "x", "-m", "y", "--wait", "0"])
                .unwrap();
        let Commands::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert!(matches!(args.wait(), Err(CliError::InvalidArguments(_))));
    }

    #[test]
    fn test_config_file_then_flags() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "broker_address = \"from-file\"\nport = 2883\nauto_connect = true").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from(["tethermq", "probe", "--config", &path, "--port", "3883"])
            .unwrap();
        let config = cli.client_config().unwrap();

        assert_eq!(config.broker_address, "from-file");
        assert_eq!(config.port, 3883);
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_port_zero_is_config_error() {
        let cli = Cli::try_parse_from(["tethermq", "probe", "--port", "0"]).unwrap();
        assert!(matches!(cli.client_config(), Err(CliError::Config(_))));
    }
}
