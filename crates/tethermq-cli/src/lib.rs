//! # tethermq CLI
//!
//! Command-line driver for the tethermq connection manager. The process's
//! main task is the owner context: it ticks at a fixed frame rate and drains
//! the manager's dispatch queue, so every handler and observer runs there.
//!
//! ## Usage
//!
//! ```bash
//! # Print everything under sensors/ until Ctrl-C
//! tethermq listen -t 'sensors/#' --host broker.local
//!
//! # One-shot publish with QoS 1
//! tethermq publish -t robot/cmd -m home -q 1
//!
//! # Reachability only, no handshake
//! tethermq probe --config tethermq.toml
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod cli;
pub mod commands;
pub mod error;

pub use cli::{Cli, Commands};
pub use error::{CliError, CliResult};

use tracing_subscriber::EnvFilter;

/// Install the `fmt` subscriber on stderr. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn,tethermq_cli=info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Ignored: a subscriber may already be installed
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 0)
        .try_init();
}

/// Run the parsed command
pub async fn run(cli: Cli) -> CliResult<()> {
    let config = cli.client_config()?;
    match cli.command {
        Commands::Listen(args) => commands::listen(config, args).await,
        Commands::Publish(args) => commands::publish(config, args).await,
        Commands::Probe => commands::probe(&config).await,
    }
}
