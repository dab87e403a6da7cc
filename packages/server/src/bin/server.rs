//! WebSocket to console relay server.
//!
//! Listens for one WebSocket peer, sends every console line to it and prints
//! every message it sends. An empty line or EOF ends the relay.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin wsrelay-server
//! cargo run --bin wsrelay-server -- --port 7681 --no-extensions --once
//! ```

use clap::Parser;
use wsrelay_server::{
    domain::ShutdownState,
    error::RelayError,
    ui::{Console, Relay, RelayConfig},
};
use wsrelay_shared::logger::{DEFAULT_LOG_MASK, level_from_mask, setup_logger};

#[derive(Parser, Debug)]
#[command(name = "wsrelay-server")]
#[command(about = "Relay between a WebSocket peer and the console", long_about = None)]
struct Args {
    /// Port number to listen on (0 picks a free port)
    #[arg(short = 'p', long, default_value = "7681")]
    port: u16,

    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Do not advertise any WebSocket extensions
    #[arg(short = 'n', long)]
    no_extensions: bool,

    /// Shut down once the first connection closes
    #[arg(short = 'o', long)]
    once: bool,

    /// Log level bitmask (ERR=1, WARN=2, NOTICE=4, INFO=8, DEBUG=16, USER=1024, ...)
    #[arg(short = 'l', long, default_value_t = DEFAULT_LOG_MASK)]
    log_level: u32,
}

fn run(args: Args) -> Result<ShutdownState, RelayError> {
    let config = RelayConfig {
        host: args.host,
        port: args.port,
        once: args.once,
        extensions: !args.no_extensions,
        ..RelayConfig::default()
    };
    let mut console = Console::new()?;
    Relay::new(config).run(&mut console)
}

fn main() {
    let args = Args::parse();
    setup_logger(&[env!("CARGO_PKG_NAME")], level_from_mask(args.log_level));

    tracing::info!("wsrelay: WebSocket console relay");
    tracing::info!("Type a line and press Enter to send it; an empty line exits");

    let code = match run(args) {
        Ok(state) => {
            tracing::debug!("Relay finished ({})", state);
            state.exit_code()
        }
        Err(e) => {
            tracing::error!("Relay error: {}", e);
            1
        }
    };

    eprintln!("exiting: {}", if code == 0 { "ok" } else { "failed" });
    std::process::exit(code);
}
