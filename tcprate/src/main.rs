use clap::{Parser, Subcommand};
use tokio_tcprate::UNLIMITED;

mod nettest;
mod proxy;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load-test a rate-limited listener with many concurrent clients
    Nettest(nettest::Config),
    /// Proxy TCP connections through a rate-limited listener with a control API
    Proxy(proxy::Config),
}

/// Command-line bandwidth, where `0` means unlimited.
pub(crate) fn bandwidth(bytes_per_sec: usize) -> usize {
    if bytes_per_sec == 0 {
        UNLIMITED
    } else {
        bytes_per_sec
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Command::Nettest(cfg) => {
            cfg.validate()?;
            nettest::run(cfg).await
        }
        Command::Proxy(cfg) => proxy::run(cfg).await,
    }
}
