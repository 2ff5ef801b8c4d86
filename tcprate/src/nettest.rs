use std::{fmt, net::SocketAddr, time::Duration};

use clap::{Args, ValueEnum};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::{Instant, timeout},
};
use tokio_tcprate::{LimitedConn, LimitedListener, io::ListenerLimitExt};
use tracing::{Instrument, debug, error, info, warn};

use crate::bandwidth;

const KIB: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CLIENT_BUF: usize = 32 * KIB;

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Global bandwidth limit in bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 100 * 256 * KIB)]
    pub limit: usize,

    /// Per-connection bandwidth limit in bytes per second (0 = unlimited)
    #[arg(long = "limit-conn", value_name = "bytes/s", default_value_t = 256 * KIB)]
    pub limit_conn: usize,

    /// Number of concurrent clients
    #[arg(long, default_value_t = 100)]
    pub count: usize,

    /// How long each client transfers, measured from its first byte
    #[arg(long = "time", value_name = "secs", default_value_t = 30.0)]
    pub time_secs: f64,

    /// Accepted relative deviation from the expected byte count
    #[arg(long, value_name = "0..1", default_value_t = 0.05)]
    pub epsilon: f64,

    /// Direction of the transfer, seen from the clients
    #[arg(long, value_enum, default_value_t = Mode::Read)]
    pub mode: Mode,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Clients read, the limited server writes
    Read,
    /// Clients write, the limited server reads
    Write,
}

impl Mode {
    fn control_byte(self) -> u8 {
        match self {
            Mode::Read => b'r',
            Mode::Write => b'w',
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.count == 0 {
            anyhow::bail!("--count must be at least 1");
        }

        if !self.time_secs.is_finite() || self.time_secs < 1.0 {
            anyhow::bail!("--time must be at least 1 second (got {})", self.time_secs);
        }

        if !(0.0..=1.0).contains(&self.epsilon) {
            anyhow::bail!(
                "--epsilon must be between 0.0 and 1.0 (got {})",
                self.epsilon
            );
        }

        if self.expected_rate() == 0 {
            anyhow::bail!(
                "--limit and --limit-conn leave no finite per-client rate to check against"
            );
        }

        Ok(())
    }

    fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.time_secs)
    }

    /// Bytes per second each client should observe.
    fn expected_rate(&self) -> u64 {
        min_non_zero(self.limit_conn, self.limit / self.count) as u64
    }

    /// Inclusive range of bytes a client must transfer to pass.
    fn expected_range(&self) -> (u64, u64) {
        let want = self.time_secs.round() as u64 * self.expected_rate();
        let eps = (want as f64 * self.epsilon).round() as u64;
        (want.saturating_sub(eps), want + eps)
    }
}

/// Smallest of the two values that is not zero, or zero if both are.
fn min_non_zero(a: usize, b: usize) -> usize {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

#[derive(Debug)]
struct Deviation {
    client: usize,
    got: u64,
    range: (u64, u64),
}

/// Every client whose byte count fell outside the expected range.
#[derive(Debug)]
pub struct DeviationError(Vec<Deviation>);

impl fmt::Display for DeviationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "failed with {} errors:", self.0.len())?;
        for d in &self.0 {
            write!(
                f,
                "\n\t* client {}: transferred {} bytes, want {}..={}",
                d.client, d.got, d.range.0, d.range.1
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for DeviationError {}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?.limit_listener();
    listener.set_limits(bandwidth(config.limit), bandwidth(config.limit_conn))?;
    let addr = listener.local_addr()?;

    let range = config.expected_range();
    info!(
        %addr,
        limit = config.limit,
        limit_conn = config.limit_conn,
        count = config.count,
        mode = ?config.mode,
        want_min = range.0,
        want_max = range.1,
        "starting nettest"
    );

    let server = tokio::spawn(serve(listener));

    let (mode, ttl) = (config.mode, config.duration());
    let mut clients = JoinSet::new();
    for client in 0..config.count {
        let span = tracing::info_span!("client", client);
        clients.spawn(
            async move {
                run_client(addr, mode, ttl)
                    .await
                    .map(|got| (client, got))
            }
            .instrument(span),
        );
    }

    let mut deviations = Vec::new();
    let outcome = async {
        while let Some(joined) = clients.join_next().await {
            let (client, got) = joined??;
            info!(client, got, "client finished");
            if got < range.0 || got > range.1 {
                deviations.push(Deviation { client, got, range });
            }
        }
        anyhow::Ok(())
    }
    .await;

    server.abort();
    outcome?;

    if deviations.is_empty() {
        info!(count = config.count, "all clients within range");
        Ok(())
    } else {
        deviations.sort_by_key(|d| d.client);
        Err(DeviationError(deviations).into())
    }
}

async fn serve(listener: LimitedListener<TcpListener>) {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                let span = tracing::info_span!("server", %peer);
                tokio::spawn(serve_conn(conn).instrument(span));
            }
            Err(e) => {
                error!(%e, "accept failed");
            }
        }
    }
}

async fn serve_conn(mut conn: LimitedConn<TcpStream>) {
    let mut control = [0u8; 1];
    if let Err(e) = conn.read_exact(&mut control).await {
        warn!(%e, "failed to read control byte");
        return;
    }

    // Clients hang up once their time is over, so errors here are the normal way out.
    let res = match control[0] {
        b'r' => io::copy(&mut io::repeat(0), &mut conn).await,
        b'w' => io::copy(&mut conn, &mut io::sink()).await,
        other => {
            error!(control = other, "unknown control byte");
            return;
        }
    };
    debug!(?res, "server side finished");
}

/// Connect, announce `mode` and transfer until `ttl` has passed since the first byte.
async fn run_client(addr: SocketAddr, mode: Mode, ttl: Duration) -> anyhow::Result<u64> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
    stream.write_all(&[mode.control_byte()]).await?;

    let mut buf = vec![0u8; CLIENT_BUF];
    let mut first: Option<Instant> = None;
    let mut total = 0u64;

    loop {
        let n = match mode {
            Mode::Read => stream.read(&mut buf).await?,
            Mode::Write => stream.write(&buf).await?,
        };
        if n == 0 {
            break;
        }
        total += n as u64;

        let started = *first.get_or_insert_with(Instant::now);
        if started.elapsed() >= ttl {
            break;
        }
    }

    Ok(total)
}
