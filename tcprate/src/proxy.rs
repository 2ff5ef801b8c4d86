use std::{error::Error, fmt, io, net::SocketAddr, sync::Arc, time};

use ahash::RandomState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Args;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error as ThisError;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    signal,
    time::timeout,
};
use tokio_tcprate::{Limiter, LimitedConn, LimitedListener, UNLIMITED};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

use crate::bandwidth;

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(short = 'l', long)]
    listen: SocketAddr,

    /// Address to connect upstream to, e.g. 127.0.0.1:8181
    #[arg(short = 'c', long)]
    upstream: SocketAddr,

    /// Address to listen for API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: SocketAddr,

    /// Bandwidth shared by all proxied connections in bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    limit: usize,

    /// Bandwidth of each proxied connection in bytes per second (0 = unlimited)
    #[arg(long = "limit-conn", value_name = "bytes/s", default_value_t = 0)]
    limit_conn: usize,

    /// Timeout for a proxy connection
    #[arg(long, value_name = "ms", default_value_t = 0)]
    connection_duration_ms: u64,
}

type ConnId = String;

#[derive(Debug, Clone, Serialize)]
struct ConnectionInfo {
    id: ConnId,
    downstream: SocketAddr,
    upstream: SocketAddr,
}

#[derive(Debug)]
struct ConnectionState {
    conn_info: ConnectionInfo,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct ApiState {
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
    limiter: Arc<Limiter>,
}

impl ApiState {
    fn new(limiter: Arc<Limiter>) -> Self {
        Self {
            connections: Arc::new(DashMap::with_hasher(RandomState::new())),
            limiter,
        }
    }

    fn all(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|c| c.conn_info.clone())
            .collect()
    }

    fn limits(&self) -> LimitsBody {
        let limits = self.limiter.limits();
        LimitsBody {
            global: finite(limits.global),
            per_conn: finite(limits.per_conn),
        }
    }

    fn update_limits(&self, req: LimitsReq) -> Result<(), ApiError> {
        let global = req.global.map(|v| v.unwrap_or(UNLIMITED));
        let per_conn = req.per_conn.map(|v| v.unwrap_or(UNLIMITED));

        // Both values are checked before either is applied.
        if global == Some(0) || per_conn == Some(0) {
            return Err(ApiError::BadBandwidth);
        }
        if let Some(global) = global {
            self.limiter
                .set_global_bandwidth(global)
                .map_err(|_| ApiError::BadBandwidth)?;
        }
        if let Some(per_conn) = per_conn {
            self.limiter
                .set_per_conn_bandwidth(per_conn)
                .map_err(|_| ApiError::BadBandwidth)?;
        }
        Ok(())
    }

    fn remove_connection(&self, id: &str) -> Result<ConnectionState, ApiError> {
        self.connections
            .remove(id)
            .ok_or(ApiError::NotFound)
            .map(|c| c.1)
    }

    fn remove_all(&self) -> Vec<ConnectionState> {
        let ids: Vec<ConnId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|(_, state)| state))
            .collect()
    }
}

fn finite(limit: usize) -> Option<usize> {
    (limit != UNLIMITED).then_some(limit)
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("connection not found")]
    NotFound,
    #[error("invalid bandwidth; must be a positive number of bytes per second or null")]
    BadBandwidth,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadBandwidth => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Current limits; `null` means unlimited.
#[derive(Debug, PartialEq, Eq, Serialize)]
struct LimitsBody {
    global: Option<usize>,
    per_conn: Option<usize>,
}

/// A missing field leaves that limit alone; `null` lifts it.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsReq {
    #[serde(default, deserialize_with = "present")]
    pub global: Option<Option<usize>>,
    #[serde(default, deserialize_with = "present")]
    pub per_conn: Option<Option<usize>>,
}

fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownReq {
    pub reason: String,
}

async fn get_limits(State(state): State<ApiState>) -> Json<LimitsBody> {
    Json(state.limits())
}

async fn set_limits(
    State(state): State<ApiState>,
    Json(req): Json<LimitsReq>,
) -> Result<StatusCode, ApiError> {
    state.update_limits(req)?;
    info!(limits = ?state.limits(), "limits updated via API");
    Ok(StatusCode::ACCEPTED)
}

async fn list_connections(State(state): State<ApiState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.all())
}

async fn shutdown_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ShutdownReq>,
) -> Result<StatusCode, ApiError> {
    let conn = state.remove_connection(&id)?;
    info!(%id, reason = %req.reason, "shutting connection down");
    conn.cancel.cancel();

    Ok(StatusCode::ACCEPTED)
}

async fn shutdown_all_connections(
    State(state): State<ApiState>,
    Json(req): Json<ShutdownReq>,
) -> StatusCode {
    let connections = state.remove_all();
    info!(count = connections.len(), reason = %req.reason, "shutting all connections down");
    for conn in connections {
        conn.cancel.cancel();
    }

    StatusCode::ACCEPTED
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/limits", get(get_limits).patch(set_limits))
        .route("/connections", get(list_connections))
        .route("/connections/{id}/shutdown", post(shutdown_connection))
        .route("/connections/_all/shutdown", post(shutdown_all_connections))
        .with_state(state)
}

async fn handle_connection(
    mut downstream: LimitedConn<TcpStream>,
    addr: SocketAddr,
    config: Arc<Config>,
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
) {
    let mut upstream = match TcpStream::connect(config.upstream).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to connect upstream {}", config.upstream);
            return;
        }
    };

    // best effort
    _ = downstream.get_ref().set_nodelay(true);
    _ = upstream.set_nodelay(true);

    info!("connected {addr} → {}", config.upstream);

    let id = nanoid!();
    let cancel = CancellationToken::new();
    downstream.set_cancellation(cancel.clone());

    connections.insert(
        id.clone(),
        ConnectionState {
            conn_info: ConnectionInfo {
                id: id.clone(),
                downstream: addr,
                upstream: config.upstream,
            },
            cancel: cancel.clone(),
        },
    );

    let span = tracing::info_span!("conn", %id, client=%addr, upstream=%config.upstream);
    async move {
        let fut = copy_bidirectional(&mut downstream, &mut upstream);

        let timeout_duration = if config.connection_duration_ms > 0 {
            Some(time::Duration::from_millis(config.connection_duration_ms))
        } else {
            None
        };

        // Cancellation also aborts a copy parked on the upstream side, where no pacing
        // wait would notice it.
        let res: io::Result<(u64, u64)> = tokio::select! {
            res = async {
                match timeout_duration {
                    Some(timeout_duration) => match timeout(timeout_duration, fut).await {
                        Ok(res) => res,
                        Err(_) => Err(io::Error::other(TimeoutError)),
                    },
                    None => fut.await,
                }
            } => res,
            _ = cancel.cancelled() => Err(io::Error::other(tokio_tcprate::Error::Cancelled)),
        };

        // clean up
        connections.remove(&id);

        match res {
            Ok((down, up)) => info!(down, up, "connection closed"),
            Err(err) => error!(error = %err, "proxy error {} -> {}", addr, config.upstream),
        }
    }
    .instrument(span)
    .await
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let limiter = Limiter::with_limits(bandwidth(config.limit), bandwidth(config.limit_conn))?;
    let config = Arc::new(config);

    let api_state = ApiState::new(limiter.clone());
    let connections = api_state.connections.clone();

    let api_addr = config.api;
    let api_listener = TcpListener::bind(api_addr).await?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(api_listener, router(api_state)).await {
            error!(%err, "api server error");
        }
    });

    // Proxy
    let listener = LimitedListener::with_limiter(TcpListener::bind(config.listen).await?, limiter);
    info!(
        listen = %config.listen,
        connect = %config.upstream,
        api = %api_addr,
        limits = ?listener.limiter().limits(),
        "Listening"
    );

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        config.clone(),
                        connections.clone(),
                    ));
                }
                Err(e) => {
                    error!(%e, "accept failed");
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[derive(Debug)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection duration exceeded")
    }
}

impl Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state() -> ApiState {
        ApiState::new(Limiter::new())
    }

    fn insert(state: &ApiState, id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        state.connections.insert(
            id.to_string(),
            ConnectionState {
                conn_info: ConnectionInfo {
                    id: id.to_string(),
                    downstream: addr,
                    upstream: addr,
                },
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    #[test]
    fn limits_report_null_for_unlimited() {
        let state = state();
        assert_eq!(
            state.limits(),
            LimitsBody {
                global: None,
                per_conn: None
            }
        );

        state.limiter.set_limits(4096, UNLIMITED).unwrap();
        assert_eq!(
            serde_json::to_value(state.limits()).unwrap(),
            serde_json::json!({ "global": 4096, "per_conn": null })
        );
    }

    #[test]
    fn limits_request_distinguishes_missing_and_null() {
        let req: LimitsReq = serde_json::from_str(r#"{ "global": null }"#).unwrap();
        assert_eq!(req.global, Some(None));
        assert_eq!(req.per_conn, None);

        let req: LimitsReq = serde_json::from_str(r#"{ "per_conn": 512 }"#).unwrap();
        assert_eq!(req.global, None);
        assert_eq!(req.per_conn, Some(Some(512)));

        assert!(serde_json::from_str::<LimitsReq>(r#"{ "rate": 1 }"#).is_err());
    }

    #[test]
    fn update_limits_applies_only_given_fields() {
        let state = state();
        state.limiter.set_limits(1000, 100).unwrap();

        state
            .update_limits(LimitsReq {
                global: Some(Some(2000)),
                per_conn: None,
            })
            .unwrap();
        assert_eq!(state.limiter.global_limit(), 2000);
        assert_eq!(state.limiter.per_conn_limit(), 100);

        state
            .update_limits(LimitsReq {
                global: None,
                per_conn: Some(None),
            })
            .unwrap();
        assert_eq!(state.limiter.per_conn_limit(), UNLIMITED);
    }

    #[test]
    fn update_limits_rejects_zero_without_applying_anything() {
        let state = state();
        let err = state
            .update_limits(LimitsReq {
                global: Some(Some(1000)),
                per_conn: Some(Some(0)),
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::BadBandwidth));
        assert_eq!(state.limiter.global_limit(), UNLIMITED);
        assert_eq!(
            err.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn timeout_error_names_the_cause() {
        let err = io::Error::other(TimeoutError);
        assert_eq!(err.to_string(), "connection duration exceeded");
    }

    #[test]
    fn remove_connection_unknown_is_not_found() {
        let state = state();
        let err = state.remove_connection("nope").unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_cancels_connections() {
        let state = state();
        let a = insert(&state, "a");
        let b = insert(&state, "b");
        let c = insert(&state, "c");
        assert_eq!(state.all().len(), 3);

        let status = shutdown_connection(
            State(state.clone()),
            Path("a".to_string()),
            Json(ShutdownReq {
                reason: "test".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());

        let status = shutdown_all_connections(
            State(state.clone()),
            Json(ShutdownReq {
                reason: "test".into(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(b.is_cancelled() && c.is_cancelled());
        assert!(state.all().is_empty());
    }

    #[tokio::test]
    async fn proxies_and_stops_on_cancel() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            // Keep the upstream side open until the proxy gives up.
            let _ = s.read(&mut buf).await;
        });

        let state = state();
        let listener = LimitedListener::with_limiter(
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            state.limiter.clone(),
        );
        let listen = listener.local_addr().unwrap();
        let config = Arc::new(Config {
            listen,
            upstream: upstream_addr,
            api: listen,
            limit: 0,
            limit_conn: 0,
            connection_duration_ms: 0,
        });

        let mut client = TcpStream::connect(listen).await.unwrap();
        let (conn, addr) = listener.accept().await.unwrap();
        let handler = tokio::spawn(handle_connection(
            conn,
            addr,
            config,
            state.connections.clone(),
        ));

        client.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");

        let listed = state.all();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].upstream, upstream_addr);

        for conn in state.remove_all() {
            conn.cancel.cancel();
        }
        handler.await.unwrap();
        assert!(state.connections.is_empty());

        // The proxy dropped both sides.
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
