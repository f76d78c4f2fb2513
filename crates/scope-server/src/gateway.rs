//! TCP gateway serving a [`PvRegistry`] to network clients.
//!
//! Each client gets its own task. Responses and monitor updates share one
//! writer task per client, so a monitor never interleaves with a response
//! mid-line. Monitors follow the PV's watch channel: a slow client skips
//! intermediate samples instead of queueing them.

use crate::protocol::{Request, Response};
use anyhow::{Context, Result};
use scope_core::registry::PvRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outgoing messages buffered per client.
const CLIENT_QUEUE: usize = 64;

/// Listening gateway.
pub struct Gateway {
    listener: TcpListener,
    registry: Arc<PvRegistry>,
}

impl Gateway {
    /// Listen on `addr`, e.g. `0.0.0.0:5064`.
    pub async fn bind(addr: &str, registry: Arc<PvRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {}", addr))?;
        tracing::info!(
            "PV gateway for {} listening on {}",
            registry.prefix(),
            listener.local_addr()?
        );
        Ok(Self { listener, registry })
    }

    /// Bound address, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the task is dropped or aborted.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, addr, registry).await {
                            tracing::warn!("Client {} error: {:#}", addr, e);
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    registry: Arc<PvRegistry>,
) -> Result<()> {
    tracing::info!("Client connected: {}", addr);
    socket.set_nodelay(true)?;
    let (read_half, mut write_half) = socket.into_split();

    let (tx, mut rx) = mpsc::channel::<Response>(CLIENT_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let line = match response.to_line() {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("cannot encode response: {}", e);
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut monitors: Vec<JoinHandle<()>> = Vec::new();
    let mut lines = BufReader::new(read_half).lines();
    let result = async {
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(line) {
                Ok(request) => {
                    tracing::debug!(client = %addr, ?request, "request");
                    handle_request(request, &registry, &tx, &mut monitors)
                }
                Err(e) => Some(Response::error(format!("Bad request: {}", e))),
            };
            if let Some(response) = response {
                if tx.send(response).await.is_err() {
                    break;
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    for monitor in &monitors {
        monitor.abort();
    }
    drop(tx);
    let _ = writer.await;
    tracing::info!("Client {} disconnected", addr);
    result
}

/// Answer one request. Monitors answer through their own task and return
/// `None` once started.
fn handle_request(
    request: Request,
    registry: &PvRegistry,
    tx: &mpsc::Sender<Response>,
    monitors: &mut Vec<JoinHandle<()>>,
) -> Option<Response> {
    let response = match request {
        Request::List => Response::names(
            registry
                .names()
                .map(|name| registry.full_name(name))
                .collect(),
        ),
        Request::Info { pv } => match registry.resolve(&pv) {
            Ok(found) => Response::meta(&pv, found.meta().clone()),
            Err(e) => Response::error(e.to_string()),
        },
        Request::Get { pv } => match registry.resolve(&pv) {
            Ok(found) => Response::sample(&pv, found.sample()),
            Err(e) => Response::error(e.to_string()),
        },
        Request::Put { pv, value } => match registry.request_put(&pv, value) {
            Ok(()) => Response {
                pv: Some(pv),
                ..Response::ok()
            },
            Err(e) => Response::error(e.to_string()),
        },
        Request::Monitor { pv } => match registry.resolve(&pv) {
            Ok(found) => {
                let mut samples = found.subscribe();
                let tx = tx.clone();
                monitors.push(tokio::spawn(async move {
                    loop {
                        let sample = samples.borrow_and_update().clone();
                        if tx.send(Response::sample(&pv, sample)).await.is_err() {
                            break;
                        }
                        if samples.changed().await.is_err() {
                            break;
                        }
                    }
                }));
                return None;
            }
            Err(e) => Response::error(e.to_string()),
        },
    };
    Some(response)
}
