// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::http::{
    LISTEN_TIMEOUT,
    httputil::{HttpError, HttpRequest},
    serverclient::{ServerClient, write_plain_status},
};

/// A client connection may live this long without a request before the
/// server forces it closed.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The verb has no registered handler.
    #[error("no handle for request type `{0}` found")]
    NoHandle(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Dispatch target for one parsed request. Implementations route on the
/// request verb and return [`HandlerError::NoHandle`] for verbs they do
/// not serve.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        sc: &mut ServerClient<'_>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// A very bare HTTP/1.1 server: an accept loop that hands each
/// connection to a keep-alive request loop against a [`RequestHandler`].
pub struct HttpServer<H: RequestHandler> {
    stop: CancellationToken,
    port: u16,
    handler: Arc<H>,
}

impl<H: RequestHandler> HttpServer<H> {
    pub fn new(stop: CancellationToken, port: u16, handler: Arc<H>) -> Self {
        Self {
            stop,
            port,
            handler,
        }
    }

    fn server_bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(5).context("listen failed")
    }

    /// Bind and spawn the accept loop. Returns the bound address so
    /// callers can discover an ephemeral port.
    pub fn start(self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = self
            .server_bind()
            .with_context(|| format!("failed to bind port {}", self.port))?;
        let bound = listener.local_addr()?;
        info!("Starting HTTP server\n\t{}:{}", bound.ip(), bound.port());

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let stop = self.stop.clone();
                            tokio::spawn(handle_connection(handler, stop, stream, addr));
                        },
                        Err(e) => error!("accept failed: {e}"),
                    },
                }
            }
            info!("HTTP server {}:{} is now offline", bound.ip(), bound.port());
        });

        Ok((bound, task))
    }
}

/// Handles requests from the client until keep-alive ends, the stop
/// signal fires, or [`CLIENT_TIMEOUT`] passes since the connection was
/// last used.
async fn handle_connection<H: RequestHandler>(
    handler: Arc<H>,
    stop: CancellationToken,
    mut stream: TcpStream,
    addr: SocketAddr,
) {
    debug!("Connection opened: {}:{}", addr.ip(), addr.port());
    let mut keep_alive = true;
    let mut last_used = Instant::now();

    while keep_alive && !stop.is_cancelled() && last_used.elapsed() < CLIENT_TIMEOUT {
        // gate the wait on a short readiness window so the stop signal
        // and the idle deadline are both observed promptly
        let readable = tokio::select! {
            _ = stop.cancelled() => break,
            r = timeout(LISTEN_TIMEOUT, stream.readable()) => r,
        };
        match readable {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!("{e}");
                break;
            },
            Ok(Ok(())) => {
                debug!("Reading from client");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    alive = handle_one_request(handler.as_ref(), &mut stream, addr) => {
                        keep_alive = alive;
                    },
                }
                last_used = Instant::now();
            },
        }
    }

    if last_used.elapsed() >= CLIENT_TIMEOUT {
        info!("Forcing connection closed...");
    }
    debug!("Connection closed");
}

/// Handle one request and return whether the connection should be kept
/// alive.
///
/// Writes 500 when a handler fails, 501 when no handler matches the
/// verb, 505 when the client speaks an unsupported HTTP version.
async fn handle_one_request<H: RequestHandler>(
    handler: &H,
    stream: &mut TcpStream,
    addr: SocketAddr,
) -> bool {
    match HttpRequest::read_from(stream).await {
        Ok(req) => {
            let verb = req.verb.clone();
            let mut sc = ServerClient::new(req, stream, addr);
            match handler.handle(&mut sc).await {
                Ok(()) => {
                    debug!("keep_alive = {}", sc.keep_alive);
                    sc.keep_alive
                },
                Err(HandlerError::NoHandle(verb)) => {
                    error!("no handle for request type `{verb}` found");
                    let _ = sc.write_generic_body(501).await;
                    true
                },
                Err(HandlerError::Other(e)) => {
                    error!("Error in handles->{verb}: {e}");
                    let _ = sc.write_generic_body(500).await;
                    true
                },
            }
        },
        Err(HttpError::NullRequest) => {
            // This seems to be how most browsers end keep-alive sessions.
            debug!("Null request error");
            false
        },
        Err(HttpError::Version) => {
            let _ = write_plain_status(stream, 505, false).await;
            false
        },
        Err(e @ HttpError::HeaderType(..)) => {
            error!("{e}");
            let _ = write_plain_status(stream, 500, true).await;
            true
        },
        Err(e) => {
            error!("{e}");
            false
        },
    }
}
