// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::http::httputil::HttpResponse;

/// Seconds a subscriber connection may sit idle before it is poked.
pub const SUB_TIMEOUT: Duration = Duration::from_secs(180);

/// How often an idle worker wakes from its channel receive.
const RECV_WAKEUP: Duration = Duration::from_secs(15);

/// Window for each gated write/read against a subscriber socket.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of a subscriber worker's event queue.
const QUEUE_DEPTH: usize = 32;

/// A JSON object payload carrying the event fields plus the event name
/// under the key `name`.
pub type EventPayload = serde_json::Map<String, Value>;

/// Keep-alive holds iff the peer answered 200 and did not ask to close.
///
/// A missing `Connection` header only closes for HTTP versions below
/// 1.1; at 1.1 and above the absence means keep alive.
pub fn should_keep_alive(res: &HttpResponse) -> bool {
    if res.code != 200 {
        return false;
    }
    match res.headers.get("connection") {
        None => res.version() >= Some((1, 1)),
        Some(value) => value != "close",
    }
}

/// Create the HTTP NOTIFY message for an event.
pub fn make_notification(addr: &SocketAddr, event: &EventPayload) -> Vec<u8> {
    let name = event.get("name").and_then(Value::as_str).unwrap_or_default();
    let body = Value::Object(event.clone()).to_string();
    format!(
        "NOTIFY / HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         NT: iotscp:event; event-name={}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         \r\n\
         {}",
        addr.ip(),
        addr.port(),
        name,
        body.len(),
        body
    )
    .into_bytes()
}

/// Create the bodiless NOTIFY used to keep a subscriber connection
/// alive by "poking" the host.
pub fn make_poke(addr: &SocketAddr) -> Vec<u8> {
    format!(
        "NOTIFY / HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        addr.ip(),
        addr.port()
    )
    .into_bytes()
}

async fn exchange(
    stream: &mut TcpStream,
    addr: &SocketAddr,
    msg: &[u8],
) -> Result<bool> {
    timeout(IO_TIMEOUT, stream.write_all(msg))
        .await
        .context("Connection timed out")??;
    // give the subscriber 5 seconds to respond
    let res = timeout(IO_TIMEOUT, HttpResponse::read_from(stream))
        .await
        .context("Connection timed out")?
        .with_context(|| format!("{addr}: bad NOTIFY response"))?;
    Ok(should_keep_alive(&res))
}

/// Sends a notification and determines if the connection should be kept
/// alive.
async fn send_event_http(
    stream: &mut TcpStream,
    addr: &SocketAddr,
    event: &EventPayload,
) -> bool {
    debug!("Sending notification");
    match exchange(stream, addr, &make_notification(addr, event)).await {
        Ok(keep_alive) => keep_alive,
        Err(e) => {
            error!("{}:{}->{}", addr.ip(), addr.port(), e);
            false
        },
    }
}

/// Pokes the subscriber to keep the connection alive.
async fn poke(stream: &mut TcpStream, addr: &SocketAddr) -> bool {
    debug!("Sending keep-alive message");
    match exchange(stream, addr, &make_poke(addr)).await {
        Ok(keep_alive) => keep_alive,
        Err(e) => {
            error!("{}:{}->{}", addr.ip(), addr.port(), e);
            false
        },
    }
}

/// Fans events out to subscribed hosts.
///
/// Each host keeps one connection to this device; all notifications the
/// host is subscribed to travel over that single connection, so multiple
/// hosts form a star network with the device in the middle.
pub struct EventDispatcher {
    stop: CancellationToken,
    /// event_url -> subscriber addresses, in subscription order.
    subscribers: DashMap<String, Vec<SocketAddr>>,
    /// subscriber address -> queue feeding its worker.
    workers: DashMap<SocketAddr, mpsc::Sender<EventPayload>>,
}

impl EventDispatcher {
    pub fn new(stop: CancellationToken) -> Self {
        Self {
            stop,
            subscribers: DashMap::new(),
            workers: DashMap::new(),
        }
    }

    /// Register a subscriber address for an event URL. Duplicate
    /// registrations are ignored; no worker is created until the first
    /// event is dispatched.
    pub fn add_subscriber(&self, event_url: &str, addr: SocketAddr) {
        let mut subs = self.subscribers.entry(event_url.to_string()).or_default();
        if !subs.contains(&addr) {
            subs.push(addr);
        }
    }

    pub fn has_subscribers(&self, event_url: &str) -> bool {
        self.subscribers
            .get(event_url)
            .is_some_and(|subs| !subs.is_empty())
    }

    pub fn subscriber_count(&self, event_url: &str) -> usize {
        self.subscribers.get(event_url).map_or(0, |subs| subs.len())
    }

    /// True while a worker owns a live connection to `addr`.
    pub fn has_worker(&self, addr: &SocketAddr) -> bool {
        self.workers.contains_key(addr)
    }

    /// Sends the event to all hosts that are subscribed to `event_url`.
    ///
    /// A subscriber that fails the hand-off is dropped from this event's
    /// list; delivery to the remaining subscribers continues.
    pub async fn send_event(self: &Arc<Self>, event_url: &str, event: EventPayload) {
        let subs = self
            .subscribers
            .get(event_url)
            .map(|s| s.value().clone())
            .unwrap_or_default();

        let mut failed = Vec::new();
        for addr in subs {
            if let Err(e) = self.dispatch_one(addr, &event).await {
                error!("{e}");
                failed.push(addr);
            }
        }

        if !failed.is_empty()
            && let Some(mut subs) = self.subscribers.get_mut(event_url)
        {
            subs.retain(|addr| !failed.contains(addr));
        }
    }

    /// Check for a live worker for this host: hand the event to it, or
    /// open a fresh connection, send the first NOTIFY, and spawn a
    /// worker when the host keeps the connection alive.
    async fn dispatch_one(
        self: &Arc<Self>,
        addr: SocketAddr,
        event: &EventPayload,
    ) -> Result<()> {
        if let Some(tx) = self.workers.get(&addr) {
            match tx.try_send(event.clone()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscriber {addr} queue is full, dropping event");
                    Ok(())
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    bail!("subscriber {addr} worker is gone")
                },
            }
        } else {
            let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
                .await
                .with_context(|| format!("connect to {addr} timed out"))??;
            let keep_alive = send_event_http(&mut stream, &addr, event).await;
            if keep_alive {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                self.workers.insert(addr, tx);
                let dispatcher = Arc::clone(self);
                tokio::spawn(dispatcher.event_loop(rx, addr, stream));
            }
            Ok(())
        }
    }

    /// Per-subscriber worker: drain the queue while the connection stays
    /// open, poking the host whenever the queue has been idle too long.
    async fn event_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<EventPayload>,
        addr: SocketAddr,
        mut stream: TcpStream,
    ) {
        let mut keep_alive = true;
        let mut idle = Instant::now();

        while keep_alive && !self.stop.is_cancelled() {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                first = timeout(RECV_WAKEUP, rx.recv()) => match first {
                    Ok(Some(event)) => {
                        keep_alive = send_event_http(&mut stream, &addr, &event).await;
                        idle = Instant::now();
                        while keep_alive {
                            match rx.try_recv() {
                                Ok(event) => {
                                    keep_alive =
                                        send_event_http(&mut stream, &addr, &event).await;
                                    idle = Instant::now();
                                },
                                Err(_) => break,
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(_) => {},
                },
            }

            if keep_alive && idle.elapsed() >= SUB_TIMEOUT {
                // try to keep the connection alive
                if poke(&mut stream, &addr).await {
                    idle = Instant::now();
                } else {
                    break;
                }
            }
        }

        // unlink before the task ends so nobody enqueues into a dead worker
        debug!("Closing connection");
        self.workers.remove(&addr);
        for mut subs in self.subscribers.iter_mut() {
            subs.retain(|sub| *sub != addr);
        }
    }
}
