// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    http::{
        httputil::{parse_headers, parse_reqline},
        serverclient::gmtime_str,
    },
    utils::get_address,
};

pub const MCAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MCAST_PORT: u16 = 1900;

// Example of an IOTSCP discovery HTTP head:
//
//   IOT-SEARCH * HTTP/1.1
//   Host: 239.255.255.250:1900
//   Return: device; type=basedevice
//   SV: iotscp:discover
//
// The Return header is bare bones right now. In the future it should be
// a query operator, e.g. "supports; method=setbinarystate" to find
// devices that implement `setbinarystate`.

/// Determines, from the request head, whether the responder should
/// answer this datagram.
pub fn should_respond(head: &str) -> bool {
    let Ok((verb, _, _)) = parse_reqline(head) else {
        return false;
    };
    if verb != "IOT-SEARCH" {
        return false;
    }
    let Ok(headers) = parse_headers(head) else {
        return false;
    };
    headers.get("host") == Some("239.255.255.250:1900")
        && headers.get("sv") == Some("iotscp:discover")
        && headers.get("return") == Some("device; type=basedevice")
}

/// Listens for discovery requests on the multicast group and answers
/// valid ones with the location of this device's setup file.
pub struct UdpServer {
    stop: CancellationToken,
    server_port: u16,
    interface: Ipv4Addr,
}

impl UdpServer {
    pub fn new(stop: CancellationToken, server_port: u16) -> Self {
        Self {
            stop,
            server_port,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Join this UDP socket to the multicast group for listening.
    fn bind(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create UDP socket")?;
        socket.set_reuse_address(true)?;
        let addr = SocketAddr::from((self.interface, MCAST_PORT));
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind {addr}"))?;
        socket
            .join_multicast_v4(&MCAST_ADDR, &Ipv4Addr::UNSPECIFIED)
            .context("failed to join multicast group")?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into()).context("failed to wrap UDP socket")
    }

    /// Bind, then answer search requests until the stop signal fires.
    pub async fn start(self) -> Result<JoinHandle<()>> {
        let sock = self.bind()?;
        let local_ip = get_address().await.context("failed to find LAN address")?;
        let template = response_template(&local_ip.to_string(), self.server_port);
        info!("Starting UDP server");

        Ok(tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let received = tokio::select! {
                    _ = self.stop.cancelled() => break,
                    r = sock.recv_from(&mut buf) => r,
                };
                let (amt, addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("{e}");
                        continue;
                    },
                };
                let Ok(head) = std::str::from_utf8(&buf[..amt]) else {
                    continue;
                };
                if should_respond(head) {
                    let reply = template.replace("{date}", &gmtime_str());
                    if let Err(e) = sock.send_to(reply.as_bytes(), addr).await {
                        error!("{e}");
                    }
                }
            }
            info!("UDP server offline");
        }))
    }
}

/// The fixed 200 OK search reply, with a `{date}` slot stamped per
/// datagram.
pub fn response_template(location_host: &str, server_port: u16) -> String {
    [
        "HTTP/1.1 200 OK".to_string(),
        "Date: {date}".to_string(),
        format!("Location: http://{location_host}:{server_port}/setup.json"),
        "Server: ZeroMasterUDP/1.0, IOTSCP/1.0".to_string(),
        String::new(),
        String::new(),
    ]
    .join("\r\n")
}
