// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result, bail};
use tokio::net::lookup_host;
use tracing::debug;

/// Ensures that an identifier only contains `[A-Za-z0-9_.-]` plus any
/// characters in `extra`.
///
/// Names and URLs travel inside HTTP heads and filesystem paths, so
/// anything outside this set is rejected up front.
pub fn verify_str(value: &str, field: &str, extra: &[char]) -> Result<()> {
    for c in value.chars() {
        let allowed = c.is_ascii_alphanumeric()
            || c == '_'
            || c == '.'
            || c == '-'
            || extra.contains(&c);
        if !allowed {
            bail!("`{c}` is not allowed in {field}");
        }
    }
    Ok(())
}

/// Get this machine's address on the LAN.
///
/// Resolves `<hostname>.local` first; a loopback result (or a resolver
/// failure) falls back to "connecting" a UDP socket towards a public
/// address and reading the socket's local name. No datagram is sent.
pub async fn get_address() -> Result<IpAddr> {
    if let Some(addr) = resolve_local_hostname().await {
        if !addr.is_loopback() {
            return Ok(addr);
        }
        debug!("hostname resolved to loopback {addr}, probing via UDP");
    }

    let sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .context("failed to bind probe socket")?;
    sock.connect(("8.8.8.8", 0))
        .context("failed to connect probe socket")?;
    let local = sock.local_addr().context("probe socket has no local name")?;
    Ok(local.ip())
}

async fn resolve_local_hostname() -> Option<IpAddr> {
    let name = hostname::get().ok()?.into_string().ok()?;
    // A bare hostname may resolve to a loopback entry in /etc/hosts, so
    // qualify it the mDNS way unless it already carries a domain.
    let name = if name.contains('.') {
        name
    } else {
        format!("{name}.local")
    };
    let mut addrs = lookup_host((name.as_str(), 0)).await.ok()?;
    addrs.next().map(|sa| sa.ip())
}
