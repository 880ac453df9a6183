//! The HTTP surfaces of the runtime: the TCP request engine, the device
//! server on top of it, the description serializer and the multicast
//! discovery responder.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

/// Verb routing for the device's HTTP surface.
pub mod deviceserver;
/// Accept loop and per-connection keep-alive lifecycle.
pub mod httpserver;
/// Head parsing and request/response framing.
pub mod httputil;
/// Device and service description files.
pub mod serializer;
/// Response writing for one connected client.
pub mod serverclient;
/// Multicast discovery responder.
pub mod udpserver;

/// How long each readiness wait may run before the stop signal is
/// polled again. Shared by the accept loop, the per-connection read
/// loop and the UDP listener.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Directory the static specification pages are served from.
pub const WEB_PATH: &str = "web";
