//! The device side of the protocol: key material, sessions, services,
//! the request hub and the event dispatcher.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Shared certificate loading and generation.
pub mod certificate;
/// The central device hub: registry, session table, request handling.
pub mod device;
/// Event fan-out to subscribed hosts.
pub mod dispatcher;
/// Service, method and event definitions.
pub mod service;
/// Per-peer symmetric cipher with time-sliced key rotation.
pub mod session;
