// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use tracing::debug;

use crate::{
    core::device::BaseDevice,
    http::{
        WEB_PATH,
        httpserver::{HandlerError, RequestHandler},
        serverclient::ServerClient,
    },
};

/// The one URL an unauthenticated host may POST to.
pub const HELLO_URL: &str = "/iotscp/hello";

/// Converts a request URL to a path under the web root.
///
/// Query and fragment suffixes are stripped, and a final segment without
/// an extension gets `index.html` appended.
pub fn get_os_path(url: &str) -> PathBuf {
    let mut parts: Vec<&str> = url.split('/').collect();
    if let Some(last) = parts.last_mut() {
        if let Some((stripped, _)) = last.split_once('?') {
            *last = stripped;
        } else if let Some((stripped, _)) = last.split_once('#') {
            *last = stripped;
        }
    }
    if parts.last().is_some_and(|last| !last.contains('.')) {
        parts.push("index.html");
    }
    let mut path = PathBuf::from(WEB_PATH);
    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Routes HTTP requests made to the device: files for anyone, control
/// and subscription for authenticated hosts.
pub struct DeviceServer {
    device: Arc<BaseDevice>,
}

impl DeviceServer {
    pub fn new(device: Arc<BaseDevice>) -> Self {
        Self { device }
    }

    /// Serves files to unauthenticated hosts. Everyone is allowed to see
    /// the device's specification pages.
    async fn get(&self, sc: &mut ServerClient<'_>) -> Result<()> {
        let path = get_os_path(&sc.req.url);
        debug!("{}", path.display());
        if !escapes_web_root(&path) && path.exists() {
            sc.write_file(&path).await
        } else {
            debug!("404 Not Found");
            sc.write_generic_body(404).await
        }
    }

    /// Forwards POST requests to the device for processing. Only
    /// authenticated hosts are allowed to control the device.
    async fn post(&self, sc: &mut ServerClient<'_>) -> Result<()> {
        let Some(uuid) = sc.req.headers.get("uuid").map(str::to_string) else {
            return sc.write_head(401).await;
        };
        if sc.req.url == HELLO_URL {
            self.device.create_session(&uuid, sc).await
        } else {
            self.device.handle_request(&uuid, sc).await
        }
    }

    /// Forwards SUBSCRIBE requests to the device for processing. Only
    /// authenticated hosts are allowed to subscribe to the device.
    async fn subscribe(&self, sc: &mut ServerClient<'_>) -> Result<()> {
        let Some(uuid) = sc.req.headers.get("uuid").map(str::to_string) else {
            return sc.write_head(401).await;
        };
        self.device.add_subscriber(&uuid, sc).await
    }
}

impl RequestHandler for DeviceServer {
    async fn handle(&self, sc: &mut ServerClient<'_>) -> Result<(), HandlerError> {
        let verb = sc.req.verb.clone();
        match verb.as_str() {
            "GET" => self.get(sc).await.map_err(HandlerError::Other),
            "POST" => self.post(sc).await.map_err(HandlerError::Other),
            "SUBSCRIBE" => self.subscribe(sc).await.map_err(HandlerError::Other),
            _ => Err(HandlerError::NoHandle(verb)),
        }
    }
}

/// True when `path` escapes the web root, which a crafted URL full of
/// `..` segments could otherwise do.
fn escapes_web_root(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}
