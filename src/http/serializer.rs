// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::{core::device::BaseDevice, http::WEB_PATH};

/// Cache of MD5 hashes for descriptions that were already written out.
pub const SERIALIZER_CACHE: &str = "serializercache.json";

fn cache_path() -> PathBuf {
    Path::new(WEB_PATH).join(SERIALIZER_CACHE)
}

fn description_hash(description: &Value) -> String {
    let mut hasher = Md5::new();
    hasher.update(description.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

async fn load_hashes() -> Vec<String> {
    match fs::read_to_string(cache_path()).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

async fn write_hashes(hashes: &[String]) -> Result<()> {
    let raw = serde_json::to_string(hashes)?;
    write_web_file(Path::new(SERIALIZER_CACHE), raw.as_bytes()).await
}

/// Write `content` to `path` joined under the web root, creating parent
/// directories as needed.
async fn write_web_file(path: &Path, content: &[u8]) -> Result<()> {
    let path = Path::new(WEB_PATH).join(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context("failed to create directory for the file")?;
    }
    let mut file = fs::File::create(&path)
        .await
        .with_context(|| format!("failed to create {path:?}"))?;
    file.write_all(content)
        .await
        .with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

/// Serializes the device and its services into their `.json`
/// representations under the web root.
///
/// Each description's MD5 hash is compared against the cache from the
/// previous run, so descriptions that did not change are not rewritten.
pub async fn serialize(device: &BaseDevice) -> Result<()> {
    let old_hashes = load_hashes().await;
    let mut new_hashes = Vec::new();

    for service in device.services() {
        let description = service.description();
        let hash = description_hash(&description);
        let fresh = !old_hashes.contains(&hash);
        new_hashes.push(hash);
        if !fresh {
            debug!("Skipping {} serialization", service.name);
            continue;
        }
        write_web_file(
            Path::new(&service.spec_url),
            description.to_string().as_bytes(),
        )
        .await?;
    }

    let description = device.description();
    let hash = description_hash(&description);
    if old_hashes.contains(&hash) {
        debug!("Skipping device serialization");
    } else {
        write_web_file(
            Path::new(&device.spec_url),
            description.to_string().as_bytes(),
        )
        .await?;
    }
    new_hashes.push(hash);

    write_hashes(&new_hashes).await
}
