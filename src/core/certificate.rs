// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, io, path::Path};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::RngExt;
use tracing::info;

/// Where the shared certificate lives on disk.
pub const CERT_PATH: &str = "iotscp.cert";

/// Default number of segments in a generated certificate.
pub const DEFAULT_SEGMENTS: usize = 1000;
/// Default length, in bytes, of one certificate segment.
pub const DEFAULT_SEGMENT_LENGTH: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    /// The certificate file is absent, or the requested segment runs off
    /// the end of it.
    #[error("no certificate found for segment {0}")]
    Missing(usize),
    /// The requested segment is all zero bytes and holds no key material.
    #[error("certificate segment {0} is null")]
    Null(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One peer's view of the shared certificate: the uuid it authenticates
/// as, the segment offset it chose, and the raw segment bytes that seed
/// its session keys.
#[derive(Debug, Clone)]
pub struct Certificate {
    uuid: String,
    offset: usize,
    segment: Bytes,
}

impl Certificate {
    /// Load the segment at `offset` from the certificate at the fixed
    /// path, using the default segment length.
    pub fn load(uuid: &str, offset: usize) -> Result<Self, CertificateError> {
        Self::load_from(Path::new(CERT_PATH), DEFAULT_SEGMENT_LENGTH, uuid, offset)
    }

    /// Load the segment at `offset` from an arbitrary certificate file.
    ///
    /// The segment is the byte run `[offset * seg_len, (offset + 1) * seg_len)`.
    pub fn load_from(
        path: &Path,
        seg_len: usize,
        uuid: &str,
        offset: usize,
    ) -> Result<Self, CertificateError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CertificateError::Missing(offset));
            },
            Err(e) => return Err(e.into()),
        };

        let start = offset.saturating_mul(seg_len);
        let end = start.saturating_add(seg_len);
        if end > raw.len() {
            return Err(CertificateError::Missing(offset));
        }

        let segment = Bytes::copy_from_slice(&raw[start..end]);
        if segment.iter().all(|&b| b == 0) {
            return Err(CertificateError::Null(offset));
        }

        Ok(Self {
            uuid: uuid.to_string(),
            offset,
            segment,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The raw segment bytes this certificate view was cut from.
    pub fn key_segment(&self) -> &[u8] {
        &self.segment
    }
}

/// Write a fresh certificate of `segments * seg_len` uniformly random
/// bytes to `path`. Both ends of a deployment must hold the same file.
pub fn generate_certificate(path: &Path, segments: usize, seg_len: usize) -> Result<()> {
    let mut raw = vec![0u8; segments.saturating_mul(seg_len)];
    rand::rng().fill(raw.as_mut_slice());
    fs::write(path, &raw)
        .with_context(|| format!("failed to write certificate to {path:?}"))?;
    info!(
        "Generated certificate: {} segments of {} bytes",
        segments, seg_len
    );
    Ok(())
}
