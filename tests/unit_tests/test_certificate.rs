// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use anyhow::Result;
use iotscp_rs::core::certificate::{Certificate, CertificateError};
use tempfile::tempdir;

use super::make_cert;

#[test]
fn test_segment_extraction_matches_raw_bytes() -> Result<()> {
    let dir = tempdir()?;
    let path = make_cert(dir.path(), 8, 64)?;
    let raw = fs::read(&path)?;

    for offset in [0usize, 3, 7] {
        let cert = Certificate::load_from(&path, 64, "abc", offset)?;
        assert_eq!(cert.key_segment(), &raw[offset * 64..(offset + 1) * 64]);
        assert_eq!(cert.uuid(), "abc");
        assert_eq!(cert.offset(), offset);
    }
    Ok(())
}

#[test]
fn test_missing_file_is_missing_certificate() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("nope.cert");
    match Certificate::load_from(&path, 64, "abc", 0) {
        Err(CertificateError::Missing(0)) => {},
        other => panic!("expected Missing, got {other:?}"),
    }
}

#[test]
fn test_offset_past_end_is_missing_certificate() -> Result<()> {
    let dir = tempdir()?;
    let path = make_cert(dir.path(), 4, 64)?;
    match Certificate::load_from(&path, 64, "abc", 4) {
        Err(CertificateError::Missing(4)) => Ok(()),
        other => panic!("expected Missing, got {other:?}"),
    }
}

#[test]
fn test_all_zero_segment_is_null_certificate() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("iotscp.cert");
    fs::write(&path, vec![0u8; 4 * 64])?;
    match Certificate::load_from(&path, 64, "abc", 2) {
        Err(CertificateError::Null(2)) => Ok(()),
        other => panic!("expected Null, got {other:?}"),
    }
}

#[test]
fn test_generated_certificate_is_not_null() -> Result<()> {
    let dir = tempdir()?;
    // a 1500-byte random segment coming out all zeros would mean a
    // broken generator, not bad luck
    let path = make_cert(dir.path(), 2, 1500)?;
    assert!(Certificate::load_from(&path, 1500, "abc", 0).is_ok());
    assert!(Certificate::load_from(&path, 1500, "abc", 1).is_ok());
    Ok(())
}
