// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use iotscp_rs::http::{
    httputil::{HttpError, HttpRequest, HttpResponse, parse_version},
    serverclient::initial_keep_alive,
};

async fn parse_request(raw: &[u8]) -> Result<HttpRequest, HttpError> {
    let mut stream = raw;
    HttpRequest::read_from(&mut stream).await
}

async fn parse_response(raw: &[u8]) -> Result<HttpResponse, HttpError> {
    let mut stream = raw;
    HttpResponse::read_from(&mut stream).await
}

#[tokio::test]
async fn test_parse_simple_get() -> Result<()> {
    let req = parse_request(b"GET /setup.json HTTP/1.1\r\nHost: 10.0.0.2:8000\r\n\r\n")
        .await?;
    assert_eq!(req.verb, "GET");
    assert_eq!(req.url, "/setup.json");
    assert_eq!(req.proto, "HTTP/1.1");
    assert_eq!(req.headers.get("host"), Some("10.0.0.2:8000"));
    assert!(req.body.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_header_keys_lowercase_and_values_trimmed() -> Result<()> {
    let req =
        parse_request(b"GET / HTTP/1.1\r\nX-Thing:   spaced value\r\nUUID: abc\r\n\r\n")
            .await?;
    assert_eq!(req.headers.get("x-thing"), Some("spaced value"));
    assert_eq!(req.headers.get("uuid"), Some("abc"));
    Ok(())
}

#[tokio::test]
async fn test_post_reads_exactly_content_length() -> Result<()> {
    let req = parse_request(
        b"POST /control/sensor/ HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world",
    )
    .await?;
    assert_eq!(req.headers.content_length(), Some(11));
    assert_eq!(&req.body[..], b"hello world");
    Ok(())
}

#[tokio::test]
async fn test_empty_read_is_null_request() {
    match parse_request(b"").await {
        Err(HttpError::NullRequest) => {},
        other => panic!("expected NullRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn test_short_request_line_is_version_error() {
    match parse_request(b"GET /\r\n\r\n").await {
        Err(HttpError::Version) => {},
        other => panic!("expected Version, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_numeric_content_length_is_header_type_error() {
    match parse_request(b"POST / HTTP/1.1\r\nContent-Length: 1.5\r\n\r\n").await {
        Err(HttpError::HeaderType(key, "number")) => assert_eq!(key, "content-length"),
        other => panic!("expected HeaderType, got {other:?}"),
    }
}

#[tokio::test]
async fn test_head_spread_over_many_reads_is_accepted() -> Result<()> {
    // a head larger than one 4096-byte buffer but under the cap
    let mut raw = b"GET /big HTTP/1.1\r\n".to_vec();
    for i in 0..250 {
        raw.extend_from_slice(format!("X-Pad-{i}: {}\r\n", "y".repeat(20)).as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    assert!(raw.len() > 4096);

    let req = parse_request(&raw).await?;
    assert_eq!(req.url, "/big");
    assert_eq!(req.headers.get("x-pad-249"), Some("y".repeat(20).as_str()));
    Ok(())
}

#[tokio::test]
async fn test_endless_head_is_rejected_at_the_cap() {
    let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
    raw.resize(70_000, b'a');
    match parse_request(&raw).await {
        Err(HttpError::Http(msg)) => assert!(msg.contains("too long")),
        other => panic!("expected HTTPError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_parse_response_with_body() -> Result<()> {
    let res = parse_response(
        b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsha256",
    )
    .await?;
    assert_eq!(res.code, 200);
    assert_eq!(res.message, "OK");
    assert_eq!(&res.body[..], b"sha256");
    assert_eq!(res.version(), Some((1, 1)));
    Ok(())
}

#[tokio::test]
async fn test_non_numeric_status_code_is_header_type_error() {
    match parse_response(b"HTTP/1.1 abc OK\r\n\r\n").await {
        Err(HttpError::HeaderType(key, "number")) => assert_eq!(key, "Response code"),
        other => panic!("expected HeaderType, got {other:?}"),
    }
}

#[test]
fn test_parse_version_pairs() {
    assert_eq!(parse_version("HTTP/1.1"), Some((1, 1)));
    assert_eq!(parse_version("HTTP/1.0"), Some((1, 0)));
    assert_eq!(parse_version("HTTP/2.0"), Some((2, 0)));
    assert_eq!(parse_version("SPEAK"), None);
}

#[tokio::test]
async fn test_keep_alive_requires_v11_and_the_header() -> Result<()> {
    let keep = parse_request(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await?;
    assert!(initial_keep_alive(&keep));

    let old = parse_request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await?;
    assert!(!initial_keep_alive(&old));

    let silent = parse_request(b"GET / HTTP/1.1\r\n\r\n").await?;
    assert!(!initial_keep_alive(&silent));

    let newer = parse_request(b"GET / HTTP/2.0\r\nConnection: keep-alive\r\n\r\n").await?;
    assert!(initial_keep_alive(&newer));
    Ok(())
}
