// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// The size of the byte buffers used to read from sockets.
pub const BUFSIZE: usize = 4096;

/// Hard cap on the accumulated HTTP head before the parser gives up.
pub const MAX_HEAD: usize = 65537;

/// All the HTTP header keys whose values must parse as integers.
const NUMBER_TYPES: &[&str] = &["content-length"];

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The peer sent zero bytes. This is how most browsers end
    /// keep-alive sessions.
    #[error("no HTTP head found")]
    NullRequest,
    /// The request line is missing or malformed, which means an HTTP
    /// version this server does not speak.
    #[error("unsupported HTTP version")]
    Version,
    /// A header value failed its expected type, e.g. `Content-Length: 1.5`.
    #[error("type mismatch for `{0}`: expected {1}")]
    HeaderType(String, &'static str),
    /// Catch-all for everything else that can go wrong in an HTTP head.
    #[error("{0}")]
    Http(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed headers: the raw key/value map (keys lowercased) plus the
/// pre-parsed `content-length`, when present.
#[derive(Debug, Default)]
pub struct Headers {
    map: HashMap<String, String>,
    content_length: Option<usize>,
}

impl Headers {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }
}

/// Attempts to parse an unsigned integer header value.
pub fn parse_number(key: &str, value: &str) -> Result<usize, HttpError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| HttpError::HeaderType(key.to_string(), "number"))
}

/// Finds all the headers in the HTTP head, converts them to expected
/// types, and places them in a map with lowercased keys.
pub fn parse_headers(head: &str) -> Result<Headers, HttpError> {
    let mut headers = Headers::default();
    for line in head.split("\r\n").skip(1) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.to_ascii_lowercase();
        let value = value.trim_start().to_string();
        if NUMBER_TYPES.contains(&key.as_str()) {
            let n = parse_number(&key, &value)?;
            if key == "content-length" {
                headers.content_length = Some(n);
            }
        }
        headers.map.insert(key, value);
    }
    Ok(headers)
}

/// Splits the first line of the head into its three fields.
///
/// A line that does not carry three fields must be HTTP/0.9, which this
/// server does not support.
pub fn parse_reqline(head: &str) -> Result<(String, String, String), HttpError> {
    let line = head.split("\r\n").next().unwrap_or("");
    let mut fields = line.splitn(3, ' ');
    match (fields.next(), fields.next(), fields.next()) {
        (Some(a), Some(b), Some(c)) if !a.is_empty() && !b.is_empty() && !c.is_empty() => {
            Ok((a.to_string(), b.to_string(), c.to_string()))
        },
        _ => Err(HttpError::Version),
    }
}

/// Parse an `HTTP/<major>.<minor>` protocol field into a version pair.
pub fn parse_version(proto: &str) -> Option<(u8, u8)> {
    let (_, version) = proto.split_once('/')?;
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Read from `stream` until the CRLF-CRLF separator appears.
///
/// Returns the ASCII-decoded head (trailing CRLF of the last header
/// kept) and whatever bytes of the body arrived with it.
///
/// Fails with [`HttpError::NullRequest`] if the first read returns zero
/// bytes, and with a plain [`HttpError::Http`] once [`MAX_HEAD`] bytes
/// have been read without finding the separator.
pub async fn get_head<R>(stream: &mut R) -> Result<(String, BytesMut), HttpError>
where R: AsyncRead + Unpin {
    let mut buf = [0u8; BUFSIZE];
    let amt = stream.read(&mut buf).await?;
    if amt == 0 {
        return Err(HttpError::NullRequest);
    }

    let mut recvd = BytesMut::from(&buf[..amt]);
    loop {
        if let Some(pos) = find_separator(&recvd) {
            let body = recvd.split_off(pos + 4);
            recvd.truncate(pos + 2);
            let head = decode_http_head(&recvd)?;
            return Ok((head, body));
        }
        if recvd.len() >= MAX_HEAD {
            return Err(HttpError::Http("HTTP head too long".to_string()));
        }
        debug!("Head overflow");
        let amt = stream.read(&mut buf).await?;
        if amt == 0 {
            return Err(HttpError::Http(
                "connection closed before HTTP head".to_string(),
            ));
        }
        recvd.extend_from_slice(&buf[..amt]);
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn decode_http_head(head: &[u8]) -> Result<String, HttpError> {
    if !head.is_ascii() {
        return Err(HttpError::Http(
            "HTTP head contained invalid characters".to_string(),
        ));
    }
    String::from_utf8(head.to_vec())
        .map_err(|_| HttpError::Http("HTTP head contained invalid characters".to_string()))
}

/// The shared parsing platform [`HttpRequest`] and [`HttpResponse`]
/// stand on.
#[derive(Debug)]
pub struct HttpHead {
    pub head: String,
    pub reqline: (String, String, String),
    pub headers: Headers,
    pub body: BytesMut,
}

impl HttpHead {
    pub async fn read_from<R>(stream: &mut R) -> Result<Self, HttpError>
    where R: AsyncRead + Unpin {
        let (head, body) = get_head(stream).await?;
        let reqline = parse_reqline(&head)?;
        let headers = parse_headers(&head)?;
        Ok(Self {
            head,
            reqline,
            headers,
            body,
        })
    }

    /// Read the rest of the body, up to the declared `content-length`.
    pub async fn recv_body<R>(&mut self, stream: &mut R) -> Result<(), HttpError>
    where R: AsyncRead + Unpin {
        let Some(total) = self.headers.content_length() else {
            return Ok(());
        };
        let have = self.body.len();
        if have < total {
            debug!("Recving body...");
            let mut rest = vec![0u8; total - have];
            stream.read_exact(&mut rest).await?;
            self.body.extend_from_slice(&rest);
        }
        Ok(())
    }
}

/// A parsed HTTP request: verb, url, protocol, headers and body.
#[derive(Debug)]
pub struct HttpRequest {
    pub verb: String,
    pub url: String,
    pub proto: String,
    pub headers: Headers,
    pub body: BytesMut,
}

impl HttpRequest {
    pub async fn read_from<R>(stream: &mut R) -> Result<Self, HttpError>
    where R: AsyncRead + Unpin {
        let mut head = HttpHead::read_from(stream).await?;
        if head.reqline.0 == "POST" {
            head.recv_body(stream).await?;
        }
        let (verb, url, proto) = head.reqline;
        Ok(Self {
            verb,
            url,
            proto,
            headers: head.headers,
            body: head.body,
        })
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        parse_version(&self.proto)
    }
}

/// A parsed HTTP response: protocol, status code, reason, headers and
/// body.
#[derive(Debug)]
pub struct HttpResponse {
    pub proto: String,
    pub code: u16,
    pub message: String,
    pub headers: Headers,
    pub body: BytesMut,
}

impl HttpResponse {
    pub async fn read_from<R>(stream: &mut R) -> Result<Self, HttpError>
    where R: AsyncRead + Unpin {
        let mut head = HttpHead::read_from(stream).await?;
        head.recv_body(stream).await?;
        let (proto, code, message) = head.reqline;
        let code = parse_number("Response code", &code)? as u16;
        Ok(Self {
            proto,
            code,
            message,
            headers: head.headers,
            body: head.body,
        })
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        parse_version(&self.proto)
    }
}
