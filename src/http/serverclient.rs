// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, error};

use crate::http::httputil::HttpRequest;

pub const PROTOCOL_VERSION: &str = "HTTP/1.1";

/// How long a gated file-chunk write may take before the transfer is
/// abandoned.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of one streamed file chunk.
const FILE_CHUNK: usize = 8192;

/// The standard reason phrases, mirroring RFC 7231.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Tries to guess the MIME type of a path from its extension.
///
/// Returns `application/octet-stream` when the type cannot be guessed.
pub fn guess_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => "application/json",
        "pdf" => "application/pdf",
        "tgz" => "application/x-compressed",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "zip" => "application/x-zip-compressed",
        "mid" | "midi" => "audio/mid",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "aif" | "aiff" | "aifc" => "audio/x-aiff",
        "flac" => "audio/x-flac",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "jpeg" | "jpg" | "jfif" => "image/jpeg",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "tiff" | "tif" => "image/tiff",
        "ico" => "image/x-icon",
        "css" => "text/css; charset=utf-8",
        "html" | "htm" | "shtml" => "text/html; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "txt" | "csv" | "py" | "c" | "h" | "bat" => "text/plain; charset=utf-8",
        "tsv" => "text/tab-separated-values; charset=utf-8",
        "xml" | "xsl" => "text/xml; charset=utf-8",
        "avi" => "video/avi",
        "mp4" | "m4v" | "mp4v" => "video/mp4",
        "mpeg" | "mpg" => "video/mpeg",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

/// The current time formatted according to RFC 1123.
pub fn gmtime_str() -> String {
    format_gmtime(SystemTime::now())
}

/// An arbitrary timestamp formatted according to RFC 1123.
pub fn format_gmtime(at: SystemTime) -> String {
    DateTime::<Utc>::from(at)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// An interface for responding to HTTP/1.0 and HTTP/1.1 clients.
///
/// Owns the parsed request and the keep-alive decision for this exchange.
pub struct ServerClient<'a> {
    pub req: HttpRequest,
    pub keep_alive: bool,
    pub ip: IpAddr,
    pub port: u16,
    stream: &'a mut TcpStream,
}

/// An inbound connection is kept alive only when the client speaks
/// HTTP/1.1 or newer and explicitly asked for it.
pub fn initial_keep_alive(req: &HttpRequest) -> bool {
    req.version() >= Some((1, 1)) && req.headers.get("connection") == Some("keep-alive")
}

impl<'a> ServerClient<'a> {
    pub fn new(req: HttpRequest, stream: &'a mut TcpStream, addr: SocketAddr) -> Self {
        let keep_alive = initial_keep_alive(&req);
        Self {
            req,
            keep_alive,
            ip: addr.ip(),
            port: addr.port(),
            stream,
        }
    }

    /// Creates the HTTP head used to respond to the client.
    ///
    /// Always includes `Cache-Control`, `Server`, `Date` and a
    /// `Connection` header matching the current keep-alive decision.
    fn make_head(&self, code: u16, headers: &[(String, String)]) -> Vec<u8> {
        let mut head = format!(
            "{PROTOCOL_VERSION} {code} {}\r\n",
            reason_phrase(code)
        );
        head.push_str("Cache-Control: max-age=86400\r\n");
        head.push_str("Server: ZeroMasterHTTP/1.0\r\n");
        head.push_str(&format!("Date: {}\r\n", gmtime_str()));
        for (key, value) in headers {
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        if self.keep_alive {
            head.push_str("Connection: keep-alive\r\n\r\n");
        } else {
            head.push_str("Connection: close\r\n\r\n");
        }
        head.into_bytes()
    }

    /// Write a bare HTTP head with response code `code` to the client.
    pub async fn write_head(&mut self, code: u16) -> Result<()> {
        self.write_head_with(code, &[]).await
    }

    pub async fn write_head_with(
        &mut self,
        code: u16,
        headers: &[(String, String)],
    ) -> Result<()> {
        let head = self.make_head(code, headers);
        self.stream.write_all(&head).await?;
        Ok(())
    }

    /// Write a response body originating from within the runtime. For
    /// serving files, [`ServerClient::write_file`] should be used
    /// instead.
    pub async fn write_body(&mut self, code: u16, ctype: &str, body: &[u8]) -> Result<()> {
        let headers = vec![
            ("Content-Type".to_string(), ctype.to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ];
        let mut output = self.make_head(code, &headers);
        output.extend_from_slice(body);
        self.stream.write_all(&output).await?;
        debug!("Body sent!");
        Ok(())
    }

    /// Write a generic HTML body of the form
    /// `<!DOCTYPE html><html><body><h1>{code} {reason}<h1></body></html>`.
    pub async fn write_generic_body(&mut self, code: u16) -> Result<()> {
        let body = format!(
            "<!DOCTYPE html><html><body><h1>{code} {}<h1></body></html>",
            reason_phrase(code)
        );
        self.write_body(code, "text/html; charset=utf-8", body.as_bytes())
            .await
    }

    /// Stream an entire file to the client in [`FILE_CHUNK`]-sized
    /// pieces.
    ///
    /// A chunk write that misses its 5-second window forces keep-alive
    /// to false and abandons the transfer, leaving the partial body on
    /// the wire.
    pub async fn write_file(&mut self, path: &Path) -> Result<()> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("failed to open {path:?}"))?;
        let meta = file.metadata().await?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let headers = vec![
            ("Content-Length".to_string(), meta.len().to_string()),
            ("Last-Modified".to_string(), format_gmtime(modified)),
            ("Content-Type".to_string(), guess_type(path).to_string()),
        ];
        let head = self.make_head(200, &headers);
        self.stream.write_all(&head).await?;

        let mut buf = [0u8; FILE_CHUNK];
        loop {
            let amt = file.read(&mut buf).await?;
            if amt == 0 {
                break;
            }
            // if this times out, the sent file will be corrupted
            match timeout(WRITE_TIMEOUT, self.stream.write_all(&buf[..amt])).await {
                Ok(res) => res?,
                Err(_) => {
                    // in that case, give up
                    error!("Connection with `{}` timed out", self.ip);
                    self.keep_alive = false;
                    break;
                },
            }
        }
        Ok(())
    }
}

/// Write a minimal response for requests that never produced a usable
/// [`ServerClient`], e.g. a head that failed version parsing.
pub async fn write_plain_status(
    stream: &mut TcpStream,
    code: u16,
    keep_alive: bool,
) -> Result<()> {
    let body = format!(
        "<!DOCTYPE html><html><body><h1>{code} {}<h1></body></html>",
        reason_phrase(code)
    );
    let connection = if keep_alive { "keep-alive" } else { "close" };
    let head = format!(
        "{PROTOCOL_VERSION} {code} {}\r\nCache-Control: max-age=86400\r\nServer: ZeroMasterHTTP/1.0\r\nDate: {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
        reason_phrase(code),
        gmtime_str(),
        body.len(),
        connection,
        body
    );
    stream.write_all(head.as_bytes()).await?;
    Ok(())
}
