// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::SocketAddr;

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::{
    core::{
        certificate::Certificate,
        service::ArgMap,
        session::{ALGORITHMS, HashAlg, Session},
    },
    http::{deviceserver::HELLO_URL, httputil::HttpResponse},
};

/// A controller's authenticated link to one remote device.
///
/// Performs the hello handshake on construction and keeps the resulting
/// session in lock-step with the device across calls and subscriptions.
pub struct ControllerLink {
    addr: SocketAddr,
    cert: Certificate,
    session: Session,
}

impl ControllerLink {
    /// Start an authenticated session with the device at `addr`.
    ///
    /// Fails when the device rejects the hello, or answers with a hash
    /// algorithm this build does not carry (only a man in the middle
    /// should cause the latter, so beware).
    pub async fn connect(addr: SocketAddr, cert: Certificate) -> Result<Self> {
        let algorithms: Vec<&str> = ALGORITHMS.iter().map(|alg| alg.name()).collect();
        let data = json!({
            "offset": cert.offset(),
            "algorithms": algorithms,
        })
        .to_string();
        let req = format!(
            "POST {HELLO_URL} HTTP/1.1\r\n\
             uuid: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            cert.uuid(),
            data.len(),
            data
        );

        let res = send(addr, req.as_bytes()).await?;
        if res.code != 200 {
            bail!("device responded with {}", res.code);
        }
        let name = std::str::from_utf8(&res.body)?;
        let algorithm = HashAlg::from_name(name)?;
        let session = Session::new(cert.clone(), algorithm);
        Ok(Self {
            addr,
            cert,
            session,
        })
    }

    /// Executes the service method found at `control_url`/`method_name`
    /// on the device and returns the decrypted result.
    pub async fn call(
        &mut self,
        control_url: &str,
        method_name: &str,
        args: Option<ArgMap>,
    ) -> Result<Value> {
        let plain = json!([method_name, args.unwrap_or_default()]).to_string();
        let data = self.session.encrypt(plain.as_bytes());
        let req = request_with_body("POST", control_url, self.cert.uuid(), &data);

        let res = send(self.addr, &req).await?;
        if res.code != 200 {
            bail!("device responded with {}", res.code);
        }
        self.session.update_key();
        let body = self.session.decrypt(&res.body)?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Subscribes to `event_url`, asking the device to send event
    /// notifications to this host on `port`.
    pub async fn subscribe(&mut self, event_url: &str, port: u16) -> Result<()> {
        let plain = json!({ "port": port }).to_string();
        let data = self.session.encrypt(plain.as_bytes());
        let req = request_with_body("SUBSCRIBE", event_url, self.cert.uuid(), &data);

        let res = send(self.addr, &req).await?;
        if res.code != 200 {
            bail!("device responded with {}", res.code);
        }
        self.session.update_key();
        Ok(())
    }

    pub fn hashtype(&self) -> HashAlg {
        self.session.hashtype()
    }
}

fn request_with_body(verb: &str, url: &str, uuid: &str, body: &[u8]) -> Vec<u8> {
    let mut req = format!(
        "{verb} {url} HTTP/1.1\r\n\
         uuid: {uuid}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(body);
    req
}

async fn send(addr: SocketAddr, msg: &[u8]) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(msg).await?;
    Ok(HttpResponse::read_from(&mut stream).await?)
}
