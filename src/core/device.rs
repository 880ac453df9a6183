// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    core::{
        certificate::{CERT_PATH, Certificate, DEFAULT_SEGMENT_LENGTH},
        dispatcher::EventDispatcher,
        service::{ArgMap, Service},
        session::{HashAlg, Session, get_common_algorithm},
    },
    http::serverclient::ServerClient,
    utils::verify_str,
};

/// Everything a deployment declares about its device: identity fields,
/// an optional preferred hash algorithm, and the service bundles the
/// runtime should expose.
pub struct DeviceDef {
    pub name: String,
    pub device_type: String,
    pub namespace: String,
    pub mac_address: String,
    pub pref_alg: Option<String>,
    pub services: Vec<Service>,
    /// Certificate file override; the fixed [`CERT_PATH`] when `None`.
    pub cert_path: Option<PathBuf>,
}

/// What a finished RPC wants written back to the peer.
enum Reply {
    Encrypted(Vec<u8>),
    Status(u16),
}

/// The central hub of the device: it stores what the device is, owns the
/// session table and the event dispatcher, and handles every
/// authenticated request made to the device.
pub struct BaseDevice {
    pub name: String,
    pub device_type: String,
    pub namespace: String,
    pub mac_address: String,
    pub pref_alg: Option<HashAlg>,
    pub spec_url: String,
    pub urn: String,
    services: Vec<Service>,
    control_index: HashMap<String, usize>,
    event_index: HashMap<String, usize>,
    sessions: DashMap<String, Session>,
    dispatcher: Arc<EventDispatcher>,
    cert_path: PathBuf,
    /// Free-form device state shared between method thunks and the
    /// deployment's main loop.
    vars: DashMap<String, Value>,
}

impl BaseDevice {
    pub fn new(stop: CancellationToken, def: DeviceDef) -> Result<Arc<Self>> {
        verify_str(&def.name, "name", &[])?;
        verify_str(&def.device_type, "device_type", &[])?;
        verify_str(&def.namespace, "namespace", &[])?;

        let pref_alg = def
            .pref_alg
            .as_deref()
            .map(HashAlg::from_name)
            .transpose()
            .context("unsupported preferred algorithm")?;

        let urn = format!(
            "urn:{}:device:{}:1",
            def.namespace,
            def.device_type.to_lowercase()
        );

        let dispatcher = Arc::new(EventDispatcher::new(stop));
        let mut control_index = HashMap::new();
        let mut event_index = HashMap::new();
        for (i, svc) in def.services.iter().enumerate() {
            svc.attach_dispatcher(Arc::clone(&dispatcher));
            control_index.insert(svc.control_url.clone(), i);
            event_index.insert(svc.event_url.clone(), i);
        }

        Ok(Arc::new(Self {
            name: def.name,
            device_type: def.device_type,
            namespace: def.namespace,
            mac_address: def.mac_address,
            pref_alg,
            spec_url: "setup.json".to_string(),
            urn,
            services: def.services,
            control_index,
            event_index,
            sessions: DashMap::new(),
            dispatcher,
            cert_path: def.cert_path.unwrap_or_else(|| PathBuf::from(CERT_PATH)),
            vars: DashMap::new(),
        }))
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Returns the first service with the given name.
    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|svc| svc.name == name)
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        self.vars.get(key).map(|v| v.value().clone())
    }

    pub fn set_var(&self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn has_session(&self, uuid: &str) -> bool {
        self.sessions.contains_key(uuid)
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Returns a map of device-defining data.
    pub fn description(&self) -> Value {
        json!({
            "name": self.name,
            "device_type": self.device_type,
            "urn": self.urn,
            "mac_address": self.mac_address,
            "services": self
                .services
                .iter()
                .map(|svc| {
                    (
                        svc.name.clone(),
                        json!({
                            "spec_url": svc.spec_url,
                            "control_url": svc.control_url,
                            "event_url": svc.event_url,
                        }),
                    )
                })
                .collect::<serde_json::Map<_, _>>(),
        })
    }

    /// Handles one `POST /iotscp/hello` from an unauthenticated host and
    /// attempts to begin an authenticated session with it.
    ///
    /// Writes 401 with a `{"missing": ...}` body when arguments or key
    /// material are absent, 500 on anything else.
    pub async fn create_session(
        &self,
        uuid: &str,
        sc: &mut ServerClient<'_>,
    ) -> Result<()> {
        match self.negotiate_session(uuid, &sc.req.body) {
            Ok((cert, algorithm)) => {
                sc.write_body(
                    200,
                    "text/plain; charset=utf-8",
                    algorithm.name().as_bytes(),
                )
                .await?;
                // the fresh key is derived only after the reply is on the
                // wire, so both hosts clamp the same time slice
                self.sessions
                    .insert(uuid.to_string(), Session::new(cert, algorithm));
                Ok(())
            },
            Err(SessionSetupError::MissingField(field)) => {
                let body = json!({ "missing": field }).to_string();
                sc.write_body(401, "application/json", body.as_bytes()).await
            },
            Err(SessionSetupError::Certificate) => {
                let body = json!({ "missing": "certificate" }).to_string();
                sc.write_body(401, "application/json", body.as_bytes()).await
            },
            Err(SessionSetupError::Other(e)) => {
                error!("{e}");
                sc.write_head(500).await
            },
        }
    }

    /// The validating half of hello: parse the body, load the
    /// certificate segment, and negotiate the hash algorithm.
    fn negotiate_session(
        &self,
        uuid: &str,
        body: &[u8],
    ) -> Result<(Certificate, HashAlg), SessionSetupError> {
        let args: HelloArgs = serde_json::from_slice(body)
            .map_err(|e| SessionSetupError::Other(e.into()))?;
        let offset = args
            .offset
            .ok_or_else(|| SessionSetupError::MissingField("offset".to_string()))?
            as usize;
        let algorithms = args
            .algorithms
            .ok_or_else(|| SessionSetupError::MissingField("algorithms".to_string()))?;

        let cert =
            Certificate::load_from(&self.cert_path, DEFAULT_SEGMENT_LENGTH, uuid, offset)
                .map_err(|_| SessionSetupError::Certificate)?;

        let algorithm = get_common_algorithm(&algorithms, self.pref_alg)
            .map_err(|e| SessionSetupError::Other(e.into()))?;
        Ok((cert, algorithm))
    }

    /// Handles one authenticated RPC and attempts to run the requested
    /// service method.
    ///
    /// Writes 401 when decryption fails, 501 when the service method is
    /// not found, 500 when an unknown error occurs.
    pub async fn handle_request(
        &self,
        uuid: &str,
        sc: &mut ServerClient<'_>,
    ) -> Result<()> {
        match self.run_rpc(uuid, &sc.req.url, &sc.req.body) {
            Reply::Encrypted(payload) => {
                sc.write_body(200, "application/octet-stream", &payload).await
            },
            Reply::Status(code) => sc.write_head(code).await,
        }
    }

    /// Decrypt, dispatch, ratchet and re-encrypt, entirely off the
    /// socket. The session table guard never crosses an await point.
    fn run_rpc(&self, uuid: &str, url: &str, body: &[u8]) -> Reply {
        let Some(mut session) = self.sessions.get_mut(uuid) else {
            return Reply::Status(401);
        };

        let plain = match session.decrypt(body) {
            Ok(plain) => plain,
            Err(_) => return Reply::Status(401),
        };
        let (method_name, args): (String, ArgMap) =
            match serde_json::from_str(&plain) {
                Ok(parsed) => parsed,
                Err(_) => return Reply::Status(401),
            };

        let Some(service) = self
            .control_index
            .get(url)
            .and_then(|&i| self.services.get(i))
        else {
            return Reply::Status(501);
        };
        let Some(method) = service.methods.get(&method_name) else {
            return Reply::Status(501);
        };

        let output = match method.invoke(self, &args) {
            Ok(output) => output,
            Err(e) => {
                error!("{e}");
                return Reply::Status(500);
            },
        };

        session.update_key();
        let reply = session.encrypt(Value::Object(output).to_string().as_bytes());
        Reply::Encrypted(reply)
    }

    /// Handles one authenticated SUBSCRIBE and attempts to add the host
    /// as a subscriber to the event URL.
    ///
    /// Writes 401 when decryption fails, 501 when the event URL is not
    /// found, 500 when an unknown error occurs.
    pub async fn add_subscriber(
        &self,
        uuid: &str,
        sc: &mut ServerClient<'_>,
    ) -> Result<()> {
        let event_url = sc.req.url.clone();
        debug!("{event_url}");
        if !self.sessions.contains_key(uuid) {
            return sc.write_head(401).await;
        }
        if !self.event_index.contains_key(&event_url) {
            return sc.write_head(501).await;
        }

        let code = self.register_subscriber(uuid, &event_url, &sc.req.body, sc.ip);
        sc.write_head(code).await
    }

    fn register_subscriber(
        &self,
        uuid: &str,
        event_url: &str,
        body: &[u8],
        ip: std::net::IpAddr,
    ) -> u16 {
        let Some(mut session) = self.sessions.get_mut(uuid) else {
            return 401;
        };
        let plain = match session.decrypt(body) {
            Ok(plain) => plain,
            Err(_) => return 401,
        };
        let args: Value = match serde_json::from_str(&plain) {
            Ok(args) => args,
            Err(_) => return 401,
        };
        let Some(port) = args.get("port").and_then(Value::as_u64) else {
            error!("subscription request carried no usable port");
            return 500;
        };

        self.dispatcher
            .add_subscriber(event_url, (ip, port as u16).into());
        session.update_key();
        200
    }
}

/// The body a controller POSTs to `/iotscp/hello`. Fields are optional
/// so an absent one can be named in the 401 reply.
#[derive(Debug, Deserialize)]
struct HelloArgs {
    offset: Option<u64>,
    algorithms: Option<Vec<String>>,
}

/// Why hello could not produce a session.
enum SessionSetupError {
    MissingField(String),
    Certificate,
    Other(anyhow::Error),
}
