// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde_json::{Value, json};

use crate::{
    core::{device::BaseDevice, dispatcher::EventDispatcher},
    utils::verify_str,
};

/// A keyed bag of JSON values, used for method arguments, method returns
/// and event payloads.
pub type ArgMap = serde_json::Map<String, Value>;

/// The function executed when a service method is called.
pub type MethodThunk =
    Arc<dyn Fn(&BaseDevice, &ArgMap) -> Result<ArgMap> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("missing argument: {0}")]
    MissingArg(String),
    #[error("missing return value: {0}")]
    MissingReturn(String),
    #[error("type mismatch at `{name}`: expected {expected}")]
    TypeMismatch { name: String, expected: ArgKind },
    #[error("invalid event argument `{0}`")]
    InvalidEventArg(String),
    #[error("event `{0}` not found")]
    UnknownEvent(String),
    #[error(transparent)]
    Thunk(#[from] anyhow::Error),
}

/// The closed set of value shapes a method argument, method return or
/// event field may take on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl ArgKind {
    /// Runtime shape check of a JSON value against this kind.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Int => value.is_i64() || value.is_u64(),
            ArgKind::Float => value.is_f64(),
            ArgKind::Str => value.is_string(),
            ArgKind::List => value.is_array(),
            ArgKind::Map => value.is_object(),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArgKind::Bool => "bool",
            ArgKind::Int => "int",
            ArgKind::Float => "float",
            ArgKind::Str => "string",
            ArgKind::List => "list",
            ArgKind::Map => "map",
        })
    }
}

/// Declares what a service method accepts or returns, and what a service
/// event sends: a field name paired with its semantic type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceArg {
    pub name: String,
    pub kind: ArgKind,
}

impl ServiceArg {
    pub fn new(name: &str, kind: ArgKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

impl fmt::Display for ServiceArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.kind)
    }
}

/// A service method is something that can be called by network hosts that
/// have authenticated with this device.
#[derive(Clone)]
pub struct ServiceMethod {
    pub name: String,
    pub args: Vec<ServiceArg>,
    pub returns: Vec<ServiceArg>,
    pub doc: String,
    thunk: MethodThunk,
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMethod")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl ServiceMethod {
    pub fn new(name: &str, thunk: MethodThunk) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
            returns: Vec::new(),
            doc: String::new(),
            thunk,
        }
    }

    pub fn with_args(mut self, args: Vec<ServiceArg>) -> Self {
        self.args = args;
        self
    }

    pub fn with_returns(mut self, returns: Vec<ServiceArg>) -> Self {
        self.returns = returns;
        self
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = doc.to_string();
        self
    }

    /// Run the thunk after checking the argument bag against the declared
    /// argument list. Extra arguments are permitted.
    pub fn invoke(
        &self,
        device: &BaseDevice,
        args: &ArgMap,
    ) -> Result<ArgMap, ServiceError> {
        for arg in &self.args {
            let value = args
                .get(&arg.name)
                .ok_or_else(|| ServiceError::MissingArg(arg.name.clone()))?;
            if !arg.kind.matches(value) {
                return Err(ServiceError::TypeMismatch {
                    name: arg.name.clone(),
                    expected: arg.kind,
                });
            }
        }
        let output = (self.thunk)(device, args)?;
        self.verify_output(&output)?;
        Ok(output)
    }

    /// Ensures that the method returned what it declared. Extra returns
    /// are permitted.
    fn verify_output(&self, output: &ArgMap) -> Result<(), ServiceError> {
        for ret in &self.returns {
            let value = output
                .get(&ret.name)
                .ok_or_else(|| ServiceError::MissingReturn(ret.name.clone()))?;
            if !ret.kind.matches(value) {
                return Err(ServiceError::TypeMismatch {
                    name: ret.name.clone(),
                    expected: ret.kind,
                });
            }
        }
        Ok(())
    }

    pub fn description(&self) -> Value {
        json!({
            "name": self.name,
            "args": self.args.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "returns": self.returns.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "doc": self.doc,
        })
    }
}

/// A service event is something that an authenticated host can subscribe
/// to, to receive updates from the device as its state changes.
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub name: String,
    pub sends: Vec<ServiceArg>,
    pub doc: String,
}

impl ServiceEvent {
    pub fn new(name: &str, sends: Vec<ServiceArg>) -> Self {
        Self {
            name: name.to_string(),
            sends,
            doc: String::new(),
        }
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = doc.to_string();
        self
    }

    /// Ensures a payload about to be sent matches the event definition.
    pub fn validate(&self, payload: &ArgMap) -> Result<(), ServiceError> {
        for (key, value) in payload {
            let arg = self
                .sends
                .iter()
                .find(|arg| arg.name == *key)
                .ok_or_else(|| ServiceError::InvalidEventArg(key.clone()))?;
            if !arg.kind.matches(value) {
                return Err(ServiceError::TypeMismatch {
                    name: key.clone(),
                    expected: arg.kind,
                });
            }
        }
        Ok(())
    }

    pub fn description(&self) -> Value {
        json!({
            "name": self.name,
            "sends": self.sends.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "doc": self.doc,
        })
    }
}

/// A bundle of service methods and service events.
///
/// The `control_url` is used to call methods, the `event_url` when
/// subscribing to events. Both default to paths derived from the service
/// name.
pub struct Service {
    pub name: String,
    pub control_url: String,
    pub event_url: String,
    pub spec_url: String,
    pub methods: BTreeMap<String, ServiceMethod>,
    pub events: BTreeMap<String, ServiceEvent>,
    dispatcher: OnceCell<Arc<EventDispatcher>>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("control_url", &self.control_url)
            .field("event_url", &self.event_url)
            .finish_non_exhaustive()
    }
}

impl Service {
    pub fn new(name: &str) -> Result<Self> {
        verify_str(name, "name", &[])?;
        let lower = name.to_lowercase();
        Ok(Self {
            name: name.to_string(),
            control_url: format!("/control/{lower}/"),
            event_url: format!("/event/{lower}/"),
            spec_url: format!("{lower}.json"),
            methods: BTreeMap::new(),
            events: BTreeMap::new(),
            dispatcher: OnceCell::new(),
        })
    }

    pub fn with_control_url(mut self, url: &str) -> Result<Self> {
        verify_str(url, "control_url", &['/'])?;
        self.control_url = url.to_string();
        Ok(self)
    }

    pub fn with_event_url(mut self, url: &str) -> Result<Self> {
        verify_str(url, "event_url", &['/'])?;
        self.event_url = url.to_string();
        Ok(self)
    }

    pub fn with_method(mut self, method: ServiceMethod) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    pub fn with_event(mut self, event: ServiceEvent) -> Self {
        self.events.insert(event.name.clone(), event);
        self
    }

    /// Attach the device's event dispatcher. Called once by the device
    /// when the service is registered.
    pub(crate) fn attach_dispatcher(&self, dispatcher: Arc<EventDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    /// Validate `payload` against the named event and hand it to the
    /// dispatcher. A payload for an event nobody subscribed to is dropped
    /// without validation, matching the subscription check-first order.
    pub async fn send_event(&self, event_name: &str, payload: ArgMap) -> Result<()> {
        let dispatcher = self
            .dispatcher
            .get()
            .context("service is not attached to a device")?;
        if !dispatcher.has_subscribers(&self.event_url) {
            return Ok(());
        }
        let event = self
            .events
            .get(event_name)
            .ok_or_else(|| ServiceError::UnknownEvent(event_name.to_string()))?;
        event.validate(&payload)?;
        let mut payload = payload;
        payload.insert("name".to_string(), json!(event_name));
        dispatcher.send_event(&self.event_url, payload).await;
        Ok(())
    }

    pub fn description(&self) -> Value {
        json!({
            "name": self.name,
            "control_url": self.control_url,
            "event_url": self.event_url,
            "spec_url": self.spec_url,
            "methods": self.methods.values().map(ServiceMethod::description).collect::<Vec<_>>(),
            "events": self.events.values().map(ServiceEvent::description).collect::<Vec<_>>(),
        })
    }
}
