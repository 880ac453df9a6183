// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The device definition the `start` action runs: a motion sensor with a
//! `GetBinaryState` method and a `BinaryState` event. Deployments swap
//! this module out for their own hardware.

use std::sync::Arc;

use anyhow::Result;
use rand::RngExt;
use serde_json::json;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::core::{
    device::{BaseDevice, DeviceDef},
    service::{ArgKind, ArgMap, Service, ServiceArg, ServiceEvent, ServiceMethod},
};

const BINARY_STATE: &str = "binarystate";

fn get_binary_state(device: &BaseDevice, _args: &ArgMap) -> Result<ArgMap> {
    let state = device
        .get_var(BINARY_STATE)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mut out = ArgMap::new();
    out.insert("BinaryState".to_string(), json!(state));
    Ok(out)
}

/// Declares the sensor device: identity fields, the `Sensor` service and
/// its method/event roster.
pub fn device_def() -> Result<DeviceDef> {
    let sensor = Service::new("Sensor")?
        .with_method(
            ServiceMethod::new("GetBinaryState", Arc::new(get_binary_state))
                .with_returns(vec![ServiceArg::new("BinaryState", ArgKind::Bool)])
                .with_doc("Get the `BinaryState` of the motion sensor"),
        )
        .with_event(
            ServiceEvent::new(
                "BinaryState",
                vec![ServiceArg::new("BinaryState", ArgKind::Bool)],
            )
            .with_doc(
                "Get `BinaryState` notifications when the motion sensor detects motion",
            ),
        );

    Ok(DeviceDef {
        name: "PiMotion".to_string(),
        device_type: "Motion_Sensor".to_string(),
        namespace: "NullPiProjects".to_string(),
        mac_address: "01:23:45:AB:CD:EF".to_string(),
        pref_alg: Some("sha256".to_string()),
        services: vec![sensor],
        cert_path: None,
    })
}

/// The deployment's main loop: randomly toggles the sensor state and
/// raises a `BinaryState` event on each flip. Terminates when the stop
/// signal fires.
pub async fn run(device: Arc<BaseDevice>, stop: CancellationToken) {
    let Some(sensor) = device.service_by_name("Sensor") else {
        error!("Sensor service is not registered");
        return;
    };
    let mut state = false;

    while !stop.is_cancelled() {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep(Duration::from_secs(2)) => {},
        }

        let roll: u32 = rand::rng().random_range(0..100);
        if roll < 30 {
            state = !state;
            device.set_var(BINARY_STATE, json!(state));
            let mut payload = ArgMap::new();
            payload.insert("BinaryState".to_string(), json!(state));
            if let Err(e) = sensor.send_event("BinaryState", payload).await {
                warn!("failed to raise BinaryState: {e}");
            }
        }
    }
}
