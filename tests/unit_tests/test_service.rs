// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use iotscp_rs::core::{
    device::{BaseDevice, DeviceDef},
    service::{
        ArgKind, ArgMap, Service, ServiceArg, ServiceError, ServiceEvent, ServiceMethod,
    },
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn empty_device() -> Arc<BaseDevice> {
    BaseDevice::new(
        CancellationToken::new(),
        DeviceDef {
            name: "Bench".to_string(),
            device_type: "Test_Rig".to_string(),
            namespace: "Lab".to_string(),
            mac_address: "00:00:00:00:00:01".to_string(),
            pref_alg: None,
            services: Vec::new(),
            cert_path: None,
        },
    )
    .expect("device")
}

fn echo_method() -> ServiceMethod {
    ServiceMethod::new(
        "Echo",
        Arc::new(|_device: &BaseDevice, args: &ArgMap| {
            let mut out = ArgMap::new();
            out.insert("Echoed".to_string(), args["Value"].clone());
            Ok(out)
        }),
    )
    .with_args(vec![ServiceArg::new("Value", ArgKind::Str)])
    .with_returns(vec![ServiceArg::new("Echoed", ArgKind::Str)])
}

#[test]
fn test_arg_kind_shape_checks() {
    assert!(ArgKind::Bool.matches(&json!(true)));
    assert!(ArgKind::Int.matches(&json!(3)));
    assert!(ArgKind::Int.matches(&json!(-3)));
    assert!(ArgKind::Float.matches(&json!(1.5)));
    assert!(ArgKind::Str.matches(&json!("hi")));
    assert!(ArgKind::List.matches(&json!([1, 2])));
    assert!(ArgKind::Map.matches(&json!({"k": 1})));

    assert!(!ArgKind::Bool.matches(&json!(1)));
    assert!(!ArgKind::Int.matches(&json!(1.5)));
    assert!(!ArgKind::Float.matches(&json!(1)));
    assert!(!ArgKind::Str.matches(&json!(null)));
    assert!(!ArgKind::Map.matches(&json!([])));
}

#[test]
fn test_service_urls_derive_from_the_name() -> Result<()> {
    let svc = Service::new("Sensor")?;
    assert_eq!(svc.control_url, "/control/sensor/");
    assert_eq!(svc.event_url, "/event/sensor/");
    assert_eq!(svc.spec_url, "sensor.json");
    Ok(())
}

#[test]
fn test_service_names_and_urls_are_validated() {
    assert!(Service::new("no spaces").is_err());
    let svc = Service::new("Sensor").expect("service");
    assert!(svc.with_control_url("/control/with space/").is_err());
}

#[test]
fn test_method_invoke_checks_the_declared_args() {
    let device = empty_device();
    let method = echo_method();

    let mut args = ArgMap::new();
    args.insert("Value".to_string(), json!("ping"));
    let out = method.invoke(&device, &args).expect("invoke");
    assert_eq!(out["Echoed"], json!("ping"));

    // a declared argument that is absent
    match method.invoke(&device, &ArgMap::new()) {
        Err(ServiceError::MissingArg(name)) => assert_eq!(name, "Value"),
        other => panic!("expected MissingArg, got {other:?}"),
    }

    // a declared argument whose value has the wrong shape
    let mut args = ArgMap::new();
    args.insert("Value".to_string(), json!(7));
    match method.invoke(&device, &args) {
        Err(ServiceError::TypeMismatch { name, .. }) => assert_eq!(name, "Value"),
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_method_invoke_allows_extra_args() {
    let device = empty_device();
    let method = echo_method();
    let mut args = ArgMap::new();
    args.insert("Value".to_string(), json!("ping"));
    args.insert("Unrelated".to_string(), json!(42));
    assert!(method.invoke(&device, &args).is_ok());
}

#[test]
fn test_method_output_is_verified() {
    let device = empty_device();
    let lying = ServiceMethod::new(
        "Lies",
        Arc::new(|_device: &BaseDevice, _args: &ArgMap| Ok(ArgMap::new())),
    )
    .with_returns(vec![ServiceArg::new("Promised", ArgKind::Bool)]);

    match lying.invoke(&device, &ArgMap::new()) {
        Err(ServiceError::MissingReturn(name)) => assert_eq!(name, "Promised"),
        other => panic!("expected MissingReturn, got {other:?}"),
    }

    let mistyped = ServiceMethod::new(
        "Mistyped",
        Arc::new(|_device: &BaseDevice, _args: &ArgMap| {
            let mut out = ArgMap::new();
            out.insert("Promised".to_string(), json!("yes"));
            Ok(out)
        }),
    )
    .with_returns(vec![ServiceArg::new("Promised", ArgKind::Bool)]);

    match mistyped.invoke(&device, &ArgMap::new()) {
        Err(ServiceError::TypeMismatch { name, .. }) => assert_eq!(name, "Promised"),
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_event_payloads_are_validated() {
    let event = ServiceEvent::new(
        "BinaryState",
        vec![ServiceArg::new("BinaryState", ArgKind::Bool)],
    );

    let mut ok = ArgMap::new();
    ok.insert("BinaryState".to_string(), json!(true));
    event.validate(&ok).expect("valid payload");

    let mut unknown = ArgMap::new();
    unknown.insert("Brightness".to_string(), json!(5));
    match event.validate(&unknown) {
        Err(ServiceError::InvalidEventArg(name)) => assert_eq!(name, "Brightness"),
        other => panic!("expected InvalidEventArg, got {other:?}"),
    }

    let mut mistyped = ArgMap::new();
    mistyped.insert("BinaryState".to_string(), json!("on"));
    assert!(event.validate(&mistyped).is_err());
}

#[test]
fn test_descriptions_render_args_as_name_colon_type() {
    let svc = Service::new("Sensor")
        .expect("service")
        .with_method(echo_method());
    let desc = svc.description();
    assert_eq!(desc["name"], json!("Sensor"));
    assert_eq!(desc["methods"][0]["args"][0], json!("Value: string"));
    assert_eq!(desc["methods"][0]["returns"][0], json!("Echoed: string"));
}
