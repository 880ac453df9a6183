// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use iotscp_rs::{
    controller::ControllerLink,
    core::{service::ArgMap, session::HashAlg},
    http::httputil::{HttpHead, HttpResponse},
};
use serde_json::{Value, json};
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};

use super::common::{avoid_key_rollover, controller_cert, raw_exchange, start_rig};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_hello_negotiates_the_preferred_algorithm() -> Result<()> {
    let rig = start_rig().await?;
    avoid_key_rollover().await;
    let cert = controller_cert(&rig.cert_path, "abc", 0)?;

    let link = timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert)).await??;
    // device pref_alg is sha256 and the controller offers it
    assert_eq!(link.hashtype(), HashAlg::Sha256);
    assert!(rig.device.has_session("abc"));
    Ok(())
}

#[tokio::test]
async fn test_rpc_roundtrip_decrypts_to_the_method_output() -> Result<()> {
    let rig = start_rig().await?;
    avoid_key_rollover().await;
    let cert = controller_cert(&rig.cert_path, "abc", 1)?;
    let mut link =
        timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert)).await??;

    let out = timeout(
        TEST_TIMEOUT,
        link.call("/control/sensor/", "GetBinaryState", None),
    )
    .await??;
    assert_eq!(out, json!({"BinaryState": false}));

    // flip the device state and ask again over the ratcheted session
    rig.device.set_var("binarystate", json!(true));
    let out = timeout(
        TEST_TIMEOUT,
        link.call("/control/sensor/", "GetBinaryState", None),
    )
    .await??;
    assert_eq!(out, json!({"BinaryState": true}));
    Ok(())
}

#[tokio::test]
async fn test_unknown_method_and_url_are_not_implemented() -> Result<()> {
    let rig = start_rig().await?;
    avoid_key_rollover().await;
    let cert = controller_cert(&rig.cert_path, "abc", 2)?;
    let mut link =
        timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert)).await??;

    let err = timeout(
        TEST_TIMEOUT,
        link.call("/control/sensor/", "SetWarpFactor", None),
    )
    .await?
    .expect_err("unknown method must fail");
    assert!(err.to_string().contains("501"), "got: {err}");
    Ok(())
}

#[tokio::test]
async fn test_post_without_uuid_is_unauthorized() -> Result<()> {
    let rig = start_rig().await?;
    let response = raw_exchange(
        rig.addr,
        b"POST /control/sensor/ HTTP/1.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await?;
    let res = HttpResponse::read_from(&mut &response[..]).await?;
    assert_eq!(res.code, 401);
    assert!(!rig.device.has_session("abc"));
    Ok(())
}

#[tokio::test]
async fn test_hello_reports_missing_fields() -> Result<()> {
    let rig = start_rig().await?;
    let body = r#"{"algorithms": ["sha256"]}"#;
    let request = format!(
        "POST /iotscp/hello HTTP/1.1\r\nuuid: abc\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = raw_exchange(rig.addr, request.as_bytes()).await?;
    let res = HttpResponse::read_from(&mut &response[..]).await?;
    assert_eq!(res.code, 401);
    let parsed: Value = serde_json::from_slice(&res.body)?;
    assert_eq!(parsed, json!({"missing": "offset"}));
    Ok(())
}

#[tokio::test]
async fn test_hello_with_a_bad_offset_blames_the_certificate() -> Result<()> {
    let rig = start_rig().await?;
    // the scratch certificate only has 4 segments
    let body = r#"{"offset": 99, "algorithms": ["sha256"]}"#;
    let request = format!(
        "POST /iotscp/hello HTTP/1.1\r\nuuid: abc\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = raw_exchange(rig.addr, request.as_bytes()).await?;
    let res = HttpResponse::read_from(&mut &response[..]).await?;
    assert_eq!(res.code, 401);
    let parsed: Value = serde_json::from_slice(&res.body)?;
    assert_eq!(parsed, json!({"missing": "certificate"}));
    Ok(())
}

#[tokio::test]
async fn test_unknown_verb_is_not_implemented() -> Result<()> {
    let rig = start_rig().await?;
    let response =
        raw_exchange(rig.addr, b"BREW /coffee HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await?;
    let res = HttpResponse::read_from(&mut &response[..]).await?;
    assert_eq!(res.code, 501);
    Ok(())
}

#[tokio::test]
async fn test_missing_request_line_is_version_not_supported() -> Result<()> {
    let rig = start_rig().await?;
    let response = raw_exchange(rig.addr, b"BREW\r\n\r\n").await?;
    let res = HttpResponse::read_from(&mut &response[..]).await?;
    assert_eq!(res.code, 505);
    Ok(())
}

#[tokio::test]
async fn test_subscribe_then_notify_over_a_kept_alive_connection() -> Result<()> {
    let rig = start_rig().await?;
    avoid_key_rollover().await;
    let cert = controller_cert(&rig.cert_path, "abc", 3)?;
    let mut link =
        timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert)).await??;

    // a subscriber endpoint that answers every NOTIFY with a bare 200,
    // forwarding the parsed payloads back to the test
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let sub_port = listener.local_addr()?.port();
    let (seen_tx, mut seen_rx) = mpsc::channel::<Value>(8);
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        loop {
            let Ok(mut head) = HttpHead::read_from(&mut stream).await else {
                return;
            };
            if head.recv_body(&mut stream).await.is_err() {
                return;
            }
            let payload: Value =
                serde_json::from_slice(&head.body).unwrap_or(Value::Null);
            if seen_tx.send(payload).await.is_err() {
                return;
            }
            if stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
        }
    });

    timeout(TEST_TIMEOUT, link.subscribe("/event/sensor/", sub_port)).await??;
    let sensor = rig.device.service_by_name("Sensor").context("sensor")?;
    assert!(rig.device.dispatcher().has_subscribers("/event/sensor/"));

    // first event dials the subscriber and spawns a worker
    let mut payload = ArgMap::new();
    payload.insert("BinaryState".to_string(), json!(true));
    sensor.send_event("BinaryState", payload).await?;

    let first = timeout(TEST_TIMEOUT, seen_rx.recv())
        .await?
        .context("no first notification")?;
    assert_eq!(first, json!({"BinaryState": true, "name": "BinaryState"}));

    // the worker should now own the connection
    let sub_addr = std::net::SocketAddr::from(([127, 0, 0, 1], sub_port));
    let worker_up = async {
        while !rig.device.dispatcher().has_worker(&sub_addr) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(TEST_TIMEOUT, worker_up).await?;

    // second event travels through the worker's queue, same connection
    let mut payload = ArgMap::new();
    payload.insert("BinaryState".to_string(), json!(false));
    sensor.send_event("BinaryState", payload).await?;

    let second = timeout(TEST_TIMEOUT, seen_rx.recv())
        .await?
        .context("no second notification")?;
    assert_eq!(second, json!({"BinaryState": false, "name": "BinaryState"}));
    Ok(())
}

#[tokio::test]
async fn test_subscribe_to_an_unknown_event_url_is_not_implemented() -> Result<()> {
    let rig = start_rig().await?;
    avoid_key_rollover().await;
    let cert = controller_cert(&rig.cert_path, "abc", 0)?;
    let mut link =
        timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert)).await??;

    let err = timeout(TEST_TIMEOUT, link.subscribe("/event/thermostat/", 9000))
        .await?
        .expect_err("unknown event url must fail");
    assert!(err.to_string().contains("501"), "got: {err}");
    Ok(())
}

#[tokio::test]
async fn test_a_second_hello_replaces_the_session() -> Result<()> {
    let rig = start_rig().await?;
    avoid_key_rollover().await;
    let cert = controller_cert(&rig.cert_path, "abc", 0)?;

    let _first =
        timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert.clone())).await??;
    let mut second =
        timeout(TEST_TIMEOUT, ControllerLink::connect(rig.addr, cert)).await??;

    // the replacement session serves the fresh link
    let out = timeout(
        TEST_TIMEOUT,
        second.call("/control/sensor/", "GetBinaryState", None),
    )
    .await??;
    assert_eq!(out, json!({"BinaryState": false}));
    Ok(())
}
