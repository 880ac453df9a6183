// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use iotscp_rs::{
    cfg::{
        cli::{Action, Cli, LogLevel},
        logger::init_logger,
    },
    core::{certificate::{CERT_PATH, generate_certificate}, device::BaseDevice},
    http::{deviceserver::DeviceServer, httpserver::HttpServer, serializer, udpserver::UdpServer},
    userdevice,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader, stdin},
    signal,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.action {
        Action::Start {
            port,
            loglvl,
            logfile,
        } => start_server(port, loglvl, logfile.as_deref()).await,
        Action::GetCert { certsize } => {
            let (segments, seg_len) = (certsize[0], certsize[1]);
            generate_certificate(Path::new(CERT_PATH), segments, seg_len)?;
            println!("Wrote {CERT_PATH}: {segments} segments of {seg_len} bytes");
            Ok(())
        },
    }
}

async fn start_server(port: u16, loglvl: LogLevel, logfile: Option<&Path>) -> Result<()> {
    let _guard = init_logger(loglvl.as_filter(), logfile)?;

    let stop = CancellationToken::new();
    let device = BaseDevice::new(stop.clone(), userdevice::device_def()?)?;
    serializer::serialize(&device)
        .await
        .context("failed to serialize device descriptions")?;

    let http = HttpServer::new(stop.clone(), port, Arc::new(DeviceServer::new(Arc::clone(&device))));
    let (_bound, http_task) = match http.start() {
        Ok(started) => started,
        Err(e) => {
            // No point keeping this up if we can't listen...
            error!("{e}");
            std::process::exit(1);
        },
    };
    let udp_task = match UdpServer::new(stop.clone(), port).start().await {
        Ok(task) => task,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        },
    };
    let user_task = tokio::spawn(userdevice::run(Arc::clone(&device), stop.clone()));

    command_loop(&stop).await;

    let _ = http_task.await;
    let _ = udp_task.await;
    let _ = user_task.await;
    Ok(())
}

/// Read operator commands from stdin until `shutdown` (or Ctrl-C) fires
/// the stop signal.
async fn command_loop(stop: &CancellationToken) {
    let mut lines = BufReader::new(stdin()).lines();
    loop {
        println!("Type `help` for a list of commands");
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down; this will take some time.");
                stop.cancel();
                break;
            },
            line = lines.next_line() => match line {
                Ok(Some(command)) => match command.trim() {
                    "help" => println!("`shutdown` causes the server to shutdown"),
                    "shutdown" => {
                        info!("Shutting down; this will take some time.");
                        stop.cancel();
                        break;
                    },
                    _ => {},
                },
                // stdin is gone (detached run); wait for Ctrl-C alone
                Ok(None) | Err(_) => {
                    let _ = signal::ctrl_c().await;
                    info!("Shutting down; this will take some time.");
                    stop.cancel();
                    break;
                },
            },
        }
    }
}
