// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt,
    fmt::writer::BoxMakeWriter,
    layer::SubscriberExt,
};

/// Install the global `tracing` subscriber.
///
/// Events go to stdout, or to `logfile` when one is given. The returned
/// guard must stay alive for the process lifetime or buffered log lines
/// are lost.
pub fn init_logger(level: &str, logfile: Option<&Path>) -> Result<WorkerGuard> {
    let (writer, guard) = make_writer(logfile)?;

    let env_filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("Failed to parse log level from flag or env")?;

    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    Ok(guard)
}

fn make_writer(logfile: Option<&Path>) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match logfile {
        None => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            let name = path.file_name().map(PathBuf::from).unwrap_or_default();
            let appender = RollingFileAppender::new(Rotation::NEVER, dir, name);
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}
