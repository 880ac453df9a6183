// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use crate::core::certificate::{DEFAULT_SEGMENT_LENGTH, DEFAULT_SEGMENTS};

/// Run the IOTSCP device defined by this build's userdevice module.
#[derive(Debug, Parser)]
#[command(name = "iotscp", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Start the device server
    Start {
        /// The port that the HTTP server should listen on
        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// The level to log at
        #[arg(long, value_enum, default_value_t = LogLevel::Info)]
        loglvl: LogLevel,

        /// The file to log to. Defaults to stdout
        #[arg(long)]
        logfile: Option<PathBuf>,
    },
    /// Create a new certificate
    #[command(name = "get_cert")]
    GetCert {
        /// The size of the certificate to be generated:
        /// `--certsize 1000 1500` creates 1000 segments of 1500 bytes
        #[arg(
            long,
            num_args = 2,
            value_names = ["SEGMENTS", "LENGTH"],
            default_values_t = [DEFAULT_SEGMENTS, DEFAULT_SEGMENT_LENGTH]
        )]
        certsize: Vec<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    /// The `tracing` filter directive this level maps to.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}
