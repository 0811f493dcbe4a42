// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::{io, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, ValueEnum};
use log::LevelFilter;

use usbg_harness::{
    default_library_path, Abi, Driver, Harness, Options, ReadErrorPolicy, UsbfsDriver,
    VendorLibrary, MAX_DEVICES, TRANSFER_SIZE,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Call into the vendor library
    Library,
    /// Talk to the device through Linux usbfs
    Usbfs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AbiArg {
    Implicit,
    SerialKeyed,
}

impl From<AbiArg> for Abi {
    fn from(value: AbiArg) -> Self {
        match value {
            AbiArg::Implicit => Abi::Implicit,
            AbiArg::SerialKeyed => Abi::SerialKeyed,
        }
    }
}

/// Scan for USB_G_50 devices, open one and dump what it sends.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, value_enum, env = "USBG_BACKEND", default_value = "library")]
    backend: Backend,
    /// Vendor library to load [default: platform name of USB_G_50]
    #[arg(long, env = "USBG_LIBRARY")]
    library: Option<PathBuf>,
    /// Calling convention of the library's read and close exports
    #[arg(long, value_enum, default_value = "implicit")]
    abi: AbiArg,
    /// Open this serial instead of the first device found
    #[arg(long)]
    serial: Option<String>,
    /// Number of reads
    #[arg(long, default_value_t = 10)]
    reads: u32,
    /// Keep reading until interrupted
    #[arg(long, conflicts_with = "reads")]
    forever: bool,
    /// Delay between reads
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
    /// Delay between opening the device and the first read
    #[arg(long, default_value_t = 0)]
    settle_ms: u64,
    #[arg(long, default_value_t = MAX_DEVICES)]
    max_devices: usize,
    #[arg(long, default_value_t = TRANSFER_SIZE)]
    transfer_size: usize,
    /// Keep reading after a failed read
    #[arg(long)]
    keep_going: bool,
    /// More log output on stderr, repeatable
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn options(&self) -> Options {
        Options {
            max_devices: self.max_devices,
            transfer_size: self.transfer_size,
            reads: (!self.forever).then_some(self.reads),
            read_interval: Duration::from_millis(self.interval_ms),
            settle: Duration::from_millis(self.settle_ms),
            serial: self.serial.as_ref().map(|s| s.as_bytes().to_vec()),
            on_read_error: if self.keep_going {
                ReadErrorPolicy::Continue
            } else {
                ReadErrorPolicy::Break
            },
            trap_interrupts: true,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn load_driver(args: &Args) -> Option<Box<dyn Driver>> {
    match args.backend {
        Backend::Library => {
            let path = args
                .library
                .clone()
                .unwrap_or_else(|| PathBuf::from(default_library_path()));
            match unsafe { VendorLibrary::load(&path, args.abi.into()) } {
                Ok(library) => {
                    println!("Successfully loaded {}", path.display());
                    Some(Box::new(library))
                }
                Err(e) => {
                    println!("Failed to load {}: {}", path.display(), source_message(&e));
                    None
                }
            }
        }
        Backend::Usbfs => Some(Box::new(UsbfsDriver::default())),
    }
}

fn source_message(e: &usbg_harness::Error) -> String {
    match std::error::Error::source(e) {
        Some(source) => source.to_string(),
        None => e.to_string(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let Some(driver) = load_driver(&args) else {
        return ExitCode::FAILURE;
    };
    let mut harness = Harness::new(driver, io::stdout().lock(), args.options());
    match harness.run() {
        Ok(outcome) => {
            log::debug!("Run finished: {outcome:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Writing to stdout failed: {e}");
            ExitCode::FAILURE
        }
    }
}
