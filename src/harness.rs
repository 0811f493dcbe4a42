// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::{
    io::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use log::{debug, warn};

use crate::{interrupt, DeviceInfo, Driver, MAX_DEVICES, TRANSFER_SIZE};

/// What the read loop does after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadErrorPolicy {
    #[default]
    Break,
    Continue,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Descriptor slots handed to the scan.
    pub max_devices: usize,
    /// Capacity of the buffer passed to every read.
    pub transfer_size: usize,
    /// Number of reads, or `None` to poll until interrupted.
    pub reads: Option<u32>,
    pub read_interval: Duration,
    /// Delay between opening the device and the first read.
    pub settle: Duration,
    /// Serial to open instead of the first scanned device.
    pub serial: Option<Vec<u8>>,
    pub on_read_error: ReadErrorPolicy,
    /// Install a SIGINT handler for the duration of the read loop.
    pub trap_interrupts: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_devices: MAX_DEVICES,
            transfer_size: TRANSFER_SIZE,
            reads: Some(10),
            read_interval: Duration::from_millis(100),
            settle: Duration::ZERO,
            serial: None,
            on_read_error: ReadErrorPolicy::Break,
            trap_interrupts: true,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The scan found nothing or failed. Nothing was opened.
    NoDevices { code: i32 },
    OpenFailed { code: i32 },
    /// The device was opened, read from and closed.
    Completed {
        reads: u32,
        bytes: usize,
        read_errors: u32,
        interrupted: bool,
        /// Status of a failed close, `None` if it succeeded.
        close_code: Option<i32>,
    },
}

/// An opened device. Closed exactly once: explicitly via [`Session::close`],
/// or on drop if the run is cut short.
struct Session<'d, D: Driver> {
    driver: &'d mut D,
    closed: bool,
}

impl<'d, D: Driver> Session<'d, D> {
    fn new(driver: &'d mut D) -> Self {
        Self {
            driver,
            closed: false,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        self.driver.read(buf)
    }

    fn close(mut self) -> crate::Result<()> {
        self.closed = true;
        self.driver.close()
    }
}

impl<D: Driver> Drop for Session<'_, D> {
    fn drop(&mut self) {
        if !self.closed {
            debug!("Closing device on early exit");
            if let Err(e) = self.driver.close() {
                warn!("Failed to close device (error code: {})", e.code());
            }
        }
    }
}

#[derive(Debug, Default)]
struct ReadStats {
    reads: u32,
    bytes: usize,
    read_errors: u32,
    interrupted: bool,
}

/// Scans, opens one device, reads from it and closes it, reporting every
/// step as console text on `out`.
pub struct Harness<'a, D, W> {
    driver: D,
    out: W,
    options: Options,
    cancel: &'a AtomicBool,
}

impl<D: Driver, W: Write> Harness<'static, D, W> {
    /// A harness cancelled by the process-wide SIGINT flag.
    pub fn new(driver: D, out: W, options: Options) -> Self {
        Self {
            driver,
            out,
            options,
            cancel: interrupt::flag(),
        }
    }
}

impl<'a, D: Driver, W: Write> Harness<'a, D, W> {
    /// Replaces the flag polled between reads.
    pub fn cancel_flag<'b>(self, cancel: &'b AtomicBool) -> Harness<'b, D, W> {
        Harness {
            driver: self.driver,
            out: self.out,
            options: self.options,
            cancel,
        }
    }

    pub fn into_parts(self) -> (D, W) {
        (self.driver, self.out)
    }

    /// Runs one session. Only failures to write to `out` are returned as
    /// errors; driver failures are reported and end up in the [`Outcome`].
    pub fn run(&mut self) -> io::Result<Outcome> {
        let Self {
            driver,
            out,
            options,
            cancel,
        } = self;

        let mut devices = vec![DeviceInfo::default(); options.max_devices];
        let count = match driver.scan(&mut devices) {
            Ok(count) => count.min(devices.len()),
            Err(e) => {
                writeln!(out, "No devices found (error code: {})", e.code())?;
                return Ok(Outcome::NoDevices { code: e.code() });
            }
        };
        if count == 0 {
            writeln!(out, "No devices found (error code: 0)")?;
            return Ok(Outcome::NoDevices { code: 0 });
        }
        writeln!(out, "Found {count} device(s)")?;
        for (i, device) in devices[..count].iter().enumerate() {
            writeln!(out, "\nDevice {}:", i + 1)?;
            writeln!(out, "  Serial: {}", device.serial_text())?;
            writeln!(out, "  Manufacturer: {}", device.manufacturer_text())?;
            writeln!(out, "  Product: {}", device.product_text())?;
        }

        let serial = match &options.serial {
            Some(serial) => serial.clone(),
            None => devices[0].serial().to_vec(),
        };
        debug!("Opening {}", String::from_utf8_lossy(&serial));
        if let Err(e) = driver.open(&serial) {
            writeln!(out, "Failed to open device (error code: {})", e.code())?;
            return Ok(Outcome::OpenFailed { code: e.code() });
        }
        let mut session = Session::new(driver);
        writeln!(out, "\nDevice opened successfully")?;

        if !options.settle.is_zero() {
            std::thread::sleep(options.settle);
        }
        let stats = read_loop(&mut session, out, options, *cancel)?;
        if stats.interrupted {
            writeln!(out, "\nTest stopped by user")?;
        }

        let close_code = match session.close() {
            Ok(()) => {
                writeln!(out, "Device closed successfully")?;
                None
            }
            Err(e) => {
                writeln!(out, "Failed to close device (error code: {})", e.code())?;
                Some(e.code())
            }
        };
        Ok(Outcome::Completed {
            reads: stats.reads,
            bytes: stats.bytes,
            read_errors: stats.read_errors,
            interrupted: stats.interrupted,
            close_code,
        })
    }
}

fn read_loop<D: Driver>(
    session: &mut Session<'_, D>,
    out: &mut impl Write,
    options: &Options,
    cancel: &AtomicBool,
) -> io::Result<ReadStats> {
    let _trap = if options.trap_interrupts {
        interrupt::SigintTrap::install()
            .map_err(|e| warn!("Ctrl-C will not stop the read loop: {e}"))
            .ok()
    } else {
        None
    };
    let mut buf = vec![0u8; options.transfer_size];
    let mut stats = ReadStats::default();
    loop {
        if options.reads.is_some_and(|n| stats.reads >= n) {
            break;
        }
        if cancel.load(Ordering::SeqCst) {
            stats.interrupted = true;
            break;
        }
        stats.reads += 1;
        match session.read(&mut buf) {
            Ok(count) => {
                // A driver reporting more than it was given is clamped
                let count = count.min(buf.len());
                if count > 0 {
                    stats.bytes += count;
                    writeln!(out, "\nReceived {count} bytes:")?;
                    writeln!(out, "Data: {}", hex_line(&buf[..count]))?;
                }
            }
            // A blocking read cut short by Ctrl-C
            Err(_) if cancel.load(Ordering::SeqCst) => {
                stats.interrupted = true;
                break;
            }
            Err(e) => {
                stats.read_errors += 1;
                writeln!(out, "Failed to read data (error code: {})", e.code())?;
                if options.on_read_error == ReadErrorPolicy::Break {
                    break;
                }
            }
        }
        if !options.read_interval.is_zero() {
            std::thread::sleep(options.read_interval);
        }
    }
    Ok(stats)
}

/// Formats bytes as two digit uppercase hex, separated by single spaces.
pub fn hex_line(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Result};

    #[test]
    fn hex_formatting() {
        assert_eq!(hex_line(&[0x00, 0x0a, 0xff, 0x5C]), "00 0A FF 5C");
        assert_eq!(hex_line(&[7]), "07");
        assert_eq!(hex_line(&[]), "");
    }

    struct Closer {
        closes: u32,
    }

    impl Driver for Closer {
        fn scan(&mut self, _: &mut [DeviceInfo]) -> Result<usize> {
            Ok(0)
        }

        fn open(&mut self, _: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, _: &mut [u8]) -> Result<usize> {
            Err(Error::Driver(-1))
        }

        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    #[test]
    fn session_closes_once() {
        let mut driver = Closer { closes: 0 };
        {
            let session = Session::new(&mut driver);
            session.close().unwrap();
        }
        assert_eq!(driver.closes, 1);
        {
            let _session = Session::new(&mut driver);
        }
        assert_eq!(driver.closes, 2);
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn output_failure_in_read_loop_still_closes() {
        let mut driver = Closer { closes: 0 };
        let options = Options {
            trap_interrupts: false,
            read_interval: Duration::ZERO,
            ..Options::default()
        };
        let cancel = AtomicBool::new(false);
        {
            let mut session = Session::new(&mut driver);
            // The read fails and its report cannot be written
            let result = read_loop(&mut session, &mut Broken, &options, &cancel);
            assert!(result.is_err());
        }
        assert_eq!(driver.closes, 1);
    }
}
