// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

use crate::{DeviceInfo, Result};

/// The four calls a device session is made of.
///
/// Sessions are implicit driver state: at most one device is open at a time,
/// and `close` releases whichever one `open` acquired. Drivers whose native
/// close call is keyed by serial remember the serial themselves.
pub trait Driver {
    /// Fills up to `devices.len()` records and returns how many were filled.
    /// `Ok(0)` means nothing was found.
    fn scan(&mut self, devices: &mut [DeviceInfo]) -> Result<usize>;

    fn open(&mut self, serial: &[u8]) -> Result<()>;

    /// Reads into `buf`, returning the number of valid bytes. Zero is not an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn close(&mut self) -> Result<()>;
}

impl<D: Driver + ?Sized> Driver for Box<D> {
    fn scan(&mut self, devices: &mut [DeviceInfo]) -> Result<usize> {
        (**self).scan(devices)
    }

    fn open(&mut self, serial: &[u8]) -> Result<()> {
        (**self).open(serial)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<D: Driver + ?Sized> Driver for &mut D {
    fn scan(&mut self, devices: &mut [DeviceInfo]) -> Result<usize> {
        (**self).scan(devices)
    }

    fn open(&mut self, serial: &[u8]) -> Result<()> {
        (**self).open(serial)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
