// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Session harness for USB_G_50 compatible devices.
//!
//! The harness only ever talks to a device through [`Driver`]. Two drivers
//! are provided: [`VendorLibrary`], which calls into the vendor's dynamic
//! library, and [`UsbfsDriver`], which speaks the same device protocol over
//! Linux usbfs.

mod descriptor;
mod driver;
mod harness;
pub mod interrupt;
mod ioctl;
mod library;
mod usbfs;

pub use descriptor::{DeviceInfo, UsbDeviceDescriptor, MAX_STR_LENGTH};
pub use driver::Driver;
pub use harness::{hex_line, Harness, Options, Outcome, ReadErrorPolicy};
pub use library::{default_library_path, Abi, VendorLibrary};
pub use usbfs::{UsbDevice, UsbfsDriver, PRODUCT_ID, VENDOR_ID};

/// Number of descriptor slots handed to a scan.
pub const MAX_DEVICES: usize = 16;
/// Capacity of the transfer buffer used for a single read.
pub const TRANSFER_SIZE: usize = 64;

pub type Result<T> = std::result::Result<T, Error>;

/// Integer status codes shared with the vendor library. They are libusb's.
pub mod code {
    pub const SUCCESS: i32 = 0;
    pub const IO: i32 = -1;
    pub const INVALID_PARAM: i32 = -2;
    pub const ACCESS: i32 = -3;
    pub const NO_DEVICE: i32 = -4;
    pub const NOT_FOUND: i32 = -5;
    pub const BUSY: i32 = -6;
    pub const TIMEOUT: i32 = -7;
    pub const OVERFLOW: i32 = -8;
    pub const PIPE: i32 = -9;
    pub const INTERRUPTED: i32 = -10;
    pub const NO_MEM: i32 = -11;
    pub const NOT_SUPPORTED: i32 = -12;
    pub const OTHER: i32 = -99;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Raw negative result returned by the driver. Its meaning is the driver's.
    #[error("driver returned error code {0}")]
    Driver(i32),
    #[error("failed to load {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },
    #[error(transparent)]
    Descriptor(#[from] descriptor::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ioctl(nix::errno::Errno),
    #[error("Device disconnected")]
    DeviceDisconnected,
    #[error("Invalid endpoint")]
    InvalidEndpoint,
    #[error("Invalid parameter")]
    InvalidParam,
    #[error("Not found")]
    NotFound,
    #[error("A device is already open")]
    Busy,
    #[error("No device is open")]
    NotOpen,
}

impl Error {
    /// The status code this error is reported as.
    pub fn code(&self) -> i32 {
        match self {
            Error::Driver(c) => *c,
            Error::Load { .. } => code::NOT_FOUND,
            Error::Descriptor(_) => code::IO,
            Error::Io(e) => e
                .raw_os_error()
                .map(|e| errno_code(nix::errno::Errno::from_i32(e)))
                .unwrap_or(code::IO),
            Error::Ioctl(e) => errno_code(*e),
            Error::DeviceDisconnected | Error::NotOpen => code::NO_DEVICE,
            Error::InvalidEndpoint | Error::InvalidParam => code::INVALID_PARAM,
            Error::NotFound => code::NOT_FOUND,
            Error::Busy => code::BUSY,
        }
    }

    /// Turns a raw driver result into a `Result`. Non-negative values are success.
    pub fn check(result: i32) -> Result<i32> {
        if result < 0 {
            Err(Error::Driver(result))
        } else {
            Ok(result)
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(value: nix::errno::Errno) -> Self {
        match value {
            nix::errno::Errno::ENODEV => Self::DeviceDisconnected,
            nix::errno::Errno::ENOENT => Self::NotFound,
            v => Self::Ioctl(v),
        }
    }
}

/// Maps an errno from usbfs onto a status code, following libusb's linux backend.
fn errno_code(errno: nix::errno::Errno) -> i32 {
    use nix::errno::Errno;
    match errno {
        Errno::ENODEV | Errno::ESHUTDOWN => code::NO_DEVICE,
        Errno::ENOENT => code::NOT_FOUND,
        Errno::EACCES | Errno::EPERM => code::ACCESS,
        Errno::EBUSY => code::BUSY,
        Errno::ETIMEDOUT => code::TIMEOUT,
        Errno::EPIPE => code::PIPE,
        Errno::EOVERFLOW => code::OVERFLOW,
        Errno::EINTR => code::INTERRUPTED,
        Errno::ENOMEM => code::NO_MEM,
        Errno::EINVAL => code::INVALID_PARAM,
        Errno::ENOSYS | Errno::EOPNOTSUPP => code::NOT_SUPPORTED,
        _ => code::IO,
    }
}

/// Symbolic name of a status code.
pub fn error_name(error_code: i32) -> &'static str {
    match error_code {
        code::SUCCESS => "LIBUSB_SUCCESS",
        code::IO => "LIBUSB_ERROR_IO",
        code::INVALID_PARAM => "LIBUSB_ERROR_INVALID_PARAM",
        code::ACCESS => "LIBUSB_ERROR_ACCESS",
        code::NO_DEVICE => "LIBUSB_ERROR_NO_DEVICE",
        code::NOT_FOUND => "LIBUSB_ERROR_NOT_FOUND",
        code::BUSY => "LIBUSB_ERROR_BUSY",
        code::TIMEOUT => "LIBUSB_ERROR_TIMEOUT",
        code::OVERFLOW => "LIBUSB_ERROR_OVERFLOW",
        code::PIPE => "LIBUSB_ERROR_PIPE",
        code::INTERRUPTED => "LIBUSB_ERROR_INTERRUPTED",
        code::NO_MEM => "LIBUSB_ERROR_NO_MEM",
        code::NOT_SUPPORTED => "LIBUSB_ERROR_NOT_SUPPORTED",
        code::OTHER => "LIBUSB_ERROR_OTHER",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn driver_codes_pass_through() {
        assert_eq!(Error::Driver(-7).code(), -7);
        assert_eq!(Error::Driver(-1234).code(), -1234);
        assert!(matches!(Error::check(3), Ok(3)));
        assert!(matches!(Error::check(0), Ok(0)));
        assert!(matches!(Error::check(-5), Err(Error::Driver(-5))));
    }

    #[test]
    fn errno_mapping() {
        assert!(matches!(Error::from(Errno::ENODEV), Error::DeviceDisconnected));
        assert_eq!(Error::from(Errno::ENODEV).code(), code::NO_DEVICE);
        assert_eq!(Error::from(Errno::ETIMEDOUT).code(), code::TIMEOUT);
        assert_eq!(Error::from(Errno::EBUSY).code(), code::BUSY);
        assert_eq!(Error::from(Errno::EINTR).code(), code::INTERRUPTED);
        assert_eq!(Error::from(Errno::EACCES).code(), code::ACCESS);
        assert_eq!(Error::from(Errno::EIO).code(), code::IO);
        let io = std::io::Error::from_raw_os_error(Errno::EPIPE as i32);
        assert_eq!(Error::from(io).code(), code::PIPE);
    }

    #[test]
    fn names() {
        assert_eq!(error_name(-7), "LIBUSB_ERROR_TIMEOUT");
        assert_eq!(error_name(-99), "LIBUSB_ERROR_OTHER");
        assert_eq!(error_name(-42), "Unknown error");
        assert_eq!(Error::Driver(-5).to_string(), "driver returned error code -5");
    }
}
