// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Binding to the vendor's `USB_G_50` library, loaded at runtime.

use std::{
    ffi::{c_char, c_int, CString, OsString},
    path::Path,
};

use libloading::Library;
use log::debug;

use crate::{DeviceInfo, Driver, Error, Result};

const LIBRARY_NAME: &str = "USB_G_50";

type ScanDevice = unsafe extern "C" fn(*mut DeviceInfo, c_int) -> c_int;
type OpenDevice = unsafe extern "C" fn(*const c_char) -> c_int;
type ReadDataImplicit = unsafe extern "C" fn(*mut u8, c_int, *mut c_int) -> c_int;
type ReadDataKeyed = unsafe extern "C" fn(*const c_char, *mut u8, c_int) -> c_int;
type CloseDeviceImplicit = unsafe extern "C" fn() -> c_int;
type CloseDeviceKeyed = unsafe extern "C" fn(*const c_char) -> c_int;

/// Calling convention of the library's read and close exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Abi {
    /// `USB_ReadData(data, length, &transferred)` and `USB_CloseDevice()`.
    #[default]
    Implicit,
    /// `USB_ReadData(serial, data, length)` returning the byte count, and
    /// `USB_CloseDevice(serial)`.
    SerialKeyed,
}

#[derive(Clone, Copy)]
enum Session {
    Implicit {
        read: ReadDataImplicit,
        close: CloseDeviceImplicit,
    },
    Keyed {
        read: ReadDataKeyed,
        close: CloseDeviceKeyed,
    },
}

/// File name the library has on this platform, e.g. `libUSB_G_50.so`.
pub fn default_library_path() -> OsString {
    libloading::library_filename(LIBRARY_NAME)
}

pub struct VendorLibrary {
    scan: ScanDevice,
    open: OpenDevice,
    session: Session,
    // Serial passed to `USB_OpenDevice`, needed by the keyed calls
    serial: Option<CString>,
    // Declared last so the function pointers above never outlive it.
    // `None` only for exports linked into the test binary.
    _library: Option<Library>,
}

impl std::fmt::Debug for VendorLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorLibrary")
            .field("abi", &self.abi())
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl VendorLibrary {
    /// Loads the library and resolves every export the harness uses.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initialisers, and the resolved symbols are
    /// trusted to have the signatures `abi` describes.
    pub unsafe fn load(path: impl AsRef<Path>, abi: Abi) -> Result<Self> {
        let path = path.as_ref();
        let load_error = |source| Error::Load {
            path: path.display().to_string(),
            source,
        };
        let library = Library::new(path).map_err(load_error)?;
        let scan = *library
            .get::<ScanDevice>(b"USB_ScanDevice\0")
            .map_err(load_error)?;
        let open = *library
            .get::<OpenDevice>(b"USB_OpenDevice\0")
            .map_err(load_error)?;
        let session = match abi {
            Abi::Implicit => Session::Implicit {
                read: *library
                    .get::<ReadDataImplicit>(b"USB_ReadData\0")
                    .map_err(load_error)?,
                close: *library
                    .get::<CloseDeviceImplicit>(b"USB_CloseDevice\0")
                    .map_err(load_error)?,
            },
            Abi::SerialKeyed => Session::Keyed {
                read: *library
                    .get::<ReadDataKeyed>(b"USB_ReadData\0")
                    .map_err(load_error)?,
                close: *library
                    .get::<CloseDeviceKeyed>(b"USB_CloseDevice\0")
                    .map_err(load_error)?,
            },
        };
        debug!("Resolved exports of {} ({abi:?})", path.display());
        Ok(Self {
            scan,
            open,
            session,
            serial: None,
            _library: Some(library),
        })
    }

    #[cfg(test)]
    fn from_exports(scan: ScanDevice, open: OpenDevice, session: Session) -> Self {
        Self {
            scan,
            open,
            session,
            serial: None,
            _library: None,
        }
    }

    pub fn abi(&self) -> Abi {
        match self.session {
            Session::Implicit { .. } => Abi::Implicit,
            Session::Keyed { .. } => Abi::SerialKeyed,
        }
    }

    fn serial_ptr(&self) -> *const c_char {
        self.serial
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }
}

impl Driver for VendorLibrary {
    fn scan(&mut self, devices: &mut [DeviceInfo]) -> Result<usize> {
        let capacity = c_int::try_from(devices.len()).map_err(|_| Error::InvalidParam)?;
        let found = Error::check(unsafe { (self.scan)(devices.as_mut_ptr(), capacity) })?;
        // Never trust the count beyond the slots we handed over
        Ok((found as usize).min(devices.len()))
    }

    fn open(&mut self, serial: &[u8]) -> Result<()> {
        let serial = CString::new(serial).map_err(|_| Error::InvalidParam)?;
        Error::check(unsafe { (self.open)(serial.as_ptr()) })?;
        self.serial = Some(serial);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let length = c_int::try_from(buf.len()).map_err(|_| Error::InvalidParam)?;
        let transferred = match self.session {
            Session::Implicit { read, .. } => {
                let mut transferred: c_int = 0;
                Error::check(unsafe { read(buf.as_mut_ptr(), length, &mut transferred) })?;
                transferred
            }
            Session::Keyed { read, .. } => {
                Error::check(unsafe { read(self.serial_ptr(), buf.as_mut_ptr(), length) })?
            }
        };
        Ok((transferred.max(0) as usize).min(buf.len()))
    }

    fn close(&mut self) -> Result<()> {
        let result = match self.session {
            Session::Implicit { close, .. } => unsafe { close() },
            Session::Keyed { close, .. } => unsafe { close(self.serial_ptr()) },
        };
        self.serial = None;
        Error::check(result)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::VecDeque, ffi::CStr};

    thread_local! {
        // Counts handed out by the read stubs, negative values are returned as errors
        static COUNTS: RefCell<VecDeque<c_int>> = RefCell::new(VecDeque::new());
        static SCAN_RESULT: RefCell<c_int> = RefCell::new(0);
        static CALLS: RefCell<Vec<String>> = RefCell::new(Vec::new());
    }

    fn record(call: &str, serial: *const c_char) {
        let serial = if serial.is_null() {
            "<null>".to_string()
        } else {
            unsafe { CStr::from_ptr(serial) }.to_string_lossy().into_owned()
        };
        CALLS.with(|c| c.borrow_mut().push(format!("{call} {serial}")));
    }

    fn calls() -> Vec<String> {
        CALLS.with(|c| c.borrow().clone())
    }

    fn script(counts: &[c_int]) {
        COUNTS.with(|c| *c.borrow_mut() = counts.iter().copied().collect());
    }

    fn next_count() -> c_int {
        COUNTS.with(|c| c.borrow_mut().pop_front().unwrap_or(0))
    }

    unsafe fn fill(data: *mut u8, length: c_int, count: c_int) {
        for i in 0..count.min(length) {
            *data.add(i as usize) = i as u8;
        }
    }

    unsafe extern "C" fn scan_stub(devices: *mut DeviceInfo, capacity: c_int) -> c_int {
        if capacity > 0 {
            *devices = DeviceInfo::new(b"ABC123", b"Acme Instruments", b"G50 Sensor");
        }
        SCAN_RESULT.with(|r| *r.borrow())
    }

    unsafe extern "C" fn open_stub(serial: *const c_char) -> c_int {
        record("open", serial);
        if CStr::from_ptr(serial).to_bytes() == b"BUSY" {
            crate::code::BUSY
        } else {
            0
        }
    }

    unsafe extern "C" fn read_implicit(
        data: *mut u8,
        length: c_int,
        transferred: *mut c_int,
    ) -> c_int {
        CALLS.with(|c| c.borrow_mut().push("read".to_string()));
        let count = next_count();
        if count < 0 {
            return count;
        }
        fill(data, length, count);
        *transferred = count;
        0
    }

    unsafe extern "C" fn close_implicit() -> c_int {
        CALLS.with(|c| c.borrow_mut().push("close".to_string()));
        0
    }

    unsafe extern "C" fn read_keyed(serial: *const c_char, data: *mut u8, length: c_int) -> c_int {
        record("read", serial);
        let count = next_count();
        if count >= 0 {
            fill(data, length, count);
        }
        count
    }

    unsafe extern "C" fn close_keyed(serial: *const c_char) -> c_int {
        record("close", serial);
        0
    }

    fn implicit() -> VendorLibrary {
        VendorLibrary::from_exports(
            scan_stub,
            open_stub,
            Session::Implicit {
                read: read_implicit,
                close: close_implicit,
            },
        )
    }

    fn keyed() -> VendorLibrary {
        VendorLibrary::from_exports(
            scan_stub,
            open_stub,
            Session::Keyed {
                read: read_keyed,
                close: close_keyed,
            },
        )
    }

    #[test]
    fn implicit_read_takes_count_from_out_parameter() {
        let mut library = implicit();
        assert_eq!(library.abi(), Abi::Implicit);
        script(&[5, 1000, 0, -7]);
        library.open(b"ABC123").unwrap();
        let mut buf = [0xEEu8; 64];
        assert_eq!(library.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..6], &[0, 1, 2, 3, 4, 0xEE]);
        // Over-reported counts never exceed the buffer
        assert_eq!(library.read(&mut buf).unwrap(), 64);
        assert_eq!(buf[63], 63);
        assert_eq!(library.read(&mut buf).unwrap(), 0);
        assert!(matches!(library.read(&mut buf), Err(Error::Driver(-7))));
        library.close().unwrap();
        assert_eq!(calls(), ["open ABC123", "read", "read", "read", "read", "close"]);
    }

    #[test]
    fn keyed_calls_carry_the_opened_serial() {
        let mut library = keyed();
        assert_eq!(library.abi(), Abi::SerialKeyed);
        script(&[2, 1000, 0, -7]);
        library.open(b"345E34593133").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(library.read(&mut buf).unwrap(), 2);
        assert_eq!(library.read(&mut buf).unwrap(), 64);
        assert_eq!(library.read(&mut buf).unwrap(), 0);
        assert!(matches!(library.read(&mut buf), Err(Error::Driver(-7))));
        library.close().unwrap();
        assert!(library.serial.is_none());
        assert_eq!(
            calls(),
            [
                "open 345E34593133",
                "read 345E34593133",
                "read 345E34593133",
                "read 345E34593133",
                "read 345E34593133",
                "close 345E34593133",
            ]
        );
    }

    #[test]
    fn failed_open_keeps_no_serial() {
        let mut library = keyed();
        assert!(matches!(library.open(b"BUSY"), Err(Error::Driver(-6))));
        assert!(library.serial.is_none());
        library.close().unwrap();
        assert_eq!(calls(), ["open BUSY", "close <null>"]);
    }

    #[test]
    fn serial_with_nul_is_rejected_before_the_call() {
        let mut library = implicit();
        assert!(matches!(library.open(b"AB\0C"), Err(Error::InvalidParam)));
        assert!(calls().is_empty());
    }

    #[test]
    fn scan_count_is_bounded_by_slots() {
        let mut library = implicit();
        let mut devices = vec![DeviceInfo::default(); 2];
        SCAN_RESULT.with(|r| *r.borrow_mut() = 5);
        assert_eq!(library.scan(&mut devices).unwrap(), 2);
        assert_eq!(devices[0].serial(), b"ABC123");
        SCAN_RESULT.with(|r| *r.borrow_mut() = crate::code::NOT_FOUND);
        assert!(matches!(library.scan(&mut devices), Err(Error::Driver(-5))));
    }

    #[test]
    fn missing_library_is_a_load_error() {
        let err = unsafe { VendorLibrary::load("/nonexistent/libUSB_G_50.so", Abi::Implicit) }
            .unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().starts_with("failed to load /nonexistent/libUSB_G_50.so"));
    }

    #[test]
    fn platform_file_name() {
        let name = default_library_path();
        assert!(name.to_string_lossy().contains("USB_G_50"));
    }
}
