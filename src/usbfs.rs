// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! The device protocol spoken directly over Linux usbfs, for machines without
//! the vendor library.

use std::{
    cell::OnceCell,
    ffi::c_void,
    fs::{File, OpenOptions},
    io::{Read, Seek},
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    descriptor::{decode_string_ascii, parse_language_ids, DESCRIPTOR_TYPE_STRING},
    ioctl::{
        usbdevfs_bulk, usbdevfs_claim_interface, usbdevfs_control, usbdevfs_ioctl,
        usbdevfs_release_interface, usbdevfs_set_configuration, BulkTransfer, ControlTransfer,
        SubIoctl, IOCTL_USBFS_DISCONNECT,
    },
    DeviceInfo, Driver, Error, Result, UsbDeviceDescriptor,
};

pub const VENDOR_ID: u16 = 0x1733;
pub const PRODUCT_ID: u16 = 0xAABB;

const CONFIGURATION: u8 = 1;
const INTERFACE: u8 = 0;
const COMMAND_ENDPOINT: u8 = 0x01;
const DATA_ENDPOINT: u8 = 0x81;
const COMMAND_OPEN: u8 = 0x01;
const COMMAND_CLOSE: u8 = 0x00;
// Zero means no timeout
const COMMAND_TIMEOUT: Duration = Duration::ZERO;
const READ_TIMEOUT: Duration = Duration::from_millis(1000);
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

const REQUEST_TYPE_STANDARD_DEVICE_IN: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

#[derive(Debug)]
pub struct UsbDevice {
    file: File,
    descriptor_cache: OnceCell<UsbDeviceDescriptor>,
}

impl UsbDevice {
    pub fn new(file: File) -> Self {
        Self {
            file,
            descriptor_cache: OnceCell::new(),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::new(file))
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn descriptor(&self) -> Result<&UsbDeviceDescriptor> {
        if let Some(d) = self.descriptor_cache.get() {
            return Ok(d);
        }
        let mut file = &self.file;
        let mut descriptor_data = Vec::new();
        file.rewind()?;
        file.read_to_end(&mut descriptor_data)?;
        let descriptor = UsbDeviceDescriptor::from_byte_array(&descriptor_data)?;
        Ok(self.descriptor_cache.get_or_init(|| descriptor))
    }

    pub fn set_configuration(&self, configuration: u8) -> Result<()> {
        let mut configuration = configuration as u32;
        unsafe { usbdevfs_set_configuration(self.fd(), &mut configuration as *mut _)? };
        Ok(())
    }

    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut command = SubIoctl {
            ifno: interface as i32,
            ioctl_code: IOCTL_USBFS_DISCONNECT,
            data: std::ptr::null_mut(),
        };
        // Fails when no kernel driver is attached, which is fine
        let _ = unsafe { usbdevfs_ioctl(self.fd(), &mut command as *mut _) };
        let mut interface = interface as u32;

        unsafe { usbdevfs_claim_interface(self.fd(), &mut interface as *mut _)? };
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> Result<()> {
        let mut interface = interface as u32;
        unsafe { usbdevfs_release_interface(self.fd(), &mut interface as *mut _)? };
        Ok(())
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if endpoint & 0x80 == 0 {
            return Err(Error::InvalidEndpoint);
        }
        let mut bulk_desc = BulkTransfer {
            ep: endpoint as u32,
            len: buf.len() as u32,
            timeout: timeout.as_millis() as u32,
            data: buf.as_mut_ptr() as *mut c_void,
        };
        let transferred = unsafe { usbdevfs_bulk(self.fd(), &mut bulk_desc as *mut _)? };
        Ok(transferred as usize)
    }

    pub fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        if endpoint & 0x80 != 0 {
            return Err(Error::InvalidEndpoint);
        }
        let mut bulk_desc = BulkTransfer {
            ep: endpoint as u32,
            len: buf.len() as u32,
            timeout: timeout.as_millis() as u32,
            data: buf.as_ptr() as *mut c_void,
        };
        let transferred = unsafe { usbdevfs_bulk(self.fd(), &mut bulk_desc as *mut _)? };
        Ok(transferred as usize)
    }

    pub fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if request_type & 0x80 == 0 {
            return Err(Error::InvalidEndpoint);
        }
        let mut desc = ControlTransfer {
            request_type,
            request,
            value,
            index,
            length: buf.len() as u16,
            timeout: timeout.as_millis() as u32,
            data: buf.as_mut_ptr() as *mut c_void,
        };
        let transferred = unsafe { usbdevfs_control(self.fd(), &mut desc as *mut _)? };
        Ok(transferred as usize)
    }

    /// Reads string descriptor `index` in the device's first language,
    /// decoded to NUL terminated ASCII. Index 0 yields an empty string.
    pub fn string_descriptor_ascii(&self, index: u8, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Err(Error::InvalidParam);
        }
        if index == 0 {
            out[0] = 0;
            return Ok(0);
        }
        let mut raw = [0u8; 255];
        let len = self.get_string_descriptor(0, 0, &mut raw)?;
        let language = *parse_language_ids(&raw[..len])?
            .first()
            .ok_or(Error::NotFound)?;
        let len = self.get_string_descriptor(index, language, &mut raw)?;
        Ok(decode_string_ascii(&raw[..len], out)?)
    }

    fn get_string_descriptor(&self, index: u8, language: u16, buf: &mut [u8]) -> Result<usize> {
        self.read_control(
            REQUEST_TYPE_STANDARD_DEVICE_IN,
            REQUEST_GET_DESCRIPTOR,
            (DESCRIPTOR_TYPE_STRING as u16) << 8 | index as u16,
            language,
            buf,
            CONTROL_TIMEOUT,
        )
    }
}

/// Device nodes of every attached device with the given ids, in bus order.
pub fn find_devices(vid: u16, pid: u16) -> Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    for device_path in std::fs::read_dir("/sys/bus/usb/devices/")? {
        let device_path = device_path?.path();
        // Interfaces live in the same directory and have none of these
        if let (Some(dev_vid), Some(dev_pid), Some(busnum), Some(devnum)) = (
            read_attribute(&device_path, "idVendor", 16),
            read_attribute(&device_path, "idProduct", 16),
            read_attribute(&device_path, "busnum", 10),
            read_attribute(&device_path, "devnum", 10),
        ) {
            if dev_vid == vid as u32 && dev_pid == pid as u32 {
                result.push(PathBuf::from(format!(
                    "/dev/bus/usb/{busnum:03}/{devnum:03}"
                )));
            }
        }
    }
    result.sort();
    Ok(result)
}

fn read_attribute(device_path: &Path, name: &str, radix: u32) -> Option<u32> {
    let raw = std::fs::read_to_string(device_path.join(name)).ok()?;
    u32::from_str_radix(raw.trim(), radix).ok()
}

/// [`Driver`] implementation talking to the device through usbfs.
#[derive(Debug)]
pub struct UsbfsDriver {
    vendor_id: u16,
    product_id: u16,
    session: Option<UsbDevice>,
}

impl Default for UsbfsDriver {
    fn default() -> Self {
        Self::new(VENDOR_ID, PRODUCT_ID)
    }
}

impl UsbfsDriver {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            session: None,
        }
    }

    fn read_info(device: &UsbDevice) -> Result<DeviceInfo> {
        let (manufacturer, product, serial) = {
            let desc = device.descriptor()?;
            (desc.iManufacturer, desc.iProduct, desc.iSerialNumber)
        };
        let mut info = DeviceInfo::default();
        // Only the serial is required, the rest is informational
        if let Err(e) = device.string_descriptor_ascii(manufacturer, info.manufacturer_mut()) {
            warn!("Failed to read manufacturer: {}", crate::error_name(e.code()));
        }
        if let Err(e) = device.string_descriptor_ascii(product, info.product_mut()) {
            warn!("Failed to read product: {}", crate::error_name(e.code()));
        }
        device.string_descriptor_ascii(serial, info.serial_mut())?;
        Ok(info)
    }

    fn send_command(device: &UsbDevice, command: u8) -> Result<usize> {
        device.write_bulk(COMMAND_ENDPOINT, &[command], COMMAND_TIMEOUT)
    }

    fn start_session(&mut self, device: UsbDevice) -> Result<()> {
        device.set_configuration(CONFIGURATION)?;
        device.claim_interface(INTERFACE)?;
        self.send_open(device)
    }

    /// Makes `device` the session and starts it. A rejected open command
    /// closes the session again.
    fn send_open(&mut self, device: UsbDevice) -> Result<()> {
        debug!("Sending open command");
        let device = self.session.insert(device);
        match Self::send_command(device, COMMAND_OPEN) {
            Ok(transferred) => {
                info!("Device opened (transferred {transferred} bytes)");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to send open command: {}", crate::error_name(e.code()));
                let _ = self.close();
                Err(e)
            }
        }
    }
}

impl Driver for UsbfsDriver {
    fn scan(&mut self, devices: &mut [DeviceInfo]) -> Result<usize> {
        if devices.is_empty() {
            return Err(Error::InvalidParam);
        }
        let paths = find_devices(self.vendor_id, self.product_id)?;
        debug!("Found {} matching device nodes", paths.len());
        let mut found = 0;
        for path in paths {
            if found == devices.len() {
                break;
            }
            let device = match UsbDevice::open(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        "{}: cannot open device: {}",
                        path.display(),
                        crate::error_name(e.code())
                    );
                    continue;
                }
            };
            match Self::read_info(&device) {
                Ok(info) => {
                    devices[found] = info;
                    found += 1;
                }
                Err(e) => warn!(
                    "{}: failed to read serial: {}",
                    path.display(),
                    crate::error_name(e.code())
                ),
            }
        }
        if found == 0 {
            info!("No matching devices found");
            return Err(Error::NotFound);
        }
        info!("Found {found} matching device(s)");
        Ok(found)
    }

    fn open(&mut self, serial: &[u8]) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::Busy);
        }
        for path in find_devices(self.vendor_id, self.product_id)? {
            let Ok(device) = UsbDevice::open(&path) else {
                continue;
            };
            let mut candidate = DeviceInfo::default();
            let Ok(index) = device.descriptor().map(|d| d.iSerialNumber) else {
                continue;
            };
            if device
                .string_descriptor_ascii(index, candidate.serial_mut())
                .is_err()
            {
                continue;
            }
            if candidate.serial() == serial {
                info!("Opening device with S/N: {}", candidate.serial_text());
                return self.start_session(device);
            }
        }
        info!("Target device not found");
        Err(Error::NotFound)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let device = self.session.as_ref().ok_or(Error::NotOpen)?;
        device.read_bulk(DATA_ENDPOINT, buf, READ_TIMEOUT)
    }

    fn close(&mut self) -> Result<()> {
        let device = self.session.take().ok_or(Error::NotFound)?;
        debug!("Sending close command");
        let result = Self::send_command(&device, COMMAND_CLOSE);
        match &result {
            Ok(transferred) => info!("Device closed (transferred {transferred} bytes)"),
            Err(e) => warn!("Failed to send close command: {}", crate::error_name(e.code())),
        }
        if let Err(e) = device.release_interface(INTERFACE) {
            debug!("Failed to release interface: {e}");
        }
        result.map(|_| ())
    }
}

impl Drop for UsbfsDriver {
    fn drop(&mut self) {
        if let Some(device) = self.session.take() {
            let _ = device.release_interface(INTERFACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_calls_without_open_device() {
        let mut driver = UsbfsDriver::default();
        let mut buf = [0u8; 64];
        assert_eq!(driver.read(&mut buf).unwrap_err().code(), crate::code::NO_DEVICE);
        assert_eq!(driver.close().unwrap_err().code(), crate::code::NOT_FOUND);
    }

    #[test]
    fn scan_needs_room() {
        let mut driver = UsbfsDriver::default();
        assert_eq!(
            driver.scan(&mut []).unwrap_err().code(),
            crate::code::INVALID_PARAM
        );
    }

    #[test]
    fn endpoint_direction_is_checked() {
        let device = UsbDevice::new(null_device());
        let mut buf = [0u8; 4];
        assert!(matches!(
            device.read_bulk(COMMAND_ENDPOINT, &mut buf, READ_TIMEOUT),
            Err(Error::InvalidEndpoint)
        ));
        assert!(matches!(
            device.write_bulk(DATA_ENDPOINT, &buf, READ_TIMEOUT),
            Err(Error::InvalidEndpoint)
        ));
    }

    #[test]
    fn second_open_is_busy() {
        let mut driver = UsbfsDriver::default();
        driver.session = Some(UsbDevice::new(null_device()));
        assert_eq!(driver.open(b"ABC123").unwrap_err().code(), crate::code::BUSY);
        assert!(driver.session.is_some());
    }

    #[test]
    fn rejected_open_command_closes_the_session() {
        let mut driver = UsbfsDriver::default();
        // Bulk transfers on /dev/null fail with ENOTTY
        let err = driver.send_open(UsbDevice::new(null_device())).unwrap_err();
        assert_eq!(err.code(), crate::code::IO);
        assert!(driver.session.is_none());
        assert_eq!(driver.close().unwrap_err().code(), crate::code::NOT_FOUND);
    }

    #[test]
    fn failed_close_command_still_ends_the_session() {
        let mut driver = UsbfsDriver::default();
        driver.session = Some(UsbDevice::new(null_device()));
        assert_eq!(driver.close().unwrap_err().code(), crate::code::IO);
        assert!(driver.session.is_none());
        assert_eq!(driver.close().unwrap_err().code(), crate::code::NOT_FOUND);
    }

    fn null_device() -> File {
        File::open("/dev/null").unwrap()
    }
}
