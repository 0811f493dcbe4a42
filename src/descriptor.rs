// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::borrow::Cow;

macro_rules! check_size {
    ($t:ty, $s: literal) => {
        const _: () = assert!(std::mem::size_of::<$t>() == $s);
    };
}

/// Capacity of every string field in [`DeviceInfo`].
pub const MAX_STR_LENGTH: usize = 256;

/// Device record filled in by a scan. Layout matches the vendor library's
/// `device_info_t`, so a slice of these can be handed over as-is.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    serial: [u8; MAX_STR_LENGTH],
    manufacturer: [u8; MAX_STR_LENGTH],
    product: [u8; MAX_STR_LENGTH],
}

check_size!(DeviceInfo, 768);

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            serial: [0; MAX_STR_LENGTH],
            manufacturer: [0; MAX_STR_LENGTH],
            product: [0; MAX_STR_LENGTH],
        }
    }
}

impl DeviceInfo {
    /// Builds a record, truncating every field to its capacity.
    pub fn new(serial: &[u8], manufacturer: &[u8], product: &[u8]) -> Self {
        let mut info = Self::default();
        fill(&mut info.serial, serial);
        fill(&mut info.manufacturer, manufacturer);
        fill(&mut info.product, product);
        info
    }

    pub fn serial(&self) -> &[u8] {
        until_nul(&self.serial)
    }

    pub fn manufacturer(&self) -> &[u8] {
        until_nul(&self.manufacturer)
    }

    pub fn product(&self) -> &[u8] {
        until_nul(&self.product)
    }

    pub fn serial_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.serial())
    }

    pub fn manufacturer_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.manufacturer())
    }

    pub fn product_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.product())
    }

    pub(crate) fn serial_mut(&mut self) -> &mut [u8; MAX_STR_LENGTH] {
        &mut self.serial
    }

    pub(crate) fn manufacturer_mut(&mut self) -> &mut [u8; MAX_STR_LENGTH] {
        &mut self.manufacturer
    }

    pub(crate) fn product_mut(&mut self) -> &mut [u8; MAX_STR_LENGTH] {
        &mut self.product
    }
}

fn fill(field: &mut [u8; MAX_STR_LENGTH], value: &[u8]) {
    let len = value.len().min(MAX_STR_LENGTH);
    field[..len].copy_from_slice(&value[..len]);
}

// The driver is not trusted to terminate the field.
fn until_nul(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

#[allow(non_snake_case)]
#[repr(C)]
#[repr(packed)]
#[derive(Debug, Clone)]
pub struct UsbDeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: u16,
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: u16,
    pub idProduct: u16,
    pub bcdDevice: u16,
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

check_size!(UsbDeviceDescriptor, 18);

const DESCRIPTOR_TYPE_DEVICE: u8 = 1;
pub(crate) const DESCRIPTOR_TYPE_STRING: u8 = 3;

impl UsbDeviceDescriptor {
    /// Parses the device descriptor at the start of a usbfs node's contents.
    pub fn from_byte_array(data: &[u8]) -> Result<Self> {
        let size = std::mem::size_of::<Self>();
        if data.len() < size || (data[0] as usize) < size {
            return Err(Error::InvalidSize);
        }
        if data[1] != DESCRIPTOR_TYPE_DEVICE {
            return Err(Error::InvalidType);
        }
        Ok(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }
}

/// Language IDs listed in string descriptor zero.
pub(crate) fn parse_language_ids(data: &[u8]) -> Result<Vec<u16>> {
    let payload = string_payload(data)?;
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Decodes a string descriptor into `out` the way libusb's ascii helper does:
/// code units above 0x7f become `?` and the result is always NUL terminated.
/// Returns the number of characters written.
pub(crate) fn decode_string_ascii(data: &[u8], out: &mut [u8]) -> Result<usize> {
    let payload = string_payload(data)?;
    let Some(room) = out.len().checked_sub(1) else {
        return Err(Error::InvalidSize);
    };
    let mut written = 0;
    for (slot, unit) in out[..room].iter_mut().zip(payload.chunks_exact(2)) {
        let unit = u16::from_le_bytes([unit[0], unit[1]]);
        *slot = if unit < 0x80 { unit as u8 } else { b'?' };
        written += 1;
    }
    out[written] = 0;
    Ok(written)
}

fn string_payload(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 2 {
        return Err(Error::InvalidSize);
    }
    if data[1] != DESCRIPTOR_TYPE_STRING {
        return Err(Error::InvalidType);
    }
    let len = data[0] as usize;
    if len < 2 || len > data.len() {
        return Err(Error::InvalidSize);
    }
    Ok(&data[2..len])
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid size field")]
    InvalidSize,
    #[error("Invalid type")]
    InvalidType,
}
