//! File notification records
//!
//! The co-processor announces a file deposited in the shared region with a
//! fixed binary record. Two layouts exist in the field:
//!
//! | Layout | Length | Header                                                        | Filename |
//! |--------|--------|---------------------------------------------------------------|----------|
//! | Packed | 13+    | target u8, type u8, flags u8, reserved u16, offset u32, size u32 (native order) | byte 13.. |
//! | Legacy | 256    | target u8, type u8, flags u8, pad u8, reserved u16, offset u32, size u32 (little endian) | byte 14..256 |
//!
//! The packed layout matches the driver's `file_transfer_msg` and is
//! authoritative; the legacy layout is accepted for older firmware.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Length of the packed header
pub const PACKED_HEADER_LEN: usize = 13;

/// Filename field carried after the packed header
pub const FILENAME_FIELD_LEN: usize = 240;

/// Total length of a legacy record
pub const LEGACY_RECORD_LEN: usize = 256;

/// Length of the legacy header
pub const LEGACY_HEADER_LEN: usize = 14;

/// Address of the host on the co-processor link
pub const HOST_ADDR: u8 = 0x55;

/// Message type of a file transfer request (`$`)
pub const MSG_TYPE_FILE_REQ: u8 = 0x24;

/// Which record layout to decode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLayout {
    /// Legacy for exactly 256-byte records, packed otherwise
    #[default]
    Auto,
    Packed,
    Legacy,
}

impl NotificationLayout {
    /// Resolve `Auto` for a record of the given length
    pub fn resolve(self, len: usize) -> NotificationLayout {
        match self {
            NotificationLayout::Auto if len == LEGACY_RECORD_LEN => NotificationLayout::Legacy,
            NotificationLayout::Auto => NotificationLayout::Packed,
            other => other,
        }
    }
}

/// A decoded file notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNotification {
    pub target: u8,
    pub msg_type: u8,
    pub flags: u8,
    pub reserved: u16,
    /// Offset from the base of the shared region
    pub offset: u32,
    /// Byte count
    pub size: u32,
    pub filename: String,
    pub arrived_at: DateTime<Utc>,
}

fn nul_terminated(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn filename_field(name: &str, len: usize) -> Vec<u8> {
    let mut field = vec![0u8; len];
    let bytes = name.as_bytes();
    // Always leave room for the terminating NUL
    let n = bytes.len().min(len.saturating_sub(1));
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

impl FileNotification {
    pub fn new(filename: impl Into<String>, offset: u32, size: u32) -> Self {
        Self {
            target: HOST_ADDR,
            msg_type: MSG_TYPE_FILE_REQ,
            flags: 0,
            reserved: 0,
            offset,
            size,
            filename: filename.into(),
            arrived_at: Utc::now(),
        }
    }

    /// Decode a record read from the notification channel
    pub fn decode(data: &[u8], layout: NotificationLayout) -> LinkResult<Self> {
        match layout.resolve(data.len()) {
            NotificationLayout::Legacy => Self::decode_legacy(data),
            _ => Self::decode_packed(data),
        }
    }

    fn decode_packed(data: &[u8]) -> LinkResult<Self> {
        if data.len() < PACKED_HEADER_LEN {
            return Err(LinkError::notification(format!(
                "record too short: {} bytes (need at least {})",
                data.len(),
                PACKED_HEADER_LEN
            )));
        }

        Ok(Self {
            target: data[0],
            msg_type: data[1],
            flags: data[2],
            reserved: u16::from_ne_bytes([data[3], data[4]]),
            offset: u32::from_ne_bytes([data[5], data[6], data[7], data[8]]),
            size: u32::from_ne_bytes([data[9], data[10], data[11], data[12]]),
            filename: nul_terminated(&data[PACKED_HEADER_LEN..]),
            arrived_at: Utc::now(),
        })
    }

    fn decode_legacy(data: &[u8]) -> LinkResult<Self> {
        if data.len() < LEGACY_RECORD_LEN {
            return Err(LinkError::notification(format!(
                "incomplete legacy record: {} bytes (need {})",
                data.len(),
                LEGACY_RECORD_LEN
            )));
        }

        Ok(Self {
            target: data[0],
            msg_type: data[1],
            flags: data[2],
            reserved: u16::from_le_bytes([data[4], data[5]]),
            offset: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
            size: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
            filename: nul_terminated(&data[LEGACY_HEADER_LEN..LEGACY_RECORD_LEN]),
            arrived_at: Utc::now(),
        })
    }

    /// Encode in the packed layout with a full filename field
    pub fn encode_packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKED_HEADER_LEN + FILENAME_FIELD_LEN);
        out.extend_from_slice(&[self.target, self.msg_type, self.flags]);
        out.extend_from_slice(&self.reserved.to_ne_bytes());
        out.extend_from_slice(&self.offset.to_ne_bytes());
        out.extend_from_slice(&self.size.to_ne_bytes());
        out.extend_from_slice(&filename_field(&self.filename, FILENAME_FIELD_LEN));
        out
    }

    /// Encode in the legacy 256-byte layout
    pub fn encode_legacy(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_RECORD_LEN);
        out.extend_from_slice(&[self.target, self.msg_type, self.flags, 0]);
        out.extend_from_slice(&self.reserved.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&filename_field(&self.filename, LEGACY_RECORD_LEN - LEGACY_HEADER_LEN));
        out
    }

    /// One past the last byte referenced in the shared region
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }

    /// Check the referenced range against the region size
    pub fn validate(&self, region_size: u64) -> LinkResult<()> {
        if self.end() > region_size {
            return Err(LinkError::OutOfBounds {
                offset: u64::from(self.offset),
                size: u64::from(self.size),
                region: region_size,
            });
        }
        if self.filename.is_empty() {
            return Err(LinkError::notification("empty filename"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_decode() {
        let mut record = vec![HOST_ADDR, MSG_TYPE_FILE_REQ, 0x01];
        record.extend_from_slice(&0xBEEFu16.to_ne_bytes());
        record.extend_from_slice(&0x100u32.to_ne_bytes());
        record.extend_from_slice(&1024u32.to_ne_bytes());
        record.extend_from_slice(b"img_0001.raw\0garbage");

        let n = FileNotification::decode(&record, NotificationLayout::Auto).unwrap();
        assert_eq!(n.target, HOST_ADDR);
        assert_eq!(n.flags, 0x01);
        assert_eq!(n.reserved, 0xBEEF);
        assert_eq!(n.offset, 0x100);
        assert_eq!(n.size, 1024);
        assert_eq!(n.filename, "img_0001.raw");
    }

    #[test]
    fn test_driver_sized_record_is_packed() {
        let record = FileNotification::new("a.txt", 8, 16).encode_packed();
        assert_eq!(record.len(), PACKED_HEADER_LEN + FILENAME_FIELD_LEN);
        assert_eq!(NotificationLayout::Auto.resolve(record.len()), NotificationLayout::Packed);

        let n = FileNotification::decode(&record, NotificationLayout::Auto).unwrap();
        assert_eq!((n.offset, n.size, n.filename.as_str()), (8, 16, "a.txt"));
    }

    #[test]
    fn test_legacy_decode() {
        let mut record = vec![0u8; LEGACY_RECORD_LEN];
        record[0] = HOST_ADDR;
        record[1] = MSG_TYPE_FILE_REQ;
        record[6..10].copy_from_slice(&0x2000u32.to_le_bytes());
        record[10..14].copy_from_slice(&512u32.to_le_bytes());
        record[14..21].copy_from_slice(b"log.txt");

        let n = FileNotification::decode(&record, NotificationLayout::Auto).unwrap();
        assert_eq!(n.offset, 0x2000);
        assert_eq!(n.size, 512);
        assert_eq!(n.filename, "log.txt");
        assert_eq!(FileNotification::decode(&n.encode_legacy(), NotificationLayout::Legacy).unwrap().offset, 0x2000);
    }

    #[test]
    fn test_short_records_rejected() {
        assert!(FileNotification::decode(&[0u8; 12], NotificationLayout::Auto).is_err());
        assert!(FileNotification::decode(&[0u8; 100], NotificationLayout::Legacy).is_err());
    }

    #[test]
    fn test_validate_bounds() {
        let n = FileNotification::new("x.bin", 0, 1024);
        assert!(n.validate(2048).is_ok());
        assert!(n.validate(1024).is_ok());
        assert!(matches!(n.validate(512), Err(LinkError::OutOfBounds { region: 512, .. })));

        let wrap = FileNotification::new("y.bin", u32::MAX, u32::MAX);
        assert!(wrap.validate(u64::from(u32::MAX)).is_err());
    }

    #[test]
    fn test_layout_serde() {
        let layout: NotificationLayout = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(layout, NotificationLayout::Legacy);
        assert_eq!(NotificationLayout::default(), NotificationLayout::Auto);
    }
}
