//! SDO (Service Data Object) protocol: abort codes, command specifiers and
//! the state alphabet shared by the client and server state machines.

pub mod client;
mod crc;
mod fifo;
pub mod server;

pub use client::{SdoClient, TransferStatus};
pub use crc::CrcCcitt;
pub use fifo::Fifo;
pub use server::SdoServer;

use core::fmt;

/// Default per-state timeout for SDO transfers, in microseconds.
pub const SDO_DEFAULT_TIMEOUT_US: u64 = 1_000_000;
/// Number of data bytes carried by one segmented-transfer frame.
pub const SDO_SEGMENT_DATA: usize = 7;
/// Largest block size a peer may advertise (CiA 301, Section 7.2.4.3.9).
pub const SDO_BLOCK_MAX_SIZE: u8 = 127;

// --- Command specifiers, byte 0 bits 5..=7 (CiA 301, Section 7.2.4.3) ---

/// Client command specifiers.
pub mod ccs {
    pub const DOWNLOAD_SEGMENT: u8 = 0;
    pub const DOWNLOAD_INITIATE: u8 = 1;
    pub const UPLOAD_INITIATE: u8 = 2;
    pub const UPLOAD_SEGMENT: u8 = 3;
    pub const ABORT: u8 = 4;
    pub const BLOCK_UPLOAD: u8 = 5;
    pub const BLOCK_DOWNLOAD: u8 = 6;
}

/// Server command specifiers.
pub mod scs {
    pub const UPLOAD_SEGMENT: u8 = 0;
    pub const DOWNLOAD_SEGMENT: u8 = 1;
    pub const UPLOAD_INITIATE: u8 = 2;
    pub const DOWNLOAD_INITIATE: u8 = 3;
    pub const ABORT: u8 = 4;
    pub const BLOCK_DOWNLOAD: u8 = 5;
    pub const BLOCK_UPLOAD: u8 = 6;
}

/// Byte 0 of every abort frame.
pub const CS_ABORT: u8 = 0x80;

/// The SDO abort codes of CiA 301, Table 22.
///
/// `Unknown` preserves codes outside the table verbatim so they survive a
/// round trip through the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoAbortCode {
    ToggleBit,
    Timeout,
    CommandSpecifier,
    BlockSize,
    SequenceNumber,
    Crc,
    OutOfMemory,
    UnsupportedAccess,
    WriteOnly,
    ReadOnly,
    ObjectNotExist,
    NoMapping,
    MappingLength,
    ParameterIncompat,
    DeviceIncompat,
    Hardware,
    TypeMismatch,
    DataLong,
    DataShort,
    SubNotExist,
    InvalidValue,
    ValueHigh,
    ValueLow,
    MaxLessMin,
    NoResource,
    General,
    DataTransfer,
    DataLocalControl,
    DataDeviceState,
    OdMissing,
    NoData,
    Unknown(u32),
}

impl SdoAbortCode {
    /// The 32-bit code word as transmitted in bytes 4..8 of an abort frame.
    pub fn code(&self) -> u32 {
        match self {
            Self::ToggleBit => 0x0503_0000,
            Self::Timeout => 0x0504_0000,
            Self::CommandSpecifier => 0x0504_0001,
            Self::BlockSize => 0x0504_0002,
            Self::SequenceNumber => 0x0504_0003,
            Self::Crc => 0x0504_0004,
            Self::OutOfMemory => 0x0504_0005,
            Self::UnsupportedAccess => 0x0601_0000,
            Self::WriteOnly => 0x0601_0001,
            Self::ReadOnly => 0x0601_0002,
            Self::ObjectNotExist => 0x0602_0000,
            Self::NoMapping => 0x0604_0041,
            Self::MappingLength => 0x0604_0042,
            Self::ParameterIncompat => 0x0604_0043,
            Self::DeviceIncompat => 0x0604_0047,
            Self::Hardware => 0x0606_0000,
            Self::TypeMismatch => 0x0607_0010,
            Self::DataLong => 0x0607_0012,
            Self::DataShort => 0x0607_0013,
            Self::SubNotExist => 0x0609_0011,
            Self::InvalidValue => 0x0609_0030,
            Self::ValueHigh => 0x0609_0031,
            Self::ValueLow => 0x0609_0032,
            Self::MaxLessMin => 0x0609_0036,
            Self::NoResource => 0x060A_0023,
            Self::General => 0x0800_0000,
            Self::DataTransfer => 0x0800_0020,
            Self::DataLocalControl => 0x0800_0021,
            Self::DataDeviceState => 0x0800_0022,
            Self::OdMissing => 0x0800_0023,
            Self::NoData => 0x0800_0024,
            Self::Unknown(code) => *code,
        }
    }
}

impl From<u32> for SdoAbortCode {
    fn from(code: u32) -> Self {
        match code {
            0x0503_0000 => Self::ToggleBit,
            0x0504_0000 => Self::Timeout,
            0x0504_0001 => Self::CommandSpecifier,
            0x0504_0002 => Self::BlockSize,
            0x0504_0003 => Self::SequenceNumber,
            0x0504_0004 => Self::Crc,
            0x0504_0005 => Self::OutOfMemory,
            0x0601_0000 => Self::UnsupportedAccess,
            0x0601_0001 => Self::WriteOnly,
            0x0601_0002 => Self::ReadOnly,
            0x0602_0000 => Self::ObjectNotExist,
            0x0604_0041 => Self::NoMapping,
            0x0604_0042 => Self::MappingLength,
            0x0604_0043 => Self::ParameterIncompat,
            0x0604_0047 => Self::DeviceIncompat,
            0x0606_0000 => Self::Hardware,
            0x0607_0010 => Self::TypeMismatch,
            0x0607_0012 => Self::DataLong,
            0x0607_0013 => Self::DataShort,
            0x0609_0011 => Self::SubNotExist,
            0x0609_0030 => Self::InvalidValue,
            0x0609_0031 => Self::ValueHigh,
            0x0609_0032 => Self::ValueLow,
            0x0609_0036 => Self::MaxLessMin,
            0x060A_0023 => Self::NoResource,
            0x0800_0000 => Self::General,
            0x0800_0020 => Self::DataTransfer,
            0x0800_0021 => Self::DataLocalControl,
            0x0800_0022 => Self::DataDeviceState,
            0x0800_0023 => Self::OdMissing,
            0x0800_0024 => Self::NoData,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for SdoAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ToggleBit => "Toggle bit not alternated",
            Self::Timeout => "SDO protocol timed out",
            Self::CommandSpecifier => "Command specifier not valid or unknown",
            Self::BlockSize => "Invalid block size",
            Self::SequenceNumber => "Invalid block sequence number",
            Self::Crc => "CRC error",
            Self::OutOfMemory => "Out of memory",
            Self::UnsupportedAccess => "Unsupported access to an object",
            Self::WriteOnly => "Attempt to read a write only object",
            Self::ReadOnly => "Attempt to write a read only object",
            Self::ObjectNotExist => "Object does not exist in the object dictionary",
            Self::NoMapping => "Object cannot be mapped to the PDO",
            Self::MappingLength => "Mapped objects would exceed PDO length",
            Self::ParameterIncompat => "General parameter incompatibility",
            Self::DeviceIncompat => "General internal incompatibility in the device",
            Self::Hardware => "Access failed due to a hardware error",
            Self::TypeMismatch => "Data type does not match, length does not match",
            Self::DataLong => "Length of service parameter too high",
            Self::DataShort => "Length of service parameter too low",
            Self::SubNotExist => "Sub-index does not exist",
            Self::InvalidValue => "Invalid value for parameter",
            Self::ValueHigh => "Value of parameter written too high",
            Self::ValueLow => "Value of parameter written too low",
            Self::MaxLessMin => "Maximum value is less than minimum value",
            Self::NoResource => "Resource not available",
            Self::General => "General error",
            Self::DataTransfer => "Data cannot be transferred or stored",
            Self::DataLocalControl => "Data cannot be stored due to local control",
            Self::DataDeviceState => "Data cannot be stored due to device state",
            Self::OdMissing => "Object dictionary not present",
            Self::NoData => "No data available",
            Self::Unknown(_) => "Unknown abort code",
        };
        write!(f, "{} ({:#010X})", text, self.code())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SdoAbortCode {}

/// Builds the 8-byte abort frame payload for the given multiplexer.
pub(crate) fn abort_payload(index: u16, sub_index: u8, code: SdoAbortCode) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = CS_ABORT;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub_index;
    data[4..8].copy_from_slice(&code.code().to_le_bytes());
    data
}

/// The states an SDO endpoint can occupy. Client and server share the
/// alphabet; each machine only ever visits the subset that belongs to its
/// role. Any frame not accepted by the current state aborts the transfer
/// with `CommandSpecifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdoState {
    #[default]
    Idle,
    Abort,
    DownloadLocalTransfer,
    DownloadInitiateReq,
    DownloadInitiateRsp,
    DownloadSegmentReq,
    DownloadSegmentRsp,
    UploadLocalTransfer,
    UploadInitiateReq,
    UploadInitiateRsp,
    UploadSegmentReq,
    UploadSegmentRsp,
    DownloadBlkInitiateReq,
    DownloadBlkInitiateRsp,
    DownloadBlkSubblockReq,
    DownloadBlkSubblockRsp,
    DownloadBlkEndReq,
    DownloadBlkEndRsp,
    UploadBlkInitiateReq,
    UploadBlkInitiateRsp,
    UploadBlkInitiateReq2,
    UploadBlkSubblockSreq,
    UploadBlkSubblockCrsp,
    UploadBlkEndSreq,
    UploadBlkEndCrsp,
}

impl SdoState {
    /// True while any transfer (in either direction) is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, SdoState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_code_roundtrip() {
        for code in [
            SdoAbortCode::ToggleBit,
            SdoAbortCode::Timeout,
            SdoAbortCode::Crc,
            SdoAbortCode::ReadOnly,
            SdoAbortCode::ObjectNotExist,
            SdoAbortCode::NoData,
        ] {
            assert_eq!(SdoAbortCode::from(code.code()), code);
        }
        assert_eq!(
            SdoAbortCode::from(0x1234_5678),
            SdoAbortCode::Unknown(0x1234_5678)
        );
        assert_eq!(SdoAbortCode::Unknown(0x1234_5678).code(), 0x1234_5678);
    }

    #[test]
    fn test_abort_payload_layout() {
        let data = abort_payload(0x2003, 0x01, SdoAbortCode::ToggleBit);
        assert_eq!(data[0], 0x80);
        assert_eq!(u16::from_le_bytes([data[1], data[2]]), 0x2003);
        assert_eq!(data[3], 0x01);
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 0x0503_0000);
    }
}
