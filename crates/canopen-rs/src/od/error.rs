use crate::sdo::SdoAbortCode;
use core::fmt;

/// Result codes of Object Dictionary accesses.
///
/// Every variant maps deterministically onto an SDO abort code so that local
/// failures can be surfaced to a remote peer verbatim; the mapping is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdError {
    /// The access succeeded but more data remains; the stream offset has been
    /// advanced and the caller's buffer was completely used.
    Partial,
    OutOfMem,
    UnsupportedAccess,
    WriteOnly,
    ReadOnly,
    IdxNotExist,
    NoMap,
    MapLen,
    ParIncompat,
    DevIncompat,
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
}

impl OdError {
    /// Maps the error onto the CiA 301 SDO abort code. `Partial` is not an
    /// abort condition; if it ever escapes to the wire it degrades to the
    /// general error, and anything unmapped would report `DeviceIncompat`.
    pub fn abort_code(&self) -> SdoAbortCode {
        match self {
            Self::Partial => SdoAbortCode::General,
            Self::OutOfMem => SdoAbortCode::OutOfMemory,
            Self::UnsupportedAccess => SdoAbortCode::UnsupportedAccess,
            Self::WriteOnly => SdoAbortCode::WriteOnly,
            Self::ReadOnly => SdoAbortCode::ReadOnly,
            Self::IdxNotExist => SdoAbortCode::ObjectNotExist,
            Self::NoMap => SdoAbortCode::NoMapping,
            Self::MapLen => SdoAbortCode::MappingLength,
            Self::ParIncompat => SdoAbortCode::ParameterIncompat,
            Self::DevIncompat => SdoAbortCode::DeviceIncompat,
            Self::Hardware => SdoAbortCode::Hardware,
            Self::TypeMismatch => SdoAbortCode::TypeMismatch,
            Self::DataLong => SdoAbortCode::DataLong,
            Self::DataShort => SdoAbortCode::DataShort,
            Self::SubNotExist => SdoAbortCode::SubNotExist,
            Self::InvalidValue => SdoAbortCode::InvalidValue,
            Self::ValueHigh => SdoAbortCode::ValueHigh,
            Self::ValueLow => SdoAbortCode::ValueLow,
            Self::MaxLessMin => SdoAbortCode::MaxLessMin,
            Self::NoResource => SdoAbortCode::NoResource,
            Self::General => SdoAbortCode::General,
            Self::DataTransfer => SdoAbortCode::DataTransfer,
            Self::DataLocalControl => SdoAbortCode::DataLocalControl,
            Self::DataDeviceState => SdoAbortCode::DataDeviceState,
            Self::OdMissing => SdoAbortCode::OdMissing,
            Self::NoData => SdoAbortCode::NoData,
        }
    }
}

impl fmt::Display for OdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Partial => "Partial transfer, more data pending",
            Self::OutOfMem => "Out of memory",
            Self::UnsupportedAccess => "Unsupported access to an object",
            Self::WriteOnly => "Object is write only",
            Self::ReadOnly => "Object is read only",
            Self::IdxNotExist => "Object does not exist",
            Self::NoMap => "Object cannot be mapped to the PDO",
            Self::MapLen => "Mapped objects exceed PDO length",
            Self::ParIncompat => "Parameter incompatibility",
            Self::DevIncompat => "Device incompatibility",
            Self::Hardware => "Hardware error",
            Self::TypeMismatch => "Data type length does not match",
            Self::DataLong => "Data length too high",
            Self::DataShort => "Data length too low",
            Self::SubNotExist => "Sub-index does not exist",
            Self::InvalidValue => "Invalid value",
            Self::ValueHigh => "Value too high",
            Self::ValueLow => "Value too low",
            Self::MaxLessMin => "Maximum less than minimum",
            Self::NoResource => "Resource not available",
            Self::General => "General error",
            Self::DataTransfer => "Data cannot be transferred",
            Self::DataLocalControl => "Data refused due to local control",
            Self::DataDeviceState => "Data refused due to device state",
            Self::OdMissing => "Object dictionary not present",
            Self::NoData => "No data available",
        };
        write!(f, "{}", text)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for OdError {}
