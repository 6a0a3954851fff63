use super::entry::{Attributes, ExtensionHandler};
use super::error::OdError;
use crate::types::DataType;
use alloc::vec::Vec;

/// Access cursor over one sub-object.
///
/// A `Stream` is created fresh for each access sequence by
/// [`Entry::streamer`](super::entry::Entry::streamer); `offset` is nonzero
/// between successive partial reads or writes of the same sequence.
pub struct Stream<'a> {
    /// Backing byte storage of the sub-object.
    pub data: &'a mut Vec<u8>,
    /// Cursor position for partial transfers.
    pub offset: usize,
    /// Declared data length of the current transfer. Starts out as the stored
    /// value length and may be adjusted by [`Streamer::set_write_size`].
    pub data_length: usize,
    /// Maximum number of bytes the backing storage may hold.
    pub capacity: usize,
    /// Access attribute flags of the sub-object.
    pub attributes: Attributes,
    /// Data type of the sub-object.
    pub data_type: DataType,
    /// Index of the owning entry.
    pub index: u16,
    /// Sub-index being accessed.
    pub sub_index: u8,
    /// Lower limit, little-endian encoded in the sub-object's type.
    pub low_limit: Option<Vec<u8>>,
    /// Upper limit, little-endian encoded in the sub-object's type.
    pub high_limit: Option<Vec<u8>>,
}

/// Decoded numeric value used for limit checking.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Numeric {
    Int(i128),
    Float(f64),
}

fn decode_numeric(data_type: DataType, bytes: &[u8]) -> Option<Numeric> {
    let size = data_type.fixed_size()?;
    if bytes.len() != size {
        return None;
    }
    let value = match data_type {
        DataType::Real32 => {
            // Decode through the 32-bit pattern; never widen the raw bytes
            // to 64 bits before reinterpreting.
            let bits = u32::from_le_bytes(bytes.try_into().ok()?);
            Numeric::Float(f32::from_bits(bits) as f64)
        }
        DataType::Real64 => {
            let bits = u64::from_le_bytes(bytes.try_into().ok()?);
            Numeric::Float(f64::from_bits(bits))
        }
        _ => {
            let mut raw = [0u8; 16];
            raw[..size].copy_from_slice(bytes);
            if data_type.is_signed() && bytes[size - 1] & 0x80 != 0 {
                for slot in raw[size..].iter_mut() {
                    *slot = 0xFF;
                }
            }
            Numeric::Int(i128::from_le_bytes(raw))
        }
    };
    Some(value)
}

impl Stream<'_> {
    /// Checks a completed write against the configured low/high limits.
    fn check_limits(&self) -> Result<(), OdError> {
        if self.low_limit.is_none() && self.high_limit.is_none() {
            return Ok(());
        }
        let value = match decode_numeric(self.data_type, &self.data[..self.data_length]) {
            Some(v) => v,
            None => return Ok(()),
        };
        let low = self
            .low_limit
            .as_ref()
            .and_then(|b| decode_numeric(self.data_type, b));
        let high = self
            .high_limit
            .as_ref()
            .and_then(|b| decode_numeric(self.data_type, b));
        if let (Some(lo), Some(hi)) = (low, high) {
            if lo > hi {
                return Err(OdError::MaxLessMin);
            }
        }
        if let Some(lo) = low {
            if value < lo {
                return Err(OdError::ValueLow);
            }
        }
        if let Some(hi) = high {
            if value > hi {
                return Err(OdError::ValueHigh);
            }
        }
        Ok(())
    }
}

/// Default reader: copies `min(data_length - offset, buf.len())` bytes into
/// the caller's buffer. When the destination cannot take all remaining bytes
/// the offset advances and `Partial` is returned; consuming the remainder
/// resets the offset to zero.
pub fn read_default(stream: &mut Stream<'_>, buf: &mut [u8]) -> Result<usize, OdError> {
    if stream.offset > stream.data_length {
        return Err(OdError::General);
    }
    let remaining = stream.data_length - stream.offset;
    let count = remaining.min(buf.len());
    buf[..count].copy_from_slice(&stream.data[stream.offset..stream.offset + count]);
    if count < remaining {
        stream.offset += count;
        Err(OdError::Partial)
    } else {
        stream.offset = 0;
        Ok(count)
    }
}

/// Default writer, symmetric to the reader: partial writes advance the
/// offset; a call that would overflow the backing storage returns `DataLong`.
/// `last` marks the final chunk of a transfer whose total size was not
/// declared up front.
pub fn write_default(stream: &mut Stream<'_>, data: &[u8], last: bool) -> Result<usize, OdError> {
    let end = stream.offset + data.len();
    if end > stream.capacity {
        return Err(OdError::DataLong);
    }
    if stream.data.len() < end {
        stream.data.resize(end, 0);
    }
    stream.data[stream.offset..end].copy_from_slice(data);

    let variable_length = stream.attributes.contains(Attributes::STR)
        || stream.data_type.fixed_size().is_none();
    let complete = if variable_length {
        last || end == stream.data_length
    } else {
        if end > stream.data_length {
            return Err(OdError::DataLong);
        }
        if last && end < stream.data_length {
            return Err(OdError::DataShort);
        }
        end == stream.data_length
    };

    if complete {
        if variable_length {
            stream.data.truncate(end);
            stream.data_length = end;
        }
        stream.check_limits()?;
        stream.offset = 0;
        Ok(data.len())
    } else {
        stream.offset = end;
        Err(OdError::Partial)
    }
}

pub(super) enum StreamAccess<'a> {
    Raw,
    Extension(&'a mut dyn ExtensionHandler),
}

/// A `Stream` bound to its access route: either the raw storage via the
/// default reader/writer, or the entry's extension callbacks.
pub struct Streamer<'a> {
    pub stream: Stream<'a>,
    pub(super) access: StreamAccess<'a>,
    pub(super) origin: bool,
}

impl Streamer<'_> {
    /// Declares the total size of an upcoming write, as indicated by an SDO
    /// initiate frame. Validates against the sub-object's storage.
    pub fn set_write_size(&mut self, total: usize) -> Result<(), OdError> {
        let variable_length = self.stream.attributes.contains(Attributes::STR)
            || self.stream.data_type.fixed_size().is_none();
        if variable_length {
            if total > self.stream.capacity {
                return Err(OdError::DataLong);
            }
        } else {
            if total > self.stream.data_length {
                return Err(OdError::DataLong);
            }
            if total < self.stream.data_length {
                return Err(OdError::DataShort);
            }
        }
        self.stream.data_length = total;
        Ok(())
    }

    /// Declared length of the data this streamer will produce on read.
    pub fn data_length(&self) -> usize {
        self.stream.data_length
    }

    /// Reads the next chunk. `Ok(n)` completes the transfer; `Err(Partial)`
    /// means `buf` was filled entirely and more data remains.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, OdError> {
        if !self.origin && !self.stream.attributes.contains(Attributes::SDO_R) {
            return Err(OdError::WriteOnly);
        }
        match &mut self.access {
            StreamAccess::Raw => read_default(&mut self.stream, buf),
            StreamAccess::Extension(handler) => handler.read(&mut self.stream, buf),
        }
    }

    /// Writes the next chunk. `last` marks the final chunk of the transfer.
    /// `Ok(n)` completes the transfer; `Err(Partial)` means the chunk was
    /// consumed and more data is expected.
    pub fn write(&mut self, data: &[u8], last: bool) -> Result<usize, OdError> {
        if !self.origin && !self.stream.attributes.contains(Attributes::SDO_W) {
            return Err(OdError::ReadOnly);
        }
        match &mut self.access {
            StreamAccess::Raw => write_default(&mut self.stream, data, last),
            StreamAccess::Extension(handler) => handler.write(&mut self.stream, data, last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::entry::{Entry, Variable};

    fn u32_entry(value: u32) -> Entry {
        Entry::variable(
            0x2000,
            "test",
            Variable::unsigned32(0x2000, 0, Attributes::SDO_RW, value),
        )
    }

    #[test]
    fn test_read_complete() {
        let mut entry = u32_entry(0xAABBCCDD);
        let mut streamer = entry.streamer(0, true).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(streamer.read(&mut buf), Ok(4));
        assert_eq!(&buf[..4], &0xAABBCCDDu32.to_le_bytes());
    }

    #[test]
    fn test_partial_read_resumes() {
        let mut entry = Entry::variable(
            0x2001,
            "blob",
            Variable::octet_string(0x2001, 0, Attributes::SDO_RW, b"0123456789"),
        );
        let mut streamer = entry.streamer(0, true).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(streamer.read(&mut buf), Err(OdError::Partial));
        assert_eq!(&buf, b"0123456");
        assert_eq!(streamer.stream.offset, 7);
        let mut rest = [0u8; 7];
        assert_eq!(streamer.read(&mut rest), Ok(3));
        assert_eq!(&rest[..3], b"789");
        assert_eq!(streamer.stream.offset, 0);
    }

    #[test]
    fn test_write_overflow_is_data_long() {
        let mut entry = u32_entry(0);
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(&[0; 5], true), Err(OdError::DataLong));
    }

    #[test]
    fn test_fixed_write_short_is_data_short() {
        let mut entry = u32_entry(0);
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(&[0; 2], true), Err(OdError::DataShort));
    }

    #[test]
    fn test_string_write_shorter_truncates() {
        let mut entry = Entry::variable(
            0x200B,
            "str",
            Variable::visible_string(0x200B, 0, Attributes::SDO_RW, "defaultdefault"),
        );
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(b"short", true), Ok(5));
        drop(streamer);
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.data_length(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(streamer.read(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"short");
    }

    #[test]
    fn test_access_attributes_enforced_for_remote_route() {
        let mut entry = Entry::variable(
            0x2002,
            "wo",
            Variable::unsigned8(0x2002, 0, Attributes::SDO_W, 1),
        );
        let mut streamer = entry.streamer(0, false).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(streamer.read(&mut buf), Err(OdError::WriteOnly));
        drop(streamer);

        let mut entry = Entry::variable(
            0x2003,
            "ro",
            Variable::unsigned8(0x2003, 0, Attributes::SDO_R, 1),
        );
        let mut streamer = entry.streamer(0, false).unwrap();
        assert_eq!(streamer.write(&[2], true), Err(OdError::ReadOnly));
        // The internal route bypasses the access attributes.
        drop(streamer);
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(&[2], true), Ok(1));
    }

    #[test]
    fn test_limits() {
        let mut var = Variable::unsigned8(0x2004, 0, Attributes::SDO_RW, 10);
        var.low_limit = Some(alloc::vec![5]);
        var.high_limit = Some(alloc::vec![20]);
        let mut entry = Entry::variable(0x2004, "limited", var);

        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(&[4], true), Err(OdError::ValueLow));
        drop(streamer);
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(&[21], true), Err(OdError::ValueHigh));
        drop(streamer);
        let mut streamer = entry.streamer(0, true).unwrap();
        assert_eq!(streamer.write(&[15], true), Ok(1));
    }

    #[test]
    fn test_real32_decodes_through_32bit_pattern() {
        let bytes = 1.5f32.to_le_bytes();
        match decode_numeric(DataType::Real32, &bytes) {
            Some(Numeric::Float(v)) => assert_eq!(v, 1.5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_signed_decode_sign_extends() {
        let bytes = (-5i16).to_le_bytes();
        assert_eq!(
            decode_numeric(DataType::Integer16, &bytes),
            Some(Numeric::Int(-5))
        );
    }
}
