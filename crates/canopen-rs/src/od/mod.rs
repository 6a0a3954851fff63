//! The Object Dictionary: the typed, indexed data model of a node and the
//! contract between application and network.

mod entry;
mod error;
pub mod predefined;
mod stream;

pub use entry::{
    Attributes, Entry, ExtensionHandler, Extension, ObjectData, ObjectType, Variable,
    VariableList, PDO_FLAGS_SIZE,
};
pub use error::OdError;
pub use stream::{read_default, write_default, Stream, Streamer};

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use log::warn;

/// Key used to look up an entry: the 16-bit index or the unique entry name.
#[derive(Debug, Clone, Copy)]
pub enum OdKey<'a> {
    Index(u16),
    Name(&'a str),
}

impl From<u16> for OdKey<'_> {
    fn from(index: u16) -> Self {
        OdKey::Index(index)
    }
}

impl<'a> From<&'a str> for OdKey<'a> {
    fn from(name: &'a str) -> Self {
        OdKey::Name(name)
    }
}

/// The Object Dictionary: entries keyed by 16-bit index, with a secondary
/// unique-name lookup. Structurally stable after node construction; only
/// sub-object values and extensions change afterwards.
#[derive(Debug, Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<u16, Entry>,
    names: BTreeMap<String, u16>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry. Overwriting an existing index is permitted but
    /// logged, since it usually indicates a duplicated EDS definition.
    pub fn add_entry(&mut self, entry: Entry) {
        if let Some(old) = self.entries.get(&entry.index) {
            warn!(
                "[OD] Overwriting entry {:#06X} ({})",
                entry.index, old.name
            );
            self.names.remove(&old.name);
        }
        self.names.insert(entry.name.to_owned(), entry.index);
        self.entries.insert(entry.index, entry);
    }

    /// Looks up an entry by numeric index or by name.
    pub fn index<'a, K: Into<OdKey<'a>>>(&self, key: K) -> Option<&Entry> {
        match key.into() {
            OdKey::Index(index) => self.entries.get(&index),
            OdKey::Name(name) => self
                .names
                .get(name)
                .and_then(|index| self.entries.get(index)),
        }
    }

    /// Mutable entry lookup.
    pub fn index_mut<'a, K: Into<OdKey<'a>>>(&mut self, key: K) -> Option<&mut Entry> {
        match key.into() {
            OdKey::Index(index) => self.entries.get_mut(&index),
            OdKey::Name(name) => match self.names.get(name) {
                Some(index) => self.entries.get_mut(index),
                None => None,
            },
        }
    }

    /// Iterates all entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Required entry lookup, for the internal consumers.
    pub(crate) fn entry_mut(&mut self, index: u16) -> Result<&mut Entry, OdError> {
        self.entries.get_mut(&index).ok_or(OdError::IdxNotExist)
    }

    /// Reads raw bytes from a sub-object through the internal (origin) route.
    /// Returns the number of bytes read; `buf` must hold the whole value.
    pub fn read_raw(&mut self, index: u16, sub_index: u8, buf: &mut [u8]) -> Result<usize, OdError> {
        let entry = self.entry_mut(index)?;
        let mut streamer = entry.streamer(sub_index, true)?;
        streamer.read(buf)
    }

    /// Reads the complete value of a sub-object into a fresh buffer.
    pub fn read_all(&mut self, index: u16, sub_index: u8) -> Result<Vec<u8>, OdError> {
        let entry = self.entry_mut(index)?;
        let mut streamer = entry.streamer(sub_index, true)?;
        let mut out = alloc::vec![0u8; streamer.data_length()];
        let n = streamer.read(&mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Writes raw bytes to a sub-object through the internal (origin) route.
    pub fn write_raw(&mut self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), OdError> {
        let entry = self.entry_mut(index)?;
        let mut streamer = entry.streamer(sub_index, true)?;
        streamer.write(data, true).map(|_| ())
    }

    fn read_exact<const N: usize>(&mut self, index: u16, sub_index: u8) -> Result<[u8; N], OdError> {
        let entry = self.entry_mut(index)?;
        let mut streamer = entry.streamer(sub_index, true)?;
        if streamer.data_length() != N {
            return Err(OdError::TypeMismatch);
        }
        let mut buf = [0u8; N];
        streamer.read(&mut buf)?;
        Ok(buf)
    }

    fn write_exact(&mut self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), OdError> {
        let entry = self.entry_mut(index)?;
        let mut streamer = entry.streamer(sub_index, true)?;
        if streamer.data_length() != data.len() {
            return Err(OdError::TypeMismatch);
        }
        streamer.write(data, true).map(|_| ())
    }

    // --- Typed accessors (internal route, exact length enforced) ---

    pub fn read_u8(&mut self, index: u16, sub_index: u8) -> Result<u8, OdError> {
        self.read_exact::<1>(index, sub_index).map(|b| b[0])
    }

    pub fn read_u16(&mut self, index: u16, sub_index: u8) -> Result<u16, OdError> {
        self.read_exact::<2>(index, sub_index).map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self, index: u16, sub_index: u8) -> Result<u32, OdError> {
        self.read_exact::<4>(index, sub_index).map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self, index: u16, sub_index: u8) -> Result<u64, OdError> {
        self.read_exact::<8>(index, sub_index).map(u64::from_le_bytes)
    }

    pub fn write_u8(&mut self, index: u16, sub_index: u8, value: u8) -> Result<(), OdError> {
        self.write_exact(index, sub_index, &value.to_le_bytes())
    }

    pub fn write_u16(&mut self, index: u16, sub_index: u8, value: u16) -> Result<(), OdError> {
        self.write_exact(index, sub_index, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, index: u16, sub_index: u8, value: u32) -> Result<(), OdError> {
        self.write_exact(index, sub_index, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, index: u16, sub_index: u8, value: u64) -> Result<(), OdError> {
        self.write_exact(index, sub_index, &value.to_le_bytes())
    }

    /// Restores every sub-object to its default value. Used by the NMT
    /// reset-node service.
    pub fn restore_defaults(&mut self) {
        for entry in self.entries.values_mut() {
            entry.restore_defaults();
        }
    }

    /// Application write path: updates a mapped sub-object and signals every
    /// TPDO it is mapped into.
    pub fn write_signalled(&mut self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), OdError> {
        self.write_raw(index, sub_index, data)?;
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.pdo_flags_signal();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn dict_with_u16(index: u16, name: &str, value: u16) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.add_entry(Entry::variable(
            index,
            name,
            Variable::unsigned16(index, 0, Attributes::SDO_RW, value),
        ));
        od
    }

    #[test]
    fn test_lookup_by_index_and_name() {
        let od = dict_with_u16(0x2003, "velocity", 0x4444);
        assert_eq!(od.index(0x2003u16).map(|e| e.index), Some(0x2003));
        assert_eq!(od.index("velocity").map(|e| e.index), Some(0x2003));
        assert!(od.index(0x2004u16).is_none());
        assert!(od.index("missing").is_none());
    }

    #[test]
    fn test_overwrite_replaces_name_mapping() {
        let mut od = dict_with_u16(0x2003, "velocity", 1);
        od.add_entry(Entry::variable(
            0x2003,
            "speed",
            Variable::unsigned16(0x2003, 0, Attributes::SDO_RW, 2),
        ));
        assert!(od.index("velocity").is_none());
        assert_eq!(od.index("speed").map(|e| e.index), Some(0x2003));
    }

    #[test]
    fn test_typed_roundtrip() {
        let mut od = dict_with_u16(0x2003, "v", 0x4444);
        assert_eq!(od.read_u16(0x2003, 0), Ok(0x4444));
        od.write_u16(0x2003, 0, 0x1234).unwrap();
        assert_eq!(od.read_u16(0x2003, 0), Ok(0x1234));
    }

    #[test]
    fn test_typed_width_mismatch() {
        let mut od = dict_with_u16(0x2003, "v", 0x4444);
        assert_eq!(od.read_u32(0x2003, 0), Err(OdError::TypeMismatch));
        assert_eq!(od.write_u8(0x2003, 0, 1), Err(OdError::TypeMismatch));
        assert_eq!(od.read_u16(0x9999, 0), Err(OdError::IdxNotExist));
    }

    #[test]
    fn test_write_signalled_flags_pdos() {
        let mut od = ObjectDictionary::new();
        let mut entry = Entry::variable(
            0x2001,
            "status",
            Variable::unsigned8(0x2001, 0, Attributes::SDO_RW | Attributes::TPDO, 0),
        );
        entry.ensure_extension();
        // Simulate a prior transmission having acknowledged flag 0.
        entry.pdo_flag_acknowledge(0);
        od.add_entry(entry);

        od.write_signalled(0x2001, 0, &[7]).unwrap();
        assert!(od.index(0x2001u16).unwrap().pdo_flag_pending(0));
        assert_eq!(od.read_u8(0x2001, 0), Ok(7));
    }

    #[test]
    fn test_read_all() {
        let mut od = ObjectDictionary::new();
        od.add_entry(Entry::variable(
            0x200B,
            "name",
            Variable::visible_string(0x200B, 0, Attributes::SDO_RW, "hello"),
        ));
        assert_eq!(od.read_all(0x200B, 0), Ok(vec![b'h', b'e', b'l', b'l', b'o']));
    }
}
