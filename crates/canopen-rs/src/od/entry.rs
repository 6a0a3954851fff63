use super::error::OdError;
use super::stream::{Stream, StreamAccess, Streamer};
use crate::types::DataType;
use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Access attribute flags of a sub-object, as a type-safe bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes(pub u16);

impl Attributes {
    /// Readable via SDO.
    pub const SDO_R: Self = Self(1 << 0);
    /// Writable via SDO.
    pub const SDO_W: Self = Self(1 << 1);
    /// Readable and writable via SDO.
    pub const SDO_RW: Self = Self(1 << 0 | 1 << 1);
    /// Mappable into a TPDO.
    pub const TPDO: Self = Self(1 << 2);
    /// Mappable into an RPDO.
    pub const RPDO: Self = Self(1 << 3);
    /// Mappable into either PDO direction.
    pub const TRPDO: Self = Self(1 << 2 | 1 << 3);
    /// Multi-byte value, little-endian on the wire.
    pub const MB: Self = Self(1 << 4);
    /// Variable-length value (strings); shorter writes are accepted.
    pub const STR: Self = Self(1 << 5);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for Attributes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Object type tag of an entry (CiA 301, Table 42 object codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Domain = 0x02,
    Var = 0x07,
    Array = 0x08,
    Record = 0x09,
}

/// One typed sub-object: the unit of storage and access in the dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Current value, little-endian for multi-byte integers.
    pub value: Vec<u8>,
    /// Default value; also fixes the storage capacity for strings.
    pub default: Vec<u8>,
    pub data_type: DataType,
    pub attributes: Attributes,
    /// Lower limit, encoded like the value. Numeric types only.
    pub low_limit: Option<Vec<u8>>,
    /// Upper limit, encoded like the value. Numeric types only.
    pub high_limit: Option<Vec<u8>>,
    pub index: u16,
    pub sub_index: u8,
}

impl Variable {
    /// Creates a sub-object from a raw default. Multi-byte and string
    /// attribute bits are derived from the data type.
    pub fn new(
        index: u16,
        sub_index: u8,
        data_type: DataType,
        mut attributes: Attributes,
        default: &[u8],
    ) -> Self {
        match data_type.fixed_size() {
            Some(size) if size > 1 => attributes.insert(Attributes::MB),
            None if data_type != DataType::Domain => attributes.insert(Attributes::STR),
            _ => {}
        }
        Self {
            value: default.to_vec(),
            default: default.to_vec(),
            data_type,
            attributes,
            low_limit: None,
            high_limit: None,
            index,
            sub_index,
        }
    }

    pub fn boolean(index: u16, sub_index: u8, attributes: Attributes, value: bool) -> Self {
        Self::new(index, sub_index, DataType::Boolean, attributes, &[value as u8])
    }

    pub fn unsigned8(index: u16, sub_index: u8, attributes: Attributes, value: u8) -> Self {
        Self::new(index, sub_index, DataType::Unsigned8, attributes, &value.to_le_bytes())
    }

    pub fn unsigned16(index: u16, sub_index: u8, attributes: Attributes, value: u16) -> Self {
        Self::new(index, sub_index, DataType::Unsigned16, attributes, &value.to_le_bytes())
    }

    pub fn unsigned32(index: u16, sub_index: u8, attributes: Attributes, value: u32) -> Self {
        Self::new(index, sub_index, DataType::Unsigned32, attributes, &value.to_le_bytes())
    }

    pub fn unsigned64(index: u16, sub_index: u8, attributes: Attributes, value: u64) -> Self {
        Self::new(index, sub_index, DataType::Unsigned64, attributes, &value.to_le_bytes())
    }

    pub fn integer8(index: u16, sub_index: u8, attributes: Attributes, value: i8) -> Self {
        Self::new(index, sub_index, DataType::Integer8, attributes, &value.to_le_bytes())
    }

    pub fn integer16(index: u16, sub_index: u8, attributes: Attributes, value: i16) -> Self {
        Self::new(index, sub_index, DataType::Integer16, attributes, &value.to_le_bytes())
    }

    pub fn integer32(index: u16, sub_index: u8, attributes: Attributes, value: i32) -> Self {
        Self::new(index, sub_index, DataType::Integer32, attributes, &value.to_le_bytes())
    }

    pub fn real32(index: u16, sub_index: u8, attributes: Attributes, value: f32) -> Self {
        Self::new(index, sub_index, DataType::Real32, attributes, &value.to_le_bytes())
    }

    pub fn visible_string(index: u16, sub_index: u8, attributes: Attributes, value: &str) -> Self {
        Self::new(index, sub_index, DataType::VisibleString, attributes, value.as_bytes())
    }

    pub fn octet_string(index: u16, sub_index: u8, attributes: Attributes, value: &[u8]) -> Self {
        Self::new(index, sub_index, DataType::OctetString, attributes, value)
    }

    pub fn domain(index: u16, sub_index: u8, attributes: Attributes) -> Self {
        Self::new(index, sub_index, DataType::Domain, attributes, &[])
    }

    /// Maximum number of bytes the storage may hold.
    pub fn capacity(&self) -> usize {
        self.default.len().max(self.value.len())
    }
}

/// Ordered sequence of sub-objects backing ARRAY and RECORD entries.
///
/// Sub-index 0 is always present: for an array it is an UNSIGNED8 holding the
/// element count, for a record the highest supported sub-index. Sub-index 0
/// is authoritative when enumerating an entry (`sub_count`); structural
/// access to individual members is independent of it, so configuration
/// records (PDO mapping) stay writable while their valid-count is lowered.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableList {
    variables: Vec<Variable>,
}

impl VariableList {
    fn highest_sub(&self) -> u8 {
        self.variables
            .first()
            .and_then(|v| v.value.first().copied())
            .unwrap_or(0)
    }

    pub fn find(&self, sub_index: u8) -> Option<&Variable> {
        self.variables.iter().find(|v| v.sub_index == sub_index)
    }

    pub fn find_mut(&mut self, sub_index: u8) -> Option<&mut Variable> {
        self.variables.iter_mut().find(|v| v.sub_index == sub_index)
    }

    /// Iterates over the data sub-objects (sub-index 0 excluded).
    pub fn elements(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|v| v.sub_index != 0)
    }
}

/// The contained object of an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectData {
    Variable(Variable),
    List(VariableList),
}

/// Pluggable per-entry access hooks.
///
/// Both methods default to `UnsupportedAccess`, so a handler only supporting
/// one direction implements just that method. Handlers wanting the stock
/// behavior for the other direction can delegate to
/// [`read_default`](super::stream::read_default) /
/// [`write_default`](super::stream::write_default).
pub trait ExtensionHandler {
    fn read(&mut self, stream: &mut Stream<'_>, buf: &mut [u8]) -> Result<usize, OdError> {
        let _ = (stream, buf);
        Err(OdError::UnsupportedAccess)
    }

    fn write(&mut self, stream: &mut Stream<'_>, data: &[u8], last: bool) -> Result<usize, OdError> {
        let _ = (stream, data, last);
        Err(OdError::UnsupportedAccess)
    }
}

/// Number of bytes in the PDO change-flag bitmap (one bit per TPDO 1..=256).
pub const PDO_FLAGS_SIZE: usize = 32;

/// Per-entry extension: optional access hooks plus the PDO change-flag
/// bitmap. A cleared bit means "mapped value changed, transmission pending";
/// the TPDO engine sets the bit back after transmitting.
pub struct Extension {
    pub handler: Option<Box<dyn ExtensionHandler + Send>>,
    pub flags: [u8; PDO_FLAGS_SIZE],
}

impl Extension {
    fn new(handler: Option<Box<dyn ExtensionHandler + Send>>) -> Self {
        Self {
            handler,
            flags: [0xFF; PDO_FLAGS_SIZE],
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field(
                "handler",
                &if self.handler.is_some() { "Some(<hooks>)" } else { "None" },
            )
            .field("flags", &self.flags)
            .finish()
    }
}

/// A complete dictionary entry: the object data plus its metadata, optional
/// extension and the sub-index name map.
pub struct Entry {
    pub index: u16,
    pub name: String,
    pub object_type: ObjectType,
    pub(super) data: ObjectData,
    extension: Option<Extension>,
    sub_names: BTreeMap<String, u8>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("object_type", &self.object_type)
            .field("extension", &self.extension.is_some())
            .finish()
    }
}

impl Entry {
    /// Creates a VAR (or DOMAIN) entry holding a single sub-object at
    /// sub-index 0.
    pub fn variable(index: u16, name: &str, mut variable: Variable) -> Self {
        variable.index = index;
        variable.sub_index = 0;
        let object_type = if variable.data_type == DataType::Domain {
            ObjectType::Domain
        } else {
            ObjectType::Var
        };
        Self {
            index,
            name: name.to_owned(),
            object_type,
            data: ObjectData::Variable(variable),
            extension: None,
            sub_names: BTreeMap::new(),
        }
    }

    /// Creates an ARRAY entry from homogeneous elements. Sub-index 0 is
    /// generated as the element count.
    pub fn array(index: u16, name: &str, elements: Vec<Variable>) -> Self {
        let mut variables = Vec::with_capacity(elements.len() + 1);
        variables.push(Variable::unsigned8(
            index,
            0,
            Attributes::SDO_R,
            elements.len() as u8,
        ));
        for (i, mut element) in elements.into_iter().enumerate() {
            element.index = index;
            element.sub_index = (i + 1) as u8;
            variables.push(element);
        }
        Self {
            index,
            name: name.to_owned(),
            object_type: ObjectType::Array,
            data: ObjectData::List(VariableList { variables }),
            extension: None,
            sub_names: BTreeMap::new(),
        }
    }

    /// Creates a RECORD entry from (possibly sparse) sub-objects. Sub-index 0
    /// is generated as the highest supported sub-index.
    pub fn record(index: u16, name: &str, mut members: Vec<Variable>) -> Self {
        let highest = members.iter().map(|v| v.sub_index).max().unwrap_or(0);
        for member in members.iter_mut() {
            member.index = index;
        }
        let mut variables = Vec::with_capacity(members.len() + 1);
        variables.push(Variable::unsigned8(index, 0, Attributes::SDO_R, highest));
        variables.extend(members);
        Self {
            index,
            name: name.to_owned(),
            object_type: ObjectType::Record,
            data: ObjectData::List(VariableList { variables }),
            extension: None,
            sub_names: BTreeMap::new(),
        }
    }

    /// Creates a RECORD entry from explicitly supplied sub-objects, including
    /// sub-index 0. Used for configuration records whose sub-index 0 carries
    /// meaning beyond the structural bound (e.g. a PDO mapping valid-count).
    pub fn record_with_sub0(index: u16, name: &str, mut members: Vec<Variable>) -> Self {
        for member in members.iter_mut() {
            member.index = index;
        }
        Self {
            index,
            name: name.to_owned(),
            object_type: ObjectType::Record,
            data: ObjectData::List(VariableList { variables: members }),
            extension: None,
            sub_names: BTreeMap::new(),
        }
    }

    /// Registers a name for a sub-index, enabling string lookup via `sub()`.
    pub fn name_sub(&mut self, name: &str, sub_index: u8) {
        self.sub_names.insert(name.to_owned(), sub_index);
    }

    /// Resolves a sub-index name registered with `name_sub`.
    pub fn sub_index_of(&self, name: &str) -> Option<u8> {
        self.sub_names.get(name).copied()
    }

    /// Returns the typed sub-object at the given sub-index.
    pub fn sub(&self, sub_index: u8) -> Result<&Variable, OdError> {
        match &self.data {
            ObjectData::Variable(v) => {
                if sub_index == 0 {
                    Ok(v)
                } else {
                    Err(OdError::SubNotExist)
                }
            }
            ObjectData::List(list) => list.find(sub_index).ok_or(OdError::SubNotExist),
        }
    }

    /// Mutable variant of [`sub`](Self::sub).
    pub fn sub_mut(&mut self, sub_index: u8) -> Result<&mut Variable, OdError> {
        match &mut self.data {
            ObjectData::Variable(v) => {
                if sub_index == 0 {
                    Ok(v)
                } else {
                    Err(OdError::SubNotExist)
                }
            }
            ObjectData::List(list) => list.find_mut(sub_index).ok_or(OdError::SubNotExist),
        }
    }

    /// Returns the sub-object named `name`.
    pub fn sub_named(&self, name: &str) -> Result<&Variable, OdError> {
        let sub_index = self.sub_index_of(name).ok_or(OdError::SubNotExist)?;
        self.sub(sub_index)
    }

    /// Number of data sub-objects (array/record members, 1 for VAR/DOMAIN).
    pub fn sub_count(&self) -> u8 {
        match &self.data {
            ObjectData::Variable(_) => 1,
            ObjectData::List(list) => list.highest_sub(),
        }
    }

    /// Installs access hooks, replacing any prior extension (including its
    /// PDO flag bitmap).
    pub fn add_extension(&mut self, handler: Box<dyn ExtensionHandler + Send>) {
        self.extension = Some(Extension::new(Some(handler)));
    }

    /// Removes the extension, restoring raw access for every route.
    pub fn remove_extension(&mut self) {
        self.extension = None;
    }

    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// Makes sure an extension exists so the PDO flag bitmap is available,
    /// without installing access hooks.
    pub fn ensure_extension(&mut self) -> &mut Extension {
        self.extension.get_or_insert_with(|| Extension::new(None))
    }

    /// Clears the change flag for every PDO this entry is mapped into,
    /// signalling "value changed, transmission pending". Called from the
    /// application write path.
    pub fn pdo_flags_signal(&mut self) {
        if let Some(ext) = &mut self.extension {
            ext.flags = [0; PDO_FLAGS_SIZE];
        }
    }

    /// True when the change flag for the given TPDO ordinal (0-based) is
    /// cleared, i.e. a transmission is pending.
    pub fn pdo_flag_pending(&self, tpdo: usize) -> bool {
        match &self.extension {
            Some(ext) if tpdo < PDO_FLAGS_SIZE * 8 => {
                ext.flags[tpdo / 8] & (1 << (tpdo % 8)) == 0
            }
            _ => false,
        }
    }

    /// Marks the given TPDO ordinal as transmitted. Called by the TPDO engine
    /// after sending.
    pub fn pdo_flag_acknowledge(&mut self, tpdo: usize) {
        if let Some(ext) = &mut self.extension {
            if tpdo < PDO_FLAGS_SIZE * 8 {
                ext.flags[tpdo / 8] |= 1 << (tpdo % 8);
            }
        }
    }

    /// Restores every sub-object of this entry to its default value.
    pub fn restore_defaults(&mut self) {
        match &mut self.data {
            ObjectData::Variable(v) => v.value = v.default.clone(),
            ObjectData::List(list) => {
                for variable in list.variables.iter_mut() {
                    variable.value = variable.default.clone();
                }
            }
        }
    }

    /// Creates an access cursor over the sub-object at `sub_index`.
    ///
    /// With `origin == true`, or when no extension hooks are installed, the
    /// streamer targets the raw storage through the default reader/writer and
    /// skips the SDO access-attribute checks; otherwise the extension hooks
    /// see the access. DOMAIN sub-objects without an extension are not
    /// accessible at all.
    pub fn streamer(&mut self, sub_index: u8, origin: bool) -> Result<Streamer<'_>, OdError> {
        let Entry {
            data, extension, ..
        } = self;
        let variable = match data {
            ObjectData::Variable(v) => {
                if sub_index != 0 {
                    return Err(OdError::SubNotExist);
                }
                v
            }
            ObjectData::List(list) => list.find_mut(sub_index).ok_or(OdError::SubNotExist)?,
        };
        let has_hooks = extension
            .as_ref()
            .map(|e| e.handler.is_some())
            .unwrap_or(false);
        if variable.data_type == DataType::Domain && !has_hooks {
            return Err(OdError::UnsupportedAccess);
        }
        let capacity = variable.capacity();
        let access = if origin {
            StreamAccess::Raw
        } else {
            match extension.as_mut().and_then(|e| e.handler.as_mut()) {
                Some(handler) => StreamAccess::Extension(handler.as_mut()),
                None => StreamAccess::Raw,
            }
        };
        Ok(Streamer {
            stream: Stream {
                data_length: variable.value.len(),
                capacity,
                attributes: variable.attributes,
                data_type: variable.data_type,
                index: variable.index,
                sub_index,
                low_limit: variable.low_limit.clone(),
                high_limit: variable.high_limit.clone(),
                offset: 0,
                data: &mut variable.value,
            },
            access,
            origin,
        })
    }
}
