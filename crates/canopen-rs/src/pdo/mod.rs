//! PDO engine: mapping descriptors, communication-parameter loading and the
//! RPDO/TPDO implementations.

mod rpdo;
mod tpdo;

pub use rpdo::Rpdo;
pub use tpdo::Tpdo;

use crate::od::{Attributes, ObjectDictionary, OdError};
use crate::types::{is_restricted_can_id, COB_ID_FLAG_INVALID, COB_ID_MASK};
use alloc::vec::Vec;
use log::warn;

/// Maximum number of PDOs per direction addressable by the OD layout.
pub const PDO_MAX_COUNT: usize = 512;
/// Maximum payload of a PDO in bits.
pub const PDO_MAX_BITS: u32 = 64;

/// Transmission type values (communication record sub-index 2).
pub mod transmission {
    /// Synchronous acyclic: transmit on the next SYNC after a trigger.
    pub const SYNC_ACYCLIC: u8 = 0;
    /// Highest synchronous cyclic divisor (1..=240: every Nth SYNC).
    pub const SYNC_CYCLIC_MAX: u8 = 240;
    /// Asynchronous, vendor-specific trigger.
    pub const ASYNC_MANUFACTURER: u8 = 254;
    /// Asynchronous, event-driven (device profile default).
    pub const ASYNC_EVENT: u8 = 255;
}

/// Direction of a PDO, from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoDirection {
    Receive,
    Transmit,
}

/// One mapping slot, packed as `(index << 16) | (sub_index << 8) | bits` in
/// the mapping record (CiA 301, Section 7.5.2.35).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMappingEntry {
    pub index: u16,
    pub sub_index: u8,
    pub length_bits: u8,
}

impl PdoMappingEntry {
    pub fn from_u32(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub_index: (raw >> 8) as u8,
            length_bits: raw as u8,
        }
    }

    pub fn to_u32(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub_index as u32) << 8) | self.length_bits as u32
    }

    /// Dummy mapping: a static data-type index used as padding; carries no
    /// object access.
    pub fn is_dummy(&self) -> bool {
        self.index <= 0x000F
    }

    /// Mapped length in whole bytes. The engine maps byte-aligned objects
    /// only; a length that is not a multiple of 8 bits is a mapping fault.
    pub fn byte_length(&self) -> Option<usize> {
        if self.length_bits != 0 && self.length_bits % 8 == 0 {
            Some(self.length_bits as usize / 8)
        } else {
            None
        }
    }
}

/// Configuration shared by both PDO directions, loaded from one communication
/// record and one mapping record.
#[derive(Debug)]
pub struct PdoBase {
    /// COB-ID validity: bit 31 clear and an acceptable identifier.
    pub valid: bool,
    pub cob_id: u32,
    pub transmission_type: u8,
    pub mappings: Vec<PdoMappingEntry>,
    /// Total mapped length in bytes.
    pub data_length: usize,
    /// The mapping record was unusable; the owner reports `EM_WRONG_MAPPING`.
    pub mapping_fault: bool,
}

impl PdoBase {
    /// Loads and validates one PDO's configuration. `pdo_num` is zero-based.
    /// Returns `IdxNotExist` only when the records themselves are absent; a
    /// bad mapping yields a loaded-but-invalid PDO with `mapping_fault` set.
    pub fn from_od(
        od: &mut ObjectDictionary,
        comm_index: u16,
        map_index: u16,
        direction: PdoDirection,
    ) -> Result<Self, OdError> {
        let raw_cob = od.read_u32(comm_index, 1)?;
        let transmission_type = od.read_u8(comm_index, 2)?;
        let mut base = Self {
            valid: raw_cob & COB_ID_FLAG_INVALID == 0,
            cob_id: raw_cob & COB_ID_MASK,
            transmission_type,
            mappings: Vec::new(),
            data_length: 0,
            mapping_fault: false,
        };

        if base.valid && is_restricted_can_id(base.cob_id) {
            warn!(
                "[PDO] COB-ID {:#05X} of {:#06X} is in the restricted set, PDO disabled",
                base.cob_id, comm_index
            );
            base.valid = false;
            base.mapping_fault = true;
            return Ok(base);
        }

        let count = od.read_u8(map_index, 0)?;
        if count as usize > 8 {
            base.fault(map_index, "more than 8 mapped objects");
            return Ok(base);
        }

        let mut total_bits: u32 = 0;
        for sub in 1..=count {
            let entry = PdoMappingEntry::from_u32(od.read_u32(map_index, sub)?);
            let Some(byte_length) = entry.byte_length() else {
                base.fault(map_index, "mapped length not byte aligned");
                return Ok(base);
            };
            total_bits += entry.length_bits as u32;
            if total_bits > PDO_MAX_BITS {
                base.fault(map_index, "mapped lengths exceed 64 bits");
                return Ok(base);
            }
            if !entry.is_dummy() {
                let mappable = match od.index(entry.index).map(|e| e.sub(entry.sub_index)) {
                    Some(Ok(variable)) => {
                        let required = match direction {
                            PdoDirection::Receive => Attributes::RPDO,
                            PdoDirection::Transmit => Attributes::TPDO,
                        };
                        variable.attributes.contains(required)
                            && variable.value.len() == byte_length
                    }
                    _ => false,
                };
                if !mappable {
                    base.fault(map_index, "target not mappable");
                    return Ok(base);
                }
            }
            base.mappings.push(entry);
        }
        base.data_length = (total_bits as usize + 7) / 8;

        if base.valid && base.data_length == 0 {
            // An enabled PDO without mapping carries nothing; keep it dormant.
            base.valid = false;
        }
        Ok(base)
    }

    fn fault(&mut self, map_index: u16, reason: &str) {
        warn!("[PDO] Invalid mapping at {:#06X}: {}", map_index, reason);
        self.valid = false;
        self.mapping_fault = true;
    }

    /// True for transmission types driven by SYNC (0..=240).
    pub fn is_synchronous(&self) -> bool {
        self.transmission_type <= transmission::SYNC_CYCLIC_MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{predefined, Entry, Variable};
    use crate::types::*;

    fn setup() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        predefined::populate_communication_profile(&mut od, NodeId::try_from(0x11).unwrap());
        od.add_entry(Entry::variable(
            0x2001,
            "status",
            Variable::unsigned8(0x2001, 0, Attributes::SDO_RW | Attributes::TRPDO, 0),
        ));
        od.add_entry(Entry::variable(
            0x2002,
            "setpoint",
            Variable::unsigned32(0x2002, 0, Attributes::SDO_RW, 0),
        ));
        od
    }

    fn map(od: &mut ObjectDictionary, map_index: u16, entries: &[PdoMappingEntry]) {
        for (i, entry) in entries.iter().enumerate() {
            od.write_u32(map_index, (i + 1) as u8, entry.to_u32()).unwrap();
        }
        od.write_u8(map_index, 0, entries.len() as u8).unwrap();
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let entry = PdoMappingEntry { index: 0x2001, sub_index: 3, length_bits: 16 };
        assert_eq!(entry.to_u32(), 0x2001_0310);
        assert_eq!(PdoMappingEntry::from_u32(0x2001_0310), entry);
    }

    #[test]
    fn test_load_valid_tpdo() {
        let mut od = setup();
        map(&mut od, IDX_TPDO_MAP_BASE, &[PdoMappingEntry {
            index: 0x2001,
            sub_index: 0,
            length_bits: 8,
        }]);
        let base = PdoBase::from_od(
            &mut od,
            IDX_TPDO_COMM_BASE,
            IDX_TPDO_MAP_BASE,
            PdoDirection::Transmit,
        )
        .unwrap();
        assert!(base.valid);
        assert!(!base.mapping_fault);
        assert_eq!(base.cob_id, 0x191);
        assert_eq!(base.data_length, 1);
    }

    #[test]
    fn test_non_mappable_target_faults() {
        let mut od = setup();
        // 0x2002 lacks the PDO-mappable attribute.
        map(&mut od, IDX_TPDO_MAP_BASE, &[PdoMappingEntry {
            index: 0x2002,
            sub_index: 0,
            length_bits: 32,
        }]);
        let base = PdoBase::from_od(
            &mut od,
            IDX_TPDO_COMM_BASE,
            IDX_TPDO_MAP_BASE,
            PdoDirection::Transmit,
        )
        .unwrap();
        assert!(!base.valid);
        assert!(base.mapping_fault);
    }

    #[test]
    fn test_oversized_mapping_faults() {
        let mut od = setup();
        let slot = PdoMappingEntry { index: 0x2001, sub_index: 0, length_bits: 8 };
        map(&mut od, IDX_RPDO_MAP_BASE, &[slot; 8]);
        // 8 slots of 8 bits is fine; tack a ninth via count manipulation.
        od.write_u8(IDX_RPDO_MAP_BASE, 0, 9).unwrap();
        let base = PdoBase::from_od(
            &mut od,
            IDX_RPDO_COMM_BASE,
            IDX_RPDO_MAP_BASE,
            PdoDirection::Receive,
        )
        .unwrap();
        assert!(base.mapping_fault);
    }

    #[test]
    fn test_restricted_cob_id_disables() {
        let mut od = setup();
        map(&mut od, IDX_TPDO_MAP_BASE, &[PdoMappingEntry {
            index: 0x2001,
            sub_index: 0,
            length_bits: 8,
        }]);
        od.write_u32(IDX_TPDO_COMM_BASE, 1, 0x601).unwrap();
        let base = PdoBase::from_od(
            &mut od,
            IDX_TPDO_COMM_BASE,
            IDX_TPDO_MAP_BASE,
            PdoDirection::Transmit,
        )
        .unwrap();
        assert!(!base.valid);
    }

    #[test]
    fn test_dummy_mapping_pads() {
        let mut od = setup();
        map(
            &mut od,
            IDX_RPDO_MAP_BASE,
            &[
                // Dummy UNSIGNED16 padding, then a real byte.
                PdoMappingEntry { index: 0x0006, sub_index: 0, length_bits: 16 },
                PdoMappingEntry { index: 0x2001, sub_index: 0, length_bits: 8 },
            ],
        );
        let base = PdoBase::from_od(
            &mut od,
            IDX_RPDO_COMM_BASE,
            IDX_RPDO_MAP_BASE,
            PdoDirection::Receive,
        )
        .unwrap();
        assert!(base.valid);
        assert_eq!(base.data_length, 3);
    }

    #[test]
    fn test_disabled_by_validity_bit() {
        let mut od = setup();
        map(&mut od, IDX_TPDO_MAP_BASE, &[PdoMappingEntry {
            index: 0x2001,
            sub_index: 0,
            length_bits: 8,
        }]);
        od.write_u32(IDX_TPDO_COMM_BASE, 1, 0x191 | COB_ID_FLAG_INVALID).unwrap();
        let base = PdoBase::from_od(
            &mut od,
            IDX_TPDO_COMM_BASE,
            IDX_TPDO_MAP_BASE,
            PdoDirection::Transmit,
        )
        .unwrap();
        assert!(!base.valid);
        assert!(!base.mapping_fault);
    }
}
