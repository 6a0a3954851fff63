//! Remote-configuration helpers built on top of the SDO client: read and
//! write the PDO communication/mapping records and the SYNC, TIME and
//! heartbeat objects of a remote node.

use crate::pdo::{PdoMappingEntry, PDO_MAX_BITS};
use crate::types::*;
use crate::CanOpenError;
use alloc::vec::Vec;

/// Abstraction over a working SDO transfer path, so the configurators run
/// against the blocking node helpers or a test double alike.
pub trait SdoTransfer {
    fn read(&mut self, server: NodeId, index: u16, sub_index: u8) -> Result<Vec<u8>, CanOpenError>;
    fn write(
        &mut self,
        server: NodeId,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), CanOpenError>;
}

#[cfg(feature = "std")]
mod node_transfer {
    use super::SdoTransfer;
    use crate::bus::CanBus;
    use crate::node::Node;
    use crate::types::NodeId;
    use crate::CanOpenError;
    use alloc::vec::Vec;

    /// [`SdoTransfer`] over a node's blocking SDO helpers.
    pub struct NodeSdo<'a> {
        pub node: &'a mut Node,
        pub bus: &'a mut dyn CanBus,
    }

    impl SdoTransfer for NodeSdo<'_> {
        fn read(
            &mut self,
            server: NodeId,
            index: u16,
            sub_index: u8,
        ) -> Result<Vec<u8>, CanOpenError> {
            let mut buf = [0u8; 8];
            let n = self.node.read_raw(self.bus, server, index, sub_index, &mut buf)?;
            Ok(buf[..n].to_vec())
        }

        fn write(
            &mut self,
            server: NodeId,
            index: u16,
            sub_index: u8,
            data: &[u8],
        ) -> Result<(), CanOpenError> {
            self.node.write_raw(self.bus, server, index, sub_index, data, false)
        }
    }
}

#[cfg(feature = "std")]
pub use node_transfer::NodeSdo;

fn read_u8_of(sdo: &mut dyn SdoTransfer, server: NodeId, index: u16, sub: u8) -> Result<u8, CanOpenError> {
    let data = sdo.read(server, index, sub)?;
    if data.len() != 1 {
        return Err(CanOpenError::Od(crate::od::OdError::TypeMismatch));
    }
    Ok(data[0])
}

fn read_u16_of(sdo: &mut dyn SdoTransfer, server: NodeId, index: u16, sub: u8) -> Result<u16, CanOpenError> {
    let data = sdo.read(server, index, sub)?;
    let bytes: [u8; 2] = data
        .as_slice()
        .try_into()
        .map_err(|_| CanOpenError::Od(crate::od::OdError::TypeMismatch))?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32_of(sdo: &mut dyn SdoTransfer, server: NodeId, index: u16, sub: u8) -> Result<u32, CanOpenError> {
    let data = sdo.read(server, index, sub)?;
    let bytes: [u8; 4] = data
        .as_slice()
        .try_into()
        .map_err(|_| CanOpenError::Od(crate::od::OdError::TypeMismatch))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Configuration of one PDO as exposed by its records on a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoConfig {
    pub enabled: bool,
    pub cob_id: u32,
    pub transmission_type: u8,
    /// TPDO only; 100 µs units.
    pub inhibit_time: u16,
    /// Milliseconds.
    pub event_timer: u16,
    /// TPDO only.
    pub sync_start: u8,
    pub mappings: Vec<PdoMappingEntry>,
}

impl PdoConfig {
    /// An event-driven PDO on the given identifier with the given mappings.
    pub fn event_driven(cob_id: u32, mappings: Vec<PdoMappingEntry>) -> Self {
        Self {
            enabled: true,
            cob_id,
            transmission_type: 255,
            inhibit_time: 0,
            event_timer: 0,
            sync_start: 0,
            mappings,
        }
    }

    fn total_bits(&self) -> u32 {
        self.mappings.iter().map(|m| m.length_bits as u32).sum()
    }
}

/// PDO configurator for one remote node.
pub struct PdoConfigurator<'a> {
    sdo: &'a mut dyn SdoTransfer,
    server: NodeId,
}

impl<'a> PdoConfigurator<'a> {
    pub fn new(sdo: &'a mut dyn SdoTransfer, server: NodeId) -> Self {
        Self { sdo, server }
    }

    fn comm_index(&self, tpdo: bool, pdo_num: usize) -> u16 {
        if tpdo {
            IDX_TPDO_COMM_BASE + pdo_num as u16
        } else {
            IDX_RPDO_COMM_BASE + pdo_num as u16
        }
    }

    fn map_index(&self, tpdo: bool, pdo_num: usize) -> u16 {
        if tpdo {
            IDX_TPDO_MAP_BASE + pdo_num as u16
        } else {
            IDX_RPDO_MAP_BASE + pdo_num as u16
        }
    }

    /// Reads the complete configuration of RPDO/TPDO `pdo_num` (zero-based).
    pub fn read_config(&mut self, tpdo: bool, pdo_num: usize) -> Result<PdoConfig, CanOpenError> {
        let comm = self.comm_index(tpdo, pdo_num);
        let map = self.map_index(tpdo, pdo_num);

        let raw_cob = read_u32_of(self.sdo, self.server, comm, 1)?;
        let transmission_type = read_u8_of(self.sdo, self.server, comm, 2)?;
        let inhibit_time = if tpdo {
            read_u16_of(self.sdo, self.server, comm, 3).unwrap_or(0)
        } else {
            0
        };
        let event_timer = read_u16_of(self.sdo, self.server, comm, 5).unwrap_or(0);
        let sync_start = if tpdo {
            read_u8_of(self.sdo, self.server, comm, 6).unwrap_or(0)
        } else {
            0
        };

        let count = read_u8_of(self.sdo, self.server, map, 0)?;
        let mut mappings = Vec::with_capacity(count as usize);
        for sub in 1..=count {
            mappings.push(PdoMappingEntry::from_u32(read_u32_of(
                self.sdo,
                self.server,
                map,
                sub,
            )?));
        }
        Ok(PdoConfig {
            enabled: raw_cob & COB_ID_FLAG_INVALID == 0,
            cob_id: raw_cob & COB_ID_MASK,
            transmission_type,
            inhibit_time,
            event_timer,
            sync_start,
            mappings,
        })
    }

    /// Writes a complete PDO configuration, following the CiA discipline:
    /// disable the PDO, clear the mapping, write the slots, re-activate the
    /// mapping, then enable the COB-ID.
    pub fn configure(
        &mut self,
        tpdo: bool,
        pdo_num: usize,
        config: &PdoConfig,
    ) -> Result<(), CanOpenError> {
        if is_restricted_can_id(config.cob_id) {
            return Err(CanOpenError::Configuration("restricted CAN-ID for a PDO"));
        }
        if config.mappings.len() > 8 || config.total_bits() > PDO_MAX_BITS {
            return Err(CanOpenError::Configuration("mapping exceeds 8 bytes"));
        }
        let comm = self.comm_index(tpdo, pdo_num);
        let map = self.map_index(tpdo, pdo_num);

        // Disable while reconfiguring.
        self.write_u32(comm, 1, config.cob_id | COB_ID_FLAG_INVALID)?;
        self.write_u8(map, 0, 0)?;

        for (slot, mapping) in config.mappings.iter().enumerate() {
            self.write_u32(map, (slot + 1) as u8, mapping.to_u32())?;
        }
        self.write_u8(map, 0, config.mappings.len() as u8)?;

        self.write_u8(comm, 2, config.transmission_type)?;
        if tpdo {
            self.write_u16(comm, 3, config.inhibit_time)?;
            self.write_u8(comm, 6, config.sync_start)?;
        }
        self.write_u16(comm, 5, config.event_timer)?;

        if config.enabled {
            self.write_u32(comm, 1, config.cob_id)?;
        }
        Ok(())
    }

    /// Flips only the COB-ID validity bit, leaving the rest untouched.
    pub fn set_enabled(&mut self, tpdo: bool, pdo_num: usize, enabled: bool) -> Result<(), CanOpenError> {
        let comm = self.comm_index(tpdo, pdo_num);
        let raw = read_u32_of(self.sdo, self.server, comm, 1)?;
        let new = if enabled {
            raw & !COB_ID_FLAG_INVALID
        } else {
            raw | COB_ID_FLAG_INVALID
        };
        self.write_u32(comm, 1, new)
    }

    fn write_u8(&mut self, index: u16, sub: u8, value: u8) -> Result<(), CanOpenError> {
        self.sdo.write(self.server, index, sub, &value.to_le_bytes())
    }

    fn write_u16(&mut self, index: u16, sub: u8, value: u16) -> Result<(), CanOpenError> {
        self.sdo.write(self.server, index, sub, &value.to_le_bytes())
    }

    fn write_u32(&mut self, index: u16, sub: u8, value: u32) -> Result<(), CanOpenError> {
        self.sdo.write(self.server, index, sub, &value.to_le_bytes())
    }
}

/// Configures the SYNC producer/consumer objects of a remote node.
pub fn configure_sync(
    sdo: &mut dyn SdoTransfer,
    server: NodeId,
    cob_id: u32,
    produce: bool,
    period_us: u32,
    counter_overflow: u8,
) -> Result<(), CanOpenError> {
    if counter_overflow == 1 || counter_overflow > 240 {
        return Err(CanOpenError::Configuration("SYNC counter overflow out of range"));
    }
    // The period must be disabled while the counter overflow changes.
    sdo.write(server, IDX_SYNC_CYCLE_PERIOD, 0, &0u32.to_le_bytes())?;
    sdo.write(server, IDX_SYNC_COUNTER_OVERFLOW, 0, &counter_overflow.to_le_bytes())?;
    let raw = (cob_id & COB_ID_MASK) | if produce { COB_ID_FLAG_PRODUCER } else { 0 };
    sdo.write(server, IDX_SYNC_COB_ID, 0, &raw.to_le_bytes())?;
    sdo.write(server, IDX_SYNC_CYCLE_PERIOD, 0, &period_us.to_le_bytes())?;
    Ok(())
}

/// Configures the TIME object of a remote node.
pub fn configure_time(
    sdo: &mut dyn SdoTransfer,
    server: NodeId,
    cob_id: u32,
    produce: bool,
    consume: bool,
) -> Result<(), CanOpenError> {
    let mut raw = cob_id & COB_ID_MASK;
    if produce {
        raw |= COB_ID_FLAG_PRODUCER;
    }
    if !consume {
        raw |= COB_ID_FLAG_INVALID;
    }
    sdo.write(server, IDX_TIME_COB_ID, 0, &raw.to_le_bytes())
}

/// Sets a remote node's heartbeat production interval (0 disables).
pub fn configure_heartbeat_producer(
    sdo: &mut dyn SdoTransfer,
    server: NodeId,
    interval_ms: u16,
) -> Result<(), CanOpenError> {
    sdo.write(server, IDX_PRODUCER_HEARTBEAT, 0, &interval_ms.to_le_bytes())
}

/// Writes one consumer heartbeat slot: monitor `monitored` with the given
/// deadline.
pub fn configure_heartbeat_consumer(
    sdo: &mut dyn SdoTransfer,
    server: NodeId,
    slot: u8,
    monitored: NodeId,
    timeout_ms: u16,
) -> Result<(), CanOpenError> {
    let raw = ((monitored.0 as u32) << 16) | timeout_ms as u32;
    sdo.write(server, IDX_CONSUMER_HEARTBEAT, slot, &raw.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;

    /// SDO double backed by a flat (index, sub) -> bytes map.
    struct MapSdo {
        store: BTreeMap<(u16, u8), Vec<u8>>,
        writes: Vec<(u16, u8, Vec<u8>)>,
    }

    impl MapSdo {
        fn new() -> Self {
            Self {
                store: BTreeMap::new(),
                writes: Vec::new(),
            }
        }

        fn set_u32(&mut self, index: u16, sub: u8, value: u32) {
            self.store.insert((index, sub), value.to_le_bytes().to_vec());
        }

        fn set_u8(&mut self, index: u16, sub: u8, value: u8) {
            self.store.insert((index, sub), vec![value]);
        }
    }

    impl SdoTransfer for MapSdo {
        fn read(&mut self, _server: NodeId, index: u16, sub: u8) -> Result<Vec<u8>, CanOpenError> {
            self.store
                .get(&(index, sub))
                .cloned()
                .ok_or(CanOpenError::Od(crate::od::OdError::IdxNotExist))
        }

        fn write(
            &mut self,
            _server: NodeId,
            index: u16,
            sub: u8,
            data: &[u8],
        ) -> Result<(), CanOpenError> {
            self.store.insert((index, sub), data.to_vec());
            self.writes.push((index, sub, data.to_vec()));
            Ok(())
        }
    }

    fn server() -> NodeId {
        NodeId::try_from(0x10).unwrap()
    }

    #[test]
    fn test_read_tpdo_config() {
        let mut sdo = MapSdo::new();
        sdo.set_u32(0x1800, 1, 0x190 | COB_ID_FLAG_INVALID);
        sdo.set_u8(0x1800, 2, 254);
        sdo.store.insert((0x1800, 3), 100u16.to_le_bytes().to_vec());
        sdo.store.insert((0x1800, 5), 50u16.to_le_bytes().to_vec());
        sdo.set_u8(0x1800, 6, 2);
        sdo.set_u8(0x1A00, 0, 1);
        sdo.set_u32(0x1A00, 1, 0x2001_0008);

        let mut configurator = PdoConfigurator::new(&mut sdo, server());
        let config = configurator.read_config(true, 0).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.cob_id, 0x190);
        assert_eq!(config.transmission_type, 254);
        assert_eq!(config.inhibit_time, 100);
        assert_eq!(config.event_timer, 50);
        assert_eq!(config.sync_start, 2);
        assert_eq!(
            config.mappings,
            vec![PdoMappingEntry { index: 0x2001, sub_index: 0, length_bits: 8 }]
        );
    }

    #[test]
    fn test_configure_disables_before_remapping() {
        let mut sdo = MapSdo::new();
        let config = PdoConfig::event_driven(
            0x190,
            vec![PdoMappingEntry { index: 0x2001, sub_index: 0, length_bits: 8 }],
        );
        let mut configurator = PdoConfigurator::new(&mut sdo, server());
        configurator.configure(true, 0, &config).unwrap();

        let writes = &sdo.writes;
        // First write disables the COB-ID, second clears the mapping count.
        assert_eq!(writes[0].0, 0x1800);
        assert_eq!(writes[0].1, 1);
        assert_ne!(
            u32::from_le_bytes(writes[0].2.as_slice().try_into().unwrap()) & COB_ID_FLAG_INVALID,
            0
        );
        assert_eq!(writes[1], (0x1A00, 0, vec![0]));
        // The final write re-enables the COB-ID.
        let last = writes.last().unwrap();
        assert_eq!((last.0, last.1), (0x1800, 1));
        assert_eq!(
            u32::from_le_bytes(last.2.as_slice().try_into().unwrap()),
            0x190
        );
    }

    #[test]
    fn test_configure_refuses_restricted_cob_id() {
        let mut sdo = MapSdo::new();
        let config = PdoConfig::event_driven(0x601, vec![]);
        let mut configurator = PdoConfigurator::new(&mut sdo, server());
        assert!(configurator.configure(true, 0, &config).is_err());
        assert!(sdo.writes.is_empty());
    }

    #[test]
    fn test_configure_refuses_oversized_mapping() {
        let mut sdo = MapSdo::new();
        let slot = PdoMappingEntry { index: 0x2002, sub_index: 0, length_bits: 32 };
        let config = PdoConfig::event_driven(0x190, vec![slot; 3]);
        let mut configurator = PdoConfigurator::new(&mut sdo, server());
        assert!(configurator.configure(true, 0, &config).is_err());
    }

    #[test]
    fn test_set_enabled_flips_only_bit_31() {
        let mut sdo = MapSdo::new();
        sdo.set_u32(0x1400, 1, 0x210);
        {
            let mut configurator = PdoConfigurator::new(&mut sdo, server());
            configurator.set_enabled(false, 0, false).unwrap();
        }
        assert_eq!(
            sdo.read(server(), 0x1400, 1).unwrap(),
            (0x210u32 | COB_ID_FLAG_INVALID).to_le_bytes().to_vec()
        );
        {
            let mut configurator = PdoConfigurator::new(&mut sdo, server());
            configurator.set_enabled(false, 0, true).unwrap();
        }
        assert_eq!(
            sdo.read(server(), 0x1400, 1).unwrap(),
            0x210u32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_configure_sync_sequence() {
        let mut sdo = MapSdo::new();
        configure_sync(&mut sdo, server(), 0x080, true, 20_000, 4).unwrap();
        // Period is zeroed before the counter overflow changes.
        assert_eq!(sdo.writes[0], (IDX_SYNC_CYCLE_PERIOD, 0, 0u32.to_le_bytes().to_vec()));
        assert_eq!(sdo.writes[1], (IDX_SYNC_COUNTER_OVERFLOW, 0, vec![4]));
        let cob = u32::from_le_bytes(sdo.writes[2].2.as_slice().try_into().unwrap());
        assert_eq!(cob, 0x080 | COB_ID_FLAG_PRODUCER);
        assert_eq!(
            sdo.writes[3],
            (IDX_SYNC_CYCLE_PERIOD, 0, 20_000u32.to_le_bytes().to_vec())
        );

        assert!(configure_sync(&mut sdo, server(), 0x080, false, 0, 1).is_err());
    }

    #[test]
    fn test_heartbeat_consumer_entry_layout() {
        let mut sdo = MapSdo::new();
        configure_heartbeat_consumer(&mut sdo, server(), 1, NodeId::try_from(0x10).unwrap(), 1000)
            .unwrap();
        let raw = u32::from_le_bytes(sdo.writes[0].2.as_slice().try_into().unwrap());
        assert_eq!(raw, (0x10 << 16) | 1000);
    }
}
