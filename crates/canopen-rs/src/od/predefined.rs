//! Default communication-profile objects.
//!
//! Populates the mandatory CiA 301 entries with their pre-defined connection
//! set values so a node can be constructed without an EDS file. An EDS-driven
//! application builds the same structures programmatically and may overwrite
//! any of these.

use super::{Attributes, Entry, ObjectDictionary, Variable};
use crate::types::*;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

/// Number of pre-defined PDOs per direction.
pub const DEFAULT_PDO_COUNT: usize = 4;
/// Number of consumer heartbeat slots.
pub const HB_CONSUMER_SLOTS: usize = 8;
/// Number of mapping slots per PDO.
pub const PDO_MAPPING_SLOTS: u8 = 8;

fn comm_u32(index: u16, sub: u8, value: u32) -> Variable {
    Variable::unsigned32(index, sub, Attributes::SDO_RW, value)
}

/// RPDO communication parameter record `0x1400 + n` (n zero-based).
pub fn rpdo_comm_entry(n: usize, node_id: NodeId) -> Entry {
    let index = IDX_RPDO_COMM_BASE + n as u16;
    // PDOs beyond the pre-defined connection set start out invalid.
    let cob_id = match COB_ID_RPDO_BASE.get(n) {
        Some(base) => base + node_id.0 as u32,
        None => COB_ID_FLAG_INVALID,
    };
    let mut entry = Entry::record(
        index,
        &format!("RPDO {} communication parameter", n + 1),
        vec![
            comm_u32(index, 1, cob_id),
            Variable::unsigned8(index, 2, Attributes::SDO_RW, 255),
            Variable::unsigned16(index, 5, Attributes::SDO_RW, 0),
        ],
    );
    entry.name_sub("COB-ID", 1);
    entry.name_sub("Transmission type", 2);
    entry.name_sub("Event timer", 5);
    entry
}

/// RPDO mapping parameter record `0x1600 + n` (n zero-based).
pub fn rpdo_map_entry(n: usize) -> Entry {
    pdo_map_entry(IDX_RPDO_MAP_BASE + n as u16, &format!("RPDO {} mapping parameter", n + 1))
}

/// TPDO communication parameter record `0x1800 + n` (n zero-based).
pub fn tpdo_comm_entry(n: usize, node_id: NodeId) -> Entry {
    let index = IDX_TPDO_COMM_BASE + n as u16;
    let cob_id = match COB_ID_TPDO_BASE.get(n) {
        Some(base) => base + node_id.0 as u32,
        None => COB_ID_FLAG_INVALID,
    };
    let mut entry = Entry::record(
        index,
        &format!("TPDO {} communication parameter", n + 1),
        vec![
            comm_u32(index, 1, cob_id),
            Variable::unsigned8(index, 2, Attributes::SDO_RW, 255),
            Variable::unsigned16(index, 3, Attributes::SDO_RW, 0),
            Variable::unsigned16(index, 5, Attributes::SDO_RW, 0),
            Variable::unsigned8(index, 6, Attributes::SDO_RW, 0),
        ],
    );
    entry.name_sub("COB-ID", 1);
    entry.name_sub("Transmission type", 2);
    entry.name_sub("Inhibit time", 3);
    entry.name_sub("Event timer", 5);
    entry.name_sub("SYNC start value", 6);
    entry
}

/// TPDO mapping parameter record `0x1A00 + n` (n zero-based).
pub fn tpdo_map_entry(n: usize) -> Entry {
    pdo_map_entry(IDX_TPDO_MAP_BASE + n as u16, &format!("TPDO {} mapping parameter", n + 1))
}

fn pdo_map_entry(index: u16, name: &str) -> Entry {
    // Sub-index 0 is the writable valid-count, not the structural bound.
    let mut members: Vec<Variable> =
        vec![Variable::unsigned8(index, 0, Attributes::SDO_RW, 0)];
    for sub in 1..=PDO_MAPPING_SLOTS {
        members.push(Variable::unsigned32(index, sub, Attributes::SDO_RW, 0));
    }
    Entry::record_with_sub0(index, name, members)
}

/// Populates every communication-profile object the core consumes.
pub fn populate_communication_profile(od: &mut ObjectDictionary, node_id: NodeId) {
    od.add_entry(Entry::variable(
        IDX_DEVICE_TYPE,
        "Device type",
        Variable::unsigned32(IDX_DEVICE_TYPE, 0, Attributes::SDO_R, 0),
    ));
    od.add_entry(Entry::variable(
        IDX_ERROR_REGISTER,
        "Error register",
        Variable::unsigned8(IDX_ERROR_REGISTER, 0, Attributes::SDO_R | Attributes::TPDO, 0),
    ));
    od.add_entry(Entry::variable(
        IDX_SYNC_COB_ID,
        "COB-ID SYNC message",
        comm_u32(IDX_SYNC_COB_ID, 0, COB_ID_SYNC),
    ));
    od.add_entry(Entry::variable(
        IDX_SYNC_CYCLE_PERIOD,
        "Communication cycle period",
        comm_u32(IDX_SYNC_CYCLE_PERIOD, 0, 0),
    ));
    od.add_entry(Entry::variable(
        IDX_SYNC_WINDOW_LENGTH,
        "Synchronous window length",
        comm_u32(IDX_SYNC_WINDOW_LENGTH, 0, 0),
    ));
    od.add_entry(Entry::variable(
        IDX_TIME_COB_ID,
        "COB-ID time stamp object",
        comm_u32(IDX_TIME_COB_ID, 0, COB_ID_TIME),
    ));
    od.add_entry(Entry::variable(
        IDX_EMCY_COB_ID,
        "COB-ID EMCY",
        comm_u32(IDX_EMCY_COB_ID, 0, COB_ID_EMERGENCY + node_id.0 as u32),
    ));
    od.add_entry(Entry::array(
        IDX_CONSUMER_HEARTBEAT,
        "Consumer heartbeat time",
        (0..HB_CONSUMER_SLOTS)
            .map(|_| Variable::unsigned32(IDX_CONSUMER_HEARTBEAT, 0, Attributes::SDO_RW, 0))
            .collect(),
    ));
    od.add_entry(Entry::variable(
        IDX_PRODUCER_HEARTBEAT,
        "Producer heartbeat time",
        Variable::unsigned16(IDX_PRODUCER_HEARTBEAT, 0, Attributes::SDO_RW, 0),
    ));
    od.add_entry(Entry::variable(
        IDX_SYNC_COUNTER_OVERFLOW,
        "Synchronous counter overflow value",
        Variable::unsigned8(IDX_SYNC_COUNTER_OVERFLOW, 0, Attributes::SDO_RW, 0),
    ));

    let mut sdo_server = Entry::record(
        IDX_SDO_SERVER_PARAM,
        "SDO server parameter",
        vec![
            Variable::unsigned32(
                IDX_SDO_SERVER_PARAM,
                1,
                Attributes::SDO_R,
                COB_ID_SDO_SERVER_RX + node_id.0 as u32,
            ),
            Variable::unsigned32(
                IDX_SDO_SERVER_PARAM,
                2,
                Attributes::SDO_R,
                COB_ID_SDO_SERVER_TX + node_id.0 as u32,
            ),
        ],
    );
    sdo_server.name_sub("COB-ID client to server", 1);
    sdo_server.name_sub("COB-ID server to client", 2);
    od.add_entry(sdo_server);

    let mut sdo_client = Entry::record(
        IDX_SDO_CLIENT_PARAM,
        "SDO client parameter",
        vec![
            comm_u32(IDX_SDO_CLIENT_PARAM, 1, COB_ID_SDO_SERVER_RX),
            comm_u32(IDX_SDO_CLIENT_PARAM, 2, COB_ID_SDO_SERVER_TX),
            Variable::unsigned8(IDX_SDO_CLIENT_PARAM, 3, Attributes::SDO_RW, 0),
        ],
    );
    sdo_client.name_sub("COB-ID client to server", 1);
    sdo_client.name_sub("COB-ID server to client", 2);
    sdo_client.name_sub("Node-ID of the SDO server", 3);
    od.add_entry(sdo_client);

    for n in 0..DEFAULT_PDO_COUNT {
        od.add_entry(rpdo_comm_entry(n, node_id));
        od.add_entry(rpdo_map_entry(n));
        od.add_entry(tpdo_comm_entry(n, node_id));
        od.add_entry(tpdo_map_entry(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn test_populate_defaults() {
        let mut od = ObjectDictionary::new();
        let node_id = NodeId::try_from(0x10).unwrap();
        populate_communication_profile(&mut od, node_id);

        assert_eq!(od.read_u32(IDX_SYNC_COB_ID, 0), Ok(0x080));
        assert_eq!(od.read_u32(IDX_EMCY_COB_ID, 0), Ok(0x090));
        assert_eq!(od.read_u32(IDX_SDO_SERVER_PARAM, 1), Ok(0x610));
        assert_eq!(od.read_u32(IDX_SDO_SERVER_PARAM, 2), Ok(0x590));
        // Pre-defined connection set for the first PDOs.
        assert_eq!(od.read_u32(IDX_RPDO_COMM_BASE, 1), Ok(0x210));
        assert_eq!(od.read_u32(IDX_TPDO_COMM_BASE, 1), Ok(0x190));
        // Mapping records start out empty but keep their slots writable.
        assert_eq!(od.read_u8(IDX_TPDO_MAP_BASE, 0), Ok(0));
        assert!(od.write_u32(IDX_TPDO_MAP_BASE, 1, 0x2001_0008).is_ok());
    }

    #[test]
    fn test_heartbeat_consumer_slots() {
        let mut od = ObjectDictionary::new();
        populate_communication_profile(&mut od, NodeId::try_from(1).unwrap());
        assert_eq!(od.read_u8(IDX_CONSUMER_HEARTBEAT, 0), Ok(HB_CONSUMER_SLOTS as u8));
        assert_eq!(od.read_u32(IDX_CONSUMER_HEARTBEAT, 1), Ok(0));
    }
}
