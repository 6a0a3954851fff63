//! Emergency object (EMCY) producer and consumer.
//!
//! An error is reported as (error code u16, error register u8, five
//! manufacturer-specific bytes) on `0x080 + node_id`. The module keeps the
//! set of active errors, mirrors the error register into OD 0x1001 and
//! buffers emissions until the process loop flushes them.

use crate::bus::CanFrame;
use crate::nmt::NmtState;
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_MASK, COB_ID_FLAG_INVALID, IDX_ERROR_REGISTER, IDX_EMCY_COB_ID, NodeId};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, warn};

// --- Emergency error codes (CiA 301, Table 21) ---

/// Error reset / no error.
pub const EM_NO_ERROR: u16 = 0x0000;
/// Generic error.
pub const EM_GENERIC: u16 = 0x1000;
/// CAN overrun, objects lost.
pub const EM_CAN_OVERRUN: u16 = 0x8110;
/// Heartbeat consumer detected a missing producer.
pub const EM_HEARTBEAT: u16 = 0x8130;
/// PDO not processed due to length error (frame shorter than mapping).
pub const EM_PDO_LENGTH: u16 = 0x8210;
/// PDO length exceeded (frame longer than mapping).
pub const EM_PDO_LENGTH_EXC: u16 = 0x8220;
/// PDO mapping invalid (destination object unusable).
pub const EM_WRONG_MAPPING: u16 = 0x8230;
/// Synchronous RPDO missed its deadline window.
pub const EM_RPDO_TIMEOUT: u16 = 0x8250;

// --- Error register bits (OD 0x1001) ---

pub const ERR_REG_GENERIC: u8 = 0x01;
pub const ERR_REG_COMMUNICATION: u8 = 0x10;
pub const ERR_REG_MANUFACTURER: u8 = 0x80;

/// A decoded emergency object received from another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyMessage {
    pub node_id: u8,
    pub code: u16,
    pub register: u8,
    pub manufacturer: [u8; 5],
}

impl EmergencyMessage {
    /// Parses a received EMCY frame. The producing node-id is recovered from
    /// the COB-ID, assuming the pre-defined connection set.
    pub fn from_frame(frame: &CanFrame) -> Option<Self> {
        let payload = frame.payload();
        // COB-ID 0x080 itself is the SYNC object, not an emergency.
        if payload.len() < 8 || frame.can_id() & 0x7F == 0 {
            return None;
        }
        let mut manufacturer = [0u8; 5];
        manufacturer.copy_from_slice(&payload[3..8]);
        Some(Self {
            node_id: (frame.can_id() & 0x7F) as u8,
            code: u16::from_le_bytes([payload[0], payload[1]]),
            register: payload[2],
            manufacturer,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveError {
    code: u16,
    register_bit: u8,
}

/// Capacity of the received-emergency queue.
const RX_QUEUE_CAP: usize = 16;

/// Emergency producer/consumer state for one node.
pub struct Emcy {
    cob_id: u32,
    producer_enabled: bool,
    active: Vec<ActiveError>,
    pending: VecDeque<[u8; 8]>,
    received: VecDeque<EmergencyMessage>,
}

impl Emcy {
    /// Builds the module from OD 0x1014. Bit 31 of the COB-ID disables the
    /// producer; consumption is unaffected.
    pub fn from_od(od: &mut ObjectDictionary, node_id: NodeId) -> Self {
        let raw = od
            .read_u32(IDX_EMCY_COB_ID, 0)
            .unwrap_or(0x080 + node_id.0 as u32);
        Self {
            cob_id: raw & COB_ID_MASK,
            producer_enabled: raw & COB_ID_FLAG_INVALID == 0,
            active: Vec::new(),
            pending: VecDeque::new(),
            received: VecDeque::new(),
        }
    }

    /// The COB-ID this node emits emergencies on.
    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    /// True while the given error code is active.
    pub fn is_error_active(&self, code: u16) -> bool {
        self.active.iter().any(|e| e.code == code)
    }

    /// Current error register value (OR of all active register bits).
    pub fn error_register(&self) -> u8 {
        self.active.iter().fold(0, |acc, e| acc | e.register_bit)
    }

    fn sync_error_register(&self, od: &mut ObjectDictionary) {
        if od.write_u8(IDX_ERROR_REGISTER, 0, self.error_register()).is_err() {
            warn!("[EMCY] Error register object 0x1001 missing");
        }
    }

    fn enqueue(&mut self, code: u16, register: u8, info: u32) {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&code.to_le_bytes());
        data[2] = register;
        data[3..7].copy_from_slice(&info.to_le_bytes());
        self.pending.push_back(data);
    }

    /// Marks an error active and queues its emission. Reporting an already
    /// active code refreshes the manufacturer info but emits only once per
    /// activation.
    pub fn error_report(&mut self, od: &mut ObjectDictionary, code: u16, register_bit: u8, info: u32) {
        if self.is_error_active(code) {
            return;
        }
        debug!("[EMCY] Error report {:#06X}, register bit {:#04X}", code, register_bit);
        self.active.push(ActiveError { code, register_bit });
        self.sync_error_register(od);
        self.enqueue(code, self.error_register(), info);
    }

    /// Clears an active error and queues an emission with code 0 (error
    /// reset). Resetting an inactive code is a no-op.
    pub fn error_reset(&mut self, od: &mut ObjectDictionary, code: u16, info: u32) {
        let before = self.active.len();
        self.active.retain(|e| e.code != code);
        if self.active.len() == before {
            return;
        }
        debug!("[EMCY] Error reset {:#06X}", code);
        self.sync_error_register(od);
        self.enqueue(EM_NO_ERROR, self.error_register(), info);
    }

    /// Consumer side: records an emergency received from another node.
    pub fn handle_frame(&mut self, frame: &CanFrame) {
        if let Some(message) = EmergencyMessage::from_frame(frame) {
            debug!(
                "[EMCY] Received emergency {:#06X} from node {}",
                message.code, message.node_id
            );
            if self.received.len() == RX_QUEUE_CAP {
                self.received.pop_front();
            }
            self.received.push_back(message);
        }
    }

    /// Pops the oldest received emergency, if any.
    pub fn pop_received(&mut self) -> Option<EmergencyMessage> {
        self.received.pop_front()
    }

    /// Flushes pending emissions. Emergencies are only transmitted in
    /// PreOperational and Operational.
    pub fn process(&mut self, nmt_state: NmtState, tx: &mut dyn FnMut(&CanFrame)) {
        if !self.producer_enabled
            || !matches!(nmt_state, NmtState::PreOperational | NmtState::Operational)
        {
            return;
        }
        while let Some(data) = self.pending.pop_front() {
            tx(&CanFrame::new(self.cob_id, &data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::predefined;
    use core::convert::TryFrom;

    fn setup() -> (ObjectDictionary, Emcy) {
        let mut od = ObjectDictionary::new();
        let node_id = NodeId::try_from(0x20).unwrap();
        predefined::populate_communication_profile(&mut od, node_id);
        let emcy = Emcy::from_od(&mut od, node_id);
        (od, emcy)
    }

    fn collect(emcy: &mut Emcy, state: NmtState) -> alloc::vec::Vec<CanFrame> {
        let mut frames = alloc::vec::Vec::new();
        emcy.process(state, &mut |f| frames.push(*f));
        frames
    }

    #[test]
    fn test_report_emits_and_sets_register() {
        let (mut od, mut emcy) = setup();
        emcy.error_report(&mut od, EM_HEARTBEAT, ERR_REG_COMMUNICATION, 0x10);
        assert!(emcy.is_error_active(EM_HEARTBEAT));
        assert_eq!(od.read_u8(IDX_ERROR_REGISTER, 0), Ok(ERR_REG_COMMUNICATION));

        let frames = collect(&mut emcy, NmtState::Operational);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].can_id(), 0x0A0);
        assert_eq!(&frames[0].payload()[0..2], &EM_HEARTBEAT.to_le_bytes());
        assert_eq!(frames[0].payload()[2], ERR_REG_COMMUNICATION);
    }

    #[test]
    fn test_duplicate_report_emits_once() {
        let (mut od, mut emcy) = setup();
        emcy.error_report(&mut od, EM_PDO_LENGTH, ERR_REG_COMMUNICATION, 0);
        emcy.error_report(&mut od, EM_PDO_LENGTH, ERR_REG_COMMUNICATION, 0);
        assert_eq!(collect(&mut emcy, NmtState::Operational).len(), 1);
    }

    #[test]
    fn test_reset_emits_code_zero() {
        let (mut od, mut emcy) = setup();
        emcy.error_report(&mut od, EM_HEARTBEAT, ERR_REG_COMMUNICATION, 0);
        let _ = collect(&mut emcy, NmtState::Operational);

        emcy.error_reset(&mut od, EM_HEARTBEAT, 0x10);
        assert!(!emcy.is_error_active(EM_HEARTBEAT));
        assert_eq!(od.read_u8(IDX_ERROR_REGISTER, 0), Ok(0));

        let frames = collect(&mut emcy, NmtState::Operational);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload()[0..2], &EM_NO_ERROR.to_le_bytes());
    }

    #[test]
    fn test_no_emission_while_stopped() {
        let (mut od, mut emcy) = setup();
        emcy.error_report(&mut od, EM_GENERIC, ERR_REG_GENERIC, 0);
        assert!(collect(&mut emcy, NmtState::Stopped).is_empty());
        // Emission deferred, not lost.
        assert_eq!(collect(&mut emcy, NmtState::PreOperational).len(), 1);
    }

    #[test]
    fn test_consumer_parses_frames() {
        let (_od, mut emcy) = setup();
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&EM_HEARTBEAT.to_le_bytes());
        payload[2] = ERR_REG_COMMUNICATION;
        emcy.handle_frame(&CanFrame::new(0x085, &payload));

        let message = emcy.pop_received().unwrap();
        assert_eq!(message.node_id, 0x05);
        assert_eq!(message.code, EM_HEARTBEAT);
        assert!(emcy.pop_received().is_none());
    }
}
