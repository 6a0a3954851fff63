//! Network management: the NMT slave state machine, heartbeat production and
//! heartbeat consumption.

use crate::bus::CanFrame;
use crate::emcy::{Emcy, EM_HEARTBEAT, ERR_REG_COMMUNICATION};
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_HEARTBEAT, COB_ID_NMT, IDX_CONSUMER_HEARTBEAT, IDX_PRODUCER_HEARTBEAT, NodeId};
use alloc::vec::Vec;
use core::convert::TryFrom;
use log::{debug, info, warn};

/// NMT states of a CANopen device (CiA 301, Section 8.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmtState {
    #[default]
    Initializing,
    PreOperational,
    Operational,
    Stopped,
}

impl NmtState {
    /// The state code transmitted in heartbeat frames. `Initializing`
    /// doubles as the boot-up message code.
    pub fn code(&self) -> u8 {
        match self {
            NmtState::Initializing => 0x00,
            NmtState::Stopped => 0x04,
            NmtState::Operational => 0x05,
            NmtState::PreOperational => 0x7F,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(NmtState::Initializing),
            0x04 => Some(NmtState::Stopped),
            0x05 => Some(NmtState::Operational),
            0x7F => Some(NmtState::PreOperational),
            _ => None,
        }
    }

    /// PDO exchange is permitted only in Operational.
    pub fn pdo_allowed(&self) -> bool {
        matches!(self, NmtState::Operational)
    }

    /// SDO and EMCY are permitted in Operational and PreOperational.
    pub fn sdo_allowed(&self) -> bool {
        matches!(self, NmtState::Operational | NmtState::PreOperational)
    }
}

/// NMT command bytes carried on COB-ID 0x000 (CiA 301, Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    EnterOperational = 0x01,
    Stop = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl TryFrom<u8> for NmtCommand {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NmtCommand::EnterOperational),
            0x02 => Ok(NmtCommand::Stop),
            0x80 => Ok(NmtCommand::EnterPreOperational),
            0x81 => Ok(NmtCommand::ResetNode),
            0x82 => Ok(NmtCommand::ResetCommunication),
            other => Err(other),
        }
    }
}

/// Resets requested by a received NMT command; executed by the node, not by
/// this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmtAction {
    #[default]
    None,
    ResetNode,
    ResetCommunication,
}

/// One monitored heartbeat producer (an entry of OD 0x1016).
#[derive(Debug, Clone, Copy)]
pub struct HbConsumer {
    pub node_id: u8,
    pub timeout_us: u64,
    elapsed_us: u64,
    /// Last NMT state code seen from the producer.
    pub last_state: Option<NmtState>,
    /// Entry is in error: the producer missed its deadline.
    pub timed_out: bool,
}

/// NMT slave state plus heartbeat producer and consumers for one node.
pub struct Nmt {
    node_id: NodeId,
    state: NmtState,
    pending_command: Option<NmtCommand>,
    /// Producer interval in µs; 0 disables the producer.
    hb_producer_us: u64,
    hb_elapsed_us: u64,
    boot_up_pending: bool,
    consumers: Vec<HbConsumer>,
}

impl Nmt {
    /// Builds the module from OD 0x1017 (producer time) and 0x1016 (consumer
    /// entries). The node starts in `Initializing`; the first `process` call
    /// emits the boot-up message and enters PreOperational.
    pub fn from_od(od: &mut ObjectDictionary, node_id: NodeId) -> Self {
        let mut nmt = Self {
            node_id,
            state: NmtState::Initializing,
            pending_command: None,
            hb_producer_us: 0,
            hb_elapsed_us: 0,
            boot_up_pending: true,
            consumers: Vec::new(),
        };
        nmt.load_configuration(od);
        nmt
    }

    fn load_configuration(&mut self, od: &mut ObjectDictionary) {
        self.hb_producer_us = od
            .read_u16(IDX_PRODUCER_HEARTBEAT, 0)
            .map(|ms| ms as u64 * 1_000)
            .unwrap_or(0);

        self.consumers.clear();
        let slots = od.read_u8(IDX_CONSUMER_HEARTBEAT, 0).unwrap_or(0);
        for sub in 1..=slots {
            let Ok(raw) = od.read_u32(IDX_CONSUMER_HEARTBEAT, sub) else {
                continue;
            };
            let monitored = ((raw >> 16) & 0xFF) as u8;
            let time_ms = (raw & 0xFFFF) as u64;
            if monitored == 0 || monitored > 127 || time_ms == 0 {
                continue;
            }
            if self.consumers.iter().any(|c| c.node_id == monitored) {
                warn!("[NMT] Duplicate heartbeat consumer entry for node {}", monitored);
                continue;
            }
            self.consumers.push(HbConsumer {
                node_id: monitored,
                timeout_us: time_ms * 1_000,
                elapsed_us: 0,
                last_state: None,
                timed_out: false,
            });
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Consumer table, for diagnostics.
    pub fn consumers(&self) -> &[HbConsumer] {
        &self.consumers
    }

    /// Re-reads configuration and restarts the boot-up sequence. Called on
    /// communication reset.
    pub fn reset_communication(&mut self, od: &mut ObjectDictionary) {
        self.state = NmtState::Initializing;
        self.pending_command = None;
        self.hb_elapsed_us = 0;
        self.boot_up_pending = true;
        self.load_configuration(od);
    }

    /// Router entry point for frames on COB-ID 0x000.
    pub fn handle_command_frame(&mut self, frame: &CanFrame) {
        let payload = frame.payload();
        if payload.len() < 2 {
            return;
        }
        let Ok(command) = NmtCommand::try_from(payload[0]) else {
            debug!("[NMT] Ignoring unknown command byte {:#04X}", payload[0]);
            return;
        };
        let target = payload[1];
        if target == 0 || target == self.node_id.0 {
            self.pending_command = Some(command);
        }
    }

    /// Router entry point for heartbeat frames (0x700..=0x77F). Recovery of a
    /// timed-out producer emits an error-reset emergency.
    pub fn handle_heartbeat(&mut self, frame: &CanFrame, od: &mut ObjectDictionary, emcy: &mut Emcy) {
        let producer = (frame.can_id() & 0x7F) as u8;
        let payload = frame.payload();
        if payload.is_empty() {
            return;
        }
        let state = NmtState::from_code(payload[0] & 0x7F);
        for consumer in self.consumers.iter_mut() {
            if consumer.node_id != producer {
                continue;
            }
            consumer.elapsed_us = 0;
            consumer.last_state = state;
            if consumer.timed_out {
                info!("[NMT] Heartbeat of node {} recovered", producer);
                consumer.timed_out = false;
                emcy.error_reset(od, EM_HEARTBEAT, producer as u32);
            }
        }
    }

    /// Applies a pending NMT command, advances the heartbeat producer and
    /// checks the consumers. Returns the reset request (if any) and the time
    /// to the next internal deadline in µs.
    pub fn process(
        &mut self,
        od: &mut ObjectDictionary,
        emcy: &mut Emcy,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) -> (NmtAction, u64) {
        let mut action = NmtAction::None;

        // Boot-up: leave Initializing, announce with state code 0.
        if self.boot_up_pending {
            self.boot_up_pending = false;
            self.state = NmtState::PreOperational;
            tx(&CanFrame::new(
                COB_ID_HEARTBEAT + self.node_id.0 as u32,
                &[NmtState::Initializing.code()],
            ));
            info!("[NMT] Node {} booted, entering PreOperational", self.node_id);
        }

        if let Some(command) = self.pending_command.take() {
            match command {
                NmtCommand::EnterOperational => self.transition(NmtState::Operational),
                NmtCommand::Stop => self.transition(NmtState::Stopped),
                NmtCommand::EnterPreOperational => self.transition(NmtState::PreOperational),
                NmtCommand::ResetNode => action = NmtAction::ResetNode,
                NmtCommand::ResetCommunication => action = NmtAction::ResetCommunication,
            }
        }

        let mut next_us = u64::MAX;

        // Heartbeat producer.
        if self.hb_producer_us > 0 {
            self.hb_elapsed_us += delta_us;
            if self.hb_elapsed_us >= self.hb_producer_us {
                self.hb_elapsed_us = 0;
                tx(&CanFrame::new(
                    COB_ID_HEARTBEAT + self.node_id.0 as u32,
                    &[self.state.code()],
                ));
            }
            next_us = next_us.min(self.hb_producer_us - self.hb_elapsed_us);
        }

        // Heartbeat consumers.
        for consumer in self.consumers.iter_mut() {
            if consumer.timed_out {
                continue;
            }
            consumer.elapsed_us += delta_us;
            if consumer.elapsed_us > consumer.timeout_us {
                warn!(
                    "[NMT] Heartbeat timeout for node {} ({} ms)",
                    consumer.node_id,
                    consumer.timeout_us / 1_000
                );
                consumer.timed_out = true;
                emcy.error_report(od, EM_HEARTBEAT, ERR_REG_COMMUNICATION, consumer.node_id as u32);
            } else {
                next_us = next_us.min(consumer.timeout_us - consumer.elapsed_us);
            }
        }

        (action, next_us)
    }

    fn transition(&mut self, target: NmtState) {
        if self.state != target {
            info!("[NMT] {:?} -> {:?}", self.state, target);
            self.state = target;
        }
    }
}

/// Builds an NMT master command frame (COB-ID 0x000). `target` 0 broadcasts.
pub fn nmt_command_frame(command: NmtCommand, target: u8) -> CanFrame {
    CanFrame::new(COB_ID_NMT, &[command as u8, target])
}
