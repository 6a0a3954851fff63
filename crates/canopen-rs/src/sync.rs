//! SYNC producer and consumer.
//!
//! The SYNC object phases synchronous PDOs: consumers latch a per-tick
//! `sync_was` flag that the PDO engine samples, and expose the optional
//! counter to TPDOs with a SYNC start value.

use crate::bus::CanFrame;
use crate::nmt::NmtState;
use crate::od::ObjectDictionary;
use crate::types::{
    COB_ID_FLAG_PRODUCER, COB_ID_MASK, COB_ID_SYNC, IDX_SYNC_COB_ID, IDX_SYNC_COUNTER_OVERFLOW,
    IDX_SYNC_CYCLE_PERIOD, IDX_SYNC_WINDOW_LENGTH,
};
use log::{debug, warn};

/// Result of one SYNC tick, sampled by the PDO engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncEvent {
    /// A SYNC was seen (received or produced) since the previous tick.
    pub occurred: bool,
    /// Counter value of that SYNC; 0 when the counter is disabled.
    pub counter: u8,
}

/// SYNC producer/consumer state for one node.
pub struct Sync {
    cob_id: u32,
    is_producer: bool,
    period_us: u64,
    elapsed_us: u64,
    /// Synchronous window length (OD 0x1007), exposed for applications that
    /// gate synchronous output on it.
    pub window_us: u64,
    counter_overflow: u8,
    counter: u8,
    received: bool,
    received_counter: u8,
}

impl Sync {
    /// Builds the module from OD 0x1005/0x1006/0x1007/0x1019. Bit 30 of the
    /// COB-ID entry makes this node the SYNC producer.
    pub fn from_od(od: &mut ObjectDictionary) -> Self {
        let raw = od.read_u32(IDX_SYNC_COB_ID, 0).unwrap_or(COB_ID_SYNC);
        let counter_overflow = od.read_u8(IDX_SYNC_COUNTER_OVERFLOW, 0).unwrap_or(0);
        if counter_overflow == 1 || counter_overflow > 240 {
            warn!(
                "[SYNC] Counter overflow {} out of range, counter disabled",
                counter_overflow
            );
        }
        Self {
            cob_id: raw & COB_ID_MASK,
            is_producer: raw & COB_ID_FLAG_PRODUCER != 0,
            period_us: od.read_u32(IDX_SYNC_CYCLE_PERIOD, 0).unwrap_or(0) as u64,
            elapsed_us: 0,
            window_us: od.read_u32(IDX_SYNC_WINDOW_LENGTH, 0).unwrap_or(0) as u64,
            counter_overflow: if (2..=240).contains(&counter_overflow) {
                counter_overflow
            } else {
                0
            },
            counter: 0,
            received: false,
            received_counter: 0,
        }
    }

    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    /// Re-reads configuration. Called on communication reset.
    pub fn reset_communication(&mut self, od: &mut ObjectDictionary) {
        *self = Self::from_od(od);
    }

    /// Router entry point for frames on the SYNC COB-ID.
    pub fn handle_frame(&mut self, frame: &CanFrame) {
        self.received = true;
        if self.counter_overflow > 0 {
            match frame.payload().first() {
                Some(&counter) => self.received_counter = counter,
                None => debug!("[SYNC] Expected counter byte, got empty frame"),
            }
        }
    }

    /// Advances the producer timer and latches the per-tick SYNC phase.
    /// Returns the event for this tick and the time to the next deadline.
    pub fn process(
        &mut self,
        nmt_state: NmtState,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) -> (SyncEvent, u64) {
        let mut event = SyncEvent::default();
        let mut next_us = u64::MAX;

        if self.received {
            self.received = false;
            event.occurred = true;
            event.counter = self.received_counter;
        }

        if self.is_producer && self.period_us > 0 && nmt_state.sdo_allowed() {
            self.elapsed_us += delta_us;
            if self.elapsed_us >= self.period_us {
                self.elapsed_us = 0;
                if self.counter_overflow > 0 {
                    self.counter = if self.counter >= self.counter_overflow {
                        1
                    } else {
                        self.counter + 1
                    };
                    tx(&CanFrame::new(self.cob_id, &[self.counter]));
                } else {
                    tx(&CanFrame::new(self.cob_id, &[]));
                }
                event.occurred = true;
                event.counter = self.counter;
            }
            next_us = self.period_us - self.elapsed_us;
        }

        (event, next_us)
    }
}
