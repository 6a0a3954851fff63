//! TIME stamp object producer and consumer.
//!
//! The TIME object carries a 48-bit TIME_OF_DAY value: a 32-bit field holding
//! milliseconds since midnight (28 bits significant) and a 16-bit day count
//! since 1984-01-01. Consumers overwrite the node's local wall-clock on
//! reception.

use crate::bus::CanFrame;
use crate::nmt::NmtState;
use crate::od::ObjectDictionary;
use crate::types::{
    COB_ID_FLAG_INVALID, COB_ID_FLAG_PRODUCER, COB_ID_MASK, COB_ID_TIME, IDX_TIME_COB_ID,
};
use log::debug;

/// Mask of the significant bits in the milliseconds field.
pub const TIME_OF_DAY_MS_MASK: u32 = 0x0FFF_FFFF;
/// Milliseconds in one day.
pub const MS_PER_DAY: u32 = 24 * 60 * 60 * 1_000;

/// A CANopen TIME_OF_DAY value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeOfDay {
    /// Milliseconds since midnight, 28 bits significant.
    pub millis: u32,
    /// Days since 1 January 1984.
    pub days: u16,
}

impl TimeOfDay {
    /// Encodes into the 6-byte wire format.
    pub fn encode(&self) -> [u8; 6] {
        let mut data = [0u8; 6];
        data[0..4].copy_from_slice(&(self.millis & TIME_OF_DAY_MS_MASK).to_le_bytes());
        data[4..6].copy_from_slice(&self.days.to_le_bytes());
        data
    }

    /// Decodes from the wire format; needs at least 6 bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        Some(Self {
            millis: u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & TIME_OF_DAY_MS_MASK,
            days: u16::from_le_bytes([data[4], data[5]]),
        })
    }

    /// Advances the timestamp by a number of microseconds, carrying into the
    /// day counter.
    pub fn advance_us(&mut self, delta_us: u64) {
        let total_ms = self.millis as u64 + delta_us / 1_000;
        self.days = self.days.wrapping_add((total_ms / MS_PER_DAY as u64) as u16);
        self.millis = (total_ms % MS_PER_DAY as u64) as u32;
    }
}

/// TIME producer/consumer state for one node.
pub struct Time {
    cob_id: u32,
    is_producer: bool,
    is_consumer: bool,
    /// Producer interval in µs; 0 disables the producer.
    pub producer_interval_us: u64,
    elapsed_us: u64,
    /// Sub-millisecond remainder carried between ticks.
    residual_us: u64,
    /// The node's current wall-clock.
    pub now: TimeOfDay,
}

impl Time {
    /// Builds the module from OD 0x1012. Bit 30 enables production, bit 31
    /// disables consumption (mirroring the COB-ID validity convention).
    pub fn from_od(od: &mut ObjectDictionary) -> Self {
        let raw = od.read_u32(IDX_TIME_COB_ID, 0).unwrap_or(COB_ID_TIME);
        Self {
            cob_id: raw & COB_ID_MASK,
            is_producer: raw & COB_ID_FLAG_PRODUCER != 0,
            is_consumer: raw & COB_ID_FLAG_INVALID == 0,
            producer_interval_us: 0,
            elapsed_us: 0,
            residual_us: 0,
            now: TimeOfDay::default(),
        }
    }

    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    /// Re-reads configuration, keeping the current wall-clock. Called on
    /// communication reset.
    pub fn reset_communication(&mut self, od: &mut ObjectDictionary) {
        let now = self.now;
        let interval = self.producer_interval_us;
        *self = Self::from_od(od);
        self.now = now;
        self.producer_interval_us = interval;
    }

    /// Router entry point for frames on the TIME COB-ID.
    pub fn handle_frame(&mut self, frame: &CanFrame) {
        if !self.is_consumer {
            return;
        }
        match TimeOfDay::decode(frame.payload()) {
            Some(stamp) => {
                debug!("[TIME] Clock set to day {} ms {}", stamp.days, stamp.millis);
                self.now = stamp;
                self.residual_us = 0;
            }
            None => debug!("[TIME] Short TIME frame ignored"),
        }
    }

    /// Advances the local clock and runs the producer. Returns the time to
    /// the next deadline.
    pub fn process(
        &mut self,
        nmt_state: NmtState,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) -> u64 {
        let total = self.residual_us + delta_us;
        self.residual_us = total % 1_000;
        self.now.advance_us(total - self.residual_us);

        if !self.is_producer || self.producer_interval_us == 0 || !nmt_state.sdo_allowed() {
            return u64::MAX;
        }
        self.elapsed_us += delta_us;
        if self.elapsed_us >= self.producer_interval_us {
            self.elapsed_us = 0;
            tx(&CanFrame::new(self.cob_id, &self.now.encode()));
        }
        self.producer_interval_us - self.elapsed_us
    }
}
