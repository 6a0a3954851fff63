use super::{PdoBase, PdoDirection};
use crate::bus::CanFrame;
use crate::emcy::{Emcy, EM_PDO_LENGTH, EM_PDO_LENGTH_EXC, EM_RPDO_TIMEOUT, ERR_REG_COMMUNICATION};
use crate::nmt::NmtState;
use crate::od::{ObjectDictionary, OdError};
use crate::sync::SyncEvent;
use crate::types::{IDX_RPDO_COMM_BASE, IDX_RPDO_MAP_BASE};
use log::{trace, warn};

/// A receive PDO.
///
/// Synchronous RPDOs (transmission type 0..=240) keep two reception buffers:
/// frames land in the filling buffer and are only applied to the dictionary
/// on the tick that observes a SYNC, so the application sees data aligned to
/// the SYNC boundary. Asynchronous RPDOs apply on the next tick.
pub struct Rpdo {
    pub base: PdoBase,
    pdo_num: usize,
    /// Deadline monitor (communication record sub-index 5), µs. 0 disables.
    event_timeout_us: u64,
    elapsed_us: u64,
    deadline_armed: bool,
    timeout_reported: bool,
    buffers: [[u8; 8]; 2],
    has_data: [bool; 2],
    /// Buffer currently receiving frames (synchronous mode).
    filling: usize,
    length_error: bool,
    err_long_pending: bool,
    err_short_pending: bool,
    err_clear_pending: bool,
    timeout_clear_pending: bool,
}

impl Rpdo {
    /// Loads RPDO `pdo_num` (zero-based) from its communication and mapping
    /// records.
    pub fn from_od(od: &mut ObjectDictionary, pdo_num: usize) -> Result<Self, OdError> {
        let comm_index = IDX_RPDO_COMM_BASE + pdo_num as u16;
        let map_index = IDX_RPDO_MAP_BASE + pdo_num as u16;
        let base = PdoBase::from_od(od, comm_index, map_index, PdoDirection::Receive)?;
        let event_timeout_us = od
            .read_u16(comm_index, 5)
            .map(|ms| ms as u64 * 1_000)
            .unwrap_or(0);
        Ok(Self {
            base,
            pdo_num,
            event_timeout_us,
            elapsed_us: 0,
            deadline_armed: false,
            timeout_reported: false,
            buffers: [[0; 8]; 2],
            has_data: [false; 2],
            filling: 0,
            length_error: false,
            err_long_pending: false,
            err_short_pending: false,
            err_clear_pending: false,
            timeout_clear_pending: false,
        })
    }

    pub fn pdo_number(&self) -> usize {
        self.pdo_num
    }

    /// Router entry point for frames on this RPDO's COB-ID.
    pub fn handle_frame(&mut self, frame: &CanFrame) {
        if !self.base.valid {
            return;
        }
        let dlc = frame.dlc as usize;
        if dlc < self.base.data_length {
            // Too short to satisfy the mapping: discard and flag.
            warn!(
                "[PDO] RPDO {} frame too short ({} < {})",
                self.pdo_num + 1,
                dlc,
                self.base.data_length
            );
            self.length_error = true;
            self.err_short_pending = true;
            return;
        }
        if dlc > self.base.data_length {
            // Longer than mapped: consume the mapped prefix, note the excess.
            self.err_long_pending = true;
        } else if self.length_error {
            self.length_error = false;
            self.err_clear_pending = true;
        }

        let slot = if self.base.is_synchronous() { self.filling } else { 0 };
        self.buffers[slot] = [0; 8];
        self.buffers[slot][..self.base.data_length]
            .copy_from_slice(&frame.data[..self.base.data_length]);
        self.has_data[slot] = true;

        // Each valid reception restarts the deadline monitor.
        self.elapsed_us = 0;
        self.deadline_armed = self.event_timeout_us > 0;
        if self.timeout_reported {
            self.timeout_reported = false;
            self.timeout_clear_pending = true;
        }
    }

    fn apply(&mut self, od: &mut ObjectDictionary, slot: usize) {
        let mut offset = 0usize;
        for mapping in self.base.mappings.iter() {
            let Some(length) = mapping.byte_length() else {
                continue;
            };
            if !mapping.is_dummy() {
                let data = &self.buffers[slot][offset..offset + length];
                if let Err(err) = od.write_raw(mapping.index, mapping.sub_index, data) {
                    trace!(
                        "[PDO] RPDO {} write to {:#06X}:{} failed: {}",
                        self.pdo_num + 1,
                        mapping.index,
                        mapping.sub_index,
                        err
                    );
                }
            }
            offset += length;
        }
        self.has_data[slot] = false;
    }

    /// Applies buffered frames and advances the deadline monitor. Returns the
    /// time to the next internal deadline.
    pub fn process(
        &mut self,
        od: &mut ObjectDictionary,
        emcy: &mut Emcy,
        nmt_state: NmtState,
        sync: SyncEvent,
        delta_us: u64,
    ) -> u64 {
        // Length bookkeeping is reported even when not Operational yet.
        if self.err_short_pending {
            self.err_short_pending = false;
            emcy.error_report(od, EM_PDO_LENGTH, ERR_REG_COMMUNICATION, self.pdo_num as u32 + 1);
        }
        if self.err_long_pending {
            self.err_long_pending = false;
            emcy.error_report(od, EM_PDO_LENGTH_EXC, ERR_REG_COMMUNICATION, self.pdo_num as u32 + 1);
        }
        if self.err_clear_pending {
            self.err_clear_pending = false;
            emcy.error_reset(od, EM_PDO_LENGTH, self.pdo_num as u32 + 1);
            emcy.error_reset(od, EM_PDO_LENGTH_EXC, self.pdo_num as u32 + 1);
        }
        if self.timeout_clear_pending {
            self.timeout_clear_pending = false;
            emcy.error_reset(od, EM_RPDO_TIMEOUT, self.pdo_num as u32 + 1);
        }

        if !self.base.valid || !nmt_state.pdo_allowed() {
            return u64::MAX;
        }

        if self.base.is_synchronous() {
            if sync.occurred {
                let slot = self.filling;
                self.filling ^= 1;
                if self.has_data[slot] {
                    self.apply(od, slot);
                }
            }
        } else if self.has_data[0] {
            self.apply(od, 0);
        }

        let mut next_us = u64::MAX;
        if self.deadline_armed && !self.timeout_reported {
            self.elapsed_us += delta_us;
            if self.elapsed_us > self.event_timeout_us {
                warn!("[PDO] RPDO {} deadline missed", self.pdo_num + 1);
                self.timeout_reported = true;
                self.deadline_armed = false;
                emcy.error_report(od, EM_RPDO_TIMEOUT, ERR_REG_COMMUNICATION, self.pdo_num as u32 + 1);
            } else {
                next_us = self.event_timeout_us - self.elapsed_us;
            }
        }
        next_us
    }
}
