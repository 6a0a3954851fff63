use super::{transmission, PdoBase, PdoDirection};
use crate::bus::CanFrame;
use crate::nmt::NmtState;
use crate::od::{ObjectDictionary, OdError};
use crate::sync::SyncEvent;
use crate::types::{IDX_TPDO_COMM_BASE, IDX_TPDO_MAP_BASE};
use log::trace;

/// A transmit PDO.
///
/// Event-driven TPDOs watch the per-entry change-flag bitmap: the application
/// write path clears a bit to signal a change, and the engine sets it back
/// after transmitting. Synchronous TPDOs are paced by the SYNC counter. At
/// most one frame is emitted per TPDO per tick.
pub struct Tpdo {
    pub base: PdoBase,
    pdo_num: usize,
    /// Minimum spacing of event-driven transmissions, µs (sub-index 3,
    /// 100 µs units).
    inhibit_us: u64,
    /// Event timer, µs (sub-index 5, ms units). 0 disables.
    event_us: u64,
    /// First cyclic transmission aligns to this SYNC counter value
    /// (sub-index 6). 0 disables the alignment.
    sync_start: u8,
    inhibit_elapsed: u64,
    event_elapsed: u64,
    syncs_since_send: u8,
    sync_start_seen: bool,
    request: bool,
    deferred: bool,
}

impl Tpdo {
    /// Loads TPDO `pdo_num` (zero-based) from its communication and mapping
    /// records, and prepares the change-flag slots of every mapped entry.
    pub fn from_od(od: &mut ObjectDictionary, pdo_num: usize) -> Result<Self, OdError> {
        let comm_index = IDX_TPDO_COMM_BASE + pdo_num as u16;
        let map_index = IDX_TPDO_MAP_BASE + pdo_num as u16;
        let base = PdoBase::from_od(od, comm_index, map_index, PdoDirection::Transmit)?;
        let inhibit_us = od
            .read_u16(comm_index, 3)
            .map(|t| t as u64 * 100)
            .unwrap_or(0);
        let event_us = od
            .read_u16(comm_index, 5)
            .map(|ms| ms as u64 * 1_000)
            .unwrap_or(0);
        let sync_start = od.read_u8(comm_index, 6).unwrap_or(0);

        for mapping in base.mappings.iter().filter(|m| !m.is_dummy()) {
            if let Some(entry) = od.index_mut(mapping.index) {
                entry.ensure_extension();
                entry.pdo_flag_acknowledge(pdo_num);
            }
        }

        Ok(Self {
            base,
            pdo_num,
            inhibit_us,
            event_us,
            sync_start,
            // The first event-driven transmission must not be inhibited.
            inhibit_elapsed: inhibit_us,
            event_elapsed: 0,
            syncs_since_send: 0,
            sync_start_seen: false,
            request: false,
            deferred: false,
        })
    }

    pub fn pdo_number(&self) -> usize {
        self.pdo_num
    }

    /// Application-level transmission request, for synchronous-acyclic and
    /// manufacturer-triggered types.
    pub fn request_transmission(&mut self) {
        self.request = true;
    }

    fn changed(&self, od: &ObjectDictionary) -> bool {
        self.base.mappings.iter().any(|m| {
            !m.is_dummy()
                && od
                    .index(m.index)
                    .map(|e| e.pdo_flag_pending(self.pdo_num))
                    .unwrap_or(false)
        })
    }

    fn build_and_send(&mut self, od: &mut ObjectDictionary, tx: &mut dyn FnMut(&CanFrame)) {
        let mut data = [0u8; 8];
        let mut offset = 0usize;
        for mapping in self.base.mappings.iter() {
            let Some(length) = mapping.byte_length() else {
                continue;
            };
            if !mapping.is_dummy() {
                if let Err(err) =
                    od.read_raw(mapping.index, mapping.sub_index, &mut data[offset..offset + length])
                {
                    trace!(
                        "[PDO] TPDO {} read of {:#06X}:{} failed: {}",
                        self.pdo_num + 1,
                        mapping.index,
                        mapping.sub_index,
                        err
                    );
                }
            }
            offset += length;
        }
        tx(&CanFrame::new(self.base.cob_id, &data[..self.base.data_length]));

        for mapping in self.base.mappings.iter().filter(|m| !m.is_dummy()) {
            if let Some(entry) = od.index_mut(mapping.index) {
                entry.pdo_flag_acknowledge(self.pdo_num);
            }
        }
        self.inhibit_elapsed = 0;
        self.event_elapsed = 0;
        self.syncs_since_send = 0;
        self.request = false;
        self.deferred = false;
    }

    /// Evaluates the transmission triggers for this tick. Returns the time to
    /// the next internal deadline.
    pub fn process(
        &mut self,
        od: &mut ObjectDictionary,
        nmt_state: NmtState,
        sync: SyncEvent,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) -> u64 {
        if !self.base.valid || !nmt_state.pdo_allowed() {
            return u64::MAX;
        }
        self.inhibit_elapsed = self.inhibit_elapsed.saturating_add(delta_us);

        match self.base.transmission_type {
            transmission::SYNC_ACYCLIC => {
                if sync.occurred && (self.request || self.changed(od)) {
                    self.build_and_send(od, tx);
                }
                u64::MAX
            }
            cycle @ 1..=transmission::SYNC_CYCLIC_MAX => {
                if sync.occurred {
                    if self.sync_start != 0 && !self.sync_start_seen {
                        if sync.counter == self.sync_start {
                            self.sync_start_seen = true;
                            self.build_and_send(od, tx);
                        }
                    } else {
                        self.syncs_since_send += 1;
                        if self.syncs_since_send >= cycle {
                            self.build_and_send(od, tx);
                        }
                    }
                }
                u64::MAX
            }
            _ => self.process_event_driven(od, delta_us, tx),
        }
    }

    fn process_event_driven(
        &mut self,
        od: &mut ObjectDictionary,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) -> u64 {
        let mut trigger = self.deferred || self.request || self.changed(od);
        if self.event_us > 0 {
            self.event_elapsed += delta_us;
            if self.event_elapsed >= self.event_us {
                trigger = true;
            }
        }

        if trigger {
            if self.inhibit_elapsed >= self.inhibit_us {
                self.build_and_send(od, tx);
            } else {
                self.deferred = true;
            }
        }

        let mut next_us = u64::MAX;
        if self.deferred {
            next_us = next_us.min(self.inhibit_us - self.inhibit_elapsed);
        }
        if self.event_us > 0 {
            next_us = next_us.min(self.event_us.saturating_sub(self.event_elapsed));
        }
        next_us
    }
}
