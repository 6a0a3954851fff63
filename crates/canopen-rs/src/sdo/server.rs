//! SDO server: answers client requests against this node's Object
//! Dictionary. Supports expedited, segmented and block transfers in both
//! directions on the `0x600 + id` / `0x580 + id` COB-ID pair.

use super::{
    abort_payload, ccs, scs, CrcCcitt, SdoAbortCode, SdoState, CS_ABORT, SDO_BLOCK_MAX_SIZE,
    SDO_DEFAULT_TIMEOUT_US, SDO_SEGMENT_DATA,
};
use crate::bus::CanFrame;
use crate::nmt::NmtState;
use crate::od::{ObjectDictionary, OdError};
use crate::types::{COB_ID_MASK, IDX_SDO_SERVER_PARAM, NodeId, COB_ID_SDO_SERVER_RX, COB_ID_SDO_SERVER_TX};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Block size this server advertises for block downloads.
const SERVER_BLOCK_SIZE: u8 = SDO_BLOCK_MAX_SIZE;

/// SDO server endpoint for one node.
pub struct SdoServer {
    cob_id_rx: u32,
    cob_id_tx: u32,
    state: SdoState,
    index: u16,
    sub_index: u8,
    /// Toggle bit of the next expected/produced segment (0x00 or 0x10).
    toggle: u8,
    pub timeout_us: u64,
    elapsed_us: u64,
    /// Upload payload / download accumulator.
    buffer: Vec<u8>,
    /// Upload read position.
    buf_offset: usize,
    /// Download size announced in the initiate frame; 0 when unknown.
    size_indicated: usize,
    rx: Option<[u8; 8]>,
    // Block transfer context.
    crc_enabled: bool,
    crc: CrcCcitt,
    block_size: u8,
    /// Next expected (download) or next to send (upload) sequence number.
    seqno: u8,
    /// Highest consecutively received seqno of the current sub-block.
    ack_seqno: u8,
    /// The sub-block carrying the last-segment flag has been received.
    block_complete: bool,
}

impl SdoServer {
    /// Builds the server from OD 0x1200, falling back to the pre-defined
    /// connection set.
    pub fn from_od(od: &mut ObjectDictionary, node_id: NodeId) -> Self {
        let rx = od
            .read_u32(IDX_SDO_SERVER_PARAM, 1)
            .unwrap_or(COB_ID_SDO_SERVER_RX + node_id.0 as u32);
        let tx = od
            .read_u32(IDX_SDO_SERVER_PARAM, 2)
            .unwrap_or(COB_ID_SDO_SERVER_TX + node_id.0 as u32);
        Self {
            cob_id_rx: rx & COB_ID_MASK,
            cob_id_tx: tx & COB_ID_MASK,
            state: SdoState::Idle,
            index: 0,
            sub_index: 0,
            toggle: 0,
            timeout_us: SDO_DEFAULT_TIMEOUT_US,
            elapsed_us: 0,
            buffer: Vec::new(),
            buf_offset: 0,
            size_indicated: 0,
            rx: None,
            crc_enabled: false,
            crc: CrcCcitt::new(),
            block_size: SERVER_BLOCK_SIZE,
            seqno: 0,
            ack_seqno: 0,
            block_complete: false,
        }
    }

    /// COB-ID this server listens on.
    pub fn cob_id_rx(&self) -> u32 {
        self.cob_id_rx
    }

    /// Aborts any transfer in progress and re-reads the COB-IDs.
    pub fn reset_communication(&mut self, od: &mut ObjectDictionary, node_id: NodeId) {
        *self = Self::from_od(od, node_id);
    }

    /// Router entry point. SDO frames are always 8 bytes; short frames are
    /// ignored.
    pub fn handle_frame(&mut self, frame: &CanFrame) {
        if frame.dlc as usize == 8 {
            self.rx = Some(frame.data);
        } else {
            trace!("[SDO] Server ignoring short frame on {:#05X}", frame.can_id());
        }
    }

    fn reset(&mut self) {
        self.state = SdoState::Idle;
        self.elapsed_us = 0;
        self.buffer.clear();
        self.buf_offset = 0;
        self.toggle = 0;
        self.size_indicated = 0;
        self.crc = CrcCcitt::new();
        self.crc_enabled = false;
        self.seqno = 0;
        self.ack_seqno = 0;
        self.block_complete = false;
    }

    fn send(&self, data: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        tx(&CanFrame::new(self.cob_id_tx, &data));
    }

    fn abort(&mut self, code: SdoAbortCode, tx: &mut dyn FnMut(&CanFrame)) {
        debug!(
            "[SDO] Server abort {:#06X}:{}: {}",
            self.index, self.sub_index, code
        );
        let payload = abort_payload(self.index, self.sub_index, code);
        self.send(payload, tx);
        self.reset();
    }

    /// Reads the addressed object completely into the transfer buffer,
    /// honoring extension hooks and partial reads.
    fn load_upload_buffer(&mut self, od: &mut ObjectDictionary) -> Result<(), SdoAbortCode> {
        let entry = match od.index_mut(self.index) {
            Some(entry) => entry,
            None => return Err(SdoAbortCode::ObjectNotExist),
        };
        let mut streamer = entry
            .streamer(self.sub_index, false)
            .map_err(|e| e.abort_code())?;
        self.buffer.clear();
        self.buf_offset = 0;
        let mut chunk = [0u8; 64];
        loop {
            match streamer.read(&mut chunk) {
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(OdError::Partial) => self.buffer.extend_from_slice(&chunk),
                Err(err) => return Err(err.abort_code()),
            }
        }
    }

    /// Writes the accumulated download buffer to the addressed object.
    fn store_download_buffer(&mut self, od: &mut ObjectDictionary) -> Result<(), SdoAbortCode> {
        if self.size_indicated > 0 {
            if self.buffer.len() > self.size_indicated {
                return Err(SdoAbortCode::DataLong);
            }
            if self.buffer.len() < self.size_indicated {
                return Err(SdoAbortCode::DataShort);
            }
        }
        validate_comm_profile_write(od, self.index, self.sub_index, &self.buffer)?;
        let entry = match od.index_mut(self.index) {
            Some(entry) => entry,
            None => return Err(SdoAbortCode::ObjectNotExist),
        };
        let mut streamer = entry
            .streamer(self.sub_index, false)
            .map_err(|e| e.abort_code())?;
        match streamer.write(&self.buffer, true) {
            Ok(_) => Ok(()),
            Err(err) => Err(err.abort_code()),
        }
    }

    /// Advances the server: consumes a received frame and checks the
    /// transfer timeout.
    pub fn process(
        &mut self,
        od: &mut ObjectDictionary,
        nmt_state: NmtState,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) {
        if !nmt_state.sdo_allowed() {
            self.rx = None;
            if self.state.is_active() {
                self.reset();
            }
            return;
        }

        if let Some(request) = self.rx.take() {
            self.elapsed_us = 0;
            self.dispatch(request, od, tx);
        } else if self.state.is_active() {
            self.elapsed_us += delta_us;
            if self.elapsed_us > self.timeout_us {
                warn!("[SDO] Server transfer timed out");
                self.abort(SdoAbortCode::Timeout, tx);
            }
        }
    }

    fn dispatch(&mut self, request: [u8; 8], od: &mut ObjectDictionary, tx: &mut dyn FnMut(&CanFrame)) {
        if request[0] == CS_ABORT {
            if self.state.is_active() {
                debug!(
                    "[SDO] Server received abort {:#010X}",
                    u32::from_le_bytes([request[4], request[5], request[6], request[7]])
                );
                self.reset();
            }
            return;
        }

        match self.state {
            SdoState::Idle => self.on_initiate(request, od, tx),
            SdoState::DownloadSegmentReq => self.on_download_segment(request, od, tx),
            SdoState::UploadSegmentRsp => self.on_upload_segment(request, tx),
            SdoState::DownloadBlkSubblockReq => self.on_block_download_data(request, tx),
            SdoState::DownloadBlkEndReq => self.on_block_download_end(request, od, tx),
            SdoState::UploadBlkInitiateReq2 => self.on_block_upload_start(request, tx),
            SdoState::UploadBlkSubblockCrsp => self.on_block_upload_ack(request, tx),
            SdoState::UploadBlkEndCrsp => self.on_block_upload_end(request, tx),
            _ => self.abort(SdoAbortCode::CommandSpecifier, tx),
        }
    }

    fn on_initiate(&mut self, request: [u8; 8], od: &mut ObjectDictionary, tx: &mut dyn FnMut(&CanFrame)) {
        self.index = u16::from_le_bytes([request[1], request[2]]);
        self.sub_index = request[3];
        match request[0] >> 5 {
            ccs::DOWNLOAD_INITIATE => self.on_download_initiate(request, od, tx),
            ccs::UPLOAD_INITIATE => self.on_upload_initiate(od, tx),
            ccs::BLOCK_DOWNLOAD => self.on_block_download_initiate(request, od, tx),
            ccs::BLOCK_UPLOAD => self.on_block_upload_initiate(request, od, tx),
            _ => self.abort(SdoAbortCode::CommandSpecifier, tx),
        }
    }

    fn on_download_initiate(
        &mut self,
        request: [u8; 8],
        od: &mut ObjectDictionary,
        tx: &mut dyn FnMut(&CanFrame),
    ) {
        let expedited = request[0] & 0x02 != 0;
        let size_set = request[0] & 0x01 != 0;
        if expedited {
            let len = if size_set {
                4 - ((request[0] >> 2) & 0x03) as usize
            } else {
                4
            };
            self.buffer.clear();
            self.buffer.extend_from_slice(&request[4..4 + len]);
            self.size_indicated = 0;
            match self.store_download_buffer(od) {
                Ok(()) => {
                    let mut rsp = [0u8; 8];
                    rsp[0] = scs::DOWNLOAD_INITIATE << 5;
                    rsp[1..4].copy_from_slice(&request[1..4]);
                    self.send(rsp, tx);
                    self.reset();
                }
                Err(code) => self.abort(code, tx),
            }
        } else {
            self.size_indicated = if size_set {
                u32::from_le_bytes([request[4], request[5], request[6], request[7]]) as usize
            } else {
                0
            };
            self.buffer.clear();
            self.toggle = 0;
            self.state = SdoState::DownloadSegmentReq;
            let mut rsp = [0u8; 8];
            rsp[0] = scs::DOWNLOAD_INITIATE << 5;
            rsp[1..4].copy_from_slice(&request[1..4]);
            self.send(rsp, tx);
        }
    }

    fn on_download_segment(
        &mut self,
        request: [u8; 8],
        od: &mut ObjectDictionary,
        tx: &mut dyn FnMut(&CanFrame),
    ) {
        if request[0] >> 5 != ccs::DOWNLOAD_SEGMENT {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        if request[0] & 0x10 != self.toggle {
            return self.abort(SdoAbortCode::ToggleBit, tx);
        }
        let unused = ((request[0] >> 1) & 0x07) as usize;
        let last = request[0] & 0x01 != 0;
        self.buffer
            .extend_from_slice(&request[1..1 + (SDO_SEGMENT_DATA - unused)]);

        let mut rsp = [0u8; 8];
        rsp[0] = (scs::DOWNLOAD_SEGMENT << 5) | self.toggle;
        self.toggle ^= 0x10;

        if last {
            match self.store_download_buffer(od) {
                Ok(()) => {
                    self.send(rsp, tx);
                    self.reset();
                }
                Err(code) => self.abort(code, tx),
            }
        } else {
            self.send(rsp, tx);
        }
    }

    fn on_upload_initiate(&mut self, od: &mut ObjectDictionary, tx: &mut dyn FnMut(&CanFrame)) {
        if let Err(code) = self.load_upload_buffer(od) {
            return self.abort(code, tx);
        }
        let mut rsp = [0u8; 8];
        rsp[1..3].copy_from_slice(&self.index.to_le_bytes());
        rsp[3] = self.sub_index;
        if self.buffer.len() <= 4 {
            // Expedited with size indicated.
            let n = (4 - self.buffer.len()) as u8;
            rsp[0] = (scs::UPLOAD_INITIATE << 5) | (n << 2) | 0x03;
            rsp[4..4 + self.buffer.len()].copy_from_slice(&self.buffer);
            self.send(rsp, tx);
            self.reset();
        } else {
            rsp[0] = (scs::UPLOAD_INITIATE << 5) | 0x01;
            rsp[4..8].copy_from_slice(&(self.buffer.len() as u32).to_le_bytes());
            self.toggle = 0;
            self.state = SdoState::UploadSegmentRsp;
            self.send(rsp, tx);
        }
    }

    fn on_upload_segment(&mut self, request: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        if request[0] >> 5 != ccs::UPLOAD_SEGMENT {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        if request[0] & 0x10 != self.toggle {
            return self.abort(SdoAbortCode::ToggleBit, tx);
        }
        let remaining = self.buffer.len() - self.buf_offset;
        let count = remaining.min(SDO_SEGMENT_DATA);
        let last = remaining <= SDO_SEGMENT_DATA;

        let mut rsp = [0u8; 8];
        rsp[0] = (scs::UPLOAD_SEGMENT << 5)
            | self.toggle
            | (((SDO_SEGMENT_DATA - count) as u8) << 1)
            | last as u8;
        rsp[1..1 + count].copy_from_slice(&self.buffer[self.buf_offset..self.buf_offset + count]);
        self.buf_offset += count;
        self.toggle ^= 0x10;
        self.send(rsp, tx);
        if last {
            self.reset();
        }
    }

    // --- Block download (client -> server) ---

    fn on_block_download_initiate(
        &mut self,
        request: [u8; 8],
        od: &mut ObjectDictionary,
        tx: &mut dyn FnMut(&CanFrame),
    ) {
        if request[0] & 0x01 != 0 {
            // cs = 1 would be an end frame outside a transfer.
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        // Validate the target before accepting the stream.
        let writable = match od.index_mut(self.index) {
            Some(entry) => entry.streamer(self.sub_index, false).map(|_| ()),
            None => Err(OdError::IdxNotExist),
        };
        if let Err(err) = writable {
            return self.abort(err.abort_code(), tx);
        }
        self.crc_enabled = request[0] & 0x04 != 0;
        self.size_indicated = if request[0] & 0x02 != 0 {
            u32::from_le_bytes([request[4], request[5], request[6], request[7]]) as usize
        } else {
            0
        };
        self.buffer.clear();
        self.crc = CrcCcitt::new();
        self.seqno = 1;
        self.ack_seqno = 0;
        self.block_complete = false;
        self.state = SdoState::DownloadBlkSubblockReq;

        let mut rsp = [0u8; 8];
        rsp[0] = (scs::BLOCK_DOWNLOAD << 5) | 0x04; // sc = 1: CRC supported
        rsp[1..3].copy_from_slice(&self.index.to_le_bytes());
        rsp[3] = self.sub_index;
        rsp[4] = SERVER_BLOCK_SIZE;
        self.block_size = SERVER_BLOCK_SIZE;
        self.send(rsp, tx);
    }

    fn on_block_download_data(&mut self, request: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        let seqno = request[0] & 0x7F;
        let last = request[0] & 0x80 != 0;
        if seqno == 0 || seqno > self.block_size {
            return self.abort(SdoAbortCode::SequenceNumber, tx);
        }
        if seqno == self.seqno {
            // In order: take the data.
            self.buffer.extend_from_slice(&request[1..8]);
            self.ack_seqno = seqno;
            self.seqno += 1;
            if last {
                self.block_complete = true;
            }
        }
        // Out-of-order frames are dropped; the acknowledge below makes the
        // client retransmit from the last good sequence number.
        if last || seqno == self.block_size {
            let mut rsp = [0u8; 8];
            rsp[0] = (scs::BLOCK_DOWNLOAD << 5) | 0x02; // ss = 2: acknowledge
            rsp[1] = self.ack_seqno;
            rsp[2] = self.block_size;
            self.send(rsp, tx);
            self.seqno = 1;
            self.ack_seqno = 0;
            if self.block_complete {
                self.state = SdoState::DownloadBlkEndReq;
            }
        }
    }

    fn on_block_download_end(
        &mut self,
        request: [u8; 8],
        od: &mut ObjectDictionary,
        tx: &mut dyn FnMut(&CanFrame),
    ) {
        if request[0] >> 5 != ccs::BLOCK_DOWNLOAD || request[0] & 0x01 == 0 {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        let padding = ((request[0] >> 2) & 0x07) as usize;
        self.buffer.truncate(self.buffer.len().saturating_sub(padding));

        if self.crc_enabled {
            let mut crc = CrcCcitt::new();
            crc.update(&self.buffer);
            let received = u16::from_le_bytes([request[1], request[2]]);
            if crc.value() != received {
                return self.abort(SdoAbortCode::Crc, tx);
            }
        }
        match self.store_download_buffer(od) {
            Ok(()) => {
                let mut rsp = [0u8; 8];
                rsp[0] = (scs::BLOCK_DOWNLOAD << 5) | 0x01; // ss = 1: end
                self.send(rsp, tx);
                self.reset();
            }
            Err(code) => self.abort(code, tx),
        }
    }

    // --- Block upload (server -> client) ---

    fn on_block_upload_initiate(
        &mut self,
        request: [u8; 8],
        od: &mut ObjectDictionary,
        tx: &mut dyn FnMut(&CanFrame),
    ) {
        if request[0] & 0x03 != 0 {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        self.crc_enabled = request[0] & 0x04 != 0;
        let blksize = request[4];
        if blksize == 0 || blksize > SDO_BLOCK_MAX_SIZE {
            return self.abort(SdoAbortCode::BlockSize, tx);
        }
        if let Err(code) = self.load_upload_buffer(od) {
            return self.abort(code, tx);
        }
        self.block_size = blksize;
        self.crc = CrcCcitt::new();
        self.crc.update(&self.buffer);

        let mut rsp = [0u8; 8];
        // sc = 1 (CRC supported), s = 1 (size indicated).
        rsp[0] = (scs::BLOCK_UPLOAD << 5) | 0x04 | 0x02;
        rsp[1..3].copy_from_slice(&self.index.to_le_bytes());
        rsp[3] = self.sub_index;
        rsp[4..8].copy_from_slice(&(self.buffer.len() as u32).to_le_bytes());
        self.state = SdoState::UploadBlkInitiateReq2;
        self.send(rsp, tx);
    }

    fn on_block_upload_start(&mut self, request: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        // ccs = 5, cs = 3: start upload.
        if request[0] >> 5 != ccs::BLOCK_UPLOAD || request[0] & 0x03 != 0x03 {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        self.send_subblock(tx);
    }

    fn send_subblock(&mut self, tx: &mut dyn FnMut(&CanFrame)) {
        if self.buf_offset >= self.buffer.len() {
            // Nothing to stream (empty object): go straight to the end frame.
            return self.send_block_upload_end(tx);
        }
        let mut seqno = 0u8;
        let mut offset = self.buf_offset;
        while seqno < self.block_size && offset < self.buffer.len() {
            seqno += 1;
            let count = (self.buffer.len() - offset).min(SDO_SEGMENT_DATA);
            let mut frame = [0u8; 8];
            frame[0] = seqno;
            if offset + count >= self.buffer.len() {
                frame[0] |= 0x80;
            }
            frame[1..1 + count].copy_from_slice(&self.buffer[offset..offset + count]);
            offset += count;
            self.send(frame, tx);
        }
        self.seqno = seqno;
        self.state = SdoState::UploadBlkSubblockCrsp;
    }

    fn send_block_upload_end(&mut self, tx: &mut dyn FnMut(&CanFrame)) {
        let padding = (SDO_SEGMENT_DATA - self.buffer.len() % SDO_SEGMENT_DATA) % SDO_SEGMENT_DATA;
        let mut rsp = [0u8; 8];
        rsp[0] = (scs::BLOCK_UPLOAD << 5) | ((padding as u8) << 2) | 0x01; // ss = 1: end
        rsp[1..3].copy_from_slice(&self.crc.value().to_le_bytes());
        self.state = SdoState::UploadBlkEndCrsp;
        self.send(rsp, tx);
    }

    fn on_block_upload_ack(&mut self, request: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        // ccs = 5, cs = 2: sub-block acknowledge.
        if request[0] >> 5 != ccs::BLOCK_UPLOAD || request[0] & 0x03 != 0x02 {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        let ackseq = request[1];
        if ackseq > self.seqno {
            return self.abort(SdoAbortCode::SequenceNumber, tx);
        }
        let blksize = request[2];
        if blksize == 0 || blksize > SDO_BLOCK_MAX_SIZE {
            return self.abort(SdoAbortCode::BlockSize, tx);
        }
        // Consume the acknowledged bytes; unacknowledged frames retransmit.
        self.buf_offset = (self.buf_offset + ackseq as usize * SDO_SEGMENT_DATA)
            .min(self.buffer.len());
        self.block_size = blksize;

        if self.buf_offset >= self.buffer.len() {
            self.send_block_upload_end(tx);
        } else {
            self.send_subblock(tx);
        }
    }

    fn on_block_upload_end(&mut self, request: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        // ccs = 5, cs = 1: end of block upload.
        if request[0] >> 5 != ccs::BLOCK_UPLOAD || request[0] & 0x03 != 0x01 {
            return self.abort(SdoAbortCode::CommandSpecifier, tx);
        }
        trace!("[SDO] Block upload of {:#06X}:{} complete", self.index, self.sub_index);
        self.reset();
    }
}

/// Validation of remotely written communication-profile objects.
///
/// PDO mapping records may only change while deactivated (sub-index 0 == 0);
/// activating a mapping validates every descriptor before the count is
/// committed. COB-ID entries refuse identifiers from the restricted set.
fn validate_comm_profile_write(
    od: &mut ObjectDictionary,
    index: u16,
    sub_index: u8,
    data: &[u8],
) -> Result<(), SdoAbortCode> {
    use crate::od::Attributes;
    use crate::pdo::{PdoMappingEntry, PDO_MAX_BITS};
    use crate::types::is_restricted_can_id;

    let is_rpdo_map = (0x1600..=0x17FF).contains(&index);
    let is_tpdo_map = (0x1A00..=0x1BFF).contains(&index);
    if is_rpdo_map || is_tpdo_map {
        if sub_index > 0 {
            // Mapping slots are only writable while the mapping is disabled.
            if od.read_u8(index, 0).unwrap_or(0) != 0 {
                return Err(SdoAbortCode::DataDeviceState);
            }
            return Ok(());
        }
        let count = *data.first().unwrap_or(&0);
        if count == 0 {
            return Ok(());
        }
        if count > 8 {
            return Err(SdoAbortCode::InvalidValue);
        }
        let mut total_bits = 0u32;
        for sub in 1..=count {
            let raw = od
                .read_u32(index, sub)
                .map_err(|_| SdoAbortCode::NoMapping)?;
            let entry = PdoMappingEntry::from_u32(raw);
            total_bits += entry.length_bits as u32;
            if total_bits > PDO_MAX_BITS {
                return Err(SdoAbortCode::MappingLength);
            }
            if entry.is_dummy() {
                continue;
            }
            let required = if is_tpdo_map {
                Attributes::TPDO
            } else {
                Attributes::RPDO
            };
            let mappable = match od.index(entry.index).map(|e| e.sub(entry.sub_index)) {
                Some(Ok(variable)) => {
                    variable.attributes.contains(required)
                        && entry.length_bits != 0
                        && entry.length_bits % 8 == 0
                        && variable.value.len() == entry.length_bits as usize / 8
                }
                _ => false,
            };
            if !mappable {
                return Err(SdoAbortCode::NoMapping);
            }
        }
        return Ok(());
    }

    // COB-ID entries: PDO communication sub 1 and the SYNC/TIME/EMCY objects.
    let is_cob_write = ((0x1400..=0x15FF).contains(&index) && sub_index == 1)
        || ((0x1800..=0x19FF).contains(&index) && sub_index == 1)
        || (matches!(index, 0x1005 | 0x1012 | 0x1014) && sub_index == 0);
    if is_cob_write && data.len() >= 4 {
        let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let enabled = raw & crate::types::COB_ID_FLAG_INVALID == 0;
        let can_id = raw & crate::types::COB_ID_MASK;
        let is_pdo = index >= 0x1400;
        if enabled && is_pdo && is_restricted_can_id(can_id) {
            return Err(SdoAbortCode::InvalidValue);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{predefined, Attributes, Entry, Variable};

    fn setup() -> (ObjectDictionary, SdoServer) {
        let mut od = ObjectDictionary::new();
        let node_id = NodeId::try_from(0x22).unwrap();
        predefined::populate_communication_profile(&mut od, node_id);
        od.add_entry(Entry::variable(
            0x2003,
            "word",
            Variable::unsigned16(0x2003, 0, Attributes::SDO_RW, 0x4444),
        ));
        od.add_entry(Entry::variable(
            0x2004,
            "read only",
            Variable::unsigned8(0x2004, 0, Attributes::SDO_R, 5),
        ));
        od.add_entry(Entry::variable(
            0x2005,
            "write only",
            Variable::unsigned8(0x2005, 0, Attributes::SDO_W, 0),
        ));
        od.add_entry(Entry::variable(
            0x200B,
            "string",
            Variable::visible_string(
                0x200B,
                0,
                Attributes::SDO_RW,
                "AStringCannotBeLongerThanTheDefaultValue",
            ),
        ));
        od.add_entry(Entry::variable(
            0x2001,
            "status",
            Variable::unsigned8(0x2001, 0, Attributes::SDO_RW | Attributes::TRPDO, 0),
        ));
        let server = SdoServer::from_od(&mut od, node_id);
        (od, server)
    }

    fn expedited_write(index: u16, sub: u8, value: u32, len: usize) -> [u8; 8] {
        let mut req = [0u8; 8];
        req[0] = (ccs::DOWNLOAD_INITIATE << 5) | 0x03 | (((4 - len) as u8) << 2);
        req[1..3].copy_from_slice(&index.to_le_bytes());
        req[3] = sub;
        req[4..8].copy_from_slice(&value.to_le_bytes());
        req
    }

    fn exchange(server: &mut SdoServer, od: &mut ObjectDictionary, request: [u8; 8]) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        server.handle_frame(&CanFrame::new(0x622, &request));
        server.process(od, NmtState::PreOperational, 1_000, &mut |f| frames.push(*f));
        frames
    }

    fn initiate_upload(index: u16, sub: u8) -> [u8; 8] {
        let mut req = [0u8; 8];
        req[0] = ccs::UPLOAD_INITIATE << 5;
        req[1..3].copy_from_slice(&index.to_le_bytes());
        req[3] = sub;
        req
    }

    #[test]
    fn test_expedited_upload() {
        let (mut od, mut server) = setup();
        let frames = exchange(&mut server, &mut od, initiate_upload(0x2003, 0));
        assert_eq!(frames.len(), 1);
        let rsp = frames[0].data;
        assert_eq!(frames[0].can_id(), 0x5A2);
        // scs = 2, e = 1, s = 1, n = 2.
        assert_eq!(rsp[0], (scs::UPLOAD_INITIATE << 5) | (2 << 2) | 0x03);
        assert_eq!(u16::from_le_bytes([rsp[4], rsp[5]]), 0x4444);
    }

    #[test]
    fn test_expedited_download() {
        let (mut od, mut server) = setup();
        let mut req = [0u8; 8];
        req[0] = (ccs::DOWNLOAD_INITIATE << 5) | 0x03 | (2 << 2); // e, s, n = 2
        req[1..3].copy_from_slice(&0x2003u16.to_le_bytes());
        req[4..6].copy_from_slice(&0x1234u16.to_le_bytes());
        let frames = exchange(&mut server, &mut od, req);
        assert_eq!(frames[0].data[0], scs::DOWNLOAD_INITIATE << 5);
        assert_eq!(od.read_u16(0x2003, 0), Ok(0x1234));
    }

    #[test]
    fn test_upload_of_missing_object_aborts() {
        let (mut od, mut server) = setup();
        let frames = exchange(&mut server, &mut od, initiate_upload(0x9999, 0));
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0602_0000);
    }

    #[test]
    fn test_access_attribute_aborts() {
        let (mut od, mut server) = setup();
        // Reading a write-only object.
        let frames = exchange(&mut server, &mut od, initiate_upload(0x2005, 0));
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0601_0001);

        // Writing a read-only object.
        let mut req = [0u8; 8];
        req[0] = (ccs::DOWNLOAD_INITIATE << 5) | 0x03 | (3 << 2);
        req[1..3].copy_from_slice(&0x2004u16.to_le_bytes());
        req[4] = 9;
        let frames = exchange(&mut server, &mut od, req);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0601_0002);
    }

    #[test]
    fn test_segmented_download() {
        let (mut od, mut server) = setup();
        let payload = b"AStringCannotBeLongerThanTheDefaultValu"; // 39 bytes
        let mut req = [0u8; 8];
        req[0] = (ccs::DOWNLOAD_INITIATE << 5) | 0x01; // segmented, size set
        req[1..3].copy_from_slice(&0x200Bu16.to_le_bytes());
        req[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let frames = exchange(&mut server, &mut od, req);
        assert_eq!(frames[0].data[0], scs::DOWNLOAD_INITIATE << 5);

        let mut toggle = 0u8;
        for (i, chunk) in payload.chunks(7).enumerate() {
            let last = (i + 1) * 7 >= payload.len();
            let mut seg = [0u8; 8];
            seg[0] = toggle | (((7 - chunk.len()) as u8) << 1) | last as u8;
            seg[1..1 + chunk.len()].copy_from_slice(chunk);
            let frames = exchange(&mut server, &mut od, seg);
            assert_eq!(frames[0].data[0], (scs::DOWNLOAD_SEGMENT << 5) | toggle);
            toggle ^= 0x10;
        }
        assert_eq!(od.read_all(0x200B, 0).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_segmented_upload_toggle_mismatch_aborts() {
        let (mut od, mut server) = setup();
        exchange(&mut server, &mut od, initiate_upload(0x200B, 0));
        // First segment request must carry toggle 0; send toggle 1 instead.
        let mut seg = [0u8; 8];
        seg[0] = (ccs::UPLOAD_SEGMENT << 5) | 0x10;
        let frames = exchange(&mut server, &mut od, seg);
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0503_0000);
    }

    #[test]
    fn test_segmented_upload_roundtrip() {
        let (mut od, mut server) = setup();
        let frames = exchange(&mut server, &mut od, initiate_upload(0x200B, 0));
        // Segmented response with size.
        assert_eq!(frames[0].data[0], (scs::UPLOAD_INITIATE << 5) | 0x01);
        let size = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap()) as usize;
        assert_eq!(size, 40);

        let mut collected = Vec::new();
        let mut toggle = 0u8;
        loop {
            let mut seg = [0u8; 8];
            seg[0] = (ccs::UPLOAD_SEGMENT << 5) | toggle;
            let frames = exchange(&mut server, &mut od, seg);
            let rsp = frames[0].data;
            let unused = ((rsp[0] >> 1) & 0x07) as usize;
            collected.extend_from_slice(&rsp[1..8 - unused]);
            if rsp[0] & 0x01 != 0 {
                break;
            }
            toggle ^= 0x10;
        }
        assert_eq!(collected, od.read_all(0x200B, 0).unwrap());
    }

    #[test]
    fn test_timeout_aborts() {
        let (mut od, mut server) = setup();
        exchange(&mut server, &mut od, initiate_upload(0x200B, 0));
        let mut frames = Vec::new();
        server.process(&mut od, NmtState::PreOperational, 1_100_000, &mut |f| frames.push(*f));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0504_0000);
    }

    #[test]
    fn test_block_download() {
        let (mut od, mut server) = setup();
        let payload = b"BlockModePayloadWithThirtyNineBytes!!!!"; // 39 bytes
        let mut crc = CrcCcitt::new();
        crc.update(payload);

        let mut req = [0u8; 8];
        req[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x04 | 0x02; // cc = 1, s = 1
        req[1..3].copy_from_slice(&0x200Bu16.to_le_bytes());
        req[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let frames = exchange(&mut server, &mut od, req);
        assert_eq!(frames[0].data[0], (scs::BLOCK_DOWNLOAD << 5) | 0x04);
        let blksize = frames[0].data[4];
        assert_eq!(blksize, 127);

        // Stream the six 7-byte segments (the last padded with zeros).
        let mut chunks: Vec<[u8; 7]> = Vec::new();
        for chunk in payload.chunks(7) {
            let mut data = [0u8; 7];
            data[..chunk.len()].copy_from_slice(chunk);
            chunks.push(data);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let mut seg = [0u8; 8];
            seg[0] = (i + 1) as u8;
            if i + 1 == chunks.len() {
                seg[0] |= 0x80;
            }
            seg[1..8].copy_from_slice(chunk);
            let frames = exchange(&mut server, &mut od, seg);
            if i + 1 == chunks.len() {
                assert_eq!(frames[0].data[0], (scs::BLOCK_DOWNLOAD << 5) | 0x02);
                assert_eq!(frames[0].data[1], chunks.len() as u8);
            } else {
                assert!(frames.is_empty());
            }
        }

        // End frame: n = padding bytes, CRC.
        let padding = (chunks.len() * 7 - payload.len()) as u8;
        let mut end = [0u8; 8];
        end[0] = (ccs::BLOCK_DOWNLOAD << 5) | (padding << 2) | 0x01;
        end[1..3].copy_from_slice(&crc.value().to_le_bytes());
        let frames = exchange(&mut server, &mut od, end);
        assert_eq!(frames[0].data[0], (scs::BLOCK_DOWNLOAD << 5) | 0x01);
        assert_eq!(od.read_all(0x200B, 0).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_block_download_crc_mismatch_aborts() {
        let (mut od, mut server) = setup();
        let mut req = [0u8; 8];
        req[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x04 | 0x02;
        req[1..3].copy_from_slice(&0x200Bu16.to_le_bytes());
        req[4..8].copy_from_slice(&7u32.to_le_bytes());
        exchange(&mut server, &mut od, req);

        let mut seg = [0u8; 8];
        seg[0] = 0x81; // seqno 1, last
        seg[1..8].copy_from_slice(b"payload");
        exchange(&mut server, &mut od, seg);

        let mut end = [0u8; 8];
        end[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x01;
        end[1..3].copy_from_slice(&0xBEEFu16.to_le_bytes());
        let frames = exchange(&mut server, &mut od, end);
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0504_0004);
    }

    #[test]
    fn test_block_download_retransmit_after_lost_frame() {
        let (mut od, mut server) = setup();
        let payload = b"ABCDEFGHIJKLMN"; // 14 bytes, two full segments
        let mut req = [0u8; 8];
        req[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x02; // size set, no CRC
        req[1..3].copy_from_slice(&0x200Bu16.to_le_bytes());
        req[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        exchange(&mut server, &mut od, req);

        // Segment 1 is lost; segment 2 (flagged last) arrives alone.
        let mut seg2 = [0u8; 8];
        seg2[0] = 0x82;
        seg2[1..8].copy_from_slice(&payload[7..14]);
        let frames = exchange(&mut server, &mut od, seg2);
        // Acknowledge reports 0 good segments; client must retransmit.
        assert_eq!(frames[0].data[0], (scs::BLOCK_DOWNLOAD << 5) | 0x02);
        assert_eq!(frames[0].data[1], 0);

        let mut seg1 = [0u8; 8];
        seg1[0] = 0x01;
        seg1[1..8].copy_from_slice(&payload[0..7]);
        assert!(exchange(&mut server, &mut od, seg1).is_empty());
        let frames = exchange(&mut server, &mut od, seg2);
        assert_eq!(frames[0].data[1], 2);

        let mut end = [0u8; 8];
        end[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x01;
        let frames = exchange(&mut server, &mut od, end);
        assert_eq!(frames[0].data[0], (scs::BLOCK_DOWNLOAD << 5) | 0x01);
        assert_eq!(od.read_all(0x200B, 0).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_block_upload() {
        let (mut od, mut server) = setup();
        let expected = od.read_all(0x200B, 0).unwrap();
        let mut crc = CrcCcitt::new();
        crc.update(&expected);

        let mut req = [0u8; 8];
        req[0] = (ccs::BLOCK_UPLOAD << 5) | 0x04; // cc = 1, cs = 0
        req[1..3].copy_from_slice(&0x200Bu16.to_le_bytes());
        req[4] = 4; // small block size to force several sub-blocks
        let frames = exchange(&mut server, &mut od, req);
        assert_eq!(frames[0].data[0], (scs::BLOCK_UPLOAD << 5) | 0x04 | 0x02);
        let size = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap()) as usize;
        assert_eq!(size, expected.len());

        // Start; then consume sub-blocks, acknowledging each.
        let mut start = [0u8; 8];
        start[0] = (ccs::BLOCK_UPLOAD << 5) | 0x03;
        let mut collected = Vec::new();
        let mut frames = exchange(&mut server, &mut od, start);
        loop {
            let mut last_seq = 0;
            let mut end_seen = false;
            for frame in frames.iter() {
                last_seq = frame.data[0] & 0x7F;
                collected.extend_from_slice(&frame.data[1..8]);
                end_seen = frame.data[0] & 0x80 != 0;
            }
            let mut ack = [0u8; 8];
            ack[0] = (ccs::BLOCK_UPLOAD << 5) | 0x02;
            ack[1] = last_seq;
            ack[2] = 4;
            frames = exchange(&mut server, &mut od, ack);
            if end_seen {
                break;
            }
        }
        // The final response is the end frame with padding count and CRC.
        assert_eq!(frames.len(), 1);
        let end = frames[0].data;
        assert_eq!(end[0] & 0xE3, (scs::BLOCK_UPLOAD << 5) | 0x01);
        let padding = ((end[0] >> 2) & 0x07) as usize;
        collected.truncate(collected.len() - padding);
        assert_eq!(collected, expected);
        assert_eq!(u16::from_le_bytes([end[1], end[2]]), crc.value());

        let mut finish = [0u8; 8];
        finish[0] = (ccs::BLOCK_UPLOAD << 5) | 0x01;
        assert!(exchange(&mut server, &mut od, finish).is_empty());
    }

    #[test]
    fn test_unexpected_frame_aborts_with_command_specifier() {
        let (mut od, mut server) = setup();
        exchange(&mut server, &mut od, initiate_upload(0x200B, 0));
        // A download segment during a segmented upload is a protocol error.
        let mut bad = [0u8; 8];
        bad[0] = ccs::DOWNLOAD_SEGMENT << 5;
        let frames = exchange(&mut server, &mut od, bad);
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0504_0001);
    }

    #[test]
    fn test_mapping_locked_while_active() {
        let (mut od, mut server) = setup();
        // Activate a one-slot mapping on TPDO 1.
        od.write_u32(0x1A00, 1, 0x2001_0008).unwrap();
        od.write_u8(0x1A00, 0, 1).unwrap();

        // Writing a slot while active must abort with a device-state error.
        let frames = exchange(&mut server, &mut od, expedited_write(0x1A00, 1, 0x2001_0008, 4));
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0800_0022);

        // Deactivate, then the slot becomes writable again.
        let frames = exchange(&mut server, &mut od, expedited_write(0x1A00, 0, 0, 1));
        assert_eq!(frames[0].data[0], scs::DOWNLOAD_INITIATE << 5);
        let frames = exchange(&mut server, &mut od, expedited_write(0x1A00, 1, 0x2001_0008, 4));
        assert_eq!(frames[0].data[0], scs::DOWNLOAD_INITIATE << 5);
    }

    #[test]
    fn test_activating_unmappable_target_aborts() {
        let (mut od, mut server) = setup();
        // 0x2003 is not PDO-mappable.
        exchange(&mut server, &mut od, expedited_write(0x1A00, 1, 0x2003_0010, 4));
        let frames = exchange(&mut server, &mut od, expedited_write(0x1A00, 0, 1, 1));
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0604_0041);
    }

    #[test]
    fn test_restricted_pdo_cob_id_refused() {
        let (mut od, mut server) = setup();
        let frames = exchange(&mut server, &mut od, expedited_write(0x1800, 1, 0x601, 4));
        assert_eq!(frames[0].data[0], CS_ABORT);
        let code = u32::from_le_bytes(frames[0].data[4..8].try_into().unwrap());
        assert_eq!(code, 0x0609_0030);

        // Disabled COB-IDs (bit 31 set) may hold anything.
        let frames = exchange(
            &mut server,
            &mut od,
            expedited_write(0x1800, 1, 0x601 | crate::types::COB_ID_FLAG_INVALID, 4),
        );
        assert_eq!(frames[0].data[0], scs::DOWNLOAD_INITIATE << 5);
    }

    #[test]
    fn test_abort_reception_resets_state() {
        let (mut od, mut server) = setup();
        exchange(&mut server, &mut od, initiate_upload(0x200B, 0));
        let abort = abort_payload(0x200B, 0, SdoAbortCode::General);
        assert!(exchange(&mut server, &mut od, abort).is_empty());
        // A fresh transfer starts cleanly afterwards.
        let frames = exchange(&mut server, &mut od, initiate_upload(0x2003, 0));
        assert_eq!(frames[0].data[0] >> 5, scs::UPLOAD_INITIATE);
    }
}
