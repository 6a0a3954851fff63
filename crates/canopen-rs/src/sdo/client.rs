//! SDO client: drives expedited, segmented and block transfers against a
//! remote server's Object Dictionary, with a local shortcut when the target
//! node is this node itself.

use super::{
    abort_payload, ccs, scs, CrcCcitt, Fifo, SdoAbortCode, SdoState, CS_ABORT,
    SDO_BLOCK_MAX_SIZE, SDO_DEFAULT_TIMEOUT_US, SDO_SEGMENT_DATA,
};
use crate::bus::CanFrame;
use crate::od::{ObjectDictionary, OdError};
use crate::types::{
    COB_ID_MASK, COB_ID_SDO_SERVER_RX, COB_ID_SDO_SERVER_TX, IDX_SDO_CLIENT_PARAM, NodeId,
};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Default FIFO capacity; transfers announcing a larger size grow it.
const CLIENT_FIFO_CAP: usize = 1000;
/// Payload size from which `write_raw` switches from segmented to block mode.
pub const BLOCK_DOWNLOAD_THRESHOLD: usize = SDO_BLOCK_MAX_SIZE as usize * SDO_SEGMENT_DATA;
/// Sub-block timeout: tighter than the per-state timeout since data frames
/// stream back-to-back.
const BLOCK_TIMEOUT_US: u64 = 500_000;

/// Outcome of one `poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// No transfer in progress.
    Idle,
    /// Transfer running; keep polling.
    Busy,
    /// Transfer finished; the payload size in bytes (download: sent, upload:
    /// available through `upload_read`).
    Complete(usize),
    /// Transfer terminated, locally or by the peer.
    Aborted(SdoAbortCode),
}

/// SDO client endpoint for one node.
pub struct SdoClient {
    cob_id_tx: u32,
    cob_id_rx: u32,
    server_node_id: u8,
    own_node_id: u8,
    state: SdoState,
    index: u16,
    sub_index: u8,
    fifo: Fifo,
    pub timeout_us: u64,
    pub block_timeout_us: u64,
    elapsed_us: u64,
    /// Total size when known (download: payload length; upload: announced).
    size_indicated: usize,
    size_transferred: usize,
    toggle: u8,
    /// The initiate request has not been emitted yet.
    initiate_pending: bool,
    force_segmented: bool,
    /// The running download fits a single expedited frame.
    expedited: bool,
    rx: VecDeque<[u8; 8]>,
    // Block transfer context.
    crc_enabled: bool,
    crc: CrcCcitt,
    block_size: u8,
    /// Upload: next expected seqno. Download: frames sent this sub-block.
    block_seqno: u8,
    /// Upload: current sub-block accumulator (committed on acknowledge).
    subblock: Vec<u8>,
    /// Upload: the in-order frame carrying the last-segment flag arrived.
    block_data_end: bool,
    /// Download: bytes remaining in the FIFO when the sub-block started.
    subblock_remaining: usize,
    /// Download: the last frame of the whole payload has been sent.
    end_sent: bool,
}

impl SdoClient {
    /// Builds the client from OD 0x1280, falling back to the pre-defined
    /// connection set with no server selected.
    pub fn from_od(od: &mut ObjectDictionary, own_node_id: NodeId) -> Self {
        let tx = od
            .read_u32(IDX_SDO_CLIENT_PARAM, 1)
            .unwrap_or(COB_ID_SDO_SERVER_RX);
        let rx = od
            .read_u32(IDX_SDO_CLIENT_PARAM, 2)
            .unwrap_or(COB_ID_SDO_SERVER_TX);
        let server = od.read_u8(IDX_SDO_CLIENT_PARAM, 3).unwrap_or(0);
        Self {
            cob_id_tx: tx & COB_ID_MASK,
            cob_id_rx: rx & COB_ID_MASK,
            server_node_id: server,
            own_node_id: own_node_id.0,
            state: SdoState::Idle,
            index: 0,
            sub_index: 0,
            fifo: Fifo::with_capacity(CLIENT_FIFO_CAP),
            timeout_us: SDO_DEFAULT_TIMEOUT_US,
            block_timeout_us: BLOCK_TIMEOUT_US,
            elapsed_us: 0,
            size_indicated: 0,
            size_transferred: 0,
            toggle: 0,
            initiate_pending: false,
            force_segmented: false,
            expedited: false,
            rx: VecDeque::new(),
            crc_enabled: false,
            crc: CrcCcitt::new(),
            block_size: 0,
            block_seqno: 0,
            subblock: Vec::new(),
            block_data_end: false,
            subblock_remaining: 0,
            end_sent: false,
        }
    }

    /// Points the client at a server node using the pre-defined connection
    /// set. Fails while a transfer is running.
    pub fn setup(&mut self, server_node_id: NodeId) -> Result<(), SdoAbortCode> {
        if self.state.is_active() {
            return Err(SdoAbortCode::DeviceIncompat);
        }
        self.server_node_id = server_node_id.0;
        self.cob_id_tx = COB_ID_SDO_SERVER_RX + server_node_id.0 as u32;
        self.cob_id_rx = COB_ID_SDO_SERVER_TX + server_node_id.0 as u32;
        Ok(())
    }

    /// COB-ID carrying the server's responses (what the router subscribes).
    pub fn cob_id_rx(&self) -> u32 {
        self.cob_id_rx
    }

    pub fn server_node_id(&self) -> u8 {
        self.server_node_id
    }

    /// Aborts any transfer in progress and re-reads the parameters.
    pub fn reset_communication(&mut self, od: &mut ObjectDictionary, own_node_id: NodeId) {
        *self = Self::from_od(od, own_node_id);
    }

    /// Router entry point. SDO frames are always 8 bytes.
    pub fn handle_frame(&mut self, frame: &CanFrame) {
        if frame.dlc as usize == 8 && self.state.is_active() {
            self.rx.push_back(frame.data);
        }
    }

    fn begin(&mut self, index: u16, sub_index: u8) {
        self.index = index;
        self.sub_index = sub_index;
        self.elapsed_us = 0;
        self.size_indicated = 0;
        self.size_transferred = 0;
        self.toggle = 0;
        self.initiate_pending = true;
        self.expedited = false;
        self.rx.clear();
        self.fifo.reset();
        self.crc = CrcCcitt::new();
        self.crc_enabled = false;
        self.block_seqno = 0;
        self.subblock.clear();
        self.block_data_end = false;
        self.subblock_remaining = 0;
        self.end_sent = false;
    }

    /// Starts an upload (remote read). With `block == true` the block
    /// protocol is negotiated, otherwise the server picks expedited or
    /// segmented.
    pub fn upload_start(&mut self, index: u16, sub_index: u8, block: bool) -> Result<(), SdoAbortCode> {
        if self.state.is_active() {
            return Err(SdoAbortCode::DeviceIncompat);
        }
        self.begin(index, sub_index);
        self.state = if self.server_node_id == self.own_node_id {
            SdoState::UploadLocalTransfer
        } else if block {
            SdoState::UploadBlkInitiateReq
        } else {
            SdoState::UploadInitiateReq
        };
        Ok(())
    }

    /// Starts a download (remote write) of the complete payload. Expedited
    /// for up to 4 bytes unless `force_segmented`; block mode from
    /// `BLOCK_DOWNLOAD_THRESHOLD` bytes.
    pub fn download_start(
        &mut self,
        index: u16,
        sub_index: u8,
        data: &[u8],
        force_segmented: bool,
    ) -> Result<(), SdoAbortCode> {
        if self.state.is_active() {
            return Err(SdoAbortCode::DeviceIncompat);
        }
        self.begin(index, sub_index);
        self.force_segmented = force_segmented;
        self.size_indicated = data.len();
        self.fifo.reserve(data.len());
        self.fifo.write(data);
        self.state = if self.server_node_id == self.own_node_id {
            SdoState::DownloadLocalTransfer
        } else if data.len() >= BLOCK_DOWNLOAD_THRESHOLD && !force_segmented {
            SdoState::DownloadBlkInitiateReq
        } else {
            SdoState::DownloadInitiateReq
        };
        Ok(())
    }

    /// Drains upload data received so far.
    pub fn upload_read(&mut self, buf: &mut [u8]) -> usize {
        self.fifo.read(buf)
    }

    /// Size announced by the server for the running upload, if any.
    pub fn upload_size(&self) -> Option<usize> {
        if self.size_indicated > 0 {
            Some(self.size_indicated)
        } else {
            None
        }
    }

    fn send(&self, data: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) {
        tx(&CanFrame::new(self.cob_id_tx, &data));
    }

    fn reset(&mut self) {
        self.state = SdoState::Idle;
        self.rx.clear();
        self.initiate_pending = false;
    }

    fn local_abort(&mut self, code: SdoAbortCode, tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        debug!("[SDO] Client abort {:#06X}:{}: {}", self.index, self.sub_index, code);
        let payload = abort_payload(self.index, self.sub_index, code);
        self.send(payload, tx);
        self.reset();
        TransferStatus::Aborted(code)
    }

    /// Aborts the running transfer on the application's behalf.
    pub fn abort(&mut self, code: SdoAbortCode, tx: &mut dyn FnMut(&CanFrame)) {
        if self.state.is_active() {
            let _ = self.local_abort(code, tx);
        }
    }

    /// Advances the transfer: consumes received frames, emits requests and
    /// checks timeouts. `od` backs the local-transfer shortcut.
    pub fn poll(
        &mut self,
        od: &mut ObjectDictionary,
        delta_us: u64,
        tx: &mut dyn FnMut(&CanFrame),
    ) -> TransferStatus {
        match self.state {
            SdoState::Idle => return TransferStatus::Idle,
            SdoState::UploadLocalTransfer => return self.local_upload(od),
            SdoState::DownloadLocalTransfer => return self.local_download(od),
            _ => {}
        }

        if self.initiate_pending {
            self.initiate_pending = false;
            self.elapsed_us = 0;
            self.send_initiate(tx);
        }

        let mut received_any = false;
        while let Some(rsp) = self.rx.pop_front() {
            received_any = true;
            let status = self.dispatch(rsp, tx);
            if !matches!(status, TransferStatus::Busy) {
                return status;
            }
        }

        if received_any {
            self.elapsed_us = 0;
        } else {
            self.elapsed_us += delta_us;
            let limit = if self.in_block_data_phase() {
                self.block_timeout_us
            } else {
                self.timeout_us
            };
            if self.elapsed_us > limit {
                warn!("[SDO] Client transfer timed out in {:?}", self.state);
                return self.local_abort(SdoAbortCode::Timeout, tx);
            }
        }
        TransferStatus::Busy
    }

    fn in_block_data_phase(&self) -> bool {
        matches!(
            self.state,
            SdoState::UploadBlkSubblockSreq | SdoState::DownloadBlkSubblockRsp
        )
    }

    // --- Local shortcut: access this node's own dictionary directly ---

    fn local_upload(&mut self, od: &mut ObjectDictionary) -> TransferStatus {
        self.reset();
        let entry = match od.index_mut(self.index) {
            Some(entry) => entry,
            None => return TransferStatus::Aborted(SdoAbortCode::ObjectNotExist),
        };
        let mut streamer = match entry.streamer(self.sub_index, false) {
            Ok(streamer) => streamer,
            Err(err) => return TransferStatus::Aborted(err.abort_code()),
        };
        let mut chunk = [0u8; 64];
        loop {
            match streamer.read(&mut chunk) {
                Ok(n) => {
                    self.fifo.reserve(n);
                    self.fifo.write(&chunk[..n]);
                    self.size_transferred += n;
                    return TransferStatus::Complete(self.size_transferred);
                }
                Err(OdError::Partial) => {
                    self.fifo.reserve(chunk.len());
                    self.fifo.write(&chunk);
                    self.size_transferred += chunk.len();
                }
                Err(err) => return TransferStatus::Aborted(err.abort_code()),
            }
        }
    }

    fn local_download(&mut self, od: &mut ObjectDictionary) -> TransferStatus {
        self.reset();
        let mut data = alloc::vec![0u8; self.fifo.len()];
        self.fifo.read(&mut data);
        let entry = match od.index_mut(self.index) {
            Some(entry) => entry,
            None => return TransferStatus::Aborted(SdoAbortCode::ObjectNotExist),
        };
        let mut streamer = match entry.streamer(self.sub_index, false) {
            Ok(streamer) => streamer,
            Err(err) => return TransferStatus::Aborted(err.abort_code()),
        };
        match streamer.write(&data, true) {
            Ok(_) => TransferStatus::Complete(data.len()),
            Err(err) => TransferStatus::Aborted(err.abort_code()),
        }
    }

    // --- Request emission ---

    fn send_initiate(&mut self, tx: &mut dyn FnMut(&CanFrame)) {
        let mut req = [0u8; 8];
        req[1..3].copy_from_slice(&self.index.to_le_bytes());
        req[3] = self.sub_index;
        match self.state {
            SdoState::UploadInitiateReq => {
                req[0] = ccs::UPLOAD_INITIATE << 5;
                self.state = SdoState::UploadInitiateRsp;
            }
            SdoState::UploadBlkInitiateReq => {
                // cc = 1 (CRC supported), pst = 0 (no protocol switch).
                req[0] = (ccs::BLOCK_UPLOAD << 5) | 0x04;
                req[4] = SDO_BLOCK_MAX_SIZE;
                self.state = SdoState::UploadBlkInitiateRsp;
            }
            SdoState::DownloadInitiateReq => {
                let size = self.size_indicated;
                if (1..=4).contains(&size) && !self.force_segmented {
                    self.expedited = true;
                    let mut data = [0u8; 4];
                    self.fifo.read(&mut data[..size]);
                    req[0] = (ccs::DOWNLOAD_INITIATE << 5)
                        | (((4 - size) as u8) << 2)
                        | 0x03;
                    req[4..4 + size].copy_from_slice(&data[..size]);
                    self.size_transferred = size;
                } else {
                    req[0] = (ccs::DOWNLOAD_INITIATE << 5) | 0x01;
                    req[4..8].copy_from_slice(&(size as u32).to_le_bytes());
                }
                self.state = SdoState::DownloadInitiateRsp;
            }
            SdoState::DownloadBlkInitiateReq => {
                // cc = 1, s = 1.
                req[0] = (ccs::BLOCK_DOWNLOAD << 5) | 0x04 | 0x02;
                req[4..8].copy_from_slice(&(self.size_indicated as u32).to_le_bytes());
                self.state = SdoState::DownloadBlkInitiateRsp;
            }
            _ => return,
        }
        self.send(req, tx);
    }

    fn send_download_segment(&mut self, tx: &mut dyn FnMut(&CanFrame)) {
        let mut data = [0u8; SDO_SEGMENT_DATA];
        let count = self.fifo.read(&mut data);
        let last = self.fifo.is_empty();
        let mut req = [0u8; 8];
        req[0] = (ccs::DOWNLOAD_SEGMENT << 5)
            | self.toggle
            | (((SDO_SEGMENT_DATA - count) as u8) << 1)
            | last as u8;
        req[1..1 + count].copy_from_slice(&data[..count]);
        self.size_transferred += count;
        self.end_sent = last;
        self.state = SdoState::DownloadSegmentRsp;
        self.send(req, tx);
    }

    fn send_block_subblock(&mut self, tx: &mut dyn FnMut(&CanFrame)) {
        self.subblock_remaining = self.fifo.len();
        self.fifo.alt_begin(0);
        let mut seqno = 0u8;
        while seqno < self.block_size && self.fifo.alt_len() > 0 {
            seqno += 1;
            let mut data = [0u8; SDO_SEGMENT_DATA];
            let count = self.fifo.alt_read(&mut data);
            let mut frame = [0u8; 8];
            frame[0] = seqno;
            if self.fifo.alt_len() == 0 {
                frame[0] |= 0x80;
                self.end_sent = true;
            }
            frame[1..1 + count].copy_from_slice(&data[..count]);
            self.send(frame, tx);
        }
        self.block_seqno = seqno;
        self.state = SdoState::DownloadBlkSubblockRsp;
    }

    // --- Response dispatch ---

    fn dispatch(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] == CS_ABORT {
            let code = SdoAbortCode::from(u32::from_le_bytes([rsp[4], rsp[5], rsp[6], rsp[7]]));
            debug!("[SDO] Client received abort: {}", code);
            self.reset();
            return TransferStatus::Aborted(code);
        }
        match self.state {
            SdoState::DownloadInitiateRsp => self.on_download_initiate_rsp(rsp, tx),
            SdoState::DownloadSegmentRsp => self.on_download_segment_rsp(rsp, tx),
            SdoState::UploadInitiateRsp => self.on_upload_initiate_rsp(rsp, tx),
            SdoState::UploadSegmentRsp => self.on_upload_segment_rsp(rsp, tx),
            SdoState::DownloadBlkInitiateRsp => self.on_block_download_initiate_rsp(rsp, tx),
            SdoState::DownloadBlkSubblockRsp => self.on_block_download_ack(rsp, tx),
            SdoState::DownloadBlkEndRsp => self.on_block_download_end_rsp(rsp, tx),
            SdoState::UploadBlkInitiateRsp => self.on_block_upload_initiate_rsp(rsp, tx),
            SdoState::UploadBlkSubblockSreq => self.on_block_upload_data(rsp, tx),
            SdoState::UploadBlkEndSreq => self.on_block_upload_end(rsp, tx),
            _ => self.local_abort(SdoAbortCode::CommandSpecifier, tx),
        }
    }

    fn on_download_initiate_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::DOWNLOAD_INITIATE {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        if self.expedited {
            self.reset();
            return TransferStatus::Complete(self.size_transferred);
        }
        self.toggle = 0;
        self.send_download_segment(tx);
        TransferStatus::Busy
    }

    fn on_download_segment_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::DOWNLOAD_SEGMENT {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        if rsp[0] & 0x10 != self.toggle {
            return self.local_abort(SdoAbortCode::ToggleBit, tx);
        }
        self.toggle ^= 0x10;
        if self.end_sent {
            self.reset();
            return TransferStatus::Complete(self.size_transferred);
        }
        self.send_download_segment(tx);
        TransferStatus::Busy
    }

    fn on_upload_initiate_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::UPLOAD_INITIATE {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        let expedited = rsp[0] & 0x02 != 0;
        let size_set = rsp[0] & 0x01 != 0;
        if expedited {
            let count = if size_set {
                4 - ((rsp[0] >> 2) & 0x03) as usize
            } else {
                4
            };
            self.fifo.write(&rsp[4..4 + count]);
            self.size_transferred = count;
            self.reset();
            return TransferStatus::Complete(count);
        }
        if size_set {
            self.size_indicated =
                u32::from_le_bytes([rsp[4], rsp[5], rsp[6], rsp[7]]) as usize;
            self.fifo.reserve(self.size_indicated);
        }
        self.toggle = 0;
        self.request_upload_segment(tx);
        TransferStatus::Busy
    }

    fn request_upload_segment(&mut self, tx: &mut dyn FnMut(&CanFrame)) {
        let mut req = [0u8; 8];
        req[0] = (ccs::UPLOAD_SEGMENT << 5) | self.toggle;
        self.state = SdoState::UploadSegmentRsp;
        self.send(req, tx);
    }

    fn on_upload_segment_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::UPLOAD_SEGMENT {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        if rsp[0] & 0x10 != self.toggle {
            return self.local_abort(SdoAbortCode::ToggleBit, tx);
        }
        let unused = ((rsp[0] >> 1) & 0x07) as usize;
        let count = SDO_SEGMENT_DATA - unused;
        let last = rsp[0] & 0x01 != 0;
        self.fifo.reserve(count);
        self.fifo.write(&rsp[1..1 + count]);
        self.size_transferred += count;
        if last {
            if self.size_indicated > 0 && self.size_transferred != self.size_indicated {
                let code = if self.size_transferred < self.size_indicated {
                    SdoAbortCode::DataShort
                } else {
                    SdoAbortCode::DataLong
                };
                return self.local_abort(code, tx);
            }
            self.reset();
            return TransferStatus::Complete(self.size_transferred);
        }
        self.toggle ^= 0x10;
        self.request_upload_segment(tx);
        TransferStatus::Busy
    }

    // --- Block download ---

    fn on_block_download_initiate_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::BLOCK_DOWNLOAD || rsp[0] & 0x03 != 0 {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        self.crc_enabled = rsp[0] & 0x04 != 0;
        let blksize = rsp[4];
        if blksize == 0 || blksize > SDO_BLOCK_MAX_SIZE {
            return self.local_abort(SdoAbortCode::BlockSize, tx);
        }
        self.block_size = blksize;
        self.send_block_subblock(tx);
        TransferStatus::Busy
    }

    fn on_block_download_ack(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::BLOCK_DOWNLOAD || rsp[0] & 0x03 != 0x02 {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        let ackseq = rsp[1];
        if ackseq > self.block_seqno {
            return self.local_abort(SdoAbortCode::SequenceNumber, tx);
        }
        let blksize = rsp[2];
        if blksize == 0 || blksize > SDO_BLOCK_MAX_SIZE {
            return self.local_abort(SdoAbortCode::BlockSize, tx);
        }
        // Commit the acknowledged bytes; anything beyond retransmits from the
        // committed cursor on the next sub-block.
        let committed = (ackseq as usize * SDO_SEGMENT_DATA).min(self.subblock_remaining);
        self.fifo.alt_begin(committed);
        let crc = if self.crc_enabled { Some(&mut self.crc) } else { None };
        self.size_transferred += self.fifo.alt_finish(crc);
        self.block_size = blksize;

        if self.fifo.is_empty() && self.end_sent && ackseq == self.block_seqno {
            let remainder = self.size_indicated % SDO_SEGMENT_DATA;
            let padding = if remainder == 0 { 0 } else { SDO_SEGMENT_DATA - remainder } as u8;
            let mut req = [0u8; 8];
            req[0] = (ccs::BLOCK_DOWNLOAD << 5) | (padding << 2) | 0x01;
            req[1..3].copy_from_slice(&self.crc.value().to_le_bytes());
            self.state = SdoState::DownloadBlkEndRsp;
            self.send(req, tx);
        } else {
            self.end_sent = false;
            self.send_block_subblock(tx);
        }
        TransferStatus::Busy
    }

    fn on_block_download_end_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::BLOCK_DOWNLOAD || rsp[0] & 0x03 != 0x01 {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        trace!("[SDO] Block download of {} bytes complete", self.size_transferred);
        self.reset();
        TransferStatus::Complete(self.size_transferred)
    }

    // --- Block upload ---

    fn on_block_upload_initiate_rsp(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::BLOCK_UPLOAD || rsp[0] & 0x01 != 0 {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        self.crc_enabled = rsp[0] & 0x04 != 0;
        if rsp[0] & 0x02 != 0 {
            self.size_indicated =
                u32::from_le_bytes([rsp[4], rsp[5], rsp[6], rsp[7]]) as usize;
            self.fifo.reserve(self.size_indicated);
        }
        self.block_size = SDO_BLOCK_MAX_SIZE;
        self.block_seqno = 1;
        self.subblock.clear();
        self.block_data_end = false;

        let mut req = [0u8; 8];
        req[0] = (ccs::BLOCK_UPLOAD << 5) | 0x03; // cs = 3: start upload
        self.state = SdoState::UploadBlkSubblockSreq;
        self.send(req, tx);
        TransferStatus::Busy
    }

    fn on_block_upload_data(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        let seqno = rsp[0] & 0x7F;
        let last = rsp[0] & 0x80 != 0;
        if seqno == 0 || seqno > self.block_size {
            return self.local_abort(SdoAbortCode::SequenceNumber, tx);
        }
        if seqno == self.block_seqno {
            self.subblock.extend_from_slice(&rsp[1..8]);
            self.block_seqno += 1;
            if last {
                self.block_data_end = true;
            }
        }
        if last || seqno == self.block_size {
            let good = self.block_seqno - 1;
            let mut req = [0u8; 8];
            req[0] = (ccs::BLOCK_UPLOAD << 5) | 0x02; // cs = 2: acknowledge
            req[1] = good;
            req[2] = SDO_BLOCK_MAX_SIZE;
            self.send(req, tx);
            self.block_seqno = 1;
            if self.block_data_end {
                // Hold the final sub-block until the end frame reveals the
                // padding count.
                self.state = SdoState::UploadBlkEndSreq;
            } else {
                self.crc.update(&self.subblock);
                self.fifo.reserve(self.subblock.len());
                self.fifo.write(&self.subblock);
                self.size_transferred += self.subblock.len();
                self.subblock.clear();
            }
        }
        TransferStatus::Busy
    }

    fn on_block_upload_end(&mut self, rsp: [u8; 8], tx: &mut dyn FnMut(&CanFrame)) -> TransferStatus {
        if rsp[0] >> 5 != scs::BLOCK_UPLOAD || rsp[0] & 0x03 != 0x01 {
            return self.local_abort(SdoAbortCode::CommandSpecifier, tx);
        }
        let padding = ((rsp[0] >> 2) & 0x07) as usize;
        self.subblock.truncate(self.subblock.len().saturating_sub(padding));
        self.crc.update(&self.subblock);
        if self.crc_enabled {
            let received = u16::from_le_bytes([rsp[1], rsp[2]]);
            if self.crc.value() != received {
                return self.local_abort(SdoAbortCode::Crc, tx);
            }
        }
        self.fifo.reserve(self.subblock.len());
        self.fifo.write(&self.subblock);
        self.size_transferred += self.subblock.len();
        self.subblock.clear();

        if self.size_indicated > 0 && self.size_transferred != self.size_indicated {
            let code = if self.size_transferred < self.size_indicated {
                SdoAbortCode::DataShort
            } else {
                SdoAbortCode::DataLong
            };
            return self.local_abort(code, tx);
        }

        let mut req = [0u8; 8];
        req[0] = (ccs::BLOCK_UPLOAD << 5) | 0x01; // cs = 1: end
        self.send(req, tx);
        self.reset();
        TransferStatus::Complete(self.size_transferred)
    }
}
