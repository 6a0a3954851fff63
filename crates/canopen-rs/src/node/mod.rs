//! The CANopen node: owns the Object Dictionary and every protocol module,
//! and advances them in a single cooperative tick.

use crate::bus::{CanBus, CanFrame};
#[cfg(feature = "std")]
use crate::bus::FrameMailbox;
use crate::emcy::{Emcy, EM_CAN_OVERRUN, EM_WRONG_MAPPING, ERR_REG_COMMUNICATION};
use crate::nmt::{nmt_command_frame, Nmt, NmtAction, NmtCommand, NmtState};
use crate::od::ObjectDictionary;
use crate::pdo::{Rpdo, Tpdo, PDO_MAX_COUNT};
use crate::router::FrameRouter;
use crate::sdo::{SdoClient, SdoServer, TransferStatus};
use crate::sync::Sync;
use crate::time::Time;
use crate::types::*;
use crate::CanOpenError;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{info, warn};

/// Capacity of the node's inbound frame queue.
const RX_QUEUE_CAP: usize = 128;
/// Poll interval of the blocking SDO helpers, µs.
#[cfg(feature = "std")]
const SDO_POLL_INTERVAL_US: u64 = 10_000;

/// Routing targets inside the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consumer {
    Nmt,
    Heartbeat,
    SyncObj,
    TimeObj,
    EmcyRx,
    SdoServerRx,
    SdoClientRx,
    Rpdo(usize),
    App(usize),
}

/// Assembles a [`Node`]: node-id, dictionary and whether the default
/// communication profile is populated first.
pub struct NodeBuilder {
    node_id: NodeId,
    od: ObjectDictionary,
    populate_defaults: bool,
}

impl NodeBuilder {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            od: ObjectDictionary::new(),
            populate_defaults: true,
        }
    }

    /// Uses an application-provided dictionary (e.g. built from a parsed
    /// EDS) instead of an empty one.
    pub fn with_od(mut self, od: ObjectDictionary) -> Self {
        self.od = od;
        self
    }

    /// Skips populating the default communication-profile entries; the
    /// supplied dictionary must already carry them.
    pub fn without_default_objects(mut self) -> Self {
        self.populate_defaults = false;
        self
    }

    pub fn build(mut self) -> Result<Node, CanOpenError> {
        if self.populate_defaults {
            crate::od::predefined::populate_communication_profile(&mut self.od, self.node_id);
        }
        Node::new(self.node_id, self.od)
    }
}

/// A CANopen node instance. One thread (the process thread) owns the node
/// and must call [`process`](Node::process) periodically; bus adapters hand
/// received frames over through [`feed`](Node::feed) or the attached
/// [`FrameMailbox`].
pub struct Node {
    node_id: NodeId,
    od: ObjectDictionary,
    router: FrameRouter<Consumer>,
    nmt: Nmt,
    emcy: Emcy,
    sync: Sync,
    time: Time,
    sdo_server: SdoServer,
    sdo_client: SdoClient,
    rpdos: Vec<Rpdo>,
    tpdos: Vec<Tpdo>,
    rx_queue: VecDeque<CanFrame>,
    overrun: bool,
    app_handlers: Vec<Box<dyn FnMut(&CanFrame) + Send>>,
    /// Terminal result of the last SDO client transfer, latched for the
    /// blocking helpers.
    sdo_result: Option<TransferStatus>,
    #[cfg(feature = "std")]
    mailbox: Option<FrameMailbox>,
}

impl Node {
    /// Builds a node around a populated dictionary. Configuration-time
    /// failures (missing mandatory objects) abort construction; PDO mapping
    /// faults do not, they surface as emergencies once the node runs.
    pub fn new(node_id: NodeId, mut od: ObjectDictionary) -> Result<Self, CanOpenError> {
        for index in [IDX_DEVICE_TYPE, IDX_ERROR_REGISTER, IDX_PRODUCER_HEARTBEAT] {
            if od.index(index).is_none() {
                return Err(CanOpenError::Configuration("mandatory object missing"));
            }
        }
        let emcy = Emcy::from_od(&mut od, node_id);
        let nmt = Nmt::from_od(&mut od, node_id);
        let sync = Sync::from_od(&mut od);
        let time = Time::from_od(&mut od);
        let sdo_server = SdoServer::from_od(&mut od, node_id);
        let sdo_client = SdoClient::from_od(&mut od, node_id);
        let mut node = Self {
            node_id,
            od,
            router: FrameRouter::new(),
            nmt,
            emcy,
            sync,
            time,
            sdo_server,
            sdo_client,
            rpdos: Vec::new(),
            tpdos: Vec::new(),
            rx_queue: VecDeque::with_capacity(RX_QUEUE_CAP),
            overrun: false,
            app_handlers: Vec::new(),
            sdo_result: None,
            #[cfg(feature = "std")]
            mailbox: None,
        };
        node.load_pdos()?;
        node.rebuild_router();
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// The node's dictionary. Mutations must happen on the process thread.
    pub fn od(&mut self) -> &mut ObjectDictionary {
        &mut self.od
    }

    pub fn emcy(&self) -> &Emcy {
        &self.emcy
    }

    /// Reports an application error through the emergency producer.
    pub fn error_report(&mut self, code: u16, register_bit: u8, info: u32) {
        self.emcy.error_report(&mut self.od, code, register_bit, info);
    }

    /// Clears an application error, emitting the code-0 reset emergency.
    pub fn error_reset(&mut self, code: u16, info: u32) {
        self.emcy.error_reset(&mut self.od, code, info);
    }

    fn load_pdos(&mut self) -> Result<(), CanOpenError> {
        self.rpdos.clear();
        self.tpdos.clear();
        for n in 0..PDO_MAX_COUNT {
            if self.od.index(IDX_RPDO_COMM_BASE + n as u16).is_none() {
                break;
            }
            self.rpdos.push(Rpdo::from_od(&mut self.od, n)?);
        }
        for n in 0..PDO_MAX_COUNT {
            if self.od.index(IDX_TPDO_COMM_BASE + n as u16).is_none() {
                break;
            }
            self.tpdos.push(Tpdo::from_od(&mut self.od, n)?);
        }
        for fault in self
            .rpdos
            .iter()
            .map(|r| r.base.mapping_fault)
            .chain(self.tpdos.iter().map(|t| t.base.mapping_fault))
        {
            if fault {
                self.emcy
                    .error_report(&mut self.od, EM_WRONG_MAPPING, ERR_REG_COMMUNICATION, 0);
            }
        }
        Ok(())
    }

    fn rebuild_router(&mut self) {
        self.router.clear();
        self.router.subscribe(COB_ID_NMT, 0x7FF, false, Consumer::Nmt);
        self.router.subscribe(COB_ID_HEARTBEAT, 0x780, false, Consumer::Heartbeat);
        self.router.subscribe(self.sync.cob_id(), 0x7FF, false, Consumer::SyncObj);
        self.router.subscribe(self.time.cob_id(), 0x7FF, false, Consumer::TimeObj);
        self.router.subscribe(COB_ID_EMERGENCY, 0x780, false, Consumer::EmcyRx);
        self.router
            .subscribe(self.sdo_server.cob_id_rx(), 0x7FF, false, Consumer::SdoServerRx);
        // The whole server-to-client range: the client filters on its own
        // COB-ID, which changes with `sdo_setup`.
        self.router
            .subscribe(COB_ID_SDO_SERVER_TX, 0x780, false, Consumer::SdoClientRx);
        for rpdo in self.rpdos.iter() {
            if rpdo.base.valid {
                self.router
                    .subscribe(rpdo.base.cob_id, 0x7FF, false, Consumer::Rpdo(rpdo.pdo_number()));
            }
        }
    }

    /// Applies any pending communication-parameter changes: rebuilds every
    /// module from the dictionary, emits a fresh boot-up message.
    pub fn reset_communication(&mut self) -> Result<(), CanOpenError> {
        info!("[NODE] Communication reset");
        self.emcy = Emcy::from_od(&mut self.od, self.node_id);
        self.nmt.reset_communication(&mut self.od);
        self.sync.reset_communication(&mut self.od);
        self.time.reset_communication(&mut self.od);
        self.sdo_server.reset_communication(&mut self.od, self.node_id);
        self.sdo_client.reset_communication(&mut self.od, self.node_id);
        self.load_pdos()?;
        self.rebuild_router();
        Ok(())
    }

    /// Full application reset: restores every dictionary value to its
    /// default, then resets communication.
    pub fn reset_node(&mut self) -> Result<(), CanOpenError> {
        info!("[NODE] Node reset, restoring defaults");
        self.od.restore_defaults();
        self.reset_communication()
    }

    /// Hands a received frame to the node. Callable from the process thread;
    /// threaded adapters use a [`FrameMailbox`] instead.
    pub fn feed(&mut self, frame: CanFrame) {
        if self.rx_queue.len() == RX_QUEUE_CAP {
            self.rx_queue.pop_front();
            self.overrun = true;
        }
        self.rx_queue.push_back(frame);
    }

    /// Attaches the thread-safe mailbox a bus adapter pushes into.
    #[cfg(feature = "std")]
    pub fn attach_mailbox(&mut self, mailbox: FrameMailbox) {
        self.mailbox = Some(mailbox);
    }

    /// Registers an application frame handler for `(cob_id & mask)` matches.
    /// Handlers must be non-blocking; they run on the process thread.
    pub fn subscribe(&mut self, cob_id: u32, mask: u32, handler: Box<dyn FnMut(&CanFrame) + Send>) {
        let slot = self.app_handlers.len();
        self.app_handlers.push(handler);
        self.router.subscribe(cob_id, mask, false, Consumer::App(slot));
    }

    /// Points the SDO client at a remote server.
    pub fn sdo_setup(&mut self, server: NodeId) -> Result<(), CanOpenError> {
        self.sdo_client.setup(server).map_err(CanOpenError::Sdo)
    }

    /// Direct access to the SDO client for non-blocking use.
    pub fn sdo_client(&mut self) -> &mut SdoClient {
        &mut self.sdo_client
    }

    /// Requests transmission of a TPDO (for synchronous-acyclic and
    /// manufacturer-triggered types).
    pub fn tpdo_request(&mut self, tpdo: usize) {
        if let Some(tpdo) = self.tpdos.get_mut(tpdo) {
            tpdo.request_transmission();
        }
    }

    /// Emits an NMT master command. `target` 0 addresses every node. A
    /// command aimed at this node itself is also applied locally.
    pub fn send_nmt_command(
        &mut self,
        bus: &mut dyn CanBus,
        command: NmtCommand,
        target: u8,
    ) -> Result<(), CanOpenError> {
        let frame = nmt_command_frame(command, target);
        if target == 0 || target == self.node_id.0 {
            self.nmt.handle_command_frame(&frame);
        }
        bus.send(&frame).map_err(CanOpenError::Bus)
    }

    fn dispatch(&mut self, frame: &CanFrame) {
        // Collect first: handlers below borrow the fields the router owns
        // alongside.
        let mut targets = [None; 8];
        let mut count = 0;
        for target in self.router.route(frame) {
            if count < targets.len() {
                targets[count] = Some(target);
                count += 1;
            }
        }
        for target in targets.iter().take(count).flatten() {
            match *target {
                Consumer::Nmt => self.nmt.handle_command_frame(frame),
                Consumer::Heartbeat => {
                    self.nmt.handle_heartbeat(frame, &mut self.od, &mut self.emcy)
                }
                Consumer::SyncObj => self.sync.handle_frame(frame),
                Consumer::TimeObj => self.time.handle_frame(frame),
                Consumer::EmcyRx => self.emcy.handle_frame(frame),
                Consumer::SdoServerRx => {
                    if self.nmt.state().sdo_allowed() {
                        self.sdo_server.handle_frame(frame);
                    }
                }
                Consumer::SdoClientRx => {
                    if frame.can_id() == self.sdo_client.cob_id_rx() {
                        self.sdo_client.handle_frame(frame);
                    }
                }
                Consumer::Rpdo(n) => {
                    if let Some(rpdo) = self.rpdos.get_mut(n) {
                        rpdo.handle_frame(frame);
                    }
                }
                Consumer::App(slot) => {
                    if let Some(handler) = self.app_handlers.get_mut(slot) {
                        handler(frame);
                    }
                }
            }
        }
    }

    /// Advances the node by `delta_us`. Drains the inbound queue, then runs
    /// NMT, SYNC, EMCY, RPDOs, the SDO machines, TPDOs and TIME in that
    /// order. Returns the time to the earliest internal deadline, so the
    /// caller can sleep until then (`u64::MAX` when no timer is pending).
    pub fn process(&mut self, delta_us: u64, bus: &mut dyn CanBus) -> u64 {
        // 1. Drain inbound frames.
        #[cfg(feature = "std")]
        if let Some(mailbox) = self.mailbox.clone() {
            while let Some(frame) = mailbox.pop() {
                self.feed(frame);
            }
            if mailbox.take_overrun() {
                self.overrun = true;
            }
        }
        while let Some(frame) = self.rx_queue.pop_front() {
            self.dispatch(&frame);
        }
        if core::mem::take(&mut self.overrun) {
            self.emcy
                .error_report(&mut self.od, EM_CAN_OVERRUN, ERR_REG_COMMUNICATION, 0);
        }

        let mut next_us = u64::MAX;
        let reset_action;
        {
            let Self {
                od,
                nmt,
                emcy,
                sync,
                time,
                sdo_server,
                sdo_client,
                rpdos,
                tpdos,
                sdo_result,
                ..
            } = self;
            let mut tx = |frame: &CanFrame| {
                if let Err(err) = bus.send(frame) {
                    warn!("[NODE] Frame send failed: {}", err);
                }
            };

            // 2. NMT.
            let (action, nmt_next) = nmt.process(od, emcy, delta_us, &mut tx);
            reset_action = action;
            next_us = next_us.min(nmt_next);
            let state = nmt.state();

            // 3. SYNC; the phase sampled here is seen by every later step of
            // this tick.
            let (sync_event, sync_next) = sync.process(state, delta_us, &mut tx);
            next_us = next_us.min(sync_next);

            // 4. EMCY.
            emcy.process(state, &mut tx);

            // 5. RPDOs apply before TPDO triggers so a synchronous chain
            // completes within one tick.
            for rpdo in rpdos.iter_mut() {
                next_us = next_us.min(rpdo.process(od, emcy, state, sync_event, delta_us));
            }

            // 6. SDO server and client.
            sdo_server.process(od, state, delta_us, &mut tx);
            if state.sdo_allowed() {
                match sdo_client.poll(od, delta_us, &mut tx) {
                    TransferStatus::Idle | TransferStatus::Busy => {}
                    terminal => *sdo_result = Some(terminal),
                }
            }

            // 7. TPDOs.
            for tpdo in tpdos.iter_mut() {
                next_us = next_us.min(tpdo.process(od, state, sync_event, delta_us, &mut tx));
            }

            // 8. TIME.
            next_us = next_us.min(time.process(state, delta_us, &mut tx));
        }

        match reset_action {
            NmtAction::None => {}
            NmtAction::ResetCommunication => {
                if let Err(err) = self.reset_communication() {
                    warn!("[NODE] Communication reset failed: {}", err);
                }
                next_us = 0;
            }
            NmtAction::ResetNode => {
                if let Err(err) = self.reset_node() {
                    warn!("[NODE] Node reset failed: {}", err);
                }
                next_us = 0;
            }
        }
        next_us
    }

    /// Takes the latched result of the last finished SDO client transfer.
    pub fn take_sdo_result(&mut self) -> Option<TransferStatus> {
        self.sdo_result.take()
    }
}

/// Blocking SDO convenience wrappers.
///
/// These poll `process` at a fixed 10 ms interval and sleep in between; they
/// must not be called from inside a `process` callback (frame handlers,
/// extensions).
#[cfg(feature = "std")]
impl Node {
    fn run_transfer(
        &mut self,
        bus: &mut dyn CanBus,
        mut drain: Option<&mut Vec<u8>>,
    ) -> Result<usize, CanOpenError> {
        loop {
            self.process(SDO_POLL_INTERVAL_US, bus);
            if let Some(sink) = drain.as_deref_mut() {
                let mut chunk = [0u8; 64];
                loop {
                    let n = self.sdo_client.upload_read(&mut chunk);
                    if n == 0 {
                        break;
                    }
                    sink.extend_from_slice(&chunk[..n]);
                }
            }
            match self.sdo_result.take() {
                Some(TransferStatus::Complete(size)) => return Ok(size),
                Some(TransferStatus::Aborted(code)) => return Err(CanOpenError::Sdo(code)),
                Some(_) | None => {}
            }
            std::thread::sleep(std::time::Duration::from_micros(SDO_POLL_INTERVAL_US));
        }
    }

    /// Reads a remote sub-object into `out`. Expedited or segmented is the
    /// server's choice. Returns the number of bytes received.
    pub fn read_raw(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
        out: &mut [u8],
    ) -> Result<usize, CanOpenError> {
        self.sdo_setup(server)?;
        self.sdo_client
            .upload_start(index, sub_index, false)
            .map_err(CanOpenError::Sdo)?;
        let mut data = Vec::new();
        let size = self.run_transfer(bus, Some(&mut data))?;
        if data.len() > out.len() {
            return Err(CanOpenError::Od(crate::od::OdError::DataLong));
        }
        out[..data.len()].copy_from_slice(&data);
        Ok(size)
    }

    /// Reads a complete remote value into a growable buffer, preferring
    /// block upload.
    pub fn read_all(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
    ) -> Result<Vec<u8>, CanOpenError> {
        self.sdo_setup(server)?;
        self.sdo_client
            .upload_start(index, sub_index, true)
            .map_err(CanOpenError::Sdo)?;
        let mut data = Vec::new();
        self.run_transfer(bus, Some(&mut data))?;
        Ok(data)
    }

    /// Writes a value to a remote sub-object. Expedited for 1..=4 bytes
    /// unless `force_segmented`; block mode for large payloads.
    pub fn write_raw(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
        data: &[u8],
        force_segmented: bool,
    ) -> Result<(), CanOpenError> {
        self.sdo_setup(server)?;
        self.sdo_client
            .download_start(index, sub_index, data, force_segmented)
            .map_err(CanOpenError::Sdo)?;
        self.run_transfer(bus, None)?;
        Ok(())
    }

    fn read_exact<const N: usize>(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
    ) -> Result<[u8; N], CanOpenError> {
        let mut buf = [0u8; N];
        let size = self.read_raw(bus, server, index, sub_index, &mut buf)?;
        if size != N {
            return Err(CanOpenError::Od(crate::od::OdError::TypeMismatch));
        }
        Ok(buf)
    }

    pub fn read_u8(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
    ) -> Result<u8, CanOpenError> {
        self.read_exact::<1>(bus, server, index, sub_index).map(|b| b[0])
    }

    pub fn read_u16(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
    ) -> Result<u16, CanOpenError> {
        self.read_exact::<2>(bus, server, index, sub_index).map(u16::from_le_bytes)
    }

    pub fn read_u32(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
    ) -> Result<u32, CanOpenError> {
        self.read_exact::<4>(bus, server, index, sub_index).map(u32::from_le_bytes)
    }

    pub fn read_u64(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
    ) -> Result<u64, CanOpenError> {
        self.read_exact::<8>(bus, server, index, sub_index).map(u64::from_le_bytes)
    }

    pub fn write_u8(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
        value: u8,
    ) -> Result<(), CanOpenError> {
        self.write_raw(bus, server, index, sub_index, &value.to_le_bytes(), false)
    }

    pub fn write_u16(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
        value: u16,
    ) -> Result<(), CanOpenError> {
        self.write_raw(bus, server, index, sub_index, &value.to_le_bytes(), false)
    }

    pub fn write_u32(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
        value: u32,
    ) -> Result<(), CanOpenError> {
        self.write_raw(bus, server, index, sub_index, &value.to_le_bytes(), false)
    }

    pub fn write_u64(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
        index: u16,
        sub_index: u8,
        value: u64,
    ) -> Result<(), CanOpenError> {
        self.write_raw(bus, server, index, sub_index, &value.to_le_bytes(), false)
    }

    /// Fetches a remote node's stored EDS (objects 0x1021/0x1022) via block
    /// upload. Only format 0 (ASCII text) is understood.
    pub fn fetch_eds(
        &mut self,
        bus: &mut dyn CanBus,
        server: NodeId,
    ) -> Result<Vec<u8>, CanOpenError> {
        let format = self.read_u8(bus, server, IDX_EDS_FORMAT, 0)?;
        if format != 0 {
            return Err(CanOpenError::Configuration("unsupported EDS storage format"));
        }
        self.read_all(bus, server, IDX_EDS_STORAGE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBus;
    impl CanBus for NullBus {
        fn connect(&mut self) -> Result<(), crate::bus::BusError> {
            Ok(())
        }
        fn disconnect(&mut self) -> Result<(), crate::bus::BusError> {
            Ok(())
        }
        fn send(&mut self, _frame: &CanFrame) -> Result<(), crate::bus::BusError> {
            Ok(())
        }
        fn subscribe(&mut self, _handler: crate::bus::FrameHandler) {}
    }

    #[test]
    fn test_builder_creates_operational_ready_node() {
        let mut node = NodeBuilder::new(NodeId::try_from(0x10).unwrap()).build().unwrap();
        assert_eq!(node.nmt_state(), NmtState::Initializing);
        let mut bus = NullBus;
        node.process(1_000, &mut bus);
        assert_eq!(node.nmt_state(), NmtState::PreOperational);
    }

    #[test]
    fn test_missing_mandatory_objects_fail_construction() {
        let od = ObjectDictionary::new();
        assert!(Node::new(NodeId::try_from(1).unwrap(), od).is_err());
    }

    #[test]
    fn test_nmt_command_frame_changes_state() {
        let mut node = NodeBuilder::new(NodeId::try_from(0x10).unwrap()).build().unwrap();
        let mut bus = NullBus;
        node.process(1_000, &mut bus);
        node.feed(CanFrame::new(0x000, &[0x01, 0x00]));
        node.process(1_000, &mut bus);
        assert_eq!(node.nmt_state(), NmtState::Operational);
    }

    #[test]
    fn test_rx_queue_overrun_raises_emergency() {
        let mut node = NodeBuilder::new(NodeId::try_from(0x10).unwrap()).build().unwrap();
        let mut bus = NullBus;
        node.process(1_000, &mut bus);
        for _ in 0..(RX_QUEUE_CAP + 1) {
            node.feed(CanFrame::new(0x7E5, &[]));
        }
        node.process(1_000, &mut bus);
        assert!(node.emcy.is_error_active(EM_CAN_OVERRUN));
    }

    #[test]
    fn test_app_subscription_receives_frames() {
        use alloc::sync::Arc;
        use core::sync::atomic::{AtomicU32, Ordering};

        let mut node = NodeBuilder::new(NodeId::try_from(0x10).unwrap()).build().unwrap();
        let mut bus = NullBus;
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_handler = seen.clone();
        node.subscribe(
            0x123,
            0x7FF,
            Box::new(move |_frame| {
                seen_in_handler.fetch_add(1, Ordering::Relaxed);
            }),
        );
        node.feed(CanFrame::new(0x123, &[1]));
        node.feed(CanFrame::new(0x124, &[1]));
        node.process(1_000, &mut bus);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
