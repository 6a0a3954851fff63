//! SocketCAN implementation of the `canopen-rs` bus adapter contract.
//!
//! `send` writes on a non-blocking socket so it never waits on the wire.
//! Reception runs on a dedicated thread that invokes the subscribed frame
//! handler for every received frame; the stock handler pushes into a
//! `FrameMailbox` the node drains at the start of each `process` tick.

use canopen_rs::bus::{BusError, CanBus, CanFrame, FrameHandler, CAN_ID_FLAG_EXTENDED};
use log::{debug, warn};
use socketcan::{EmbeddedFrame, Frame, Id, Socket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Converts a received SocketCAN frame into the core representation.
fn from_socketcan(frame: &socketcan::CanFrame) -> CanFrame {
    let id = match frame.id() {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw() | CAN_ID_FLAG_EXTENDED,
    };
    let mut out = CanFrame {
        id,
        dlc: frame.dlc() as u8,
        flags: 0,
        data: [0; 8],
    };
    let data = frame.data();
    out.data[..data.len()].copy_from_slice(data);
    out
}

/// Converts a core frame into a SocketCAN frame.
fn to_socketcan(frame: &CanFrame) -> Result<socketcan::CanFrame, BusError> {
    let id: Id = if frame.is_extended() {
        socketcan::ExtendedId::new(frame.can_id())
            .map(Id::Extended)
            .ok_or(BusError::InvalidFrame)?
    } else {
        socketcan::StandardId::new(frame.can_id() as u16)
            .map(Id::Standard)
            .ok_or(BusError::InvalidFrame)?
    };
    socketcan::CanFrame::new(id, frame.payload()).ok_or(BusError::InvalidFrame)
}

/// A CAN bus reached through a Linux SocketCAN interface (e.g. `can0`,
/// `vcan0`).
pub struct SocketCanBus {
    interface: String,
    socket: Option<socketcan::CanSocket>,
    /// Handler held between `subscribe` and `connect`; the receive thread
    /// takes ownership of it.
    handler: Option<FrameHandler>,
    rx_running: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
}

impl SocketCanBus {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            socket: None,
            handler: None,
            rx_running: Arc::new(AtomicBool::new(false)),
            rx_thread: None,
        }
    }

    fn spawn_rx_thread(&mut self) -> Result<(), BusError> {
        let Some(mut handler) = self.handler.take() else {
            // Nothing subscribed; reception stays off.
            return Ok(());
        };
        let socket = socketcan::CanSocket::open(&self.interface).map_err(|err| {
            warn!("[BUS] Opening rx socket on {} failed: {}", self.interface, err);
            BusError::IoError
        })?;
        socket
            .set_read_timeout(Duration::from_millis(100))
            .map_err(|_| BusError::IoError)?;

        self.rx_running.store(true, Ordering::SeqCst);
        let running = self.rx_running.clone();
        let interface = self.interface.clone();
        self.rx_thread = Some(std::thread::spawn(move || {
            debug!("[BUS] Receive thread on {} started", interface);
            while running.load(Ordering::SeqCst) {
                match socket.read_frame() {
                    Ok(frame) => handler(&from_socketcan(&frame)),
                    // Timeouts keep the shutdown flag polled.
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(err) => {
                        warn!("[BUS] Receive on {} failed: {}", interface, err);
                        break;
                    }
                }
            }
            debug!("[BUS] Receive thread on {} stopped", interface);
        }));
        Ok(())
    }
}

impl CanBus for SocketCanBus {
    fn connect(&mut self) -> Result<(), BusError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = socketcan::CanSocket::open(&self.interface).map_err(|err| {
            warn!("[BUS] Opening {} failed: {}", self.interface, err);
            BusError::IoError
        })?;
        socket.set_nonblocking(true).map_err(|_| BusError::IoError)?;
        self.socket = Some(socket);
        self.spawn_rx_thread()
    }

    fn disconnect(&mut self) -> Result<(), BusError> {
        self.rx_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        self.socket = None;
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let socket = self.socket.as_ref().ok_or(BusError::NotConnected)?;
        let raw = to_socketcan(frame)?;
        match socket.write_frame(&raw) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(BusError::TxOverflow),
            Err(err) => {
                warn!("[BUS] Send on {} failed: {}", self.interface, err);
                Err(BusError::IoError)
            }
        }
    }

    fn subscribe(&mut self, handler: FrameHandler) {
        self.handler = Some(handler);
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
