use crate::types::CAN_MAX_DLC;
use alloc::boxed::Box;
use core::fmt;

/// Bit 31 of the identifier word marks an extended (29-bit) frame.
pub const CAN_ID_FLAG_EXTENDED: u32 = 1 << 31;
/// Mask for the 29-bit extended identifier.
pub const CAN_EXT_ID_MASK: u32 = 0x1FFF_FFFF;
/// Mask for the 11-bit standard identifier.
pub const CAN_STD_ID_MASK: u32 = 0x7FF;

/// A classic CAN 2.0 frame as exchanged with the bus adapter.
///
/// The identifier word carries the extended-id flag in bit 31; the core only
/// produces standard (11-bit) frames but tolerates extended ones on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Identifier word. Bits 0..=28 are the id, bit 31 flags an extended id.
    pub id: u32,
    /// Data length code, 0..=8.
    pub dlc: u8,
    /// Adapter flags (RTR etc.). The core neither sets nor interprets these.
    pub flags: u8,
    /// Payload. Only the first `dlc` bytes are meaningful.
    pub data: [u8; CAN_MAX_DLC],
}

impl CanFrame {
    /// Creates a standard-id frame from a payload slice. Panics if `data`
    /// exceeds 8 bytes; callers in this crate always pass fixed-size buffers.
    pub fn new(id: u32, data: &[u8]) -> Self {
        let mut frame = CanFrame {
            id: id & CAN_STD_ID_MASK,
            dlc: data.len() as u8,
            flags: 0,
            data: [0; CAN_MAX_DLC],
        };
        frame.data[..data.len()].copy_from_slice(data);
        frame
    }

    /// The identifier without the extended flag bit.
    pub fn can_id(&self) -> u32 {
        if self.is_extended() {
            self.id & CAN_EXT_ID_MASK
        } else {
            self.id & CAN_STD_ID_MASK
        }
    }

    /// True when bit 31 flags a 29-bit identifier.
    pub fn is_extended(&self) -> bool {
        self.id & CAN_ID_FLAG_EXTENDED != 0
    }

    /// The meaningful part of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// Errors reported by a bus adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The adapter is not connected.
    NotConnected,
    /// The driver transmit queue refused the frame.
    TxOverflow,
    /// The frame is malformed (bad DLC, extended id where unsupported).
    InvalidFrame,
    /// An underlying I/O error occurred.
    IoError,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Bus adapter not connected"),
            Self::TxOverflow => write!(f, "Driver transmit queue full"),
            Self::InvalidFrame => write!(f, "Malformed CAN frame"),
            Self::IoError => write!(f, "Underlying I/O error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BusError {}

/// Callback a bus adapter invokes for each received frame.
///
/// Adapters may call the handler from their own receive context (a thread in
/// `canopen-rs-linux`), hence the `Send` bound. Handlers must be
/// non-blocking; the stock handler pushes into a [`FrameMailbox`] the node
/// drains on its process thread.
pub type FrameHandler = Box<dyn FnMut(&CanFrame) + Send>;

/// Bus adapter contract: `connect`, `disconnect`, `send` and `subscribe`.
///
/// Implementations wrap a CAN driver (SocketCAN, a vendor SDK, a virtual bus
/// in tests). `send` must be a non-blocking enqueue: it returns as soon as
/// the frame has been admitted to the driver and never waits for the wire.
pub trait CanBus {
    /// Opens the underlying driver.
    fn connect(&mut self) -> Result<(), BusError>;

    /// Closes the underlying driver. Idempotent.
    fn disconnect(&mut self) -> Result<(), BusError>;

    /// Enqueues one frame for transmission without blocking on the wire.
    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Registers the callback invoked on each received frame, replacing any
    /// prior handler. Call before `connect`; adapters that hand the handler
    /// to a receive context on connect need a fresh subscription per
    /// connection.
    fn subscribe(&mut self, handler: FrameHandler);
}

/// Bounded thread-safe frame queue between a bus adapter's receive context
/// and the node's process thread.
///
/// The adapter side clones the mailbox and pushes from its own thread; the
/// node drains it at the start of every `process` tick. When full, the oldest
/// frame is dropped and the overrun is reported so the node can raise a
/// CAN-overrun emergency.
#[cfg(feature = "std")]
#[derive(Clone)]
pub struct FrameMailbox {
    inner: std::sync::Arc<std::sync::Mutex<MailboxState>>,
    capacity: usize,
}

#[cfg(feature = "std")]
struct MailboxState {
    queue: std::collections::VecDeque<CanFrame>,
    overrun: bool,
}

#[cfg(feature = "std")]
impl FrameMailbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(MailboxState {
                queue: std::collections::VecDeque::with_capacity(capacity),
                overrun: false,
            })),
            capacity,
        }
    }

    /// Enqueues a received frame. Never blocks beyond the internal lock.
    pub fn push(&self, frame: CanFrame) {
        if let Ok(mut state) = self.inner.lock() {
            if state.queue.len() == self.capacity {
                state.queue.pop_front();
                state.overrun = true;
            }
            state.queue.push_back(frame);
        }
    }

    /// Pops the oldest frame, if any.
    pub fn pop(&self) -> Option<CanFrame> {
        self.inner.lock().ok().and_then(|mut state| state.queue.pop_front())
    }

    /// Returns and clears the overrun flag.
    pub fn take_overrun(&self) -> bool {
        match self.inner.lock() {
            Ok(mut state) => core::mem::take(&mut state.overrun),
            Err(_) => false,
        }
    }

    /// A frame handler pushing into this mailbox, ready for
    /// [`CanBus::subscribe`].
    pub fn handler(&self) -> FrameHandler {
        let mailbox = self.clone();
        Box::new(move |frame| mailbox.push(*frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new_masks_id() {
        let frame = CanFrame::new(0x1585, &[1, 2, 3]);
        assert_eq!(frame.can_id(), 0x585);
        assert_eq!(frame.dlc, 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(!frame.is_extended());
    }

    #[test]
    fn test_extended_flag() {
        let frame = CanFrame {
            id: CAN_ID_FLAG_EXTENDED | 0x18DA_00F1,
            dlc: 0,
            flags: 0,
            data: [0; 8],
        };
        assert!(frame.is_extended());
        assert_eq!(frame.can_id(), 0x18DA_00F1);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_mailbox_bounded_with_overrun() {
        let mailbox = FrameMailbox::with_capacity(2);
        mailbox.push(CanFrame::new(1, &[]));
        mailbox.push(CanFrame::new(2, &[]));
        mailbox.push(CanFrame::new(3, &[]));
        assert!(mailbox.take_overrun());
        assert!(!mailbox.take_overrun());
        assert_eq!(mailbox.pop().map(|f| f.can_id()), Some(2));
        assert_eq!(mailbox.pop().map(|f| f.can_id()), Some(3));
        assert!(mailbox.pop().is_none());
    }
}
