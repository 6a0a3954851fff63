#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (OD storage, transfer buffers).
extern crate alloc;

// --- Foundation Modules ---
pub mod bus;
pub mod router;
pub mod types;

// --- Data Model ---
pub mod od;

// --- Services ---
pub mod emcy;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;
pub mod time;

// --- Node Abstraction ---
pub mod config;
pub mod node;

// --- Top-level Exports ---
pub use bus::{BusError, CanBus, CanFrame, FrameHandler};
pub use nmt::{NmtCommand, NmtState};
pub use node::{Node, NodeBuilder};
pub use od::{Attributes, Entry, ObjectDictionary, OdError, Variable};
pub use sdo::{SdoAbortCode, TransferStatus};
pub use types::{DataType, NodeId};

use core::fmt;

/// Top-level error of node construction and the high-level client helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanOpenError {
    /// A local Object Dictionary access failed.
    Od(OdError),
    /// An SDO transfer was aborted, locally or by the peer.
    Sdo(SdoAbortCode),
    /// The bus adapter reported a failure.
    Bus(BusError),
    /// A node-id was outside the valid range.
    NodeId(types::NodeIdError),
    /// A configuration-time consistency check failed.
    Configuration(&'static str),
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Od(err) => write!(f, "Object dictionary error: {}", err),
            Self::Sdo(code) => write!(f, "SDO transfer aborted: {}", code),
            Self::Bus(err) => write!(f, "Bus error: {}", err),
            Self::NodeId(err) => write!(f, "{}", err),
            Self::Configuration(reason) => write!(f, "Configuration error: {}", reason),
        }
    }
}

impl From<OdError> for CanOpenError {
    fn from(err: OdError) -> Self {
        CanOpenError::Od(err)
    }
}

impl From<SdoAbortCode> for CanOpenError {
    fn from(code: SdoAbortCode) -> Self {
        CanOpenError::Sdo(code)
    }
}

impl From<BusError> for CanOpenError {
    fn from(err: BusError) -> Self {
        CanOpenError::Bus(err)
    }
}

impl From<types::NodeIdError> for CanOpenError {
    fn from(err: types::NodeIdError) -> Self {
        CanOpenError::NodeId(err)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CanOpenError {}
