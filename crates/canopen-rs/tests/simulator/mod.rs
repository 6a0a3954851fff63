//! A virtual CAN bus with simulated time, shared by the integration tests.
//!
//! Every endpoint sees every frame the others send (a real CAN bus is a
//! broadcast medium). Frames are recorded with the simulated timestamp so
//! tests can assert on emission times.

use canopen_rs::bus::{BusError, CanBus, CanFrame, FrameHandler};
use canopen_rs::node::Node;
use std::sync::{Arc, Mutex};

/// One frame as recorded on the virtual wire.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    pub time_us: u64,
    pub sender: usize,
    pub frame: CanFrame,
}

struct Endpoint {
    queue: Vec<CanFrame>,
    handler: Option<FrameHandler>,
}

struct NetworkState {
    time_us: u64,
    endpoints: Vec<Endpoint>,
    history: Vec<Record>,
}

/// The shared bus. Clone-free handle; endpoints are created from it.
pub struct VirtualNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl VirtualNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                time_us: 0,
                endpoints: Vec::new(),
                history: Vec::new(),
            })),
        }
    }

    /// Registers a new endpoint and returns its bus handle.
    pub fn endpoint(&self) -> VirtualBus {
        let mut state = self.state.lock().unwrap();
        state.endpoints.push(Endpoint {
            queue: Vec::new(),
            handler: None,
        });
        VirtualBus {
            state: self.state.clone(),
            endpoint: state.endpoints.len() - 1,
        }
    }

    /// Advances the simulated clock.
    pub fn advance(&self, delta_us: u64) {
        self.state.lock().unwrap().time_us += delta_us;
    }

    /// Snapshot of everything sent so far.
    pub fn history(&self) -> Vec<Record> {
        self.state.lock().unwrap().history.clone()
    }

    /// History filtered to one CAN-ID.
    pub fn history_of(&self, can_id: u32) -> Vec<Record> {
        self.history()
            .into_iter()
            .filter(|r| r.frame.can_id() == can_id)
            .collect()
    }
}

/// One endpoint's handle onto the virtual bus.
pub struct VirtualBus {
    state: Arc<Mutex<NetworkState>>,
    endpoint: usize,
}

impl VirtualBus {
    /// Pops the next frame delivered to this endpoint (pull mode; endpoints
    /// with a subscribed handler are served in push mode instead).
    pub fn recv(&self) -> Option<CanFrame> {
        let mut state = self.state.lock().unwrap();
        let queue = &mut state.endpoints[self.endpoint].queue;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl CanBus for VirtualBus {
    fn connect(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let time_us = state.time_us;
        state.history.push(Record {
            time_us,
            sender: self.endpoint,
            frame: *frame,
        });
        let sender = self.endpoint;
        for (i, endpoint) in state.endpoints.iter_mut().enumerate() {
            if i == sender {
                continue;
            }
            match &mut endpoint.handler {
                Some(handler) => handler(frame),
                None => endpoint.queue.push(*frame),
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, handler: FrameHandler) {
        let mut state = self.state.lock().unwrap();
        state.endpoints[self.endpoint].handler = Some(handler);
    }
}

/// Delivers pending frames to the node, then runs one process tick.
pub fn step(node: &mut Node, bus: &mut VirtualBus, delta_us: u64) {
    while let Some(frame) = bus.recv() {
        node.feed(frame);
    }
    node.process(delta_us, bus);
}
