//! Minimal CANopen master: starts a remote node, reads its device type and
//! watches its heartbeat.
//!
//! Run against a virtual bus:
//!   sudo ip link add dev vcan0 type vcan && sudo ip link set up vcan0
//!   cargo run --example simple_master -- vcan0 5

use canopen_rs::bus::{CanBus, FrameMailbox};
use canopen_rs::types::{NodeId, IDX_CONSUMER_HEARTBEAT, IDX_DEVICE_TYPE};
use canopen_rs::{NmtCommand, NodeBuilder};
use canopen_rs_linux::SocketCanBus;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let interface = args.next().unwrap_or_else(|| "vcan0".to_string());
    let remote: u8 = args.next().as_deref().unwrap_or("5").parse()?;
    let remote = NodeId::try_from(remote)?;

    let mut node = NodeBuilder::new(NodeId::try_from(0x7F)?).build()?;
    // Monitor the remote's heartbeat with a 1 s deadline.
    node.od()
        .write_u32(IDX_CONSUMER_HEARTBEAT, 1, ((remote.0 as u32) << 16) | 1000)?;
    node.reset_communication()?;

    let mailbox = FrameMailbox::with_capacity(256);
    node.attach_mailbox(mailbox.clone());
    let mut bus = SocketCanBus::new(&interface);
    bus.subscribe(mailbox.handler());
    bus.connect()?;

    node.send_nmt_command(&mut bus, NmtCommand::EnterOperational, remote.0)?;
    let device_type = node.read_u32(&mut bus, remote, IDX_DEVICE_TYPE, 0)?;
    println!("node {} device type: {:#010X}", remote, device_type);

    loop {
        node.process(10_000, &mut bus);
        if node.emcy().is_error_active(canopen_rs::emcy::EM_HEARTBEAT) {
            println!("heartbeat of node {} lost", remote);
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    bus.disconnect()?;
    Ok(())
}
