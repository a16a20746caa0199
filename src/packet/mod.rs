//! Typed views over contiguous byte buffers for commands, events and ACL
//! frames, plus the size-classed pool backing their allocation (§4.1).
pub mod acl;
pub mod command;
pub mod event;
pub mod pool;

pub use acl::{AclPacket, BroadcastFlag, PacketBoundaryFlag};
pub use command::CommandPacket;
pub use event::{EventCode, EventPacket, LeSubeventCode};
