//! HCI transport and link-management core of a Bluetooth host stack.
//!
//! [`Transport`] owns a [`command_channel::CommandChannel`] and, once the
//! controller's data buffer sizes are known, an
//! [`acl_data_channel::AclDataChannel`]. Everything else in this crate --
//! connections, advertising, scanning -- is built on top of those two
//! channels (§2).

pub mod acl_data_channel;
pub mod address;
pub mod advertising;
pub mod command_channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod lmp_feature_set;
pub mod local_address_delegate;
pub mod opcode;
pub mod packet;
pub mod scanner;
pub mod sequential_command_runner;
pub mod transport;

pub use config::HciConfig;
pub use error::{HciError, Result, Status};
pub use handle::{ConnectionHandle, LinkType};
pub use opcode::OpCode;
pub use transport::Transport;
