//! Owns the command and ACL data channels for one controller connection and
//! watches for it going away (§4.2).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

use crate::acl_data_channel::{AclDataChannel, DataBufferInfo};
use crate::command_channel::CommandChannel;
use crate::config::HciConfig;
use crate::error::{HciError, Result};
use crate::opcode::OpCode;
use crate::packet::{acl, CommandPacket, EventCode};

type ClosedCallback = Box<dyn FnOnce() + Send>;

const OGF_INFORMATIONAL: u8 = 0x04;
const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
const OGF_LE: u8 = 0x08;
const OCF_LE_READ_BUFFER_SIZE: u16 = 0x0002;

/// Bundles the command channel with an ACL data channel that only becomes
/// usable once `Read Buffer Size` / `LE Read Buffer Size` have been learned
/// from the controller (§4.2, §10).
pub struct Transport {
    command_channel: CommandChannel,
    acl_channel: Mutex<Option<AclDataChannel>>,
    closed: Arc<AtomicBool>,
    on_closed: Mutex<Option<ClosedCallback>>,
}

impl Transport {
    /// Spawns the read loop over `controller_in`/`command_out` and returns
    /// the transport with a live `CommandChannel` but no ACL channel yet --
    /// callers bootstrap buffer sizing with `Send`/`SendLEAsync` on the
    /// command channel, then call [`Transport::install_acl_channel`] (§10).
    pub fn new<R, W>(controller_in: R, command_out: W, config: HciConfig) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let command_channel = CommandChannel::new(command_out, config.command_timeout);
        let transport = Arc::new(Transport {
            command_channel,
            acl_channel: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            on_closed: Mutex::new(None),
        });

        let weak = Arc::downgrade(&transport);
        tokio::spawn(async move {
            let mut controller_in = controller_in;
            // H4-style framing: a one-byte indicator (0x04 event, 0x02 ACL
            // data) prefixes every packet the controller sends (§4.2).
            loop {
                let mut indicator = [0u8; 1];
                if controller_in.read_exact(&mut indicator).await.is_err() {
                    break;
                }
                let Some(transport) = weak.upgrade() else { break };
                match indicator[0] {
                    0x04 => {
                        let mut header = [0u8; 2];
                        if controller_in.read_exact(&mut header).await.is_err() {
                            break;
                        }
                        let len = header[1] as usize;
                        let mut params = vec![0u8; len];
                        if controller_in.read_exact(&mut params).await.is_err() {
                            break;
                        }
                        let mut raw = Vec::with_capacity(2 + len);
                        raw.extend_from_slice(&header);
                        raw.extend_from_slice(&params);
                        if let Err(e) = transport.command_channel.handle_event_bytes(&raw) {
                            warn!("dropping malformed event: {e}");
                        }
                    }
                    0x02 => {
                        let mut header = [0u8; acl::HEADER_SIZE];
                        if controller_in.read_exact(&mut header).await.is_err() {
                            break;
                        }
                        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
                        let mut payload = vec![0u8; len];
                        if controller_in.read_exact(&mut payload).await.is_err() {
                            break;
                        }
                        let mut raw = Vec::with_capacity(acl::HEADER_SIZE + len);
                        raw.extend_from_slice(&header);
                        raw.extend_from_slice(&payload);
                        let channel = transport.acl_channel.lock().unwrap().clone();
                        if let Some(channel) = channel {
                            if let Err(e) = channel.handle_inbound_bytes(&raw) {
                                warn!("dropping malformed ACL frame: {e}");
                            }
                        } else {
                            debug!("ACL data arrived before the data channel was installed, dropped");
                        }
                    }
                    other => {
                        warn!("unknown H4 indicator byte 0x{other:02x}, closing transport");
                        break;
                    }
                }
            }
            transport.shutdown();
        });

        let timeout_transport = transport.clone();
        transport.command_channel.set_timeout_callback(move || {
            timeout_transport.shutdown();
        });

        transport
    }

    pub fn command_channel(&self) -> &CommandChannel {
        &self.command_channel
    }

    /// Installs the ACL data channel once `Read Buffer Size` (and, for a
    /// dual-mode controller, `LE Read Buffer Size`) have completed (§4.4,
    /// §10). Installing twice replaces the previous channel.
    pub fn install_acl_channel(&self, writer: impl AsyncWrite + Unpin + Send + 'static, bredr: DataBufferInfo, le: DataBufferInfo) {
        let channel = AclDataChannel::new(writer, bredr, le);
        *self.acl_channel.lock().unwrap() = Some(channel);
    }

    pub fn acl_channel(&self) -> Option<AclDataChannel> {
        self.acl_channel.lock().unwrap().clone()
    }

    /// Bootstraps ACL credit accounting by issuing `Read Buffer Size` and, if
    /// the controller answers with a non-empty LE buffer, `LE Read Buffer
    /// Size`, then installs the ACL channel with the results (§10). A
    /// zero-length LE buffer means the controller has no separate LE pool;
    /// LE links then share the BR/EDR pool, per §4.4.
    pub async fn initialize_acl_data_channel(&self, writer: impl AsyncWrite + Unpin + Send + 'static) -> Result<()> {
        let bredr = {
            let packet = CommandPacket::new(OpCode::new(OGF_INFORMATIONAL, OCF_READ_BUFFER_SIZE), 0)?;
            let (_id, fut) = self.command_channel.send(packet, EventCode::CommandComplete);
            let event = fut.await?;
            let p = event.parameters();
            // [num_hci_command_packets(1)][opcode(2)][status(1)
            // acl_data_length(2) sco_data_length(1) num_acl(2) num_sco(2)]
            if p.len() < 9 {
                return Err(HciError::PacketMalformed);
            }
            let max_data_length = u16::from_le_bytes([p[4], p[5]]);
            let max_num_packets = u16::from_le_bytes([p[7], p[8]]);
            DataBufferInfo {
                max_data_length,
                max_num_packets,
            }
        };

        let le = {
            let packet = CommandPacket::new(OpCode::new(OGF_LE, OCF_LE_READ_BUFFER_SIZE), 0)?;
            let (_id, fut) = self.command_channel.send(packet, EventCode::CommandComplete);
            let event = fut.await?;
            let p = event.parameters();
            // [num_hci_command_packets(1)][opcode(2)][status(1)
            // le_acl_data_length(2) num_le_acl(1)]
            if p.len() < 7 {
                return Err(HciError::PacketMalformed);
            }
            let max_data_length = u16::from_le_bytes([p[4], p[5]]);
            let max_num_packets = p[6] as u16;
            if max_num_packets == 0 {
                DataBufferInfo::EMPTY
            } else {
                DataBufferInfo {
                    max_data_length,
                    max_num_packets,
                }
            }
        };

        self.install_acl_channel(writer, bredr, le);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers the single callback invoked once, the first time the
    /// transport closes for any reason -- peer-closed, a command timeout, or
    /// an explicit `shutdown()` (§4.2).
    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, f: F) {
        *self.on_closed.lock().unwrap() = Some(Box::new(f));
    }

    /// Idempotent: only the first call has any effect (§4.2).
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cb) = self.on_closed.lock().unwrap().take() {
            cb();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn closes_when_controller_channel_is_dropped() {
        let (controller_in, mut controller_in_writer) = duplex(256);
        let (command_out, _command_out_reader) = duplex(256);
        let transport = Transport::new(controller_in, command_out, HciConfig::default());

        let (flag_tx, flag_rx) = tokio::sync::oneshot::channel();
        transport.on_closed(move || {
            let _ = flag_tx.send(());
        });

        controller_in_writer.shutdown().await.unwrap();
        drop(controller_in_writer);

        timeout(Duration::from_millis(200), flag_rx).await.unwrap().unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn initializes_acl_channel_from_buffer_size_replies() {
        let (controller_in, _controller_in_writer) = duplex(256);
        let (command_out, mut command_out_reader) = duplex(256);
        let (acl_out, _acl_out_reader) = duplex(256);
        let transport = Transport::new(controller_in, command_out, HciConfig::default());

        let responder = tokio::spawn({
            let channel = transport.command_channel().clone();
            async move {
                for _ in 0..2 {
                    let mut header = [0u8; 3];
                    AsyncReadExt::read_exact(&mut command_out_reader, &mut header).await.unwrap();
                    let len = header[2] as usize;
                    let mut payload = vec![0u8; len];
                    if len > 0 {
                        AsyncReadExt::read_exact(&mut command_out_reader, &mut payload).await.unwrap();
                    }
                    let op = [header[0], header[1]];
                    if op == OpCode::new(OGF_INFORMATIONAL, OCF_READ_BUFFER_SIZE).0.to_le_bytes() {
                        channel.handle_event(
                            crate::packet::EventPacket::parse(&[0x0e, 11, 1, op[0], op[1], 0x00, 0xfb, 0x00, 0x01, 0x14, 0x00, 0x0a, 0x00]).unwrap(),
                        );
                    } else {
                        channel.handle_event(crate::packet::EventPacket::parse(&[0x0e, 7, 1, op[0], op[1], 0x00, 0x1b, 0x00, 0x04]).unwrap());
                    }
                }
            }
        });

        transport.initialize_acl_data_channel(acl_out).await.unwrap();
        responder.await.unwrap();
        assert!(transport.acl_channel().is_some());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (controller_in, _w) = duplex(256);
        let (command_out, _r) = duplex(256);
        let transport = Transport::new(controller_in, command_out, HciConfig::default());
        transport.shutdown();
        transport.shutdown();
        assert!(transport.is_closed());
    }
}
