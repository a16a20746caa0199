//! Per-link-type credit pools, outbound fragmentation and inbound
//! reassembly for the ACL data channel (§4.4).
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{HciError, Result};
use crate::handle::{ConnectionHandle, LinkType};
use crate::packet::{AclPacket, BroadcastFlag, PacketBoundaryFlag};

/// `Read Buffer Size` / `LE Read Buffer Size` controller capabilities, used
/// to size the credit pools before the channel accepts any link (§4.4, §10).
#[derive(Debug, Clone, Copy)]
pub struct DataBufferInfo {
    pub max_data_length: u16,
    pub max_num_packets: u16,
}

impl DataBufferInfo {
    pub const EMPTY: DataBufferInfo = DataBufferInfo {
        max_data_length: 0,
        max_num_packets: 0,
    };

    fn is_empty(self) -> bool {
        self.max_num_packets == 0
    }
}

struct CreditPool {
    buffer_size: u16,
    total: u16,
    available: u16,
}

impl CreditPool {
    fn new(info: DataBufferInfo) -> Self {
        CreditPool {
            buffer_size: info.max_data_length,
            total: info.max_num_packets,
            available: info.max_num_packets,
        }
    }

    fn consume_one(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    fn restore(&mut self, n: u16) {
        self.available = self.available.saturating_add(n).min(self.total);
    }
}

enum Reassembly {
    Idle,
    InProgress { buffer: Vec<u8>, expected_len: usize },
}

struct LinkState {
    link_type: LinkType,
    outbound: VecDeque<Vec<u8>>,
    reassembly: Reassembly,
}

struct State {
    bredr_pool: CreditPool,
    le_pool: Option<CreditPool>,
    links: HashMap<ConnectionHandle, LinkState>,
    order: VecDeque<ConnectionHandle>,
    reassembly_error_count: u64,
}

impl State {
    fn pool_for(&mut self, link_type: LinkType) -> &mut CreditPool {
        match (link_type, &mut self.le_pool) {
            (LinkType::LowEnergy, Some(pool)) => pool,
            _ => &mut self.bredr_pool,
        }
    }
}

type InboundHandler = Box<dyn Fn(ConnectionHandle, Vec<u8>) + Send + Sync>;
type LinkErrorHandler = Box<dyn Fn(ConnectionHandle) + Send + Sync>;

/// Handle to the data channel. Cheaply cloned; state lives behind a mutex so
/// outbound queuing, inbound reassembly and credit updates all serialize
/// through the same single-threaded view the spec describes (§5).
#[derive(Clone)]
pub struct AclDataChannel {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    on_inbound: Mutex<Option<InboundHandler>>,
    on_link_error: Mutex<Option<LinkErrorHandler>>,
}

impl AclDataChannel {
    /// `le_info` with `max_num_packets == 0` means "LE shares the BR/EDR
    /// pool", matching the controller capability report (§4.4).
    pub fn new<W>(writer: W, bredr_info: DataBufferInfo, le_info: DataBufferInfo) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(bytes) = write_rx.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("acl data channel write error: {e}");
                    break;
                }
            }
        });
        let le_pool = if le_info.is_empty() { None } else { Some(CreditPool::new(le_info)) };
        AclDataChannel {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    bredr_pool: CreditPool::new(bredr_info),
                    le_pool,
                    links: HashMap::new(),
                    order: VecDeque::new(),
                    reassembly_error_count: 0,
                }),
                write_tx,
                on_inbound: Mutex::new(None),
                on_link_error: Mutex::new(None),
            }),
        }
    }

    pub fn set_inbound_handler<F>(&self, f: F)
    where
        F: Fn(ConnectionHandle, Vec<u8>) + Send + Sync + 'static,
    {
        *self.inner.on_inbound.lock().unwrap() = Some(Box::new(f));
    }

    /// Invoked when reassembly observes a protocol violation on a link (a
    /// stray continuation, or a PDU that overruns its declared length); the
    /// link is expected to be disconnected in response (§4.4).
    pub fn set_link_error_handler<F>(&self, f: F)
    where
        F: Fn(ConnectionHandle) + Send + Sync + 'static,
    {
        *self.inner.on_link_error.lock().unwrap() = Some(Box::new(f));
    }

    pub fn reassembly_error_count(&self) -> u64 {
        self.inner.state.lock().unwrap().reassembly_error_count
    }

    /// SCO links do not flow over the ACL data channel (§4.4).
    pub fn register_link(&self, handle: ConnectionHandle, link_type: LinkType) -> Result<()> {
        if link_type == LinkType::Sco {
            return Err(HciError::invalid("SCO connections do not use the ACL data channel"));
        }
        let mut state = self.inner.state.lock().unwrap();
        state.links.entry(handle).or_insert_with(|| LinkState {
            link_type,
            outbound: VecDeque::new(),
            reassembly: Reassembly::Idle,
        });
        if !state.order.contains(&handle) {
            state.order.push_back(handle);
        }
        Ok(())
    }

    pub fn unregister_link(&self, handle: ConnectionHandle) {
        let mut state = self.inner.state.lock().unwrap();
        state.links.remove(&handle);
        state.order.retain(|h| *h != handle);
    }

    /// Enqueues `payload` as a single ACL frame for round-robin transmission
    /// (§4.4). Rejects with `InvalidParameters` if `payload` exceeds the
    /// link's `max_data_length` -- the data channel does not fragment;
    /// fragmenting to MTU is the upper layer's job. Rejects with `NotReady`
    /// when the channel has not yet learned a buffer size for this link's
    /// type.
    pub fn queue_outbound(&self, handle: ConnectionHandle, payload: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let link_type = state
            .links
            .get(&handle)
            .map(|l| l.link_type)
            .ok_or_else(|| HciError::invalid("unregistered connection handle"))?;
        let buffer_size = state.pool_for(link_type).buffer_size as usize;
        if buffer_size == 0 {
            return Err(HciError::NotReady);
        }
        if payload.len() > buffer_size {
            return Err(HciError::invalid("ACL payload exceeds max_data_length"));
        }

        let frame = AclPacket::new(handle, PacketBoundaryFlag::FirstFlushable, BroadcastFlag::PointToPoint, payload).to_wire_bytes();
        let link = state.links.get_mut(&handle).unwrap();
        link.outbound.push_back(frame);
        drop(state);
        self.try_send_more();
        Ok(())
    }

    /// Restores controller credit after a `Number Of Completed Packets`
    /// event and drains whatever can now go out (§4.4).
    pub fn handle_number_of_completed_packets(&self, handle: ConnectionHandle, count: u16) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(link_type) = state.links.get(&handle).map(|l| l.link_type) {
                state.pool_for(link_type).restore(count);
            }
        }
        self.try_send_more();
    }

    /// Feeds one inbound ACL frame through reassembly. Returns an error only
    /// for a frame that fails basic wire validation; reassembly-level
    /// protocol violations are reported via the link-error handler instead,
    /// matching the drop-and-close policy of §4.4.
    pub fn handle_inbound_bytes(&self, raw: &[u8]) -> Result<()> {
        let packet = AclPacket::parse(raw)?;
        self.handle_inbound(packet);
        Ok(())
    }

    fn handle_inbound(&self, packet: AclPacket) {
        let handle = packet.connection_handle();
        let pb = packet.packet_boundary_flag();

        let outcome = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(link) = state.links.get_mut(&handle) else {
                trace!(%handle, "inbound ACL data for unregistered link, dropped");
                return;
            };
            reassemble(link, pb, packet.payload())
        };

        match outcome {
            ReassemblyOutcome::Complete(pdu) => {
                if let Some(f) = self.inner.on_inbound.lock().unwrap().as_ref() {
                    f(handle, pdu);
                }
            }
            ReassemblyOutcome::Pending => {}
            ReassemblyOutcome::Error => {
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.reassembly_error_count += 1;
                }
                if let Some(f) = self.inner.on_link_error.lock().unwrap().as_ref() {
                    f(handle);
                }
            }
        }
    }

    /// One fairness sweep per registered link with pending data and credit,
    /// repeated until no link can make further progress (§4.4).
    fn try_send_more(&self) {
        loop {
            let frame = {
                let mut state = self.inner.state.lock().unwrap();
                let mut sent = None;
                for _ in 0..state.order.len() {
                    let Some(handle) = state.order.pop_front() else { break };
                    state.order.push_back(handle);
                    let link_type = state.links.get(&handle).map(|l| l.link_type);
                    let Some(link_type) = link_type else { continue };
                    let has_pending = state.links.get(&handle).map(|l| !l.outbound.is_empty()).unwrap_or(false);
                    if !has_pending {
                        continue;
                    }
                    if !state.pool_for(link_type).consume_one() {
                        continue;
                    }
                    let bytes = state.links.get_mut(&handle).unwrap().outbound.pop_front();
                    if let Some(bytes) = bytes {
                        sent = Some(bytes);
                        break;
                    }
                }
                sent
            };
            match frame {
                Some(bytes) => {
                    if self.inner.write_tx.send(bytes).is_err() {
                        warn!("acl data channel writer task gone");
                        return;
                    }
                }
                None => return,
            }
        }
    }
}

enum ReassemblyOutcome {
    Complete(Vec<u8>),
    Pending,
    Error,
}

fn reassemble(link: &mut LinkState, pb: PacketBoundaryFlag, payload: &[u8]) -> ReassemblyOutcome {
    if pb == PacketBoundaryFlag::Complete {
        if matches!(link.reassembly, Reassembly::InProgress { .. }) {
            link.reassembly = Reassembly::Idle;
            return ReassemblyOutcome::Error;
        }
        return ReassemblyOutcome::Complete(payload.to_vec());
    }

    if pb.is_first() {
        if matches!(link.reassembly, Reassembly::InProgress { .. }) {
            link.reassembly = Reassembly::Idle;
            return ReassemblyOutcome::Error;
        }
        if payload.len() < 2 {
            return ReassemblyOutcome::Error;
        }
        let l2cap_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let expected_len = l2cap_len + 4; // L2CAP header: length(2) + channel id(2)
        let buffer = payload.to_vec();
        if buffer.len() >= expected_len {
            link.reassembly = Reassembly::Idle;
            return ReassemblyOutcome::Complete(buffer);
        }
        link.reassembly = Reassembly::InProgress { buffer, expected_len };
        return ReassemblyOutcome::Pending;
    }

    // Continuing fragment.
    match &mut link.reassembly {
        Reassembly::Idle => ReassemblyOutcome::Error,
        Reassembly::InProgress { buffer, expected_len } => {
            buffer.extend_from_slice(payload);
            if buffer.len() > *expected_len {
                link.reassembly = Reassembly::Idle;
                ReassemblyOutcome::Error
            } else if buffer.len() == *expected_len {
                let buffer = std::mem::take(buffer);
                link.reassembly = Reassembly::Idle;
                ReassemblyOutcome::Complete(buffer)
            } else {
                ReassemblyOutcome::Pending
            }
        }
    }
}
