//! The command/event flow-control engine (§4.3): serializes outbound commands,
//! matches them to their completion events, and dispatches asynchronous events
//! to registered handlers.
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{HciError, Result, Status};
use crate::opcode::OpCode;
use crate::packet::{CommandPacket, EventCode, EventPacket, LeSubeventCode};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

/// Returned by a registered event handler to indicate whether it should keep
/// receiving future dispatches of the same code (§4.3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    Continue,
    RemoveMe,
}

type EventHandler = Box<dyn FnMut(&EventPacket) -> HandlerAction + Send + 'static>;

enum TxStatus {
    Queued(CommandPacket),
    AwaitingStatus,
    AwaitingComplete,
}

struct Transaction {
    id: TransactionId,
    opcode: OpCode,
    expected_complete_event: EventCode,
    callback: Option<oneshot::Sender<Result<EventPacket>>>,
    status: TxStatus,
}

struct State {
    queue: VecDeque<Transaction>,
    in_flight: Option<Transaction>,
    awaiting_complete: Vec<Transaction>,
    credits: u8,
    event_handlers: HashMap<u8, Vec<EventHandler>>,
    le_handlers: HashMap<u8, Vec<EventHandler>>,
    timeout_generation: u64,
    closed: bool,
}

impl State {
    fn new() -> Self {
        State {
            queue: VecDeque::new(),
            in_flight: None,
            awaiting_complete: Vec::new(),
            credits: 1,
            event_handlers: HashMap::new(),
            le_handlers: HashMap::new(),
            timeout_generation: 0,
            closed: false,
        }
    }
}

/// Handle to the engine. Cheaply cloned; internally serialized by a mutex so
/// it behaves as the single-threaded cooperative dispatcher the spec
/// describes even when called from multiple tasks (§5).
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicU64,
    timeout: Duration,
    on_timeout: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CommandChannel {
    /// Spawns the background writer task that serializes bytes onto `writer`
    /// and returns the handle upper layers interact with.
    pub fn new<W>(writer: W, timeout: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(bytes) = write_rx.recv().await {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("command channel write error: {e}");
                    break;
                }
            }
        });
        CommandChannel {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
                write_tx,
                next_id: AtomicU64::new(1),
                timeout,
                on_timeout: Mutex::new(None),
            }),
        }
    }

    /// Registers the callback invoked exactly once when the per-command
    /// watchdog fires (§4.3.d); the transport uses this to tear itself down.
    pub fn set_timeout_callback<F: FnOnce() + Send + 'static>(&self, f: F) {
        *self.inner.on_timeout.lock().unwrap() = Some(Box::new(f));
    }

    /// Queues `packet` for transmission. Returns synchronously with a
    /// `TransactionId` and a future that resolves with the matching
    /// completion event (§4.3). Fails synchronously for opcode `0` (already
    /// enforced by `CommandPacket::new`, re-checked here defensively).
    pub fn send(&self, packet: CommandPacket, complete_event: EventCode) -> (TransactionId, CommandFuture) {
        let (tx, rx) = oneshot::channel();
        let id = TransactionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let transaction = Transaction {
            id,
            opcode: packet.opcode(),
            expected_complete_event: complete_event,
            callback: Some(tx),
            status: TxStatus::Queued(packet),
        };
        {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push_back(transaction);
        }
        self.try_dispatch();
        (id, CommandFuture { rx })
    }

    /// LE commands use the same transaction machinery; kept as a separate
    /// entry point to mirror the controller-visible `SendLEAsync` distinction
    /// upper layers rely on (§4.3).
    pub fn send_le_async(&self, packet: CommandPacket, complete_event: EventCode) -> (TransactionId, CommandFuture) {
        self.send(packet, complete_event)
    }

    /// Removes a still-queued command. A command already in flight cannot be
    /// unsent -- its callback still fires with `Canceled` once the controller
    /// replies (§5).
    pub fn cancel(&self, id: TransactionId) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(pos) = state.queue.iter().position(|t| t.id == id) {
            let mut transaction = state.queue.remove(pos).unwrap();
            if let Some(cb) = transaction.callback.take() {
                let _ = cb.send(Err(HciError::Canceled));
            }
        }
    }

    pub fn add_event_handler<F>(&self, code: EventCode, handler: F)
    where
        F: FnMut(&EventPacket) -> HandlerAction + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        state.event_handlers.entry(code.raw()).or_default().push(Box::new(handler));
    }

    pub fn add_le_event_handler<F>(&self, subevent: LeSubeventCode, handler: F)
    where
        F: FnMut(&EventPacket) -> HandlerAction + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        state.le_handlers.entry(subevent.0).or_default().push(Box::new(handler));
    }

    /// Entry point for inbound bytes from the controller's control channel.
    pub fn handle_event_bytes(&self, raw: &[u8]) -> Result<()> {
        let event = EventPacket::parse(raw)?;
        self.handle_event(event);
        Ok(())
    }

    pub fn handle_event(&self, event: EventPacket) {
        match event.code() {
            EventCode::CommandComplete | EventCode::CommandStatus => self.handle_completion(event),
            EventCode::LeMeta => {
                if let Some(sub) = event.le_subevent() {
                    self.dispatch_to(Lookup::Le(sub.0), event);
                }
            }
            other => self.dispatch_to(Lookup::Event(other.raw()), event),
        }
    }

    fn handle_completion(&self, event: EventPacket) {
        let opcode = match event.command_opcode() {
            Some(op) => op,
            None => {
                warn!("malformed completion event, no opcode");
                return;
            }
        };
        let credits = event.command_credits().unwrap_or(0);
        let is_status = event.code() == EventCode::CommandStatus;

        let mut state = self.inner.state.lock().unwrap();
        state.credits = credits;

        let mut finished: Option<Transaction> = None;
        let mut still_in_flight = false;

        if let Some(t) = &state.in_flight {
            if t.opcode == opcode {
                let mut t = state.in_flight.take().unwrap();
                if is_status && t.expected_complete_event != EventCode::CommandStatus {
                    t.status = TxStatus::AwaitingComplete;
                    state.awaiting_complete.push(t);
                    still_in_flight = false;
                } else {
                    finished = Some(t);
                }
            } else {
                still_in_flight = true;
            }
        }

        if finished.is_none() && !still_in_flight {
            if let Some(pos) = state.awaiting_complete.iter().position(|t| t.opcode == opcode) {
                finished = Some(state.awaiting_complete.remove(pos));
            }
        }

        drop(state);

        if let Some(mut transaction) = finished {
            let status = event.to_status();
            if let Some(cb) = transaction.callback.take() {
                match status {
                    Ok(s) if !s.is_success() => {
                        let _ = cb.send(Err(HciError::Protocol(s)));
                    }
                    Ok(_) => {
                        let _ = cb.send(Ok(event));
                    }
                    Err(e) => {
                        let _ = cb.send(Err(e));
                    }
                }
            }
        }

        self.try_dispatch();
    }

    fn dispatch_to(&self, lookup: Lookup, event: EventPacket) {
        let mut handlers = {
            let mut state = self.inner.state.lock().unwrap();
            let map = match lookup {
                Lookup::Event(_) => &mut state.event_handlers,
                Lookup::Le(_) => &mut state.le_handlers,
            };
            let key = match lookup {
                Lookup::Event(c) => c,
                Lookup::Le(c) => c,
            };
            map.remove(&key).unwrap_or_default()
        };

        let mut keep = Vec::with_capacity(handlers.len());
        let mut handled = false;
        for mut handler in handlers.drain(..) {
            handled = true;
            if handler(&event) == HandlerAction::Continue {
                keep.push(handler);
            }
        }
        if !handled {
            trace!(code = ?event.code(), "unhandled event");
        }

        let mut state = self.inner.state.lock().unwrap();
        let map = match lookup {
            Lookup::Event(_) => &mut state.event_handlers,
            Lookup::Le(_) => &mut state.le_handlers,
        };
        let key = match lookup {
            Lookup::Event(c) => c,
            Lookup::Le(c) => c,
        };
        map.entry(key).or_default().splice(0..0, keep);
    }

    /// Issues the next queued command if credit and the single-in-flight
    /// slot both allow it (§4.3 rules a-c).
    fn try_dispatch(&self) {
        let (bytes, generation) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed || state.in_flight.is_some() || state.credits == 0 {
                return;
            }
            let Some(mut transaction) = state.queue.pop_front() else {
                return;
            };
            let packet = match std::mem::replace(&mut transaction.status, TxStatus::AwaitingStatus) {
                TxStatus::Queued(p) => p,
                _ => unreachable!("queued transactions always hold their packet"),
            };
            let bytes = packet.to_wire_bytes();
            state.credits -= 1;
            state.timeout_generation += 1;
            let generation = state.timeout_generation;
            state.in_flight = Some(transaction);
            (bytes, generation)
        };

        if self.inner.write_tx.send(bytes).is_err() {
            warn!("command channel writer task gone");
        }

        let me = self.clone();
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            me.fire_timeout(generation);
        });
    }

    fn fire_timeout(&self, generation: u64) {
        let fired = {
            let mut state = self.inner.state.lock().unwrap();
            if state.timeout_generation == generation && state.in_flight.is_some() {
                state.closed = true;
                state.in_flight.take()
            } else {
                None
            }
        };
        if let Some(mut transaction) = fired {
            debug!(opcode = %transaction.opcode, "command timed out");
            if let Some(cb) = transaction.callback.take() {
                let _ = cb.send(Err(HciError::Timeout));
            }
            if let Some(cb) = self.inner.on_timeout.lock().unwrap().take() {
                cb();
            }
        }
    }
}

enum Lookup {
    Event(u8),
    Le(u8),
}

pub struct CommandFuture {
    rx: oneshot::Receiver<Result<EventPacket>>,
}

impl Future for CommandFuture {
    type Output = Result<EventPacket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(HciError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;
    use tokio::io::duplex;

    fn status_event(opcode: OpCode, credits: u8, status: u8) -> Vec<u8> {
        let op = opcode.0.to_le_bytes();
        vec![0x0f, 4, status, credits, op[0], op[1]]
    }

    fn complete_event(opcode: OpCode, credits: u8, status: u8) -> Vec<u8> {
        let op = opcode.0.to_le_bytes();
        vec![0x0e, 4, credits, op[0], op[1], status]
    }

    #[tokio::test]
    async fn enforces_single_in_flight_and_credit() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, Duration::from_secs(5));

        let op_a = OpCode::new(0x03, 0x0001);
        let op_b = OpCode::new(0x03, 0x0002);
        let pkt_a = CommandPacket::new(op_a, 0).unwrap();
        let pkt_b = CommandPacket::new(op_b, 0).unwrap();

        let (_id_a, _fut_a) = channel.send(pkt_a, EventCode::CommandComplete);
        let (_id_b, _fut_b) = channel.send(pkt_b, EventCode::CommandComplete);

        // Only A's bytes should be on the wire so far.
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
        assert_eq!(OpCode(u16::from_le_bytes([buf[0], buf[1]])), op_a);

        // Controller grants credit back via CommandStatus for A.
        channel.handle_event(EventPacket::parse(&status_event(op_a, 1, 0)).unwrap());

        // Now B should go out.
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
        assert_eq!(OpCode(u16::from_le_bytes([buf[0], buf[1]])), op_b);
    }

    #[tokio::test]
    async fn completion_event_resolves_future() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, Duration::from_secs(5));
        let op = OpCode::new(0x03, 0x0003);
        let pkt = CommandPacket::new(op, 0).unwrap();
        let (_id, fut) = channel.send(pkt, EventCode::CommandComplete);

        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();

        channel.handle_event(EventPacket::parse(&complete_event(op, 1, 0)).unwrap());
        let result = fut.await.unwrap();
        assert_eq!(result.to_status().unwrap(), Status::SUCCESS);
    }

    #[tokio::test]
    async fn cancel_queued_command_yields_canceled() {
        let (writer, _reader) = duplex(4096);
        let channel = CommandChannel::new(writer, Duration::from_secs(5));
        let op_a = OpCode::new(0x03, 0x0001);
        let op_b = OpCode::new(0x03, 0x0002);
        let pkt_a = CommandPacket::new(op_a, 0).unwrap();
        let pkt_b = CommandPacket::new(op_b, 0).unwrap();
        let (_id_a, _fut_a) = channel.send(pkt_a, EventCode::CommandComplete);
        let (id_b, fut_b) = channel.send(pkt_b, EventCode::CommandComplete);
        channel.cancel(id_b);
        assert!(matches!(fut_b.await, Err(HciError::Canceled)));
    }

    #[tokio::test]
    async fn timeout_fires_and_is_fatal() {
        let (writer, _reader) = duplex(4096);
        let channel = CommandChannel::new(writer, Duration::from_millis(20));
        let (flag_tx, flag_rx) = oneshot::channel();
        channel.set_timeout_callback(move || {
            let _ = flag_tx.send(());
        });
        let op = OpCode::new(0x03, 0x0004);
        let pkt = CommandPacket::new(op, 0).unwrap();
        let (_id, fut) = channel.send(pkt, EventCode::CommandComplete);
        assert!(matches!(fut.await, Err(HciError::Timeout)));
        flag_rx.await.unwrap();
    }
}
