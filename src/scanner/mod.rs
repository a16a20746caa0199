//! LE scan state machine: `Idle -> Initiating -> {Passive, Active} ->
//! Stopping -> Idle`, with scan-response pairing for active scans (§4.10)
//! and an optional one-shot scan period (§4.8).
pub mod report_parser;

pub use report_parser::{AdvertisingReport, AdvertisingReportParser};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::address::DeviceAddress;
use crate::command_channel::CommandChannel;
use crate::error::{HciError, Result};
use crate::opcode::OpCode;
use crate::packet::CommandPacket;
use crate::packet::EventCode;

pub const DEFAULT_SCAN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const OGF_LE: u8 = 0x08;
const OCF_SET_SCAN_PARAMS: u16 = 0x000b;
const OCF_SET_SCAN_ENABLE: u16 = 0x000c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Initiating,
    Passive,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Passive,
    Active,
}

/// LE advertising event-type byte (Core spec "LE Advertising Report" event),
/// narrowed to the distinction the scanner itself must act on (§4.8):
/// directed reports are routed separately and never wait for a scan
/// response, since a directed advertisement is never scannable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingEventKind {
    /// `ADV_IND` / `ADV_SCAN_IND` -- may be followed by a scan response.
    Scannable,
    /// `ADV_DIRECT_IND` -- targeted at a specific peer.
    Directed,
    /// `ADV_NONCONN_IND` and anything else not recognized above.
    Plain,
}

impl AdvertisingEventKind {
    pub fn from_raw(event_type: u8) -> Self {
        match event_type {
            0x00 | 0x02 => AdvertisingEventKind::Scannable,
            0x01 => AdvertisingEventKind::Directed,
            _ => AdvertisingEventKind::Plain,
        }
    }
}

/// A discovered advertisement not yet paired with its scan response (or
/// confirmed to have none); accumulates until the response arrives or the
/// per-entry timeout expires (§4.10).
struct PendingResult {
    data: Vec<u8>,
    rssi: i8,
    first_seen: Instant,
}

struct ScannerState {
    scan_state: ScanState,
    scan_type: Option<ScanType>,
    pending: HashMap<DeviceAddress, PendingResult>,
    period_generation: u64,
}

struct Inner {
    channel: CommandChannel,
    state: Mutex<ScannerState>,
    scan_response_timeout: Duration,
    on_scan_complete: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Handle to the scanner. Cheaply cloned; internal state is serialized by a
/// mutex so the period timer can mutate it from a spawned task the same way
/// `CommandChannel`'s command watchdog does (§4.8).
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<Inner>,
}

/// One assembled scan result, either standalone or merged with its scan
/// response (§4.10).
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub address: DeviceAddress,
    pub data: Vec<u8>,
    pub rssi: i8,
}

/// Routed outcome of an inbound advertising report: directed reports are
/// split out from the regular discovery stream so callers can dispatch them
/// to a distinct handler (§4.8).
#[derive(Debug, Clone)]
pub enum ScanEvent {
    PeerFound(ScanResult),
    DirectedAdvertisement(ScanResult),
}

impl Scanner {
    pub fn new(channel: CommandChannel) -> Self {
        Scanner {
            inner: Arc::new(Inner {
                channel,
                state: Mutex::new(ScannerState {
                    scan_state: ScanState::Idle,
                    scan_type: None,
                    pending: HashMap::new(),
                    period_generation: 0,
                }),
                scan_response_timeout: DEFAULT_SCAN_RESPONSE_TIMEOUT,
                on_scan_complete: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.inner.state.lock().unwrap().scan_state
    }

    /// Overrides the default scan-response timeout (§10 `HciConfig`). Must be
    /// called before the handle is cloned/shared.
    pub fn with_scan_response_timeout(mut self, timeout: Duration) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("scanner already shared")
            .scan_response_timeout = timeout;
        self
    }

    /// Registers the callback invoked exactly once when a scan finishes,
    /// whether by an explicit `stop_scan` or by the period timer elapsing
    /// (§4.8).
    pub fn set_scan_complete_callback<F: FnOnce() + Send + 'static>(&self, f: F) {
        *self.inner.on_scan_complete.lock().unwrap() = Some(Box::new(f));
    }

    async fn run(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut packet = CommandPacket::new(opcode, payload.len())?;
        packet.payload_mut().copy_from_slice(payload);
        let (_id, fut) = self.inner.channel.send(packet, EventCode::CommandComplete);
        fut.await?;
        Ok(())
    }

    /// `Idle -> Initiating -> {Passive, Active}` (§4.10). Rejected unless the
    /// scanner is currently idle. When `period` is non-zero, arms a one-shot
    /// timer that stops the scan and fires the scan-complete callback once
    /// it elapses (§4.8).
    pub async fn start_scan(&self, scan_type: ScanType, interval: u16, window: u16, period: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.scan_state != ScanState::Idle {
                return Err(HciError::invalid("scan already in progress"));
            }
            state.scan_state = ScanState::Initiating;
        }

        let active = matches!(scan_type, ScanType::Active);
        let mut params = vec![0u8; 7];
        params[0] = active as u8;
        params[1..3].copy_from_slice(&interval.to_le_bytes());
        params[3..5].copy_from_slice(&window.to_le_bytes());
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_SCAN_PARAMS), &params).await {
            self.inner.state.lock().unwrap().scan_state = ScanState::Idle;
            return Err(e);
        }
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_SCAN_ENABLE), &[0x01, 0x00]).await {
            self.inner.state.lock().unwrap().scan_state = ScanState::Idle;
            return Err(e);
        }

        let generation = {
            let mut state = self.inner.state.lock().unwrap();
            state.scan_type = Some(scan_type);
            state.scan_state = match scan_type {
                ScanType::Passive => ScanState::Passive,
                ScanType::Active => ScanState::Active,
            };
            state.period_generation += 1;
            state.period_generation
        };

        if !period.is_zero() {
            let scanner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(period).await;
                scanner.fire_period_timeout(generation).await;
            });
        }
        Ok(())
    }

    /// `{Passive, Active} -> Stopping -> Idle` (§4.10). Idempotent: stopping
    /// an already-idle scanner is a no-op, since the period timer may have
    /// already run this same completion path (§4.8).
    pub async fn stop_scan(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.scan_state {
                ScanState::Idle => return Ok(()),
                ScanState::Passive | ScanState::Active => {
                    state.scan_state = ScanState::Stopping;
                    state.period_generation += 1;
                }
                _ => return Err(HciError::invalid("scan already stopping")),
            }
        }
        self.run(OpCode::new(OGF_LE, OCF_SET_SCAN_ENABLE), &[0x00, 0x00]).await?;
        self.finish_stop();
        Ok(())
    }

    /// Fires once, iff no newer `start_scan`/`stop_scan` call has advanced
    /// `period_generation` since this timer was armed (§4.8).
    async fn fire_period_timeout(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.period_generation != generation || !matches!(state.scan_state, ScanState::Passive | ScanState::Active) {
                return;
            }
            state.scan_state = ScanState::Stopping;
        }
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_SCAN_ENABLE), &[0x00, 0x00]).await {
            warn!("failed to disable scan on period timeout: {e}");
        }
        self.finish_stop();
    }

    fn finish_stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.clear();
            state.scan_type = None;
            state.scan_state = ScanState::Idle;
        }
        if let Some(cb) = self.inner.on_scan_complete.lock().unwrap().take() {
            cb();
        }
    }

    /// Feeds one advertising report in. Directed reports are routed
    /// immediately and never wait for a scan response. Passive scans (and
    /// any other non-scannable report) resolve immediately; active scans
    /// hold scannable reports until their scan response arrives or
    /// `reap_expired` times them out (§4.10, §4.8).
    pub fn on_advertising_report(&self, address: DeviceAddress, event_type: AdvertisingEventKind, data: &[u8], rssi: i8) -> Option<ScanEvent> {
        if event_type == AdvertisingEventKind::Directed {
            return Some(ScanEvent::DirectedAdvertisement(ScanResult {
                address,
                data: data.to_vec(),
                rssi,
            }));
        }

        let mut state = self.inner.state.lock().unwrap();
        let wait_for_response = state.scan_type == Some(ScanType::Active) && event_type == AdvertisingEventKind::Scannable;
        if wait_for_response {
            state.pending.insert(
                address,
                PendingResult {
                    data: data.to_vec(),
                    rssi,
                    first_seen: Instant::now(),
                },
            );
            None
        } else {
            Some(ScanEvent::PeerFound(ScanResult {
                address,
                data: data.to_vec(),
                rssi,
            }))
        }
    }

    /// Merges a scan-response report with its pending advertisement, if any
    /// is still outstanding (§4.10).
    pub fn on_scan_response(&self, address: DeviceAddress, data: &[u8]) -> Option<ScanResult> {
        let mut state = self.inner.state.lock().unwrap();
        let pending = state.pending.remove(&address)?;
        let mut merged = pending.data;
        merged.extend_from_slice(data);
        Some(ScanResult {
            address,
            data: merged,
            rssi: pending.rssi,
        })
    }

    /// Flushes any pending advertisement older than the scan-response
    /// timeout, returning it as a standalone result (the response never
    /// came) (§4.10).
    pub fn reap_expired(&self) -> Vec<ScanResult> {
        let timeout = self.inner.scan_response_timeout;
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap();
        let expired: Vec<DeviceAddress> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.first_seen) >= timeout)
            .map(|(addr, _)| *addr)
            .collect();
        expired
            .into_iter()
            .filter_map(|addr| {
                state.pending.remove(&addr).map(|p| ScanResult {
                    address: addr,
                    data: p.data,
                    rssi: p.rssi,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;
    use tokio::io::duplex;

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new(AddressType::LeRandom, [0, 0, 0, 0, 0, last])
    }

    async fn respond_ok_n_times(reader: &mut tokio::io::DuplexStream, channel: &CommandChannel, n: usize) {
        for _ in 0..n {
            let mut header = [0u8; 3];
            tokio::io::AsyncReadExt::read_exact(reader, &mut header).await.unwrap();
            let len = header[2] as usize;
            let mut payload = vec![0u8; len];
            if len > 0 {
                tokio::io::AsyncReadExt::read_exact(reader, &mut payload).await.unwrap();
            }
            let op = [header[0], header[1]];
            channel.handle_event(crate::packet::EventPacket::parse(&[0x0e, 4, 1, op[0], op[1], 0x00]).unwrap());
        }
    }

    #[tokio::test]
    async fn active_scan_pairs_report_with_response() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, StdDuration::from_secs(5));
        let scanner = Scanner::new(channel.clone());

        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 2).await;
                reader_task
            }
        });
        scanner.start_scan(ScanType::Active, 0x10, 0x10, Duration::ZERO).await.unwrap();
        reader = run.await.unwrap();
        let _ = reader;
        assert_eq!(scanner.state(), ScanState::Active);

        assert!(scanner
            .on_advertising_report(addr(1), AdvertisingEventKind::Scannable, b"adv", -50)
            .is_none());
        let result = scanner.on_scan_response(addr(1), b"scan").unwrap();
        assert_eq!(result.data, b"advscan");
    }

    #[tokio::test]
    async fn passive_scan_never_waits_for_response() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, StdDuration::from_secs(5));
        let scanner = Scanner::new(channel.clone());
        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 2).await;
                reader_task
            }
        });
        scanner.start_scan(ScanType::Passive, 0x10, 0x10, Duration::ZERO).await.unwrap();
        reader = run.await.unwrap();
        let _ = reader;

        let result = scanner.on_advertising_report(addr(2), AdvertisingEventKind::Scannable, b"adv", -60);
        assert!(matches!(result, Some(ScanEvent::PeerFound(_))));
    }

    #[tokio::test]
    async fn directed_reports_bypass_scan_response_pairing() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, StdDuration::from_secs(5));
        let scanner = Scanner::new(channel.clone());
        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 2).await;
                reader_task
            }
        });
        scanner.start_scan(ScanType::Active, 0x10, 0x10, Duration::ZERO).await.unwrap();
        reader = run.await.unwrap();
        let _ = reader;

        let result = scanner.on_advertising_report(addr(4), AdvertisingEventKind::Directed, b"dir", -55);
        assert!(matches!(result, Some(ScanEvent::DirectedAdvertisement(_))));
        assert!(scanner.on_scan_response(addr(4), b"scan").is_none());
    }

    #[tokio::test]
    async fn reap_expired_times_out_unanswered_reports() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, StdDuration::from_secs(5));
        let scanner = Scanner::new(channel.clone()).with_scan_response_timeout(Duration::from_millis(10));
        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 2).await;
                reader_task
            }
        });
        scanner.start_scan(ScanType::Active, 0x10, 0x10, Duration::ZERO).await.unwrap();
        reader = run.await.unwrap();
        let _ = reader;

        scanner.on_advertising_report(addr(3), AdvertisingEventKind::Scannable, b"adv", -70);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = scanner.reap_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].address, addr(3));
    }

    #[tokio::test]
    async fn period_elapsing_stops_the_scan_and_fires_completion() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, StdDuration::from_secs(5));
        let scanner = Scanner::new(channel.clone());

        let completed = Arc::new(AtomicBool::new(false));
        scanner.set_scan_complete_callback({
            let completed = completed.clone();
            move || completed.store(true, Ordering::SeqCst)
        });

        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                // scan params + scan enable(on) + scan enable(off, from the period timer)
                respond_ok_n_times(&mut reader_task, &channel, 3).await;
                reader_task
            }
        });
        scanner.start_scan(ScanType::Passive, 0x10, 0x10, Duration::from_millis(10)).await.unwrap();
        reader = run.await.unwrap();
        let _ = reader;

        // give the spawned one-shot timer a chance to fire and drive the
        // disable command through the duplex pair above.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scanner.state(), ScanState::Idle);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_scan_is_idempotent() {
        let (writer, _reader) = duplex(4096);
        let channel = CommandChannel::new(writer, StdDuration::from_secs(5));
        let scanner = Scanner::new(channel);
        assert_eq!(scanner.state(), ScanState::Idle);
        scanner.stop_scan().await.unwrap();
        assert_eq!(scanner.state(), ScanState::Idle);
    }
}
