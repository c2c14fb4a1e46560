//! The communication worker: sole owner of the serial link.
//!
//! Per iteration the worker drains a bounded number of outbound commands,
//! reads whatever bytes the link has, decodes a bounded number of frames,
//! dispatches them to the addressed modules, and clones every message in
//! both directions into the event log with a run-relative microsecond
//! timestamp. Transient frame errors are counted and survived; storms and
//! serial I/O failures are fatal and latch the controller into `Faulted`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};
use eventlog::{LogHandle, LogPackage};
use modules::{Module, ModuleEvent};
use timekit::MicrosTimer;
use wire::{encode_frame, FrameReader, Message, WireError, HOST_NOTE};

use crate::link::SerialLink;
use crate::routing::RoutingTable;
use crate::{ControllerConfig, ControllerError, ControllerResult, ControllerState};

/// Host-note kinds recorded under [`HOST_NOTE`] in the controller's log
/// stream.
pub const NOTE_FRAME_ERROR: u8 = 1;
pub const NOTE_MODULE_ERROR: u8 = 2;
pub const NOTE_LINK_DEGRADED: u8 = 3;
pub const NOTE_DROPPED_COMMANDS: u8 = 4;

/// Consecutive-error window that triggers the link-degraded warning.
const DEGRADED_COUNT: usize = 3;
const DEGRADED_WINDOW: Duration = Duration::from_millis(100);
/// Consecutive-error window that is fatal to the worker.
const FATAL_COUNT: usize = 20;
const FATAL_WINDOW: Duration = Duration::from_secs(1);

/// Link counters published after every worker iteration that changes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    pub frames_decoded: u64,
    pub frames_sent: u64,
    pub frame_errors: u64,
    pub dropped_commands: u64,
    pub unknown_routing_keys: u64,
}

pub(crate) struct WorkerContext {
    pub config: ControllerConfig,
    pub link: Box<dyn SerialLink>,
    pub modules: Vec<Module>,
    pub routing: RoutingTable,
    pub commands: Receiver<Message>,
    pub logger: LogHandle,
    pub cancel: Arc<AtomicBool>,
    pub state: Arc<AtomicU8>,
    pub stats: Arc<ArcSwap<LinkStats>>,
    pub ready: Sender<ControllerResult<()>>,
}

pub(crate) struct WorkerOutcome {
    pub modules: Vec<Module>,
    pub result: ControllerResult<()>,
}

pub(crate) fn run(ctx: WorkerContext) -> WorkerOutcome {
    let WorkerContext {
        config,
        mut link,
        mut modules,
        routing,
        commands,
        logger,
        cancel,
        state,
        stats,
        ready,
    } = ctx;

    let mut worker = Worker {
        config,
        link: &mut *link,
        routing,
        logger,
        timer: MicrosTimer::start(),
        reader: FrameReader::new(),
        stats: LinkStats::default(),
        stats_out: stats,
        storm: ErrorStorm::default(),
        unknown_keys: HashSet::new(),
    };

    // Startup: onset stamp, identify handshake, output lock, module assets.
    let startup = worker.startup(&mut modules);
    if let Err(err) = startup {
        state.store(ControllerState::Faulted as u8, Ordering::Release);
        for module in &mut modules {
            module.terminate_remote_assets();
        }
        let _ = ready.send(Err(clone_for_caller(&err)));
        return WorkerOutcome {
            modules,
            result: Err(err),
        };
    }
    let _ = ready.send(Ok(()));

    let result = worker.main_loop(&mut modules, &commands, &cancel);

    // Shutdown path: drain what we can, then release module assets.
    let final_state = match &result {
        Ok(()) => {
            worker.drain_outbound(&commands);
            ControllerState::Stopped
        }
        Err(_) => ControllerState::Faulted,
    };
    for module in &mut modules {
        module.terminate_remote_assets();
    }
    let _ = worker.link.flush_output();
    worker.publish_stats();
    state.store(final_state as u8, Ordering::Release);

    WorkerOutcome { modules, result }
}

/// Errors surfaced through the `ready` channel must also stay with the
/// worker outcome; rebuild the user-visible variants and describe the rest.
fn clone_for_caller(err: &ControllerError) -> ControllerError {
    match err {
        ControllerError::IdentifyTimeout { timeout_ms } => ControllerError::IdentifyTimeout {
            timeout_ms: *timeout_ms,
        },
        ControllerError::IdentifyMismatch { expected, found } => {
            ControllerError::IdentifyMismatch {
                expected: *expected,
                found: *found,
            }
        }
        other => ControllerError::SerialIo(std::io::Error::other(other.to_string())),
    }
}

struct Worker<'a> {
    config: ControllerConfig,
    link: &'a mut dyn SerialLink,
    routing: RoutingTable,
    logger: LogHandle,
    timer: MicrosTimer,
    reader: FrameReader,
    stats: LinkStats,
    stats_out: Arc<ArcSwap<LinkStats>>,
    storm: ErrorStorm,
    unknown_keys: HashSet<(u8, u8)>,
}

impl Worker<'_> {
    fn startup(&mut self, modules: &mut [Module]) -> ControllerResult<()> {
        self.logger.submit(LogPackage::onset(self.config.id))?;

        self.send_message(&Message::Identify)?;
        self.await_identification()?;
        self.send_message(&Message::Lock)?;

        for module in modules.iter_mut() {
            module.initialize_remote_assets()?;
        }
        Ok(())
    }

    /// Waits for the matching identification reply within the configured
    /// deadline.
    fn await_identification(&mut self) -> ControllerResult<()> {
        let deadline = Instant::now() + Duration::from_millis(self.config.identify_timeout_ms);
        let mut buf = vec![0u8; self.config.buffer_size.max(64)];

        while Instant::now() < deadline {
            let n = self.link.read_available(&mut buf)?;
            if n > 0 {
                self.reader.push_bytes(&buf[..n]);
            }
            loop {
                match self.reader.next_payload() {
                    Ok(Some(payload)) => {
                        self.log_payload(payload.clone());
                        match Message::decode_payload(&payload) {
                            Ok(Message::Identification(reply)) => {
                                if reply.controller_id == self.config.id {
                                    self.stats.frames_decoded += 1;
                                    return Ok(());
                                }
                                return Err(ControllerError::IdentifyMismatch {
                                    expected: self.config.id,
                                    found: reply.controller_id,
                                });
                            }
                            Ok(_) => {
                                // Startup chatter (e.g. initial module state
                                // reports) is logged above and skipped here.
                                self.stats.frames_decoded += 1;
                            }
                            Err(err) => self.note_frame_error(&err),
                        }
                    }
                    Ok(None) => break,
                    Err(err) => self.note_frame_error(&err),
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        Err(ControllerError::IdentifyTimeout {
            timeout_ms: self.config.identify_timeout_ms,
        })
    }

    fn main_loop(
        &mut self,
        modules: &mut [Module],
        commands: &Receiver<Message>,
        cancel: &AtomicBool,
    ) -> ControllerResult<()> {
        let mut buf = vec![0u8; self.config.buffer_size.max(64)];
        let keepalive = Duration::from_millis(self.config.keepalive_interval_ms);
        let mut last_tx = Instant::now();

        while !cancel.load(Ordering::Acquire) {
            let mut did_work = false;

            // Outbound: bounded drain keeps command latency inside one tick.
            for _ in 0..self.config.command_budget {
                match commands.try_recv() {
                    Ok(message) => {
                        self.send_message(&message)?;
                        last_tx = Instant::now();
                        did_work = true;
                    }
                    Err(_) => break,
                }
            }

            // Inbound: read what the link has, decode a bounded batch.
            let n = self.link.read_available(&mut buf)?;
            if n > 0 {
                self.reader.push_bytes(&buf[..n]);
                did_work = true;
            }
            for _ in 0..self.config.frame_budget {
                match self.reader.next_payload() {
                    Ok(Some(payload)) => {
                        self.storm.success();
                        self.log_payload(payload.clone());
                        match Message::decode_payload(&payload) {
                            Ok(message) => {
                                self.stats.frames_decoded += 1;
                                self.dispatch(modules, &message);
                            }
                            Err(err) => self.handle_frame_error(err)?,
                        }
                        did_work = true;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        self.handle_frame_error(err)?;
                        did_work = true;
                    }
                }
            }

            if !keepalive.is_zero() && last_tx.elapsed() >= keepalive {
                self.send_message(&Message::Identify)?;
                last_tx = Instant::now();
            }

            self.publish_stats();
            if !did_work {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, modules: &mut [Module], message: &Message) {
        let (event, key) = match message {
            Message::Data(data) => (data.event, (data.module_type, data.module_id)),
            Message::State(state) => (state.event, (state.module_type, state.module_id)),
            // Identification replies double as keepalive echoes.
            Message::Identification(_) => return,
            other => {
                log::warn!("device sent a host-only message {other:?}; ignored");
                return;
            }
        };

        let Some(slot) = self.routing.lookup(key.0, key.1) else {
            // Firmware may be newer than the host; complain once per key.
            if self.unknown_keys.insert(key) {
                self.stats.unknown_routing_keys += 1;
                log::warn!(
                    "message for unregistered module ({}, {}); ignoring this key",
                    key.0,
                    key.1
                );
            }
            return;
        };
        let module = &mut modules[slot];

        if module.core().is_error_event(event) {
            log::warn!(
                "{} ({}, {}) reported error event {event}",
                module.kind_name(),
                key.0,
                key.1
            );
            self.log_note(NOTE_MODULE_ERROR, &[key.0, key.1, event]);
        }
        if module.core().wants_event(event) {
            let module_event = match message {
                Message::Data(data) => ModuleEvent::Data(data),
                Message::State(state) => ModuleEvent::State(state),
                _ => unreachable!("filtered above"),
            };
            module.process_received_data(module_event);
        }
    }

    /// Encodes, logs, and writes one outbound message.
    fn send_message(&mut self, message: &Message) -> ControllerResult<()> {
        let mut payload = Vec::with_capacity(16);
        message.encode_payload(&mut payload);
        let frame = encode_frame(&payload).map_err(|err| {
            ControllerError::SerialIo(std::io::Error::other(format!(
                "outbound frame rejected: {err}"
            )))
        })?;
        self.log_payload(payload);
        self.link.write_all_bytes(&frame)?;
        self.link.flush_output()?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    /// Transient decode failure: count, log, survive; storms escalate.
    fn handle_frame_error(&mut self, err: WireError) -> ControllerResult<()> {
        self.note_frame_error(&err);
        match self.storm.record(Instant::now()) {
            StormLevel::Calm => Ok(()),
            StormLevel::Degraded => {
                log::warn!("serial link degraded: repeated frame errors ({err})");
                self.log_note(NOTE_LINK_DEGRADED, &[]);
                Ok(())
            }
            StormLevel::Fatal => {
                log::error!("frame-error storm on the serial link; worker stopping");
                Err(ControllerError::FrameErrorStorm {
                    count: FATAL_COUNT as u32,
                    window_ms: FATAL_WINDOW.as_millis() as u64,
                })
            }
        }
    }

    fn note_frame_error(&mut self, err: &WireError) {
        self.stats.frame_errors += 1;
        log::debug!("frame error on controller {}: {err}", self.config.id);
        let detail = match err {
            WireError::Framing(_) => 1,
            WireError::Crc { .. } => 2,
            WireError::UnknownPrototype(_) => 3,
            WireError::UnknownProtocol(_) => 4,
            WireError::Truncated { .. } => 5,
            WireError::Oversize(_) => 6,
        };
        self.log_note(NOTE_FRAME_ERROR, &[detail]);
    }

    /// Best-effort shutdown drain of the outbound queue, bounded by the
    /// configured grace period.
    fn drain_outbound(&mut self, commands: &Receiver<Message>) {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.stop_drain_timeout_ms);
        let mut dropped = 0u64;
        while let Ok(message) = commands.try_recv() {
            if Instant::now() < deadline {
                if self.send_message(&message).is_err() {
                    dropped += 1;
                }
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.stats.dropped_commands += dropped;
            log::warn!("dropped {dropped} queued command(s) during shutdown");
            self.log_note(NOTE_DROPPED_COMMANDS, &(dropped as u32).to_le_bytes());
        }
    }

    /// Clones a wire payload into the event log with a run-relative stamp.
    fn log_payload(&self, payload: Vec<u8>) {
        let package = LogPackage {
            source_id: self.config.id,
            time_stamp_us: self.timer.elapsed_us(),
            serialized_data: payload,
        };
        // Never stall the serial loop on a healthy logger; block only when
        // the logger genuinely lags, preferring delayed acquisition over
        // lost data.
        if let Err(package) = self.logger.try_submit(package) {
            if self.logger.submit(package).is_err() {
                log::error!("event logger rejected a payload; entry lost");
            }
        }
    }

    /// Host-originated annotation inside this controller's source stream.
    fn log_note(&self, kind: u8, detail: &[u8]) {
        let mut payload = Vec::with_capacity(2 + detail.len());
        payload.push(HOST_NOTE);
        payload.push(kind);
        payload.extend_from_slice(detail);
        self.log_payload(payload);
    }

    fn publish_stats(&self) {
        self.stats_out.store(Arc::new(self.stats));
    }
}

/// Consecutive frame-error tracking with two escalation windows.
#[derive(Default)]
struct ErrorStorm {
    consecutive: VecDeque<Instant>,
    degraded_reported: bool,
}

enum StormLevel {
    Calm,
    Degraded,
    Fatal,
}

impl ErrorStorm {
    fn success(&mut self) {
        self.consecutive.clear();
        self.degraded_reported = false;
    }

    fn record(&mut self, now: Instant) -> StormLevel {
        self.consecutive.push_back(now);
        while self.consecutive.len() > FATAL_COUNT {
            self.consecutive.pop_front();
        }

        let len = self.consecutive.len();
        if len >= FATAL_COUNT {
            let window_start = self.consecutive[len - FATAL_COUNT];
            if now.duration_since(window_start) <= FATAL_WINDOW {
                return StormLevel::Fatal;
            }
        }
        if len >= DEGRADED_COUNT && !self.degraded_reported {
            let window_start = self.consecutive[len - DEGRADED_COUNT];
            if now.duration_since(window_start) <= DEGRADED_WINDOW {
                self.degraded_reported = true;
                return StormLevel::Degraded;
            }
        }
        StormLevel::Calm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storm_escalates_from_calm_to_degraded() {
        let mut storm = ErrorStorm::default();
        let now = Instant::now();
        assert!(matches!(storm.record(now), StormLevel::Calm));
        assert!(matches!(storm.record(now), StormLevel::Calm));
        assert!(matches!(storm.record(now), StormLevel::Degraded));
        // The degraded warning fires once per storm.
        assert!(matches!(storm.record(now), StormLevel::Calm));
    }

    #[test]
    fn storm_goes_fatal_at_twenty_in_a_second() {
        let mut storm = ErrorStorm::default();
        let now = Instant::now();
        for _ in 0..FATAL_COUNT - 1 {
            let _ = storm.record(now);
        }
        assert!(matches!(storm.record(now), StormLevel::Fatal));
    }

    #[test]
    fn success_resets_the_window() {
        let mut storm = ErrorStorm::default();
        let now = Instant::now();
        let _ = storm.record(now);
        let _ = storm.record(now);
        storm.success();
        assert!(matches!(storm.record(now), StormLevel::Calm));
        assert!(matches!(storm.record(now), StormLevel::Calm));
    }
}
