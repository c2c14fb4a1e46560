//! Controller: owns one serial link and every module wired to it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender};
use eventlog::LogHandle;
use modules::{
    AnalogCommands, BrakeCommands, CommandQueue, EncoderCommands, LickCommands, Module,
    ScreenCommands, TorqueCommands, TtlCommands, ValveCommands,
};
use parking_lot::Mutex;
use wire::Message;

use crate::link::{SerialLink, SerialPortLink};
use crate::routing::RoutingTable;
use crate::worker::{self, LinkStats, WorkerContext};
use crate::{ControllerError, ControllerResult};

/// Construction parameters for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller id: echoed by the identify handshake and used as the log
    /// source id. Must be at least [`eventlog::FIRST_CONTROLLER_SOURCE`].
    pub id: u8,
    /// Serial port path, e.g. `/dev/ttyACM0`.
    pub port: String,
    pub baud: u32,
    /// Serial read buffer size per poll.
    pub buffer_size: usize,
    /// Keepalive probe interval; zero disables keepalives.
    pub keepalive_interval_ms: u64,
    /// Identify handshake deadline.
    pub identify_timeout_ms: u64,
    /// Grace period for draining queued commands at stop.
    pub stop_drain_timeout_ms: u64,
    /// Max outbound commands encoded per worker tick.
    pub command_budget: usize,
    /// Max inbound frames decoded per worker tick.
    pub frame_budget: usize,
}

impl ControllerConfig {
    pub fn new(id: u8, port: impl Into<String>, baud: u32) -> Self {
        Self {
            id,
            port: port.into(),
            baud,
            buffer_size: 4096,
            keepalive_interval_ms: 500,
            identify_timeout_ms: 2_000,
            stop_drain_timeout_ms: 5_000,
            command_budget: 16,
            frame_budget: 64,
        }
    }
}

/// Lifecycle states latched by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    Idle = 0,
    Running = 1,
    Faulted = 2,
    Stopped = 3,
}

impl ControllerState {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => ControllerState::Running,
            2 => ControllerState::Faulted,
            3 => ControllerState::Stopped,
            _ => ControllerState::Idle,
        }
    }
}

enum LinkSource {
    Port { port: String, baud: u32 },
    Prepared(Box<dyn SerialLink>),
}

/// State handed to the worker at start and reclaimed at stop.
struct Registration {
    modules: Option<Vec<Module>>,
    routing: Option<RoutingTable>,
    link_source: Option<LinkSource>,
    command_rx: Option<Receiver<Message>>,
}

/// One microcontroller: its serial link, its registered modules, and the
/// communication worker coordinating them.
pub struct Controller {
    config: ControllerConfig,
    logger: LogHandle,
    registration: Mutex<Registration>,
    command_tx: Sender<Message>,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    stats: Arc<ArcSwap<LinkStats>>,
    worker: Mutex<Option<JoinHandle<worker::WorkerOutcome>>>,
}

impl Controller {
    /// Builds a controller over a real serial port.
    pub fn new(
        config: ControllerConfig,
        logger: LogHandle,
        modules: Vec<Module>,
    ) -> ControllerResult<Self> {
        let source = LinkSource::Port {
            port: config.port.clone(),
            baud: config.baud,
        };
        Self::build(config, logger, modules, source)
    }

    /// Builds a controller over an already-opened link (loopback pairs in
    /// tests and dry runs).
    pub fn with_link(
        config: ControllerConfig,
        logger: LogHandle,
        modules: Vec<Module>,
        link: Box<dyn SerialLink>,
    ) -> ControllerResult<Self> {
        Self::build(config, logger, modules, LinkSource::Prepared(link))
    }

    fn build(
        config: ControllerConfig,
        logger: LogHandle,
        modules: Vec<Module>,
        link_source: LinkSource,
    ) -> ControllerResult<Self> {
        if logger.is_stopped() {
            return Err(ControllerError::LoggerStopped);
        }

        let mut routing = RoutingTable::new();
        for (slot, module) in modules.iter().enumerate() {
            let (module_type, module_id) = module.routing_key();
            if !routing.insert(module_type, module_id, slot as u16) {
                return Err(ControllerError::DuplicateRoutingKey(module_type, module_id));
            }
        }

        let (command_tx, command_rx) = bounded(1024);
        Ok(Self {
            config,
            logger,
            registration: Mutex::new(Registration {
                modules: Some(modules),
                routing: Some(routing),
                link_source: Some(link_source),
                command_rx: Some(command_rx),
            }),
            command_tx,
            cancel: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(ControllerState::Idle as u8)),
            stats: Arc::new(ArcSwap::from_pointee(LinkStats::default())),
            worker: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_byte(self.state.load(Ordering::Acquire))
    }

    /// Latest link counters published by the worker.
    pub fn link_stats(&self) -> LinkStats {
        **self.stats.load()
    }

    /// Queue handle for building module command senders.
    pub fn command_queue(&self) -> CommandQueue {
        CommandQueue::attached(self.command_tx.clone())
    }

    /// Starts the communication worker and blocks until the identify
    /// handshake completes. Idempotent while running; restarting a stopped
    /// controller is refused.
    pub fn start(&self) -> ControllerResult<()> {
        match self.state() {
            ControllerState::Running => return Ok(()),
            ControllerState::Faulted => return Err(ControllerError::Faulted),
            ControllerState::Stopped => return Err(ControllerError::AlreadyStopped),
            ControllerState::Idle => {}
        }

        let mut worker_slot = self.worker.lock();
        if worker_slot.is_some() {
            return Ok(());
        }

        let (modules, routing, link_source, command_rx) = {
            let mut registration = self.registration.lock();
            match (
                registration.modules.take(),
                registration.routing.take(),
                registration.link_source.take(),
                registration.command_rx.take(),
            ) {
                (Some(m), Some(r), Some(l), Some(c)) => (m, r, l, c),
                _ => return Err(ControllerError::AlreadyStopped),
            }
        };

        let link: Box<dyn SerialLink> = match link_source {
            LinkSource::Prepared(link) => link,
            LinkSource::Port { port, baud } => Box::new(SerialPortLink::open(&port, baud)?),
        };

        // The worker overwrites this with `Faulted`/`Stopped` as it sees
        // fit; publishing `Running` first keeps the ordering single-writer.
        self.state
            .store(ControllerState::Running as u8, Ordering::Release);

        let (ready_tx, ready_rx) = bounded(1);
        let context = WorkerContext {
            config: self.config.clone(),
            link,
            modules,
            routing,
            commands: command_rx,
            logger: self.logger.clone(),
            cancel: Arc::clone(&self.cancel),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            ready: ready_tx,
        };

        let handle = std::thread::Builder::new()
            .name(format!("controller-{}", self.config.id))
            .spawn(move || worker::run(context))
            .map_err(ControllerError::SerialIo)?;
        *worker_slot = Some(handle);

        // Surface handshake failures synchronously from start().
        let startup = ready_rx
            .recv_timeout(Duration::from_millis(
                self.config.identify_timeout_ms + 1_000,
            ))
            .unwrap_or(Err(ControllerError::IdentifyTimeout {
                timeout_ms: self.config.identify_timeout_ms,
            }));

        if startup.is_err() {
            // The worker latched `Faulted` before reporting; reclaim the
            // interfaces so extraction still works after the failed start.
            if let Some(handle) = worker_slot.take() {
                if let Ok(outcome) = handle.join() {
                    self.registration.lock().modules = Some(outcome.modules);
                }
            }
        }
        startup
    }

    /// Submits a typed message to the outbound queue. Fails fast once the
    /// controller faulted.
    pub fn submit(&self, message: Message) -> ControllerResult<()> {
        match self.state() {
            ControllerState::Running => {}
            ControllerState::Faulted => return Err(ControllerError::Faulted),
            _ => return Err(ControllerError::NotRunning),
        }
        self.command_tx
            .send(message)
            .map_err(|_| ControllerError::NotRunning)
    }

    /// Releases the device output lock; required before any command can
    /// drive outputs.
    pub fn unlock(&self) -> ControllerResult<()> {
        self.submit(Message::Unlock)
    }

    /// Re-engages the device output lock.
    pub fn lock(&self) -> ControllerResult<()> {
        self.submit(Message::Lock)
    }

    /// Signals cancellation, waits for the worker to drain and exit, and
    /// reclaims the module interfaces for extraction.
    pub fn stop(&self) -> ControllerResult<()> {
        let handle = {
            let mut worker_slot = self.worker.lock();
            match worker_slot.take() {
                Some(handle) => handle,
                None => return Ok(()),
            }
        };

        self.cancel.store(true, Ordering::Release);
        let outcome = handle.join().map_err(|_| ControllerError::NotRunning)?;
        self.registration.lock().modules = Some(outcome.modules);
        outcome.result
    }

    /// Runs `f` over the registered modules. Returns `None` while the
    /// worker owns them (between start and stop).
    pub fn with_modules<R>(&self, f: impl FnOnce(&[Module]) -> R) -> Option<R> {
        let registration = self.registration.lock();
        registration.modules.as_deref().map(f)
    }

    /// Consumes the controller, yielding the modules for log extraction.
    pub fn into_modules(self) -> Vec<Module> {
        let _ = self.stop();
        self.registration.lock().modules.take().unwrap_or_default()
    }

    fn command_handle<R>(&self, f: impl Fn(&Module, CommandQueue) -> Option<R>) -> Option<R> {
        let registration = self.registration.lock();
        registration
            .modules
            .as_deref()?
            .iter()
            .find_map(|module| f(module, self.command_queue()))
    }

    /// Valve command handle; grab before `start()` moves the interfaces to
    /// the worker.
    pub fn valve_commands(&self, module_id: u8) -> Option<ValveCommands> {
        self.command_handle(|m, queue| match m {
            Module::Valve(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn lick_commands(&self, module_id: u8) -> Option<LickCommands> {
        self.command_handle(|m, queue| match m {
            Module::Lick(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn ttl_commands(&self, module_id: u8) -> Option<TtlCommands> {
        self.command_handle(|m, queue| match m {
            Module::Ttl(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn brake_commands(&self, module_id: u8) -> Option<BrakeCommands> {
        self.command_handle(|m, queue| match m {
            Module::Brake(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn torque_commands(&self, module_id: u8) -> Option<TorqueCommands> {
        self.command_handle(|m, queue| match m {
            Module::Torque(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn encoder_commands(&self, module_id: u8) -> Option<EncoderCommands> {
        self.command_handle(|m, queue| match m {
            Module::Encoder(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn screen_commands(&self, module_id: u8) -> Option<ScreenCommands> {
        self.command_handle(|m, queue| match m {
            Module::Screen(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }

    pub fn analog_commands(&self, module_id: u8) -> Option<AnalogCommands> {
        self.command_handle(|m, queue| match m {
            Module::Analog(v) if v.core().module_id == module_id => Some(v.commands(queue)),
            _ => None,
        })
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
