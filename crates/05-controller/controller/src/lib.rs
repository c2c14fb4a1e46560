//! Controller interface: exclusive owner of one serial link.
//!
//! A [`Controller`] validates module registration, spawns the communication
//! worker, and mediates every interaction between module interfaces and the
//! wire:
//! * [`ControllerConfig`] – port, budgets, deadlines.
//! * [`SerialLink`] – the byte-transport seam; [`loopback`] provides the
//!   in-memory implementation tests drive.
//! * [`LinkStats`] – lock-free counters published by the worker.

mod controller;
mod error;
mod link;
pub mod loopback;
mod routing;
mod worker;

pub use controller::{Controller, ControllerConfig, ControllerState};
pub use error::{ControllerError, ControllerResult};
pub use link::{SerialLink, SerialPortLink};
pub use worker::{
    LinkStats, NOTE_DROPPED_COMMANDS, NOTE_FRAME_ERROR, NOTE_LINK_DEGRADED, NOTE_MODULE_ERROR,
};
