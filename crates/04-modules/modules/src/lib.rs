//! Hardware module interfaces for the acquisition rig.
//!
//! Each interface converts byte-level device events into typed behavioral
//! data and typed commands back:
//! * [`Module`] – the closed dispatch enum the controller routes through.
//! * [`ModuleCore`] / [`CommandQueue`] – identity, code sets, and the
//!   outbound queue attached at registration.
//! * per-module `*Interface` (worker side) and `*Commands` (app side)
//!   pairs, e.g. [`ValveInterface`] / [`ValveCommands`].
//! * [`ModuleSeries`] – the typed columnar outputs of log extraction.
//! * [`power_law_fit`] – the valve's pulse→volume calibration.

mod analog;
mod base;
mod brake;
mod bus;
mod calibration;
mod encoder;
mod error;
mod lick;
mod module;
mod screen;
mod series;
mod torque;
mod ttl;
mod valve;

pub use analog::{
    AnalogCommands, AnalogConfig, AnalogInterface, ANALOG_NONZERO, ANALOG_TYPE,
};
pub use base::{
    merged_levels, rising_edges, sorted_events, CommandQueue, EventMap, EventRecord, ModuleCore,
    ModuleEvent,
};
pub use brake::{
    BrakeCommands, BrakeConfig, BrakeInterface, BrakeParameters, BRAKE_DISENGAGED, BRAKE_ENGAGED,
    BRAKE_OUTPUT_LOCKED, BRAKE_TYPE, NCM_PER_GCM,
};
pub use bus::{null_bus, BusHandle, BusPublisher, NullBus};
pub use calibration::{power_law_fit, round_decimals};
pub use encoder::{
    EncoderCommands, EncoderConfig, EncoderInterface, EncoderParameters, ENCODER_CCW, ENCODER_CW,
    ENCODER_PPR, ENCODER_TYPE, MOTION_TOPIC,
};
pub use error::{ModuleError, ModuleResult};
pub use lick::{
    volts_per_adc, LickCommands, LickConfig, LickInterface, LickParameters, LICK_TYPE,
    LICK_VOLTAGE_CHANGED,
};
pub use module::Module;
pub use screen::{
    ScreenCommands, ScreenConfig, ScreenInterface, ScreenParameters, SCREEN_PULSE_OFF,
    SCREEN_PULSE_ON, SCREEN_TYPE,
};
pub use series::ModuleSeries;
pub use torque::{
    TorqueCommands, TorqueConfig, TorqueInterface, TorqueParameters, TORQUE_CCW, TORQUE_CW,
    TORQUE_TYPE,
};
pub use ttl::{
    TtlCommands, TtlConfig, TtlInterface, TtlParameters, TTL_INPUT_OFF, TTL_INPUT_ON, TTL_TYPE,
};
pub use valve::{
    ValveCommands, ValveConfig, ValveInterface, ValveParameters, VALVE_CALIBRATED, VALVE_CLOSED,
    VALVE_OPEN, VALVE_TYPE,
};
