//! Closed set of hardware module interfaces with match dispatch.
//!
//! The controller routes inbound traffic through this enum; the
//! `(module_type, module_id)` lookup stays a dense table because the
//! variant set is closed. New hardware means a new variant, not a new
//! trait implementation.

use crate::analog::AnalogInterface;
use crate::base::{EventMap, ModuleCore, ModuleEvent};
use crate::brake::BrakeInterface;
use crate::encoder::EncoderInterface;
use crate::lick::LickInterface;
use crate::screen::ScreenInterface;
use crate::series::ModuleSeries;
use crate::torque::TorqueInterface;
use crate::ttl::TtlInterface;
use crate::valve::ValveInterface;
use crate::ModuleResult;

/// One registered hardware module interface.
pub enum Module {
    Valve(ValveInterface),
    Lick(LickInterface),
    Ttl(TtlInterface),
    Brake(BrakeInterface),
    Torque(TorqueInterface),
    Encoder(EncoderInterface),
    Screen(ScreenInterface),
    Analog(AnalogInterface),
}

impl Module {
    pub fn core(&self) -> &ModuleCore {
        match self {
            Module::Valve(m) => m.core(),
            Module::Lick(m) => m.core(),
            Module::Ttl(m) => m.core(),
            Module::Brake(m) => m.core(),
            Module::Torque(m) => m.core(),
            Module::Encoder(m) => m.core(),
            Module::Screen(m) => m.core(),
            Module::Analog(m) => m.core(),
        }
    }

    pub fn routing_key(&self) -> (u8, u8) {
        self.core().routing_key()
    }

    /// Short human-readable name used in logs and extraction file names.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Module::Valve(_) => "valve",
            Module::Lick(_) => "lick",
            Module::Ttl(_) => "ttl",
            Module::Brake(_) => "brake",
            Module::Torque(_) => "torque",
            Module::Encoder(_) => "encoder",
            Module::Screen(_) => "screen",
            Module::Analog(_) => "analog",
        }
    }

    /// Called once on the communication worker thread after registration.
    pub fn initialize_remote_assets(&mut self) -> ModuleResult<()> {
        match self {
            Module::Valve(m) => m.initialize_remote_assets(),
            Module::Lick(m) => m.initialize_remote_assets(),
            Module::Ttl(m) => m.initialize_remote_assets(),
            Module::Brake(m) => m.initialize_remote_assets(),
            Module::Torque(m) => m.initialize_remote_assets(),
            Module::Encoder(m) => m.initialize_remote_assets(),
            Module::Screen(m) => m.initialize_remote_assets(),
            Module::Analog(m) => m.initialize_remote_assets(),
        }
    }

    /// Symmetric teardown on the communication worker thread.
    pub fn terminate_remote_assets(&mut self) {
        match self {
            Module::Valve(m) => m.terminate_remote_assets(),
            Module::Lick(m) => m.terminate_remote_assets(),
            Module::Ttl(m) => m.terminate_remote_assets(),
            Module::Brake(m) => m.terminate_remote_assets(),
            Module::Torque(m) => m.terminate_remote_assets(),
            Module::Encoder(m) => m.terminate_remote_assets(),
            Module::Screen(m) => m.terminate_remote_assets(),
            Module::Analog(m) => m.terminate_remote_assets(),
        }
    }

    /// Non-blocking online processing hook; the controller calls this for
    /// events listed in the module's `data_codes`.
    pub fn process_received_data(&mut self, event: ModuleEvent<'_>) {
        match self {
            Module::Valve(m) => m.process_received_data(event),
            Module::Lick(m) => m.process_received_data(event),
            Module::Ttl(m) => m.process_received_data(event),
            Module::Brake(m) => m.process_received_data(event),
            Module::Torque(m) => m.process_received_data(event),
            Module::Encoder(m) => m.process_received_data(event),
            Module::Screen(m) => m.process_received_data(event),
            Module::Analog(m) => m.process_received_data(event),
        }
    }

    /// Pure conversion of extracted events into the module's columnar
    /// output.
    pub fn parse_logged_data(&self, events: &EventMap) -> ModuleSeries {
        match self {
            Module::Valve(m) => m.parse_logged_data(events),
            Module::Lick(m) => m.parse_logged_data(events),
            Module::Ttl(m) => m.parse_logged_data(events),
            Module::Brake(m) => m.parse_logged_data(events),
            Module::Torque(m) => m.parse_logged_data(events),
            Module::Encoder(m) => m.parse_logged_data(events),
            Module::Screen(m) => m.parse_logged_data(events),
            Module::Analog(m) => m.parse_logged_data(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lick::{LickConfig, LICK_TYPE};
    use crate::ttl::TtlConfig;

    #[test]
    fn dispatch_reaches_the_inner_interface() {
        let lick = LickInterface::new(70, LickConfig::default()).expect("lick");
        let module = Module::Lick(lick);
        assert_eq!(module.routing_key(), (LICK_TYPE, 70));
        assert_eq!(module.kind_name(), "lick");
        assert!(module.core().wants_event(crate::lick::LICK_VOLTAGE_CHANGED));
    }

    #[test]
    fn parse_dispatches_by_variant() {
        let ttl = TtlInterface::new(71, TtlConfig::default()).expect("ttl");
        let module = Module::Ttl(ttl);
        let series = module.parse_logged_data(&EventMap::new());
        assert!(matches!(series, ModuleSeries::RisingEdges { .. }));
    }
}
