//! Peripheral ports: sampled inputs and switched outputs.
//!
//! The gateway itself never touches registers; ADC and GPIO live behind
//! these traits so the control logic runs identically against hardware
//! adapters and the simulators used in tests.

use std::collections::HashMap;

use log::debug;

/// Analog input channels sampled by the gateway.
pub const INPUTS: [&str; 4] = ["AI1", "AI2", "AI3", "AI4"];
/// Switched relay outputs.
pub const RELAYS: [&str; 6] = ["RELAY1", "RELAY2", "RELAY3", "RELAY4", "RELAY5", "RELAY6"];
/// PWM outputs, duty 0..=100.
pub const PWMS: [&str; 2] = ["PWM1", "PWM2"];

/// Source of sampled sensor values.
pub trait SensorPort: Send {
    /// Channel names this port serves.
    fn inputs(&self) -> &'static [&'static str];

    /// Current value of one channel; `None` for unknown names.
    fn read(&mut self, name: &str) -> Option<f64>;
}

/// Sink for switched and modulated outputs.
pub trait OutputPort: Send {
    /// Drive a relay. Returns `false` for unknown names.
    fn set_relay(&mut self, name: &str, on: bool) -> bool;

    /// Set a PWM duty cycle in percent. Returns `false` for unknown names
    /// or out-of-range duty.
    fn set_pwm(&mut self, name: &str, duty: u8) -> bool;
}

// ── Simulation adapters ──────────────────────────────────────

/// Deterministic sensor simulator: each channel ramps from a distinct
/// offset so readings are tellable apart in logs and tests.
pub struct SimSensors {
    tick: u64,
}

impl SimSensors {
    pub fn new() -> Self {
        Self { tick: 0 }
    }
}

impl Default for SimSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorPort for SimSensors {
    fn inputs(&self) -> &'static [&'static str] {
        &INPUTS
    }

    fn read(&mut self, name: &str) -> Option<f64> {
        let idx = INPUTS.iter().position(|&n| n == name)?;
        self.tick += 1;
        Some((idx as f64) * 100.0 + (self.tick % 50) as f64)
    }
}

/// In-memory output simulator; remembers the last commanded state.
pub struct SimOutputs {
    relays: HashMap<&'static str, bool>,
    pwms: HashMap<&'static str, u8>,
}

impl SimOutputs {
    pub fn new() -> Self {
        Self {
            relays: RELAYS.iter().map(|&n| (n, false)).collect(),
            pwms: PWMS.iter().map(|&n| (n, 0)).collect(),
        }
    }

    pub fn relay(&self, name: &str) -> Option<bool> {
        self.relays.get(name).copied()
    }

    pub fn pwm(&self, name: &str) -> Option<u8> {
        self.pwms.get(name).copied()
    }
}

impl Default for SimOutputs {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputPort for SimOutputs {
    fn set_relay(&mut self, name: &str, on: bool) -> bool {
        match self.relays.get_mut(name) {
            Some(state) => {
                debug!("sim: {name} -> {}", if on { "on" } else { "off" });
                *state = on;
                true
            }
            None => false,
        }
    }

    fn set_pwm(&mut self, name: &str, duty: u8) -> bool {
        if duty > 100 {
            return false;
        }
        match self.pwms.get_mut(name) {
            Some(state) => {
                debug!("sim: {name} -> {duty}%");
                *state = duty;
                true
            }
            None => false,
        }
    }
}
