use rppal::gpio::{Gpio, InputPin, Trigger};
use std::collections::HashMap;
use tracing::info;

use crate::error::ConfigError;

pub use rppal::gpio::Level;

/// Body of an edge callback. Runs in the interrupt domain: it must not
/// block, allocate or touch the network.
pub type EdgeCallback = Box<dyn FnMut(Level) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Off,
    Down,
    Up,
}

impl Pull {
    /// Original numbering: 0 off, 1 pull-down, 2 pull-up.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Pull::Off),
            1 => Some(Pull::Down),
            2 => Some(Pull::Up),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Falling,
    Rising,
    Both,
}

impl Edge {
    /// 1 falling, 2 rising, anything else both.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Edge::Falling,
            2 => Edge::Rising,
            _ => Edge::Both,
        }
    }

    fn trigger(self) -> Trigger {
        match self {
            Edge::Falling => Trigger::FallingEdge,
            Edge::Rising => Trigger::RisingEdge,
            Edge::Both => Trigger::Both,
        }
    }
}

/// What the control code needs from the GPIO hardware.
pub trait GpioDriver {
    fn setup_input(&mut self, pin: u8, pull: Pull) -> Result<(), ConfigError>;

    fn read(&mut self, pin: u8) -> Result<Level, ConfigError>;

    fn on_edge(&mut self, pin: u8, edge: Edge, callback: EdgeCallback) -> Result<(), ConfigError>;
}

/// Raspberry Pi GPIO through rppal. Pins are kept alive here so their
/// interrupt threads keep running for the process lifetime.
pub struct RppalGpio {
    gpio: Gpio,
    pins: HashMap<u8, InputPin>,
}

impl RppalGpio {
    pub fn new() -> Result<Self, ConfigError> {
        let gpio = Gpio::new()?;
        info!("GPIO initialized");
        Ok(RppalGpio {
            gpio,
            pins: HashMap::new(),
        })
    }

    fn pin(&mut self, pin: u8) -> Result<&mut InputPin, ConfigError> {
        self.pins
            .get_mut(&pin)
            .ok_or_else(|| ConfigError::invalid(&pin.to_string(), "pin not configured as input"))
    }
}

impl GpioDriver for RppalGpio {
    fn setup_input(&mut self, pin: u8, pull: Pull) -> Result<(), ConfigError> {
        let raw = self.gpio.get(pin)?;
        let input = match pull {
            Pull::Off => raw.into_input(),
            Pull::Down => raw.into_input_pulldown(),
            Pull::Up => raw.into_input_pullup(),
        };
        info!(pin, ?pull, "GPIO input initialized");
        self.pins.insert(pin, input);
        Ok(())
    }

    fn read(&mut self, pin: u8) -> Result<Level, ConfigError> {
        Ok(self.pin(pin)?.read())
    }

    fn on_edge(&mut self, pin: u8, edge: Edge, mut callback: EdgeCallback) -> Result<(), ConfigError> {
        self.pin(pin)?
            .set_async_interrupt(edge.trigger(), move |level| callback(level))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resistor_codes() {
        assert_eq!(Pull::from_code(0), Some(Pull::Off));
        assert_eq!(Pull::from_code(1), Some(Pull::Down));
        assert_eq!(Pull::from_code(2), Some(Pull::Up));
        assert_eq!(Pull::from_code(3), None);
    }

    #[test]
    fn edge_codes_default_to_both() {
        assert_eq!(Edge::from_code(1), Edge::Falling);
        assert_eq!(Edge::from_code(2), Edge::Rising);
        assert_eq!(Edge::from_code(0), Edge::Both);
        assert_eq!(Edge::from_code(3), Edge::Both);
    }
}
