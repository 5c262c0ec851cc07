use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::buttons::ButtonChannel;
use crate::clock::Clock;
use crate::commands::{CommandBinding, CommandMapper, EncoderCommand};
use crate::config::{ButtonSpec, ElementSpec, EncoderSpec};
use crate::encoder::{EncoderChannel, EncoderSignal, Phase};
use crate::error::ConfigError;
use crate::gpio::{Edge, GpioDriver, Level, Pull};

/// One 40-pin header worth of inputs.
pub const MAX_BUTTONS: usize = 17;
pub const MAX_ENCODERS: usize = 8;

/// All configured controls. Built once at startup, then only read.
#[derive(Default)]
pub struct ChannelSet {
    buttons: Vec<ButtonChannel>,
    encoders: Vec<EncoderChannel>,
    claimed: HashSet<u8>,
}

fn resolve(mapper: &CommandMapper, spec: &str, pin: u8) -> Option<CommandBinding> {
    match mapper.resolve(spec) {
        Ok(binding) => Some(binding),
        Err(e) => {
            warn!(pin, "{}, action disabled", e);
            None
        }
    }
}

impl ChannelSet {
    pub fn new() -> Self {
        ChannelSet::default()
    }

    pub fn buttons(&self) -> &[ButtonChannel] {
        &self.buttons
    }

    pub fn encoders(&self) -> &[EncoderChannel] {
        &self.encoders
    }

    pub fn encoders_mut(&mut self) -> &mut [EncoderChannel] {
        &mut self.encoders
    }

    #[cfg(test)]
    pub(crate) fn push_encoder(&mut self, encoder: EncoderChannel) {
        self.encoders.push(encoder);
    }

    fn check_free(&self, pins: &[u8]) -> Result<(), ConfigError> {
        match pins.iter().find(|pin| self.claimed.contains(pin)) {
            Some(&pin) => Err(ConfigError::PinInUse(pin)),
            None => Ok(()),
        }
    }

    /// Adds every element, logging and skipping the ones that fail.
    pub fn add_all<G: GpioDriver>(&mut self, driver: &mut G, elements: &[ElementSpec], mapper: &CommandMapper, clock: &Clock) {
        for element in elements {
            let added = match element {
                ElementSpec::Button(spec) => self.add_button(driver, spec, mapper, clock),
                ElementSpec::Encoder(spec) => self.add_encoder(driver, spec),
            };
            if let Err(e) = added {
                error!("Skipping {:?}: {}", element, e);
            }
        }
        info!(buttons = self.buttons.len(), encoders = self.encoders.len(), "Controls configured");
    }

    pub fn add_button<G: GpioDriver>(
        &mut self,
        driver: &mut G,
        spec: &ButtonSpec,
        mapper: &CommandMapper,
        clock: &Clock,
    ) -> Result<(), ConfigError> {
        if self.buttons.len() >= MAX_BUTTONS {
            return Err(ConfigError::CapacityExceeded {
                kind: "buttons",
                limit: MAX_BUTTONS,
            });
        }
        self.check_free(&[spec.pin])?;
        let pull = Pull::from_code(spec.resist)
            .ok_or_else(|| ConfigError::invalid(&spec.pin.to_string(), format!("bad resist '{}'", spec.resist)))?;
        let active = if spec.pressed == 0 { Level::Low } else { Level::High };

        let short = resolve(mapper, &spec.command, spec.pin);
        let long = spec
            .long_command
            .as_deref()
            .map(|command| resolve(mapper, command, spec.pin));
        let button = ButtonChannel::new(spec.pin, pull, active, spec.long_press_ms, short, long);

        // claimed even if the driver fails half way, it may still hold the pin
        self.claimed.insert(spec.pin);
        driver.setup_input(spec.pin, pull)?;
        let initial = driver.read(spec.pin)?;
        let mut detector = button.detector(initial, clock);
        let clock = clock.clone();
        driver.on_edge(
            spec.pin,
            Edge::Both,
            Box::new(move |level| detector.on_level(level, clock.now_ms())),
        )?;

        info!(pin = spec.pin, command = %spec.command, long_command = ?spec.long_command, "Button defined");
        self.buttons.push(button);
        Ok(())
    }

    pub fn add_encoder<G: GpioDriver>(&mut self, driver: &mut G, spec: &EncoderSpec) -> Result<(), ConfigError> {
        if self.encoders.len() >= MAX_ENCODERS {
            return Err(ConfigError::CapacityExceeded {
                kind: "encoders",
                limit: MAX_ENCODERS,
            });
        }
        self.check_free(&[spec.pin_a, spec.pin_b])?;
        if spec.pin_a == spec.pin_b {
            return Err(ConfigError::PinInUse(spec.pin_b));
        }

        let command = match EncoderCommand::from_code(&spec.command) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(pin_a = spec.pin_a, pin_b = spec.pin_b, "{}, encoder disabled", e);
                None
            }
        };
        // Decoding needs every level change on both pins.
        if Edge::from_code(spec.edge) != Edge::Both {
            warn!(pin_a = spec.pin_a, pin_b = spec.pin_b, edge = spec.edge, "Single edge encoders are not supported, using both edges");
        }

        self.claimed.insert(spec.pin_a);
        self.claimed.insert(spec.pin_b);
        driver.setup_input(spec.pin_a, Pull::Up)?;
        driver.setup_input(spec.pin_b, Pull::Up)?;
        let signal = Arc::new(EncoderSignal::new(driver.read(spec.pin_a)?, driver.read(spec.pin_b)?));
        for (pin, phase) in [(spec.pin_a, Phase::A), (spec.pin_b, Phase::B)] {
            let signal = Arc::clone(&signal);
            driver.on_edge(pin, Edge::Both, Box::new(move |level| signal.on_level(phase, level)))?;
        }

        let encoder = EncoderChannel::new(
            spec.pin_a,
            spec.pin_b,
            command,
            spec.min_interval_ms,
            spec.max_step,
            signal,
        );
        info!(pin_a = spec.pin_a, pin_b = spec.pin_b, command = %spec.command, "Encoder defined");
        self.encoders.push(encoder);
        Ok(())
    }
}
