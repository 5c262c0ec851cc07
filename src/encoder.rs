//! Rotary encoders: quadrature decoding in the callback domain and
//! rate-limited aggregation in the control loop.
//!
//! The callbacks of both pins of a pair update one packed phase code with a
//! compare-and-swap, then add the decoded step to a word-sized atomic tick
//! counter. The control loop only ever reads the counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use tracing::debug;

use crate::commands::EncoderCommand;
use crate::gpio::Level;

pub const DEFAULT_MIN_INTERVAL_MS: u64 = 200;
pub const DEFAULT_MAX_STEP: u32 = 10;

/// Step for each `previous << 2 | current` phase transition.
///
/// Forward single steps (0b1101, 0b0100, 0b0010, 0b1011) count +1, backward
/// single steps (0b1110, 0b0111, 0b0001, 0b1000) count -1. Unchanged codes
/// and double steps count 0.
const TRANSITIONS: [i8; 16] = [
    0, -1, 1, 0, //
    1, 0, 0, -1, //
    -1, 0, 0, 1, //
    0, 1, -1, 0, //
];

pub fn decode(previous: u8, current: u8) -> i8 {
    TRANSITIONS[(((previous & 0b11) << 2) | (current & 0b11)) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    A,
    B,
}

impl Phase {
    fn mask(self) -> u8 {
        match self {
            Phase::A => 0b10,
            Phase::B => 0b01,
        }
    }
}

/// State shared between an encoder's edge callbacks and the control loop.
#[derive(Debug, Default)]
pub struct EncoderSignal {
    phase: AtomicU8,
    ticks: AtomicIsize,
}

impl EncoderSignal {
    pub fn new(a: Level, b: Level) -> Self {
        let signal = EncoderSignal::default();
        let code = (u8::from(a == Level::High) << 1) | u8::from(b == Level::High);
        signal.phase.store(code, Ordering::Release);
        signal
    }

    /// Records a new level on one pin and counts the resulting step.
    pub fn on_level(&self, pin: Phase, level: Level) {
        let mask = pin.mask();
        let update = |code: u8| {
            Some(if level == Level::High {
                code | mask
            } else {
                code & !mask
            })
        };
        // fetch_update only fails when the closure returns None
        let Ok(previous) = self.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, update) else {
            return;
        };
        let current = update(previous).unwrap_or(previous);
        let step = decode(previous, current);
        if step != 0 {
            self.ticks.fetch_add(step as isize, Ordering::AcqRel);
        }
    }

    pub fn ticks(&self) -> isize {
        self.ticks.load(Ordering::Acquire)
    }
}

/// A dispatch the aggregator wants to make this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderDispatch {
    pub fragment: String,
    pub delta: i64,
    observed: isize,
}

/// Loop-side aggregator for one encoder.
pub struct EncoderChannel {
    pub pin_a: u8,
    pub pin_b: u8,
    /// `None` when the configured command is unknown; ticks still count.
    pub command: Option<EncoderCommand>,
    pub min_interval_ms: u64,
    pub max_step: u32,
    last_dispatched: isize,
    last_dispatch_ms: Option<u64>,
    signal: Arc<EncoderSignal>,
}

impl EncoderChannel {
    pub fn new(
        pin_a: u8,
        pin_b: u8,
        command: Option<EncoderCommand>,
        min_interval_ms: u64,
        max_step: u32,
        signal: Arc<EncoderSignal>,
    ) -> Self {
        EncoderChannel {
            pin_a,
            pin_b,
            command,
            min_interval_ms,
            max_step,
            last_dispatched: signal.ticks(),
            last_dispatch_ms: None,
            signal,
        }
    }

    pub fn signal(&self) -> &Arc<EncoderSignal> {
        &self.signal
    }

    /// Works out what, if anything, should be sent this cycle.
    ///
    /// Nothing is recorded here; call `commit` once the transport accepted
    /// the command.
    pub fn poll(&self, now_ms: u64) -> Option<EncoderDispatch> {
        let command = self.command?;
        let observed = self.signal.ticks();
        let delta = observed.wrapping_sub(self.last_dispatched) as i64;
        if delta == 0 {
            return None;
        }
        if let Some(last) = self.last_dispatch_ms {
            if now_ms.saturating_sub(last) < self.min_interval_ms {
                debug!(pin_a = self.pin_a, pin_b = self.pin_b, delta, "Encoder rate limited");
                return None;
            }
        }
        let cap = i64::from(self.max_step);
        let clamped = delta.clamp(-cap, cap);
        debug!(pin_a = self.pin_a, pin_b = self.pin_b, delta, clamped, "Encoder value change");
        Some(EncoderDispatch {
            fragment: command.fragment(clamped),
            delta: clamped,
            observed,
        })
    }

    pub fn commit(&mut self, dispatch: &EncoderDispatch, now_ms: u64) {
        self.last_dispatched = dispatch.observed;
        self.last_dispatch_ms = Some(now_ms);
    }
}
