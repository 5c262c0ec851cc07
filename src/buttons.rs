use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::commands::CommandBinding;
use crate::gpio::{Level, Pull};

/// Edges closer than this to the previous accepted transition are chatter.
pub const DEBOUNCE_MS: u64 = 50;
pub const LONG_PRESS_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Press {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Released { since: u64 },
    Engaged { since: u64 },
}

/// Single-slot handoff from the callback domain to the control loop.
///
/// Holds the hold time of the last completed engagement, offset by one so
/// that zero means empty. `take` swaps the slot out, so a publish racing a
/// take is never lost.
#[derive(Debug, Default)]
pub struct PressSlot(AtomicU64);

impl PressSlot {
    pub fn publish(&self, held_ms: u64) {
        self.0.store(held_ms.saturating_add(1), Ordering::Release);
    }

    pub fn take(&self) -> Option<u64> {
        match self.0.swap(0, Ordering::AcqRel) {
            0 => None,
            stored => Some(stored - 1),
        }
    }
}

/// Callback-side debounce state machine for one button.
///
/// Owned by the edge callback. Only scalar updates happen here; the hold
/// time of each completed engagement goes into the shared slot.
pub struct PressDetector {
    active: Level,
    debounce_ms: u64,
    state: DebounceState,
    /// Last raw level reported, and when it changed.
    level: Level,
    level_since: u64,
    slot: Arc<PressSlot>,
}

impl PressDetector {
    pub fn new(active: Level, initial: Level, now_ms: u64, debounce_ms: u64, slot: Arc<PressSlot>) -> Self {
        let state = if initial == active {
            DebounceState::Engaged { since: now_ms }
        } else {
            DebounceState::Released { since: now_ms }
        };
        PressDetector {
            active,
            debounce_ms,
            state,
            level: initial,
            level_since: now_ms,
            slot,
        }
    }

    pub fn is_engaged(&self) -> bool {
        matches!(self.state, DebounceState::Engaged { .. })
    }

    pub fn on_level(&mut self, level: Level, now_ms: u64) {
        self.settle(now_ms);
        if level != self.level {
            self.level = level;
            self.level_since = now_ms;
        }

        let engaged = level == self.active;
        match self.state {
            DebounceState::Released { since } if engaged => {
                if now_ms.saturating_sub(since) >= self.debounce_ms {
                    self.state = DebounceState::Engaged { since: now_ms };
                }
            }
            DebounceState::Engaged { since } if !engaged => {
                // a release inside the window is a glitch: drop it unreported
                let held = now_ms.saturating_sub(since);
                self.state = DebounceState::Released { since: now_ms };
                if held >= self.debounce_ms {
                    self.slot.publish(held);
                }
            }
            _ => {}
        }
    }

    /// Catches up with an engagement whose edge fell inside the debounce
    /// window and that has stayed engaged since.
    fn settle(&mut self, now_ms: u64) {
        if matches!(self.state, DebounceState::Released { .. })
            && self.level == self.active
            && now_ms.saturating_sub(self.level_since) >= self.debounce_ms
        {
            self.state = DebounceState::Engaged { since: self.level_since };
        }
    }
}

/// Loop-side view of a configured button.
pub struct ButtonChannel {
    pub pin: u8,
    pub pull: Pull,
    pub active: Level,
    pub long_press_ms: u64,
    /// `None` when the short command could not be resolved.
    pub short: Option<CommandBinding>,
    /// Outer `None`: no long command configured, long presses use `short`.
    /// Inner `None`: configured but unresolved, long presses do nothing.
    pub long: Option<Option<CommandBinding>>,
    slot: Arc<PressSlot>,
}

impl ButtonChannel {
    pub fn new(
        pin: u8,
        pull: Pull,
        active: Level,
        long_press_ms: u64,
        short: Option<CommandBinding>,
        long: Option<Option<CommandBinding>>,
    ) -> Self {
        ButtonChannel {
            pin,
            pull,
            active,
            long_press_ms,
            short,
            long,
            slot: Arc::new(PressSlot::default()),
        }
    }

    /// Builds the detector that runs inside this button's edge callback.
    pub fn detector(&self, initial: Level, clock: &Clock) -> PressDetector {
        PressDetector::new(self.active, initial, clock.now_ms(), DEBOUNCE_MS, Arc::clone(&self.slot))
    }

    pub fn classify(&self, held_ms: u64) -> Press {
        if held_ms < self.long_press_ms {
            Press::Short
        } else {
            Press::Long
        }
    }

    /// Drains the pending engagement, if any.
    pub fn poll(&self) -> Option<Press> {
        let held = self.slot.take()?;
        let press = self.classify(held);
        info!(pin = self.pin, held_ms = held, ?press, "Button pressed");
        Some(press)
    }

    pub fn binding(&self, press: Press) -> Option<&CommandBinding> {
        let binding = match (press, &self.long) {
            (Press::Long, Some(long)) => long.as_ref(),
            _ => self.short.as_ref(),
        };
        if binding.is_none() {
            debug!(pin = self.pin, ?press, "No command bound, press ignored");
        }
        binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn pause() -> CommandBinding {
        CommandBinding::ProtocolFragment(r#"["pause"]"#.to_string())
    }

    fn channel(long: Option<Option<CommandBinding>>) -> ButtonChannel {
        ButtonChannel::new(17, Pull::Up, Level::Low, 1000, Some(pause()), long)
    }

    fn detector(channel: &ButtonChannel) -> PressDetector {
        PressDetector::new(channel.active, Level::High, 0, DEBOUNCE_MS, Arc::clone(&channel.slot))
    }

    #[test]
    fn short_press_yields_one_short() {
        let button = channel(None);
        let mut d = detector(&button);
        d.on_level(Level::Low, 100);
        assert!(d.is_engaged());
        d.on_level(Level::High, 400);
        assert_eq!(button.poll(), Some(Press::Short));
        assert_eq!(button.poll(), None);
    }

    #[test]
    fn hold_past_threshold_yields_one_long() {
        let button = channel(None);
        let mut d = detector(&button);
        d.on_level(Level::Low, 100);
        d.on_level(Level::High, 1100);
        assert_eq!(button.poll(), Some(Press::Long));
        assert_eq!(button.poll(), None);
    }

    #[test]
    fn repeated_levels_are_absorbed() {
        let button = channel(None);
        let mut d = detector(&button);
        d.on_level(Level::High, 100);
        d.on_level(Level::Low, 200);
        d.on_level(Level::Low, 250);
        d.on_level(Level::Low, 300);
        assert_eq!(button.poll(), None);
        d.on_level(Level::High, 500);
        d.on_level(Level::High, 520);
        assert_eq!(button.poll(), Some(Press::Short));
        assert_eq!(button.poll(), None);
    }

    #[test]
    fn chatter_around_transitions_gives_one_classification() {
        let button = channel(None);
        let mut d = detector(&button);
        // bouncing contact on press
        for (i, t) in (100..120).step_by(2).enumerate() {
            let level = if i % 2 == 0 { Level::Low } else { Level::High };
            d.on_level(level, t);
        }
        d.on_level(Level::Low, 121);
        assert_eq!(button.poll(), None);
        // release, then bounce again
        d.on_level(Level::High, 600);
        for (i, t) in (602..640).step_by(3).enumerate() {
            let level = if i % 2 == 0 { Level::Low } else { Level::High };
            d.on_level(level, t);
        }
        d.on_level(Level::High, 641);
        assert_eq!(button.poll(), Some(Press::Short));
        assert_eq!(button.poll(), None);
    }

    #[test]
    fn glitch_then_short_tap_is_short() {
        let button = channel(None);
        let mut d = detector(&button);
        d.on_level(Level::Low, 100);
        d.on_level(Level::High, 110);
        assert!(!d.is_engaged());
        assert_eq!(button.poll(), None);

        d.on_level(Level::Low, 5000);
        d.on_level(Level::High, 5200);
        assert_eq!(button.poll(), Some(Press::Short));
        assert_eq!(button.poll(), None);
    }

    #[test]
    fn press_settling_after_early_bounce_is_timed_from_settle() {
        let button = channel(None);
        let mut d = detector(&button);
        d.on_level(Level::Low, 100);
        d.on_level(Level::High, 105);
        d.on_level(Level::Low, 110);
        assert!(!d.is_engaged());
        // held low from 110 until the release at 1500
        d.on_level(Level::High, 1500);
        assert_eq!(button.poll(), Some(Press::Long));
        assert_eq!(button.poll(), None);
    }

    #[test]
    fn repress_inside_window_after_release_is_counted() {
        let button = channel(None);
        let mut d = detector(&button);
        d.on_level(Level::Low, 100);
        d.on_level(Level::High, 400);
        assert_eq!(button.poll(), Some(Press::Short));

        // pressed again 20 ms after the release and held
        d.on_level(Level::Low, 420);
        assert!(!d.is_engaged());
        d.on_level(Level::High, 700);
        assert_eq!(button.poll(), Some(Press::Short));
        assert!(!d.is_engaged());
    }

    #[test]
    fn active_high_button() {
        let button = ButtonChannel::new(5, Pull::Down, Level::High, 500, Some(pause()), None);
        let mut d = button.detector(Level::Low, &Clock::manual());
        d.on_level(Level::High, 100);
        d.on_level(Level::Low, 700);
        assert_eq!(button.poll(), Some(Press::Long));
    }

    #[test]
    fn slot_keeps_publish_until_taken() {
        let slot = PressSlot::default();
        assert_eq!(slot.take(), None);
        slot.publish(0);
        assert_eq!(slot.take(), Some(0));
        slot.publish(10);
        slot.publish(20);
        assert_eq!(slot.take(), Some(20));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn long_binding_selection() {
        let script = CommandBinding::ExternalScript(PathBuf::from("/tmp/x.sh"));

        let with_long = channel(Some(Some(script.clone())));
        assert_eq!(with_long.binding(Press::Long), Some(&script));
        assert_eq!(with_long.binding(Press::Short), Some(&pause()));

        let without_long = channel(None);
        assert_eq!(without_long.binding(Press::Long), Some(&pause()));

        let unresolved_long = channel(Some(None));
        assert_eq!(unresolved_long.binding(Press::Long), None);
        assert_eq!(unresolved_long.binding(Press::Short), Some(&pause()));
    }
}
