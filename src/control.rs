use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channels::ChannelSet;
use crate::clock::Clock;
use crate::commands::CommandBinding;
use crate::discovery::{Discovery, ServerLocation};
use crate::error::TransportError;
use crate::transport::{CommandTransport, ScriptRunner};

pub const LOOP_QUANTUM: Duration = Duration::from_millis(100);

/// The single-threaded dispatch loop: discovery, buttons, encoders, sleep.
pub struct Controller<T, R> {
    channels: ChannelSet,
    discovery: Discovery,
    transport: T,
    scripts: R,
}

fn dispatch<T: CommandTransport, R: ScriptRunner>(
    transport: &mut T,
    scripts: &mut R,
    binding: &CommandBinding,
    server: &ServerLocation,
) -> Result<(), TransportError> {
    match binding {
        CommandBinding::ProtocolFragment(fragment) => transport.send(fragment, server),
        CommandBinding::ExternalScript(path) => scripts.run(path),
    }
}

impl<T: CommandTransport, R: ScriptRunner> Controller<T, R> {
    pub fn new(channels: ChannelSet, discovery: Discovery, transport: T, scripts: R) -> Self {
        Controller {
            channels,
            discovery,
            transport,
            scripts,
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn scripts(&self) -> &R {
        &self.scripts
    }

    /// One loop iteration without the sleep.
    pub fn run_cycle(&mut self, now_ms: u64) {
        self.discovery.poll(now_ms);
        let server = self.discovery.location();

        for button in self.channels.buttons() {
            let Some(press) = button.poll() else {
                continue;
            };
            let Some(binding) = button.binding(press) else {
                continue;
            };
            if let Err(e) = dispatch(&mut self.transport, &mut self.scripts, binding, server) {
                warn!(pin = button.pin, ?press, "Command failed: {}", e);
            }
        }

        for encoder in self.channels.encoders_mut() {
            let Some(pending) = encoder.poll(now_ms) else {
                continue;
            };
            match self.transport.send(&pending.fragment, server) {
                Ok(()) => encoder.commit(&pending, now_ms),
                Err(e) => warn!(pin_a = encoder.pin_a, pin_b = encoder.pin_b, "Command failed, will retry: {}", e),
            }
        }
    }

    /// Runs until `stop` is set. The flag is checked once per iteration.
    pub fn run(&mut self, clock: &Clock, stop: &AtomicBool, quantum: Duration) {
        info!("Control loop started");
        while !stop.load(Ordering::Acquire) {
            self.run_cycle(clock.now_ms());
            thread::sleep(quantum);
        }
        debug!(status = ?self.discovery.status(), "Control loop stopped");
    }
}
