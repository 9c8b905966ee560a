//! Startup ordering, the hand-off to the dispatch loop, and teardown.
//!
//! Startup order matters: signals are masked before the channel exists, and
//! the capture descriptor is registered only once its filter is in place.
//! Teardown disposes of whatever was actually built, so it is safe after a
//! partial startup and safe to call twice.

use std::os::fd::AsRawFd;

use tracing::{debug, error, info};

use crate::{
    capture::PacketSource,
    dispatch::{Dispatcher, LoopState, StopReason},
    error::Result,
    registry::{EventRegistry, Interest},
    runtime::conf::Conf,
    scheduler::{Alarm, Scheduler},
    signal::{self, SignalChannel, SignalSet},
};

pub struct Lifecycle<'c, S: PacketSource, A: Alarm> {
    conf: &'c Conf,
    states: Vec<LoopState>,
    signals: Option<SignalChannel>,
    registry: Option<EventRegistry>,
    capture: Option<S>,
    scheduler: Scheduler<A>,
    packets: u64,
    teardowns: u32,
}

impl<'c, S: PacketSource, A: Alarm> Lifecycle<'c, S, A> {
    pub fn new(conf: &'c Conf, alarm: A) -> Self {
        Self {
            conf,
            states: vec![LoopState::Starting],
            signals: None,
            registry: None,
            capture: None,
            scheduler: Scheduler::new(alarm, conf.tick_interval, conf.stats_every_ticks),
            packets: 0,
            teardowns: 0,
        }
    }

    /// Build everything with `open` supplying the capture source, serve
    /// events until the loop stops, then tear down on every path.
    pub fn run<O>(&mut self, open: O) -> Result<StopReason>
    where
        O: FnOnce(&Conf) -> Result<S>,
    {
        let outcome = match self.start(open) {
            Ok(mut dispatcher) => {
                let outcome = dispatcher.run();
                match &outcome {
                    Ok(reason) => info!(
                        event.name = "lifecycle.stop_requested",
                        reason = %reason,
                        "stopping"
                    ),
                    Err(e) => error!(
                        event.name = "lifecycle.loop_failed",
                        error = %e,
                        "dispatch loop stopped on error"
                    ),
                }
                outcome
            }
            Err(e) => {
                error!(
                    event.name = "lifecycle.startup_failed",
                    error = %e,
                    "startup failed"
                );
                Err(e)
            }
        };

        if self.state() == LoopState::Running {
            self.transition(LoopState::Stopping);
        }
        self.teardown();
        outcome
    }

    /// Steps (a) through (h), then the switch to `Running`. The returned
    /// dispatcher borrows the components that were just built.
    ///
    /// On error, whatever was built stays in place for [`Lifecycle::teardown`].
    pub(crate) fn start<O>(&mut self, open: O) -> Result<Dispatcher<'_, S, A>>
    where
        O: FnOnce(&Conf) -> Result<S>,
    {
        info!(
            event.name = "lifecycle.starting",
            network.interface.name = %self.conf.interface,
            filter = self.conf.filter_expr().unwrap_or(""),
            snaplen = self.conf.snaplen,
            verbose = self.conf.verbose,
            max_batch = self.conf.max_batch,
            "starting capture agent"
        );

        signal::block_all()?;

        let signals = self
            .signals
            .insert(SignalChannel::create(SignalSet::accepted())?);

        let registry = self.registry.insert(EventRegistry::create()?);
        registry.register(signals.as_raw_fd(), Interest::Readable)?;

        let capture = self.capture.insert(open(self.conf)?);
        capture.attach_filter(self.conf.filter_expr())?;
        registry.register(capture.as_raw_fd(), Interest::Readable)?;

        self.scheduler.start();

        record(&mut self.states, LoopState::Running);
        info!(
            event.name = "lifecycle.running",
            "capture agent running"
        );

        Ok(Dispatcher::new(
            self.conf,
            registry,
            signals,
            capture,
            &mut self.scheduler,
            &mut self.packets,
        ))
    }

    /// Release the capture session, then the registry and signal channel.
    /// Only components that were constructed are touched.
    pub fn teardown(&mut self) {
        if self.state() == LoopState::Stopped {
            return;
        }

        if let Some(capture) = self.capture.take() {
            debug!(
                event.name = "lifecycle.capture_closed",
                fd = capture.as_raw_fd(),
                "closing capture session"
            );
            drop(capture);
        }
        self.registry = None;
        self.signals = None;

        self.teardowns += 1;
        self.transition(LoopState::Stopped);
        info!(
            event.name = "lifecycle.stopped",
            packets = self.packets,
            "capture agent stopped"
        );
    }

    fn transition(&mut self, next: LoopState) {
        record(&mut self.states, next);
    }

    pub fn state(&self) -> LoopState {
        *self.states.last().unwrap_or(&LoopState::Starting)
    }

    /// Every state passed through, in order.
    pub fn states(&self) -> &[LoopState] {
        &self.states
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn ticks(&self) -> u64 {
        self.scheduler.ticks()
    }

    pub fn teardowns(&self) -> u32 {
        self.teardowns
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> Option<&EventRegistry> {
        self.registry.as_ref()
    }
}

fn record(states: &mut Vec<LoopState>, next: LoopState) {
    debug!(
        event.name = "lifecycle.state_changed",
        from = %states.last().copied().unwrap_or(LoopState::Starting),
        to = %next,
        "lifecycle state changed"
    );
    states.push(next);
}

impl<S: PacketSource, A: Alarm> Drop for Lifecycle<'_, S, A> {
    fn drop(&mut self) {
        self.teardown();
    }
}
