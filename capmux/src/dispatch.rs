//! The dispatch loop: wait on the registry, route each ready descriptor to
//! its handler, run that handler to completion, repeat.
//!
//! Exactly one handler runs at a time and nothing here is shared with any
//! other thread, so there is no locking anywhere in the loop.

use std::{fmt, os::fd::AsRawFd};

use nix::sys::signal::Signal;
use tracing::{debug, info, trace, warn};

use crate::{
    capture::{self, PacketHeader, PacketSource},
    error::Result,
    registry::{EventRegistry, Events},
    runtime::conf::Conf,
    scheduler::{Alarm, Scheduler},
    signal::SignalChannel,
};

/// Where the agent is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Components are being built; no events are served yet.
    Starting,
    /// Blocked in `wait` or running a handler.
    Running,
    /// A handler asked to stop or failed; teardown is next.
    Stopping,
    /// Teardown finished.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why the loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An accepted signal other than the periodic alarm arrived.
    Signal(i32),
    /// The capture source reported it will deliver no more packets.
    CaptureEnded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal(signo) => match Signal::try_from(*signo) {
                Ok(sig) => write!(f, "received {sig}"),
                Err(_) => write!(f, "received signal {signo}"),
            },
            StopReason::CaptureEnded => write!(f, "capture ended"),
        }
    }
}

enum Flow {
    Continue,
    Stop(StopReason),
}

/// Borrows the constructed components for the duration of one run.
pub struct Dispatcher<'a, S: PacketSource, A: Alarm> {
    conf: &'a Conf,
    registry: &'a EventRegistry,
    signals: &'a SignalChannel,
    capture: &'a mut S,
    scheduler: &'a mut Scheduler<A>,
    packets: &'a mut u64,
}

impl<'a, S: PacketSource, A: Alarm> Dispatcher<'a, S, A> {
    pub fn new(
        conf: &'a Conf,
        registry: &'a EventRegistry,
        signals: &'a SignalChannel,
        capture: &'a mut S,
        scheduler: &'a mut Scheduler<A>,
        packets: &'a mut u64,
    ) -> Self {
        Self {
            conf,
            registry,
            signals,
            capture,
            scheduler,
            packets,
        }
    }

    /// Serve events until a handler asks to stop or fails.
    ///
    /// Ready descriptors are handled in the order the registry reports them;
    /// a failing handler abandons whatever else was reported in the same batch.
    pub fn run(&mut self) -> Result<StopReason> {
        let mut events = Events::with_capacity(self.conf.max_events_per_wait);
        let signal_fd = self.signals.as_raw_fd();
        let capture_fd = self.capture.as_raw_fd();

        loop {
            if self.registry.wait(&mut events, None)? == 0 {
                continue;
            }

            for ready in events.iter() {
                debug!(
                    event.name = "dispatch.fd_ready",
                    fd = ready.fd,
                    readable = ready.is_readable(),
                    error = ready.is_error(),
                    "epoll reports fd {}",
                    ready.fd
                );

                let flow = if ready.fd == signal_fd {
                    self.on_signal()?
                } else if ready.fd == capture_fd {
                    self.on_capture()?
                } else {
                    warn!(
                        event.name = "dispatch.unknown_fd",
                        fd = ready.fd,
                        "readiness reported for a descriptor with no handler"
                    );
                    Flow::Continue
                };

                if let Flow::Stop(reason) = flow {
                    return Ok(reason);
                }
            }
        }
    }

    fn on_signal(&mut self) -> Result<Flow> {
        let Some(info) = self.signals.read_one()? else {
            trace!(
                event.name = "dispatch.signal_spurious",
                "signal channel readable but nothing pending"
            );
            return Ok(Flow::Continue);
        };

        match info.signal() {
            Some(Signal::SIGALRM) => {
                let tick = self.scheduler.on_alarm(&mut *self.capture);
                trace!(
                    event.name = "dispatch.tick",
                    tick = tick.count,
                    stats = tick.stats_queried,
                    "periodic alarm handled"
                );
                Ok(Flow::Continue)
            }
            _ => {
                warn!(
                    event.name = "dispatch.signal_received",
                    signal.number = info.signo,
                    signal.sender_pid = info.sender_pid,
                    "got signal {}",
                    info.signo
                );
                Ok(Flow::Stop(StopReason::Signal(info.signo)))
            }
        }
    }

    fn on_capture(&mut self) -> Result<Flow> {
        let dispatched = capture::dispatch_ready(
            &mut *self.capture,
            self.conf.max_batch,
            |hdr: &PacketHeader, _data: &[u8]| {
                info!(
                    event.name = "capture.packet",
                    packet.len = hdr.len,
                    packet.caplen = hdr.caplen,
                    "packet of length {}",
                    hdr.len
                );
            },
        )?;
        *self.packets += dispatched.count as u64;

        trace!(
            event.name = "dispatch.capture_batch",
            count = dispatched.count,
            max_batch = self.conf.max_batch,
            "capture batch dispatched"
        );

        if dispatched.ended {
            info!(
                event.name = "dispatch.capture_ended",
                packets = *self.packets,
                "capture source has no more packets"
            );
            return Ok(Flow::Stop(StopReason::CaptureEnded));
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::net::UnixStream, time::Duration};

    use super::*;
    use crate::{
        capture::fake::{FakeSource, Probe},
        registry::Interest,
        scheduler::fake::FakeAlarm,
        signal::SignalSet,
    };

    #[test]
    fn readiness_on_a_descriptor_without_a_handler_is_skipped() {
        let conf = Conf {
            max_events_per_wait: 4,
            ..Conf::default()
        };
        let signals = SignalChannel::create(SignalSet::accepted()).expect("channel");
        let mut registry = EventRegistry::create().expect("registry");

        let (stray, mut peer) = UnixStream::pair().expect("pair");
        peer.write_all(b"x").expect("write");
        registry
            .register(stray.as_raw_fd(), Interest::Readable)
            .expect("register stray");
        registry
            .register(signals.as_raw_fd(), Interest::Readable)
            .expect("register signals");

        let probe = Probe::default();
        let mut capture = FakeSource::new(probe.clone());
        capture.end_when_drained = true;
        capture.push(vec![0; 60]);
        registry
            .register(capture.as_raw_fd(), Interest::Readable)
            .expect("register capture");

        let mut scheduler = Scheduler::new(FakeAlarm::silent(), Duration::from_secs(1), 10);
        let mut packets = 0;
        let reason = Dispatcher::new(
            &conf,
            &registry,
            &signals,
            &mut capture,
            &mut scheduler,
            &mut packets,
        )
        .run()
        .expect("stray readiness is not an error");

        assert_eq!(reason, StopReason::CaptureEnded);
        assert_eq!(packets, 1);
        assert_eq!(probe.delivered.get(), 1);
    }

    #[test]
    fn stop_reason_names_the_signal() {
        assert_eq!(
            StopReason::Signal(libc::SIGINT).to_string(),
            "received SIGINT"
        );
        assert_eq!(StopReason::CaptureEnded.to_string(), "capture ended");
    }

    #[test]
    fn states_display_lowercase() {
        assert_eq!(LoopState::Running.to_string(), "running");
        assert_eq!(LoopState::Stopped.to_string(), "stopped");
    }
}
