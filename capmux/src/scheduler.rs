//! Periodic work driven by `SIGALRM`.
//!
//! There is no timer thread: a one-shot `alarm(2)` is armed at startup and
//! re-armed every time its signal comes back through the signal channel.

use std::time::Duration;

use tracing::{info, trace, warn};

use crate::capture::{CaptureStats, PacketSource};

/// Something that delivers `SIGALRM` once after a delay.
pub trait Alarm {
    fn arm(&mut self, after: Duration);
}

/// The process-wide `alarm(2)` timer.
#[derive(Debug, Default)]
pub struct SystemAlarm;

impl Alarm for SystemAlarm {
    fn arm(&mut self, after: Duration) {
        let secs = after.as_secs().clamp(1, u64::from(u32::MAX)) as libc::c_uint;
        // SAFETY: alarm(2) has no failure mode and touches no memory.
        unsafe { libc::alarm(secs) };
    }
}

type Task = Box<dyn FnMut(u64)>;

/// Tick bookkeeping plus the statistics cadence.
pub struct Scheduler<A: Alarm> {
    alarm: A,
    interval: Duration,
    stats_every: u64,
    ticks: u64,
    last_stats: Option<CaptureStats>,
    tasks: Vec<Task>,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub count: u64,
    pub stats_queried: bool,
}

impl<A: Alarm> Scheduler<A> {
    pub fn new(alarm: A, interval: Duration, stats_every: u64) -> Self {
        Self {
            alarm,
            interval,
            stats_every: stats_every.max(1),
            ticks: 0,
            last_stats: None,
            tasks: Vec::new(),
        }
    }

    /// Register maintenance work run on every tick, before the counter moves.
    pub fn add_task(&mut self, task: impl FnMut(u64) + 'static) {
        self.tasks.push(Box::new(task));
    }

    /// Arm the first alarm.
    pub fn start(&mut self) {
        trace!(
            event.name = "scheduler.armed",
            interval = ?self.interval,
            "arming first periodic alarm"
        );
        self.alarm.arm(self.interval);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Handle one accepted `SIGALRM`.
    ///
    /// A failed statistics query is logged and skipped; it never stops the loop.
    pub fn on_alarm<S: PacketSource + ?Sized>(&mut self, source: &mut S) -> Tick {
        for task in &mut self.tasks {
            task(self.ticks);
        }

        self.ticks = self.ticks.wrapping_add(1);
        let stats_queried = self.ticks % self.stats_every == 0;
        if stats_queried {
            self.emit_stats(source);
        }

        // alarm(2) is one-shot
        self.alarm.arm(self.interval);

        Tick {
            count: self.ticks,
            stats_queried,
        }
    }

    fn emit_stats<S: PacketSource + ?Sized>(&mut self, source: &mut S) {
        match source.stats() {
            Ok(now) => {
                let delta = self.last_stats.map_or(now, |prev| now.since(&prev));
                info!(
                    event.name = "scheduler.capture_stats",
                    tick = self.ticks,
                    capture.received = now.received,
                    capture.dropped = now.dropped,
                    capture.if_dropped = now.if_dropped,
                    capture.received_delta = delta.received,
                    capture.dropped_delta = delta.dropped,
                    "received: {}, dropped: {}",
                    now.received,
                    now.dropped
                );
                self.last_stats = Some(now);
            }
            Err(e) => {
                warn!(
                    event.name = "scheduler.stats_failed",
                    tick = self.ticks,
                    error = %e,
                    "failed to read capture statistics, skipping"
                );
            }
        }
    }
}
