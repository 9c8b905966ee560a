//! Live capture source: a libpcap session exposed as a pollable descriptor
//! plus a bounded delivery step.

use std::{
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use pcap::{Active, Capture};
use tracing::{debug, info};

use crate::error::{Error, FilterStage, Result};

/// libpcap's `MAXIMUM_SNAPLEN`.
pub const MAX_SNAPLEN: u32 = 262_144;

/// Fixed per-packet header handed to the packet callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Bytes actually captured (bounded by the snapshot length).
    pub caplen: u32,
    /// Length of the packet on the wire.
    pub len: u32,
    /// Capture time since the Unix epoch.
    pub ts: Duration,
}

impl From<&pcap::PacketHeader> for PacketHeader {
    fn from(hdr: &pcap::PacketHeader) -> Self {
        let secs = u64::try_from(hdr.ts.tv_sec).unwrap_or(0);
        let micros = u32::try_from(hdr.ts.tv_usec).unwrap_or(0);
        Self {
            caplen: hdr.caplen,
            len: hdr.len,
            ts: Duration::new(secs, micros.saturating_mul(1_000)),
        }
    }
}

/// Counters maintained by the capture layer. They only ever grow, modulo the
/// 32-bit wrap libpcap allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
    pub if_dropped: u32,
}

impl CaptureStats {
    /// Counts accumulated since `earlier` was read.
    pub fn since(&self, earlier: &CaptureStats) -> CaptureStats {
        CaptureStats {
            received: self.received.wrapping_sub(earlier.received),
            dropped: self.dropped.wrapping_sub(earlier.dropped),
            if_dropped: self.if_dropped.wrapping_sub(earlier.if_dropped),
        }
    }
}

impl From<pcap::Stat> for CaptureStats {
    fn from(stat: pcap::Stat) -> Self {
        Self {
            received: stat.received,
            dropped: stat.dropped,
            if_dropped: stat.if_dropped,
        }
    }
}

/// Result of asking a source for its next packet.
pub enum NextPacket<'a> {
    Packet(PacketHeader, &'a [u8]),
    /// Nothing buffered right now; wait for the next readiness event.
    Drained,
    /// The source will never deliver again.
    Ended,
}

/// A packet source the dispatch loop can wait on and drain.
pub trait PacketSource: AsRawFd {
    /// Compile and install `filter`. `None` or a blank expression captures everything.
    fn attach_filter(&mut self, filter: Option<&str>) -> Result<()>;

    /// Fetch one packet without blocking.
    fn next_packet(&mut self) -> Result<NextPacket<'_>>;

    fn stats(&mut self) -> Result<CaptureStats>;
}

/// Outcome of one [`dispatch_ready`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    pub count: usize,
    pub ended: bool,
}

/// Deliver up to `max_batch` packets to `on_packet`, in arrival order.
///
/// Stops early when the source has nothing more buffered, so one call never
/// blocks and never starves the other registered sources.
pub fn dispatch_ready<S, F>(source: &mut S, max_batch: usize, mut on_packet: F) -> Result<Dispatched>
where
    S: PacketSource + ?Sized,
    F: FnMut(&PacketHeader, &[u8]),
{
    let mut out = Dispatched::default();
    while out.count < max_batch {
        match source.next_packet()? {
            NextPacket::Packet(hdr, data) => {
                on_packet(&hdr, data);
                out.count += 1;
            }
            NextPacket::Drained => break,
            NextPacket::Ended => {
                out.ended = true;
                break;
            }
        }
    }
    Ok(out)
}

/// An open, non-blocking live capture on one device.
pub struct CaptureSession {
    device: String,
    capture: Capture<Active>,
}

impl CaptureSession {
    /// Open `device` for live capture with a zero read timeout and switch the
    /// handle to non-blocking mode.
    pub fn open(device: &str, snaplen: u32, promiscuous: bool) -> Result<Self> {
        let snaplen = i32::try_from(snaplen.min(MAX_SNAPLEN)).unwrap_or(i32::MAX);
        let capture = Capture::from_device(device)
            .map_err(|e| Error::capture_open(device, e))?
            .snaplen(snaplen)
            .promisc(promiscuous)
            .timeout(0)
            .open()
            .map_err(|e| Error::capture_open(device, e))?
            .setnonblock()
            .map_err(|e| Error::capture_open(device, e))?;

        info!(
            event.name = "capture.opened",
            network.interface.name = %device,
            snaplen,
            promiscuous,
            fd = capture.as_raw_fd(),
            "capture session opened"
        );

        Ok(Self {
            device: device.to_string(),
            capture,
        })
    }
}

impl PacketSource for CaptureSession {
    fn attach_filter(&mut self, filter: Option<&str>) -> Result<()> {
        let Some(expr) = filter.map(str::trim).filter(|e| !e.is_empty()) else {
            return Ok(());
        };

        // a syntax error is reported as a compile failure, anything else
        // pcap_setfilter refuses as an attach failure
        let program = self
            .capture
            .compile(expr, false)
            .map_err(|e| Error::filter(FilterStage::Compile, expr, e))?;
        self.capture
            .filter(expr, false)
            .map_err(|e| Error::filter(FilterStage::Attach, expr, e))?;

        debug!(
            event.name = "capture.filter_attached",
            network.interface.name = %self.device,
            filter = %expr,
            instructions = program.get_instructions().len(),
            "capture filter attached"
        );
        Ok(())
    }

    fn next_packet(&mut self) -> Result<NextPacket<'_>> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(NextPacket::Packet(PacketHeader::from(packet.header), packet.data)),
            Err(pcap::Error::TimeoutExpired) => Ok(NextPacket::Drained),
            Err(pcap::Error::NoMorePackets) => Ok(NextPacket::Ended),
            Err(e) => Err(Error::CaptureDispatch(e.to_string())),
        }
    }

    fn stats(&mut self) -> Result<CaptureStats> {
        self.capture
            .stats()
            .map(CaptureStats::from)
            .map_err(|e| Error::StatsRead(e.to_string()))
    }
}

impl AsRawFd for CaptureSession {
    fn as_raw_fd(&self) -> RawFd {
        self.capture.as_raw_fd()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory packet source whose readiness descriptor is an eventfd.

    use std::{
        cell::Cell,
        collections::VecDeque,
        mem,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        rc::Rc,
        time::Duration,
    };

    use libc::{EFD_CLOEXEC, EFD_NONBLOCK, c_void, eventfd};

    use super::*;

    /// Observations that outlive the source (it is dropped at teardown).
    #[derive(Default, Clone)]
    pub struct Probe {
        pub stats_calls: Rc<Cell<u32>>,
        pub delivered: Rc<Cell<u32>>,
        pub dropped: Rc<Cell<bool>>,
    }

    pub struct FakeSource {
        ready: OwnedFd,
        queue: VecDeque<Vec<u8>>,
        current: Vec<u8>,
        pub end_when_drained: bool,
        pub fail_reads: bool,
        pub fail_stats: bool,
        pub reject_filter: bool,
        pub received: u32,
        probe: Probe,
    }

    impl FakeSource {
        pub fn new(probe: Probe) -> Self {
            // SAFETY: eventfd takes no pointers; result checked below.
            let fd = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
            assert!(fd >= 0, "eventfd: {}", std::io::Error::last_os_error());
            Self {
                // SAFETY: freshly created descriptor, owned here only.
                ready: unsafe { OwnedFd::from_raw_fd(fd) },
                queue: VecDeque::new(),
                current: Vec::new(),
                end_when_drained: false,
                fail_reads: false,
                fail_stats: false,
                reject_filter: false,
                received: 0,
                probe,
            }
        }

        pub fn push(&mut self, packet: Vec<u8>) {
            self.queue.push_back(packet);
            self.poke();
        }

        /// Make the descriptor readable without queueing anything.
        pub fn poke(&self) {
            let one: u64 = 1;
            // SAFETY: valid eventfd, 8-byte buffer.
            unsafe {
                libc::write(
                    self.ready.as_raw_fd(),
                    &one as *const u64 as *const c_void,
                    mem::size_of::<u64>(),
                )
            };
        }

        fn clear(&self) {
            let mut val: u64 = 0;
            // SAFETY: valid eventfd, 8-byte buffer; EAGAIN when already clear is fine.
            unsafe {
                libc::read(
                    self.ready.as_raw_fd(),
                    &mut val as *mut u64 as *mut c_void,
                    mem::size_of::<u64>(),
                )
            };
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.probe.dropped.set(true);
        }
    }

    impl PacketSource for FakeSource {
        fn attach_filter(&mut self, filter: Option<&str>) -> Result<()> {
            match filter.map(str::trim).filter(|e| !e.is_empty()) {
                Some(expr) if self.reject_filter => Err(Error::filter(
                    FilterStage::Compile,
                    expr,
                    "syntax error",
                )),
                _ => Ok(()),
            }
        }

        fn next_packet(&mut self) -> Result<NextPacket<'_>> {
            if self.fail_reads {
                return Err(Error::CaptureDispatch("The interface went down".into()));
            }
            match self.queue.pop_front() {
                Some(packet) => {
                    self.current = packet;
                    self.received += 1;
                    self.probe.delivered.set(self.probe.delivered.get() + 1);
                    let len = self.current.len() as u32;
                    let hdr = PacketHeader {
                        caplen: len,
                        len,
                        ts: Duration::from_secs(1_700_000_000),
                    };
                    Ok(NextPacket::Packet(hdr, &self.current))
                }
                None => {
                    self.clear();
                    if self.end_when_drained {
                        Ok(NextPacket::Ended)
                    } else {
                        Ok(NextPacket::Drained)
                    }
                }
            }
        }

        fn stats(&mut self) -> Result<CaptureStats> {
            self.probe.stats_calls.set(self.probe.stats_calls.get() + 1);
            if self.fail_stats {
                return Err(Error::StatsRead("Operation not supported".into()));
            }
            Ok(CaptureStats {
                received: self.received,
                dropped: 0,
                if_dropped: 0,
            })
        }
    }

    impl AsRawFd for FakeSource {
        fn as_raw_fd(&self) -> RawFd {
            self.ready.as_raw_fd()
        }
    }
}
