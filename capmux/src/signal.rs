//! Synchronous signal delivery through a `signalfd`.
//!
//! Every signal is blocked from asynchronous delivery before the channel is
//! created; the accepted ones are then only ever seen as readable events on
//! the channel's descriptor, never inside a handler.

use std::{
    fmt, io, mem,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use libc::{SFD_CLOEXEC, SFD_NONBLOCK, c_void, signalfd, signalfd_siginfo};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Signals the agent takes through its channel. Anything else stays blocked.
pub const ACCEPTED_SIGNALS: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGALRM,
];

/// Block every blockable signal for the calling thread.
///
/// Called while the process is still single-threaded so the mask is inherited
/// by anything created later. `SIGKILL` and `SIGSTOP` are silently left alone
/// by the kernel.
pub fn block_all() -> Result<()> {
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None)
        .map_err(|e| Error::system("sigprocmask", io::Error::from(e)))?;
    debug!(
        event.name = "signal.mask_installed",
        "all signals blocked from asynchronous delivery"
    );
    Ok(())
}

/// The set of signals a [`SignalChannel`] reports.
#[derive(Clone)]
pub struct SignalSet {
    mask: SigSet,
    members: Vec<Signal>,
}

impl SignalSet {
    pub fn new(signals: &[Signal]) -> Self {
        let mut mask = SigSet::empty();
        for &sig in signals {
            mask.add(sig);
        }
        Self {
            mask,
            members: signals.to_vec(),
        }
    }

    /// Hang-up, terminate, interrupt, quit and the periodic alarm.
    pub fn accepted() -> Self {
        Self::new(&ACCEPTED_SIGNALS)
    }

    pub fn contains(&self, sig: Signal) -> bool {
        self.mask.contains(sig)
    }

    pub fn members(&self) -> &[Signal] {
        &self.members
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members.iter()).finish()
    }
}

/// One record read from the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    /// Raw signal number (`ssi_signo`).
    pub signo: i32,
    /// Sending process, zero for kernel-generated signals such as `SIGALRM`.
    pub sender_pid: u32,
}

impl SignalInfo {
    pub fn signal(&self) -> Option<Signal> {
        Signal::try_from(self.signo).ok()
    }
}

impl From<&signalfd_siginfo> for SignalInfo {
    fn from(raw: &signalfd_siginfo) -> Self {
        Self {
            signo: raw.ssi_signo as i32,
            sender_pid: raw.ssi_pid,
        }
    }
}

/// Owns a non-blocking `signalfd`; the descriptor is closed on drop.
pub struct SignalChannel {
    fd: OwnedFd,
}

impl SignalChannel {
    /// Create the channel for `set`.
    ///
    /// The caller must already have blocked every member of `set`, otherwise
    /// a signal may be delivered asynchronously instead of through the channel.
    pub fn create(set: SignalSet) -> Result<Self> {
        // SAFETY: the mask pointer comes from a live SigSet; -1 asks for a new descriptor.
        let fd = unsafe { signalfd(-1, set.mask.as_ref(), SFD_NONBLOCK | SFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error("signalfd"));
        }
        // SAFETY: signalfd just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        debug!(
            event.name = "signal.channel_created",
            fd = fd.as_raw_fd(),
            signals = ?set,
            "signal channel created"
        );

        Ok(Self { fd })
    }

    /// Consume one pending signal.
    ///
    /// Returns `Ok(None)` when nothing is pending any more: the kernel may
    /// coalesce several identical signals into one notification, so a
    /// readiness report is not a promise of a record.
    pub fn read_one(&self) -> Result<Option<SignalInfo>> {
        // SAFETY: signalfd_siginfo is plain old data, all-zero is a valid value.
        let mut raw: signalfd_siginfo = unsafe { mem::zeroed() };
        let size = mem::size_of::<signalfd_siginfo>();

        // SAFETY: fd is a valid signalfd and raw is a writable buffer of exactly `size` bytes.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut raw as *mut signalfd_siginfo as *mut c_void,
                size,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(Error::system("read signalfd", err)),
            };
        }
        if n as usize != size {
            return Err(Error::system(
                "read signalfd",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("failed to read signal fd buffer: got {n} of {size} bytes"),
                ),
            ));
        }

        let info = SignalInfo::from(&raw);
        trace!(
            event.name = "signal.record_read",
            signal.number = info.signo,
            signal.sender_pid = info.sender_pid,
            "signal record read from channel"
        );
        Ok(Some(info))
    }
}

impl AsRawFd for SignalChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SignalChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}


#[cfg(test)]
mod tests {
    use nix::sys::signal::raise;

    use super::{test_support::MaskGuard, *};

    #[test]
    fn accepted_set_has_exactly_the_five_signals() {
        let set = SignalSet::accepted();
        for sig in ACCEPTED_SIGNALS {
            assert!(set.contains(sig), "{sig} should be accepted");
        }
        assert!(!set.contains(Signal::SIGUSR1));
        assert!(!set.contains(Signal::SIGPIPE));
        assert_eq!(set.members().len(), 5);
    }

    #[test]
    fn record_keeps_the_signal_and_its_sender() {
        // SAFETY: signalfd_siginfo is plain old data.
        let mut raw: signalfd_siginfo = unsafe { mem::zeroed() };
        raw.ssi_signo = libc::SIGTERM as u32;
        raw.ssi_pid = 4242;
        raw.ssi_uid = 1000;

        let info = SignalInfo::from(&raw);
        assert_eq!(
            info,
            SignalInfo {
                signo: libc::SIGTERM,
                sender_pid: 4242,
            }
        );
        assert_eq!(info.signal(), Some(Signal::SIGTERM));
    }

    #[test]
    fn empty_channel_reads_nothing() {
        let _guard = MaskGuard::save();
        block_all().expect("block");

        let channel = SignalChannel::create(SignalSet::accepted()).expect("channel");
        assert_eq!(channel.read_one().expect("read"), None);
    }

    #[test]
    fn pending_signal_is_read_as_one_record() {
        let _guard = MaskGuard::save();
        block_all().expect("block");

        let channel = SignalChannel::create(SignalSet::accepted()).expect("channel");
        raise(Signal::SIGINT).expect("raise");

        let info = channel.read_one().expect("read").expect("a record");
        assert_eq!(info.signal(), Some(Signal::SIGINT));
        assert_eq!(channel.read_one().expect("read"), None);
    }

    #[test]
    fn repeated_identical_signals_may_coalesce() {
        let _guard = MaskGuard::save();
        block_all().expect("block");

        let channel = SignalChannel::create(SignalSet::accepted()).expect("channel");
        raise(Signal::SIGALRM).expect("raise");
        raise(Signal::SIGALRM).expect("raise");

        let mut seen = 0;
        while let Some(info) = channel.read_one().expect("read") {
            assert_eq!(info.signal(), Some(Signal::SIGALRM));
            seen += 1;
        }
        assert!((1..=2).contains(&seen));
    }

    #[test]
    fn signals_outside_the_set_are_never_observed() {
        let _guard = MaskGuard::save();
        block_all().expect("block");

        let channel = SignalChannel::create(SignalSet::accepted()).expect("channel");
        // blocked, so the thread survives the default "terminate" action
        raise(Signal::SIGUSR1).expect("raise");
        assert_eq!(channel.read_one().expect("read"), None);

        // drain it so nothing is left pending on this thread
        let drain = SignalChannel::create(SignalSet::new(&[Signal::SIGUSR1])).expect("channel");
        let info = drain.read_one().expect("read").expect("pending SIGUSR1");
        assert_eq!(info.signal(), Some(Signal::SIGUSR1));
    }
}
