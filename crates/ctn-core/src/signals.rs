//! Termination handling and the signal-blocked critical section.
//!
//! The handler never touches sessions. It flips the stop flag in [`Cx`];
//! code unwinds at its next checkpoint and the owning [`Runtime`] closes
//! every session on the way out.
//!
//! `ctrlc` runs the handler on its own thread, which a per-thread signal
//! mask cannot reach. Critical sections are therefore also counted
//! process-wide: while any is open, the abort that a second signal would
//! trigger is held back and carried out when the last section closes.
//!
//! [`Runtime`]: crate::Runtime

use ctn_error::{CtnError, Result};
use ctn_types::Cx;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

/// Open critical sections and whether an abort is waiting on them.
#[derive(Debug)]
struct CriticalSections {
    depth: AtomicUsize,
    abort_pending: AtomicBool,
}

/// What the handler did with one termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// First signal: stop requested.
    Stop,
    /// Second signal inside a critical section: abort held back.
    Deferred,
    Abort,
}

impl CriticalSections {
    const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            abort_pending: AtomicBool::new(false),
        }
    }

    fn enter(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    /// Close one section. True when it was the last one and an abort is
    /// pending.
    fn leave(&self) -> bool {
        self.depth.fetch_sub(1, Ordering::SeqCst) == 1 && self.abort_pending.load(Ordering::SeqCst)
    }

    fn on_termination(&self, cx: &Cx) -> Termination {
        if !cx.stop_requested() {
            cx.request_stop();
            return Termination::Stop;
        }
        // Published before the depth check so a section closing concurrently
        // either sees the flag or leaves depth at zero for us.
        self.abort_pending.store(true, Ordering::SeqCst);
        if self.depth.load(Ordering::SeqCst) > 0 {
            Termination::Deferred
        } else {
            Termination::Abort
        }
    }
}

static CRITICAL: CriticalSections = CriticalSections::new();

/// Route SIGINT, SIGTERM and SIGHUP to `cx`. A second signal while the first
/// is still being honored aborts the process, once no critical section is
/// open.
pub fn install_termination_handler(cx: &Cx) -> Result<()> {
    install_with(cx, &CRITICAL)
}

fn install_with(cx: &Cx, sections: &'static CriticalSections) -> Result<()> {
    let cx = cx.clone();
    ctrlc::set_handler(move || {
        if sections.on_termination(&cx) == Termination::Abort {
            std::process::abort();
        }
    })
    .map_err(|err| CtnError::Internal(format!("cannot install signal handler: {err}")))
}

/// Every signal except SIGTRAP and SIGSEGV.
fn critical_set() -> SigSet {
    let mut set = SigSet::all();
    set.remove(Signal::SIGTRAP);
    set.remove(Signal::SIGSEGV);
    set
}

/// Signals stay blocked on this thread, and a termination abort stays
/// deferred process-wide, while the guard lives. The previous mask comes
/// back on drop.
#[derive(Debug)]
#[must_use = "signals are unblocked as soon as the guard is dropped"]
pub struct SignalBlock {
    previous: SigSet,
    sections: &'static CriticalSections,
}

impl SignalBlock {
    pub fn new() -> Result<Self> {
        Self::enter(&CRITICAL)
    }

    fn enter(sections: &'static CriticalSections) -> Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&critical_set()), Some(&mut previous))
            .map_err(|errno| CtnError::Io(errno.into()))?;
        sections.enter();
        Ok(Self { previous, sections })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(%errno, "could not restore signal mask");
        }
        if self.sections.leave() {
            std::process::abort();
        }
    }
}

/// Run `f` with signals blocked.
pub fn with_signals_blocked<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _block = SignalBlock::new()?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::time::{Duration, Instant};

    fn current_mask() -> SigSet {
        SigSet::thread_get_mask().expect("mask")
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn block_masks_termination_but_not_faults() {
        let before = current_mask();
        {
            let _block = SignalBlock::new().expect("block");
            let mask = current_mask();
            assert!(mask.contains(Signal::SIGTERM));
            assert!(mask.contains(Signal::SIGINT));
            assert!(!mask.contains(Signal::SIGSEGV));
            assert!(!mask.contains(Signal::SIGTRAP));
        }
        assert_eq!(current_mask().contains(Signal::SIGTERM), before.contains(Signal::SIGTERM));
    }

    #[test]
    fn closure_result_passes_through() {
        let value = with_signals_blocked(|| Ok(7)).expect("value");
        assert_eq!(value, 7);
        let err = with_signals_blocked(|| -> Result<()> { Err(CtnError::ReadOnly) }).unwrap_err();
        assert!(matches!(err, CtnError::ReadOnly));
    }

    #[test]
    fn second_signal_aborts_only_outside_critical_sections() {
        let sections = CriticalSections::new();
        let cx = Cx::for_testing();
        assert_eq!(sections.on_termination(&cx), Termination::Stop);
        assert!(cx.stop_requested());
        assert!(!sections.abort_pending.load(Ordering::SeqCst));

        sections.enter();
        sections.enter();
        assert_eq!(sections.on_termination(&cx), Termination::Deferred);
        assert!(!sections.leave(), "inner section must not abort");
        assert!(sections.leave(), "last section carries out the abort");

        let idle = CriticalSections::new();
        let stopped = Cx::for_testing();
        stopped.request_stop();
        assert_eq!(idle.on_termination(&stopped), Termination::Abort);
    }

    #[test]
    fn sections_without_a_pending_abort_close_quietly() {
        let sections = CriticalSections::new();
        sections.enter();
        assert!(!sections.leave());
    }

    static DELIVERY: CriticalSections = CriticalSections::new();

    #[test]
    fn delivered_signals_inside_a_block_are_deferred() {
        let cx = Cx::for_testing();
        install_with(&cx, &DELIVERY).expect("handler");

        let block = SignalBlock::enter(&DELIVERY).expect("block");
        kill(Pid::this(), Signal::SIGTERM).expect("first signal");
        wait_for("stop request", || cx.stop_requested());
        kill(Pid::this(), Signal::SIGTERM).expect("second signal");
        wait_for("deferred abort", || DELIVERY.abort_pending.load(Ordering::SeqCst));

        // Still running: the handler held the abort back. Withdraw it so
        // leaving the block does not end the test process.
        DELIVERY.abort_pending.store(false, Ordering::SeqCst);
        drop(block);
        assert_eq!(DELIVERY.depth.load(Ordering::SeqCst), 0);
    }
}
