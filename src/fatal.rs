use core::sync::atomic::{AtomicUsize, Ordering};

/// The subsystem that detected an unrecoverable invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A scheduler ready structure was found corrupted.
    Scheduler,

    /// A watchdog header operation hit an impossible state, e.g. a
    /// double insertion of the same pending entry.
    Watchdog,

    /// The thread-queue protocol observed a wait-state transition that
    /// the handshake cannot produce.
    ThreadQueue,

    /// The per-processor job mechanism lost a job or a completion.
    Smp,

    /// A fixed table was corrupted or an identifier check failed in a
    /// context where the caller had already validated it.
    Internal,
}

/// A hook invoked right before the system halts, so the embedder can log
/// or persist the failure. The hook must not block and must not call back
/// into the core; the system state is undefined at this point.
pub type Hook = fn(Source, u32);

static HOOK: AtomicUsize = AtomicUsize::new(0);

/// Registers the fatal-error hook. Only one hook can be active; a second
/// registration replaces the first.
pub fn set_hook(hook: Hook) {
    HOOK.store(hook as usize, Ordering::Release);
}

/// Halts the system after an unrecoverable invariant violation.
///
/// Nothing in the core calls this for an expected outcome — timeouts,
/// unsatisfied non-blocking acquisitions and deleted objects are ordinary
/// status values. This path exists for states that should be impossible:
/// continuing would operate on undefined data, and a kernel has no outer
/// supervisor to fail over to.
///
/// # Panics
/// Always. That is the point.
pub fn terminate(source: Source, code: u32) -> ! {
    let raw = HOOK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: The only value ever stored besides 0 comes from
        // `set_hook`, which received a valid `Hook` function pointer.
        let hook: Hook = unsafe { core::mem::transmute::<usize, Hook>(raw) };
        hook(source, code);
    }
    panic!("fatal error: source={source:?} code={code}");
}

#[cfg(test)]
mod tests {
    use super::{Source, set_hook, terminate};
    use std::sync::atomic::{AtomicU32, Ordering};

    static OBSERVED: AtomicU32 = AtomicU32::new(0);

    fn record(_source: Source, code: u32) {
        OBSERVED.store(code, Ordering::SeqCst);
    }

    #[test]
    fn hook_runs_before_the_panic() {
        set_hook(record);
        let result = std::panic::catch_unwind(|| terminate(Source::Internal, 42));
        assert!(result.is_err());
        assert_eq!(OBSERVED.load(Ordering::SeqCst), 42);
    }
}
