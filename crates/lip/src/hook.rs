//! VM execution hooks.
//!
//! A hook observes the VM read-only: [`VmHook::step`] fires before every
//! instruction and [`VmHook::error`] when a frame fails. Both methods
//! default to no-ops, so implementations only override what they need.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::vm::Vm;

/// Observer installed on a VM with [`Vm::set_hook`].
pub trait VmHook: Send {
    /// Called before each instruction is executed.
    fn step(&mut self, vm: &Vm) {
        let _ = vm;
    }

    /// Called when an error is thrown.
    fn error(&mut self, vm: &Vm) {
        let _ = vm;
    }
}

/// Counters shared between a [`CountingHook`] and its owner.
#[derive(Debug, Default)]
pub struct HookCounters {
    steps: AtomicU64,
    max_frame_depth: AtomicUsize,
    errors: AtomicU64,
}

impl HookCounters {
    /// Instructions executed.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Deepest call-stack depth observed.
    #[must_use]
    pub fn max_frame_depth(&self) -> usize {
        self.max_frame_depth.load(Ordering::Relaxed)
    }

    /// Errors observed.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Hook counting executed instructions and the deepest call stack seen.
///
/// Useful in tests: the tail-call guarantees are stated in terms of the
/// maximum frame depth a program may reach. The counters stay readable
/// after the hook has been handed to a VM.
#[derive(Debug, Default)]
pub struct CountingHook {
    counters: Arc<HookCounters>,
}

impl CountingHook {
    /// Creates a zeroed counter hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared counters; clone before installing the hook.
    #[must_use]
    pub fn counters(&self) -> Arc<HookCounters> {
        Arc::clone(&self.counters)
    }
}

impl VmHook for CountingHook {
    fn step(&mut self, vm: &Vm) {
        self.counters.steps.fetch_add(1, Ordering::Relaxed);
        self.counters
            .max_frame_depth
            .fetch_max(vm.frame_depth(), Ordering::Relaxed);
    }

    fn error(&mut self, _vm: &Vm) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }
}
