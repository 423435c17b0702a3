pub mod api;
mod timers;
pub mod value;
pub mod vm;

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

pub use api::{HostApi, LogHost, MessageSeverity, ScriptErrorRecord, ScriptStats};
pub use timers::DeferredCallHandle;
pub use value::{MarshalError, ScriptValue};
pub use vm::ScriptState;

use timers::TimerQueue;

pub const DEFAULT_SCRIPT_BUDGET_MS: u64 = 50;
pub const DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;
pub const DEFAULT_MAX_TABLE_DEPTH: usize = 32;

const MAX_SCRIPT_ERRORS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script '{name}' failed to load: {message}")]
    Load { name: String, message: String },
    #[error("could not read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct ScriptLimits {
    /// Wall-clock budget for a single guest entry (load, call, or deferred call).
    pub budget: Duration,
    pub instruction_interval: u32,
    pub max_table_depth: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(DEFAULT_SCRIPT_BUDGET_MS),
            instruction_interval: DEFAULT_SCRIPT_HOOK_INSTRUCTION_INTERVAL,
            max_table_depth: DEFAULT_MAX_TABLE_DEPTH,
        }
    }
}

#[derive(Default)]
pub(crate) struct ScriptCounters {
    pub(crate) instances_created: Cell<u64>,
    pub(crate) instances_closed: Cell<u64>,
    pub(crate) pins_created: Cell<u64>,
    pub(crate) pins_released: Cell<u64>,
}

/// Most recent guest errors, oldest dropped first.
#[derive(Default)]
pub struct ScriptErrors {
    pub entries: Vec<ScriptErrorRecord>,
}

impl ScriptErrors {
    pub fn push(&mut self, entry: ScriptErrorRecord) {
        self.entries.push(entry);
        if self.entries.len() > MAX_SCRIPT_ERRORS {
            let excess = self.entries.len() - MAX_SCRIPT_ERRORS;
            self.entries.drain(0..excess);
        }
    }
}

/// State shared by the host and every script state it created.
pub(crate) struct HostShared {
    pub(crate) api: Rc<dyn HostApi>,
    pub(crate) limits: ScriptLimits,
    pub(crate) counters: Rc<ScriptCounters>,
    pub(crate) errors: RefCell<ScriptErrors>,
    pub(crate) timers: RefCell<TimerQueue>,
    pub(crate) wake: Notify,
}

/// Creates isolated script states and drives their deferred calls.
///
/// Single-threaded: states, pins and the timer queue live behind `Rc`, and at
/// most one guest call runs at a time.
pub struct ScriptHost {
    shared: Rc<HostShared>,
}

impl ScriptHost {
    pub fn new(api: Rc<dyn HostApi>, limits: ScriptLimits) -> Self {
        Self {
            shared: Rc::new(HostShared {
                api,
                limits,
                counters: Rc::new(ScriptCounters::default()),
                errors: RefCell::new(ScriptErrors::default()),
                timers: RefCell::new(TimerQueue::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> &ScriptLimits {
        &self.shared.limits
    }

    /// Builds a new interpreter for `name`, installs the native API and runs
    /// `source` once. On failure the interpreter is already torn down.
    pub fn create_instance(&self, name: &str, source: &str) -> Result<ScriptState, ScriptError> {
        ScriptState::create(&self.shared, name, source)
    }

    pub fn call(&self, state: &ScriptState, function: &str, args: &[ScriptValue]) -> Option<ScriptValue> {
        state.call(function, args)
    }

    /// Tears `state` down. Safe to repeat; returns `false` if already closed.
    pub fn close(&self, state: &ScriptState) -> bool {
        state.close()
    }

    /// Fires every deferred call due at `now`, in due order. Calls scheduled
    /// while firing are due after `now` and wait for the next pass.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let next = self.shared.timers.borrow_mut().pop_due(now);
            let Some(call) = next else {
                break;
            };
            call.fire();
            fired += 1;
        }
        fired
    }

    /// Drives the deferred-call timeline forever. Must run on the thread
    /// that owns the host.
    pub async fn run_timers(&self) {
        loop {
            let next_due = self.shared.timers.borrow().next_due();
            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => {}
                        _ = self.shared.wake.notified() => {}
                    }
                }
                None => self.shared.wake.notified().await,
            }
            self.fire_due(Instant::now());
        }
    }

    pub fn pending_deferred(&self) -> usize {
        self.shared.timers.borrow().len()
    }

    /// Drops every pending deferred call, releasing their pins.
    pub fn shutdown(&self) {
        let pending = self.shared.timers.borrow_mut().drain();
        if !pending.is_empty() {
            debug!("[scripts] Dropping {} pending deferred calls", pending.len());
        }
        drop(pending);
    }

    pub fn recent_errors(&self) -> Vec<ScriptErrorRecord> {
        self.shared.errors.borrow().entries.clone()
    }

    pub fn stats(&self) -> ScriptStats {
        let counters = &self.shared.counters;
        ScriptStats {
            instances_created: counters.instances_created.get(),
            instances_closed: counters.instances_closed.get(),
            pins_created: counters.pins_created.get(),
            pins_released: counters.pins_released.get(),
            pending_deferred: self.pending_deferred(),
            recent_errors: self.shared.errors.borrow().entries.len(),
        }
    }
}
