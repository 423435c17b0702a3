//! Deferred guest calls: pinned functions waiting on the host timer timeline.

use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mlua::{Function, Lua, RegistryKey};
use tracing::debug;

use super::vm::StateInner;
use super::{HostShared, ScriptCounters, ScriptValue};

/// Strong reference to a guest function held in its state's registry.
///
/// Released exactly once, when the guard drops, whichever way the owning
/// call ends (fired, cancelled, or dropped at shutdown).
pub(crate) struct PinGuard {
    key: Option<RegistryKey>,
    state: Weak<StateInner>,
    counters: Rc<ScriptCounters>,
}

impl PinGuard {
    fn pin(lua: &Lua, function: Function, state: &Rc<StateInner>) -> mlua::Result<Self> {
        let key = lua.create_registry_value(function)?;
        state.pin_acquired();
        let counters = state.counters();
        counters.pins_created.set(counters.pins_created.get() + 1);
        Ok(Self {
            key: Some(key),
            state: Rc::downgrade(state),
            counters,
        })
    }

    pub(crate) fn function(&self, lua: &Lua) -> mlua::Result<Function> {
        match &self.key {
            Some(key) => lua.registry_value::<Function>(key),
            None => Err(mlua::Error::RuntimeError(
                "deferred function was already released".to_string(),
            )),
        }
    }

    pub(crate) fn owned_by(&self, state: &Weak<StateInner>) -> bool {
        self.state.ptr_eq(state)
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        if let Some(state) = self.state.upgrade() {
            state.release_pin(key);
        }
        self.counters
            .pins_released
            .set(self.counters.pins_released.get() + 1);
    }
}

/// A scheduled guest call: the pinned function plus a host-side snapshot of
/// its extra arguments, taken when the call was scheduled.
pub struct DeferredCallHandle {
    id: u64,
    due: Instant,
    pub(crate) pin: PinGuard,
    pub(crate) args: Vec<ScriptValue>,
}

impl DeferredCallHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn due(&self) -> Instant {
        self.due
    }

    /// Invokes the pinned function once. Consumes the handle, so the pin is
    /// released when this returns on every path.
    pub(crate) fn fire(self) {
        match self.pin.state.upgrade() {
            Some(state) => state.invoke_deferred(&self),
            None => debug!("[scripts] Deferred call {} dropped: owner is gone", self.id),
        }
    }
}

/// Pending deferred calls ordered by due time, then by scheduling order.
#[derive(Default)]
pub(crate) struct TimerQueue {
    next_id: u64,
    pending: BTreeMap<(Instant, u64), DeferredCallHandle>,
}

impl TimerQueue {
    fn push(&mut self, due: Instant, pin: PinGuard, args: Vec<ScriptValue>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            (due, id),
            DeferredCallHandle { id, due, pin, args },
        );
        id
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<DeferredCallHandle> {
        let (&(due, _), _) = self.pending.first_key_value()?;
        if due > now {
            return None;
        }
        self.pending.pop_first().map(|(_, call)| call)
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(due, _)| *due)
    }

    /// Removes call `id` if `owner` scheduled it.
    pub(crate) fn cancel(&mut self, id: u64, owner: &Weak<StateInner>) -> Option<DeferredCallHandle> {
        let key = self
            .pending
            .iter()
            .find(|(&(_, call_id), call)| call_id == id && call.pin.owned_by(owner))
            .map(|(key, _)| *key)?;
        self.pending.remove(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<DeferredCallHandle> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

/// Pins `callback` in `state`'s registry and queues it to run after `delay`.
pub(crate) fn schedule(
    shared: &HostShared,
    state: &Rc<StateInner>,
    lua: &Lua,
    callback: Function,
    delay: Duration,
    args: Vec<ScriptValue>,
) -> mlua::Result<u64> {
    let pin = PinGuard::pin(lua, callback, state)?;
    let due = Instant::now() + delay;
    let id = shared.timers.borrow_mut().push(due, pin, args);
    shared.wake.notify_one();
    debug!(
        "[scripts] {} scheduled deferred call {id} in {}ms",
        state.name(),
        delay.as_millis()
    );
    Ok(id)
}
