use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use mlua::{HookTriggers, Lua, RegistryKey, Value, VmState};
use tracing::{debug, error, warn};

use super::api::ScriptErrorRecord;
use super::timers::DeferredCallHandle;
use super::value::{self, ScriptValue};
use super::{HostShared, ScriptCounters, ScriptError, ScriptLimits};

/// One isolated guest interpreter, bound to a single content definition.
///
/// Not `Clone`: a state belongs to exactly one owner. The interpreter is torn
/// down by [`ScriptState::close`] or, failing that, when the state drops.
pub struct ScriptState {
    inner: Rc<StateInner>,
}

pub(crate) struct StateInner {
    name: String,
    lua: RefCell<Option<Lua>>,
    shared: Rc<HostShared>,
    live_pins: Cell<usize>,
}

impl ScriptState {
    pub(crate) fn create(
        shared: &Rc<HostShared>,
        name: &str,
        source: &str,
    ) -> Result<ScriptState, ScriptError> {
        let lua = Lua::new();
        let counters = &shared.counters;
        counters
            .instances_created
            .set(counters.instances_created.get() + 1);
        let state = ScriptState {
            inner: Rc::new(StateInner {
                name: name.to_string(),
                lua: RefCell::new(Some(lua)),
                shared: shared.clone(),
                live_pins: Cell::new(0),
            }),
        };

        if let Err(e) = state.inner.install_and_run(source) {
            // Partially built interpreters never escape.
            state.close();
            return Err(ScriptError::Load {
                name: name.to_string(),
                message: e.to_string(),
            });
        }
        debug!("[scripts] Created script state for {name}");
        Ok(state)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lua.borrow().is_none()
    }

    /// Deferred calls pinned in this state and not yet released.
    pub fn live_pins(&self) -> usize {
        self.inner.live_pins.get()
    }

    /// Calls guest global `function` with `args`.
    ///
    /// Missing functions, marshaling failures and guest runtime errors are
    /// logged and yield `None`; nothing propagates to the caller.
    pub fn call(&self, function: &str, args: &[ScriptValue]) -> Option<ScriptValue> {
        let inner = &self.inner;
        let guard = inner.lua.borrow();
        let Some(lua) = guard.as_ref() else {
            warn!("[scripts] {}: call to '{function}' on a closed state", inner.name);
            return None;
        };
        let limits = &inner.shared.limits;

        let callee = match lua.globals().get::<Value>(function) {
            Ok(Value::Function(f)) => f,
            Ok(Value::Nil) => {
                warn!("[scripts] {}: function '{function}' not found", inner.name);
                return None;
            }
            // Callable tables are not entry points; only plain functions are.
            Ok(other) => {
                warn!(
                    "[scripts] {}: '{function}' is a {}, not a function",
                    inner.name,
                    other.type_name()
                );
                return None;
            }
            Err(e) => {
                warn!("[scripts] {}: could not look up '{function}': {e}", inner.name);
                return None;
            }
        };
        let guest_args = match value::to_lua_multi(lua, args, limits.max_table_depth) {
            Ok(args) => args,
            Err(e) => {
                warn!(
                    "[scripts] {}: could not pass arguments to '{function}': {e}",
                    inner.name
                );
                return None;
            }
        };

        let returned = match call_with_budget(lua, limits, || callee.call::<Value>(guest_args)) {
            Ok(v) => v,
            Err(e) => {
                inner.record_error(function, &e.to_string());
                return None;
            }
        };
        match value::from_lua(returned, limits.max_table_depth) {
            Ok(Some(ScriptValue::Nil)) | Ok(None) => None,
            Ok(Some(v)) => Some(v),
            Err(e) => {
                warn!(
                    "[scripts] {}: could not read result of '{function}': {e}",
                    inner.name
                );
                None
            }
        }
    }

    /// Tears down the interpreter. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.inner.teardown()
    }
}

impl StateInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn counters(&self) -> Rc<ScriptCounters> {
        self.shared.counters.clone()
    }

    fn install_and_run(self: &Rc<Self>, source: &str) -> mlua::Result<()> {
        let guard = self.lua.borrow();
        let Some(lua) = guard.as_ref() else {
            return Err(mlua::Error::RuntimeError("state is closed".to_string()));
        };
        // Count hooks do not fire inside compiled traces, so the budget needs
        // the interpreter.
        lua.load("if jit then jit.off() end").exec()?;
        super::api::install(lua, self, &self.shared)?;
        call_with_budget(lua, &self.shared.limits, || {
            lua.load(source).set_name(self.name.as_str()).exec()
        })
    }

    fn teardown(&self) -> bool {
        let lua = self.lua.borrow_mut().take();
        let Some(lua) = lua else {
            return false;
        };
        drop(lua);
        let counters = &self.shared.counters;
        counters
            .instances_closed
            .set(counters.instances_closed.get() + 1);
        debug!("[scripts] Closed script state for {}", self.name);
        true
    }

    pub(crate) fn pin_acquired(&self) {
        self.live_pins.set(self.live_pins.get() + 1);
    }

    pub(crate) fn release_pin(&self, key: RegistryKey) {
        if let Some(lua) = self.lua.borrow().as_ref() {
            if let Err(e) = lua.remove_registry_value(key) {
                debug!("[scripts] {}: releasing pinned function failed: {e}", self.name);
            }
        }
        self.live_pins.set(self.live_pins.get().saturating_sub(1));
    }

    pub(crate) fn invoke_deferred(&self, call: &DeferredCallHandle) {
        let guard = self.lua.borrow();
        let Some(lua) = guard.as_ref() else {
            debug!(
                "[scripts] {}: deferred call {} skipped, state is closed",
                self.name,
                call.id()
            );
            return;
        };
        let label = format!("deferred call {}", call.id());
        let limits = &self.shared.limits;
        let outcome = call.pin.function(lua).and_then(|callee| {
            let args = value::to_lua_multi(lua, &call.args, limits.max_table_depth)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            call_with_budget(lua, limits, || callee.call::<()>(args))
        });
        if let Err(e) = outcome {
            self.record_error(&label, &e.to_string());
        }
    }

    fn record_error(&self, function: &str, message: &str) {
        error!("[scripts] {}: error in '{function}': {message}", self.name);
        self.shared.errors.borrow_mut().push(ScriptErrorRecord {
            script_name: self.name.clone(),
            function: function.to_string(),
            error_message: message.to_string(),
        });
    }
}

impl Drop for StateInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Runs `f` with an instruction hook that aborts the guest once the
/// configured wall-clock budget is spent.
fn call_with_budget<T, F>(lua: &Lua, limits: &ScriptLimits, f: F) -> mlua::Result<T>
where
    F: FnOnce() -> mlua::Result<T>,
{
    let started = Instant::now();
    let max_duration = limits.budget;
    let budget_ms = max_duration.as_secs_f64() * 1000.0;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(limits.instruction_interval.max(1)),
        move |_lua, _debug| {
            if started.elapsed() >= max_duration {
                return Err(mlua::Error::RuntimeError(format!(
                    "Script execution budget exceeded ({budget_ms:.1}ms)"
                )));
            }
            Ok(VmState::Continue)
        },
    );
    let out = f();
    lua.remove_hook();
    out
}
