use std::rc::Rc;
use std::time::Duration;

use mlua::{Function, Lua, Value, Variadic};
use serde::Serialize;
use tracing::info;

use super::timers;
use super::value::{self, ScriptValue};
use super::vm::StateInner;
use super::HostShared;

/// Severity attached to a broadcast. Exposed to guests as `MESSAGE_*` globals.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSeverity {
    Info = 0,
    Warning = 1,
    Event = 2,
    Alert = 3,
}

impl MessageSeverity {
    pub const ALL: [MessageSeverity; 4] = [
        MessageSeverity::Info,
        MessageSeverity::Warning,
        MessageSeverity::Event,
        MessageSeverity::Alert,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn global_name(self) -> &'static str {
        match self {
            MessageSeverity::Info => "MESSAGE_INFO",
            MessageSeverity::Warning => "MESSAGE_WARNING",
            MessageSeverity::Event => "MESSAGE_EVENT",
            MessageSeverity::Alert => "MESSAGE_ALERT",
        }
    }
}

/// Capabilities the embedding server lends to scripts.
pub trait HostApi {
    /// Delivers `message` to every connected player.
    fn broadcast(&self, message: &str, severity: MessageSeverity);
}

/// Host used when no server is attached: broadcasts only reach the log.
pub struct LogHost;

impl HostApi for LogHost {
    fn broadcast(&self, message: &str, severity: MessageSeverity) {
        info!("[broadcast] ({severity:?}) {message}");
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ScriptErrorRecord {
    pub script_name: String,
    pub function: String,
    pub error_message: String,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub instances_created: u64,
    pub instances_closed: u64,
    pub pins_created: u64,
    pub pins_released: u64,
    pub pending_deferred: usize,
    pub recent_errors: usize,
}

/// Thirty days; longer delays are almost certainly a unit mistake.
const MAX_EVENT_DELAY_MS: f64 = 30.0 * 24.0 * 60.0 * 60.0 * 1000.0;

fn runtime_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(message.into())
}

/// Installs the native functions and constants into a fresh state's globals.
pub(crate) fn install(lua: &Lua, state: &Rc<StateInner>, shared: &Rc<HostShared>) -> mlua::Result<()> {
    let globals = lua.globals();

    for severity in MessageSeverity::ALL {
        globals.set(severity.global_name(), severity.code())?;
    }

    let broadcast_shared = shared.clone();
    let broadcast_fn = lua.create_function(move |_lua, (text, severity): (String, Option<i64>)| {
        let severity = match severity {
            None => MessageSeverity::Info,
            Some(code) => MessageSeverity::from_code(code)
                .ok_or_else(|| runtime_error(format!("unknown message severity {code}")))?,
        };
        broadcast_shared.api.broadcast(&text, severity);
        Ok(())
    })?;
    globals.set("broadcastMessage", broadcast_fn)?;

    let add_shared = shared.clone();
    let add_owner = Rc::downgrade(state);
    let add_event_fn = lua.create_function(
        move |lua, (callback, delay_ms, extra): (Function, f64, Variadic<Value>)| {
            let Some(owner) = add_owner.upgrade() else {
                return Err(runtime_error("addEvent: script state is closed"));
            };
            if delay_ms.is_nan() || delay_ms > MAX_EVENT_DELAY_MS {
                return Err(runtime_error(format!(
                    "addEvent: delay must be a number of at most {MAX_EVENT_DELAY_MS}ms"
                )));
            }
            let depth = add_shared.limits.max_table_depth;
            // Snapshot now; the guest stack will be gone when the timer fires.
            let args = extra
                .iter()
                .cloned()
                .map(|v| value::from_lua(v, depth).map(Option::unwrap_or_default))
                .collect::<Result<Vec<ScriptValue>, _>>()
                .map_err(|e| runtime_error(format!("addEvent: {e}")))?;
            let delay = Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0);
            timers::schedule(&add_shared, &owner, lua, callback, delay, args)
        },
    )?;
    globals.set("addEvent", add_event_fn)?;

    let stop_shared = shared.clone();
    let stop_owner = Rc::downgrade(state);
    let stop_event_fn = lua.create_function(move |_lua, id: u64| {
        let cancelled = stop_shared.timers.borrow_mut().cancel(id, &stop_owner);
        Ok(cancelled.is_some())
    })?;
    globals.set("stopEvent", stop_event_fn)?;

    let script_name = state.name().to_string();
    let log_fn = lua.create_function(move |_lua, text: String| {
        info!("[scripts] {script_name}: {text}");
        Ok(())
    })?;
    globals.set("log", log_fn)?;

    Ok(())
}
