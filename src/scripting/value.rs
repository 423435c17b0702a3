//! Host-side script values and their conversion to and from guest values.

use std::collections::BTreeMap;
use std::ffi::c_void;

use mlua::{Lua, MultiValue, Table, Value};
use serde::{Deserialize, Serialize};

/// A value that can cross the host/guest boundary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(untagged)]
pub enum ScriptValue {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    Text(String),
    Sequence(Vec<ScriptValue>),
    Mapping(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, ScriptValue>> {
        match self {
            ScriptValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Field of a mapping; `None` for any other variant.
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.as_mapping().and_then(|map| map.get(key))
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        ScriptValue::Number(value as f64)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Number(value as f64)
    }
}

impl From<u32> for ScriptValue {
    fn from(value: u32) -> Self {
        ScriptValue::Number(value as f64)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Text(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::Text(value)
    }
}

impl<T: Into<ScriptValue>> From<Vec<T>> for ScriptValue {
    fn from(items: Vec<T>) -> Self {
        ScriptValue::Sequence(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ScriptValue>> From<Option<T>> for ScriptValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ScriptValue::Nil, Into::into)
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Bool(b),
            serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => ScriptValue::Text(s),
            serde_json::Value::Array(items) => {
                ScriptValue::Sequence(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                ScriptValue::Mapping(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("table nests deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("table refers back to itself")]
    Cycle,
    #[error("table keys collide as \"{0}\"")]
    KeyCollision(String),
    #[error("sequence holds nil at position {index}")]
    NilInSequence { index: usize },
    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

/// Converts a host value into a guest value.
pub fn to_lua(lua: &Lua, value: &ScriptValue, max_depth: usize) -> Result<Value, MarshalError> {
    push_value(lua, value, 0, max_depth)
}

/// Converts host call arguments into a guest argument list.
pub fn to_lua_multi(
    lua: &Lua,
    args: &[ScriptValue],
    max_depth: usize,
) -> Result<MultiValue, MarshalError> {
    let values = args
        .iter()
        .map(|arg| push_value(lua, arg, 0, max_depth))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MultiValue::from_vec(values))
}

fn push_value(
    lua: &Lua,
    value: &ScriptValue,
    depth: usize,
    limit: usize,
) -> Result<Value, MarshalError> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(*b),
        ScriptValue::Number(n) => Value::Number(*n),
        ScriptValue::Text(s) => Value::String(lua.create_string(s)?),
        ScriptValue::Sequence(items) => {
            if depth >= limit {
                return Err(MarshalError::TooDeep { limit });
            }
            let table = lua.create_table()?;
            for (index, item) in items.iter().enumerate() {
                // A guest table cannot hold nil, so the length would shrink.
                if item.is_nil() {
                    return Err(MarshalError::NilInSequence { index: index + 1 });
                }
                table.raw_set(index as i64 + 1, push_value(lua, item, depth + 1, limit)?)?;
            }
            Value::Table(table)
        }
        ScriptValue::Mapping(map) => {
            if depth >= limit {
                return Err(MarshalError::TooDeep { limit });
            }
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), push_value(lua, item, depth + 1, limit)?)?;
            }
            Value::Table(table)
        }
    })
}

/// Converts a guest value into a host value.
///
/// Functions, userdata and threads have no host form and yield `Ok(None)`.
pub fn from_lua(value: Value, max_depth: usize) -> Result<Option<ScriptValue>, MarshalError> {
    let mut path = Vec::new();
    convert(value, &mut path, max_depth)
}

fn convert(
    value: Value,
    path: &mut Vec<*const c_void>,
    limit: usize,
) -> Result<Option<ScriptValue>, MarshalError> {
    let converted = match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(b),
        Value::Integer(i) => ScriptValue::Number(i as f64),
        Value::Number(n) => ScriptValue::Number(n),
        Value::String(s) => ScriptValue::Text(s.to_string_lossy().to_string()),
        Value::Table(table) => convert_table(table, path, limit)?,
        _ => return Ok(None),
    };
    Ok(Some(converted))
}

// `path` holds the tables currently being converted, so a table met again
// further down is a cycle while a table shared by two siblings is not.
fn convert_table(
    table: Table,
    path: &mut Vec<*const c_void>,
    limit: usize,
) -> Result<ScriptValue, MarshalError> {
    let ptr = table.to_pointer();
    if path.contains(&ptr) {
        return Err(MarshalError::Cycle);
    }
    if path.len() >= limit {
        return Err(MarshalError::TooDeep { limit });
    }
    path.push(ptr);
    let result = collect_entries(&table, path, limit);
    path.pop();
    let entries = result?;

    if let Some(items) = as_sequence(&entries) {
        return Ok(ScriptValue::Sequence(items));
    }
    let mut map = BTreeMap::new();
    for (key, value) in entries {
        let Some(key) = key_to_string(&key) else {
            continue;
        };
        if map.contains_key(&key) {
            return Err(MarshalError::KeyCollision(key));
        }
        map.insert(key, value);
    }
    Ok(ScriptValue::Mapping(map))
}

fn collect_entries(
    table: &Table,
    path: &mut Vec<*const c_void>,
    limit: usize,
) -> Result<Vec<(Value, ScriptValue)>, MarshalError> {
    let mut entries = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (key, value) = pair?;
        if let Some(value) = convert(value, path, limit)? {
            entries.push((key, value));
        }
    }
    Ok(entries)
}

fn integer_key(key: &Value) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
        _ => None,
    }
}

/// Entries form a sequence when their keys are exactly `1..=len`.
fn as_sequence(entries: &[(Value, ScriptValue)]) -> Option<Vec<ScriptValue>> {
    let len = entries.len();
    let mut slots: Vec<Option<ScriptValue>> = vec![None; len];
    for (key, value) in entries {
        let index = integer_key(key)?;
        if index < 1 || index as usize > len {
            return None;
        }
        let slot = &mut slots[index as usize - 1];
        if slot.is_some() {
            return None;
        }
        *slot = Some(value.clone());
    }
    slots.into_iter().collect()
}

fn key_to_string(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(match integer_key(key) {
            Some(i) => i.to_string(),
            None => n.to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH: usize = 32;

    fn mapping(entries: Vec<(&str, ScriptValue)>) -> ScriptValue {
        ScriptValue::Mapping(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn round_trip(lua: &Lua, value: &ScriptValue) -> Option<ScriptValue> {
        let guest = to_lua(lua, value, DEPTH).expect("host to guest");
        from_lua(guest, DEPTH).expect("guest to host")
    }

    #[test]
    fn nested_mapping_survives_a_round_trip() {
        let lua = Lua::new();
        let value = mapping(vec![
            ("a", 1.into()),
            ("b", vec![2, 3].into()),
            ("c", "x".into()),
            ("d", true.into()),
            ("e", ScriptValue::Nil),
        ]);

        let back = round_trip(&lua, &value).expect("representable");
        assert_eq!(back.get("a"), Some(&ScriptValue::Number(1.0)));
        assert_eq!(
            back.get("b").and_then(ScriptValue::as_sequence),
            Some(&[ScriptValue::Number(2.0), ScriptValue::Number(3.0)][..])
        );
        assert_eq!(back.get("c").and_then(ScriptValue::as_str), Some("x"));
        assert_eq!(back.get("d").and_then(ScriptValue::as_bool), Some(true));
        assert!(back.get("e").map_or(true, ScriptValue::is_nil));
    }

    #[test]
    fn host_sequence_becomes_one_based_guest_sequence() {
        let lua = Lua::new();
        let guest = to_lua(&lua, &vec!["a", "b", "c"].into(), DEPTH).expect("to lua");
        lua.globals().set("seq", guest).expect("set global");
        let (len, first, last): (i64, String, String) = lua
            .load("return #seq, seq[1], seq[3]")
            .eval()
            .expect("eval");
        assert_eq!((len, first.as_str(), last.as_str()), (3, "a", "c"));
    }

    #[test]
    fn numbers_are_not_truncated() {
        let lua = Lua::new();
        let back = round_trip(&lua, &ScriptValue::Number(2.75)).expect("number");
        assert_eq!(back, ScriptValue::Number(2.75));
    }

    #[test]
    fn guest_tables_pick_sequence_or_mapping_by_keys() {
        let lua = Lua::new();
        let seq: Value = lua.load("return { 10, 20, 30 }").eval().expect("eval");
        assert_eq!(
            from_lua(seq, DEPTH).expect("convert"),
            Some(vec![10, 20, 30].into())
        );

        let holes: Value = lua.load("return { [1] = 'a', [3] = 'c' }").eval().expect("eval");
        let holes = from_lua(holes, DEPTH).expect("convert").expect("value");
        assert_eq!(holes.get("1").and_then(ScriptValue::as_str), Some("a"));
        assert_eq!(holes.get("3").and_then(ScriptValue::as_str), Some("c"));

        let zero_based: Value = lua.load("return { [0] = 'z', [1] = 'a' }").eval().expect("eval");
        assert!(from_lua(zero_based, DEPTH)
            .expect("convert")
            .and_then(|v| v.as_mapping().cloned())
            .is_some());

        let empty: Value = lua.load("return {}").eval().expect("eval");
        assert_eq!(
            from_lua(empty, DEPTH).expect("convert"),
            Some(ScriptValue::Sequence(Vec::new()))
        );
    }

    #[test]
    fn functions_have_no_host_form() {
        let lua = Lua::new();
        let f: Value = lua.load("return function() end").eval().expect("eval");
        assert_eq!(from_lua(f, DEPTH).expect("convert"), None);

        let mixed: Value = lua
            .load("return { name = 'guard', think = function() end }")
            .eval()
            .expect("eval");
        let mixed = from_lua(mixed, DEPTH).expect("convert").expect("table");
        assert_eq!(mixed.as_mapping().map(|m| m.len()), Some(1));
        assert_eq!(mixed.get("name").and_then(ScriptValue::as_str), Some("guard"));
    }

    #[test]
    fn self_referencing_table_is_a_conversion_error() {
        let lua = Lua::new();
        let cyclic: Value = lua
            .load("local t = { name = 'loop' }; t.me = t; return t")
            .eval()
            .expect("eval");
        assert!(matches!(from_lua(cyclic, DEPTH), Err(MarshalError::Cycle)));

        let shared: Value = lua
            .load("local s = { 1 }; return { a = s, b = s }")
            .eval()
            .expect("eval");
        let shared = from_lua(shared, DEPTH).expect("shared is fine").expect("table");
        assert_eq!(shared.get("a"), shared.get("b"));
    }

    #[test]
    fn keys_that_stringify_alike_are_a_conversion_error() {
        let lua = Lua::new();
        let clash: Value = lua
            .load("return { [1] = 'int', ['1'] = 'str', x = 2 }")
            .eval()
            .expect("eval");
        assert!(matches!(
            from_lua(clash, DEPTH),
            Err(MarshalError::KeyCollision(key)) if key == "1"
        ));

        let flags: Value = lua
            .load("return { [true] = 1, ['true'] = 2 }")
            .eval()
            .expect("eval");
        assert!(matches!(
            from_lua(flags, DEPTH),
            Err(MarshalError::KeyCollision(key)) if key == "true"
        ));
    }

    #[test]
    fn nil_inside_a_sequence_is_rejected() {
        let lua = Lua::new();
        let holey = ScriptValue::Sequence(vec![1.into(), ScriptValue::Nil, 3.into()]);
        assert!(matches!(
            to_lua(&lua, &holey, DEPTH),
            Err(MarshalError::NilInSequence { index: 2 })
        ));

        let nested: ScriptValue = serde_json::json!({ "ids": [1, null] }).into();
        assert!(matches!(
            to_lua(&lua, &nested, DEPTH),
            Err(MarshalError::NilInSequence { index: 2 })
        ));
    }

    #[test]
    fn depth_cap_applies_both_ways() {
        let lua = Lua::new();
        let deep: Value = lua
            .load("local t = {} ; for _ = 1, 10 do t = { t } end ; return t")
            .eval()
            .expect("eval");
        assert!(matches!(
            from_lua(deep, 4),
            Err(MarshalError::TooDeep { limit: 4 })
        ));

        let mut nested = ScriptValue::Sequence(Vec::new());
        for _ in 0..10 {
            nested = ScriptValue::Sequence(vec![nested]);
        }
        assert!(matches!(
            to_lua(&lua, &nested, 4),
            Err(MarshalError::TooDeep { limit: 4 })
        ));
    }

    #[test]
    fn json_values_convert_into_script_values() {
        let value: ScriptValue = serde_json::json!({ "id": 7, "tags": ["a"], "gone": null }).into();
        assert_eq!(value.get("id"), Some(&ScriptValue::Number(7.0)));
        assert_eq!(value.get("tags"), Some(&vec!["a"].into()));
        assert_eq!(value.get("gone"), Some(&ScriptValue::Nil));
    }
}
