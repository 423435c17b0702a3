//! Named content definitions (NPCs, global events) backed by one script
//! state each, loaded from a JSON index under the data directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::scripting::{ScriptError, ScriptHost, ScriptState, ScriptValue};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Npc,
    GlobalEvent,
}

impl ContentKind {
    pub fn label(self) -> &'static str {
        match self {
            ContentKind::Npc => "npc",
            ContentKind::GlobalEvent => "global event",
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            ContentKind::Npc => "npc",
            ContentKind::GlobalEvent => "globalevents",
        }
    }

    fn index_file(self) -> &'static str {
        match self {
            ContentKind::Npc => "npcs.json",
            ContentKind::GlobalEvent => "globalevents.json",
        }
    }

    pub fn index_path(self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.dir_name()).join(self.index_file())
    }

    pub fn scripts_dir(self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.dir_name()).join("scripts")
    }

    /// Global events are dispatched by type, so their entries must carry one.
    fn requires_type(self) -> bool {
        matches!(self, ContentKind::GlobalEvent)
    }
}

/// What to do when an index names the same definition twice.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Later entry wins; the earlier state is closed.
    #[default]
    Replace,
    /// Earlier entry wins; the later state is closed.
    KeepFirst,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(DuplicatePolicy::Replace),
            "keep_first" | "keep-first" => Ok(DuplicatePolicy::KeepFirst),
            other => Err(format!("unknown duplicate policy '{other}'")),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DuplicatePolicy::Replace => "replace",
            DuplicatePolicy::KeepFirst => "keep_first",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content index {path} could not be read: {reason}")]
    IndexMissing { path: PathBuf, reason: String },
    #[error("content index {path} is invalid: {reason}")]
    IndexInvalid { path: PathBuf, reason: String },
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub registered: usize,
    pub skipped: usize,
    pub replaced: usize,
}

#[derive(Debug, PartialEq)]
struct ContentEntry {
    name: String,
    script: String,
    kind_type: Option<String>,
}

fn required_str(entry: &serde_json::Map<String, Value>, field: &str) -> Result<String, String> {
    match entry.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(format!("field '{field}' must be a non-empty string")),
        None => Err(format!("missing field '{field}'")),
    }
}

fn parse_entry(kind: ContentKind, raw: &Value) -> Result<ContentEntry, String> {
    let Value::Object(entry) = raw else {
        return Err("entry is not an object".to_string());
    };
    let name = required_str(entry, "name")?;
    let script = required_str(entry, "script")?;
    let kind_type = if kind.requires_type() {
        Some(required_str(entry, "type")?)
    } else {
        match entry.get("type") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    };
    if Path::new(&script).extension().and_then(|e| e.to_str()) != Some("lua") {
        return Err(format!("script '{script}' is not a .lua file"));
    }
    Ok(ContentEntry {
        name,
        script,
        kind_type,
    })
}

/// One registered name bound to its own script state.
pub struct ContentDefinition {
    name: String,
    kind_type: Option<String>,
    script_path: PathBuf,
    state: ScriptState,
}

impl ContentDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind_type(&self) -> Option<&str> {
        self.kind_type.as_deref()
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn state(&self) -> &ScriptState {
        &self.state
    }
}

pub struct ContentRegistry {
    kind: ContentKind,
    host: Rc<ScriptHost>,
    data_dir: PathBuf,
    policy: DuplicatePolicy,
    definitions: BTreeMap<String, ContentDefinition>,
}

impl ContentRegistry {
    pub fn new(
        kind: ContentKind,
        host: Rc<ScriptHost>,
        data_dir: impl Into<PathBuf>,
        policy: DuplicatePolicy,
    ) -> Self {
        Self {
            kind,
            host,
            data_dir: data_dir.into(),
            policy,
            definitions: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Reads the index and registers every entry whose script loads.
    ///
    /// Only an unreadable or non-array index is an error; bad entries and
    /// failing scripts are logged and counted in [`LoadReport::skipped`].
    pub async fn load_all(&mut self) -> Result<LoadReport, ContentError> {
        let label = self.kind.label();
        let index_path = self.kind.index_path(&self.data_dir);
        let entries = read_index(&index_path).await?;
        let scripts_dir = self.kind.scripts_dir(&self.data_dir);
        let mut report = LoadReport::default();

        for (position, raw) in entries.iter().enumerate() {
            let entry = match parse_entry(self.kind, raw) {
                Ok(entry) => entry,
                Err(reason) => {
                    warn!(
                        "[{label}] Skipping entry {position} in {}: {reason}",
                        index_path.display()
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let script_path = scripts_dir.join(&entry.script);
            let state = match self.load_script(&entry.name, &script_path).await {
                Ok(state) => state,
                Err(e) => {
                    error!("[{label}] Failed to load {}: {e}", entry.name);
                    report.skipped += 1;
                    continue;
                }
            };
            debug!(
                "[{label}] Loaded {} from {}",
                entry.name,
                script_path.display()
            );

            let definition = ContentDefinition {
                name: entry.name.clone(),
                kind_type: entry.kind_type,
                script_path,
                state,
            };
            self.register(definition, &mut report);
        }

        info!(
            "[{label}] Loaded {} definitions ({} registered, {} skipped, {} replaced)",
            self.definitions.len(),
            report.registered,
            report.skipped,
            report.replaced
        );
        Ok(report)
    }

    async fn load_script(&self, name: &str, path: &Path) -> Result<ScriptState, ScriptError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ScriptError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.host.create_instance(name, &source)
    }

    fn register(&mut self, definition: ContentDefinition, report: &mut LoadReport) {
        let label = self.kind.label();
        let name = definition.name.clone();
        if !self.definitions.contains_key(&name) {
            self.definitions.insert(name, definition);
            report.registered += 1;
            return;
        }
        match self.policy {
            DuplicatePolicy::KeepFirst => {
                warn!("[{label}] Duplicate definition {name}; keeping the first one");
                self.host.close(&definition.state);
                report.skipped += 1;
            }
            DuplicatePolicy::Replace => {
                warn!("[{label}] Duplicate definition {name}; replacing the earlier one");
                if let Some(previous) = self.definitions.insert(name, definition) {
                    self.host.close(&previous.state);
                }
                report.replaced += 1;
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ContentDefinition> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Calls `function` in the state bound to `name`. `None` when the
    /// definition is unknown or the guest produced no value.
    pub fn call_definition_function(
        &self,
        name: &str,
        function: &str,
        args: &[ScriptValue],
    ) -> Option<ScriptValue> {
        let Some(definition) = self.definitions.get(name) else {
            debug!("[{}] No definition named {name}", self.kind.label());
            return None;
        };
        self.host.call(&definition.state, function, args)
    }

    /// Definitions whose declared type equals `kind_type`, in name order.
    pub fn definitions_of_type<'a>(
        &'a self,
        kind_type: &'a str,
    ) -> impl Iterator<Item = &'a ContentDefinition> + 'a {
        self.definitions
            .values()
            .filter(move |d| d.kind_type.as_deref() == Some(kind_type))
    }

    /// Calls `function` on every definition of `kind_type`; returns how many
    /// were invoked.
    pub fn dispatch(&self, kind_type: &str, function: &str) -> usize {
        let mut invoked = 0;
        for definition in self.definitions_of_type(kind_type) {
            debug!(
                "[{}] Dispatching {function} to {}",
                self.kind.label(),
                definition.name
            );
            self.host.call(&definition.state, function, &[]);
            invoked += 1;
        }
        invoked
    }

    /// Closes every owned state and empties the registry. Safe to repeat.
    pub fn cleanup(&mut self) {
        if self.definitions.is_empty() {
            return;
        }
        let count = self.definitions.len();
        for definition in std::mem::take(&mut self.definitions).into_values() {
            self.host.close(&definition.state);
        }
        info!("[{}] Closed {count} script states", self.kind.label());
    }
}

async fn read_index(path: &Path) -> Result<Vec<Value>, ContentError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ContentError::IndexMissing {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let invalid = |reason: String| ContentError::IndexInvalid {
        path: path.to_path_buf(),
        reason,
    };
    match serde_json::from_str::<Value>(&text).map_err(|e| invalid(e.to_string()))? {
        Value::Array(entries) => Ok(entries),
        other => Err(invalid(format!(
            "expected an array of entries, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::{LogHost, ScriptLimits};
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts WARN events seen while installed as the thread's subscriber.
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl WarnCounter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn write_content(root: &Path, kind: ContentKind, index: Value, scripts: &[(&str, &str)]) {
        let scripts_dir = kind.scripts_dir(root);
        fs::create_dir_all(&scripts_dir).expect("create scripts dir");
        fs::write(
            kind.index_path(root),
            serde_json::to_string_pretty(&index).expect("serialize index"),
        )
        .expect("write index");
        for (file, source) in scripts {
            fs::write(scripts_dir.join(file), source).expect("write script");
        }
    }

    fn registry(root: &Path, kind: ContentKind, policy: DuplicatePolicy) -> (ContentRegistry, Rc<ScriptHost>) {
        let host = Rc::new(ScriptHost::new(Rc::new(LogHost), ScriptLimits::default()));
        (ContentRegistry::new(kind, host.clone(), root, policy), host)
    }

    #[test]
    fn entries_are_validated_per_kind() {
        let npc = parse_entry(
            ContentKind::Npc,
            &json!({ "name": "Guard", "script": "guard.lua" }),
        )
        .expect("valid npc entry");
        assert_eq!(npc.kind_type, None);

        assert!(parse_entry(ContentKind::GlobalEvent, &json!({ "name": "Boot", "script": "boot.lua" })).is_err());
        assert!(parse_entry(ContentKind::Npc, &json!({ "name": "Guard" })).is_err());
        assert!(parse_entry(ContentKind::Npc, &json!({ "name": "", "script": "a.lua" })).is_err());
        assert!(parse_entry(ContentKind::Npc, &json!({ "name": "Guard", "script": "guard.js" })).is_err());
        assert!(parse_entry(ContentKind::Npc, &json!("guard.lua")).is_err());
    }

    #[test]
    fn duplicate_policy_parses_from_text() {
        assert_eq!("replace".parse(), Ok(DuplicatePolicy::Replace));
        assert_eq!("KEEP_FIRST".parse(), Ok(DuplicatePolicy::KeepFirst));
        assert!("newest".parse::<DuplicatePolicy>().is_err());
        assert_eq!(DuplicatePolicy::KeepFirst.to_string(), "keep_first");
    }

    #[tokio::test]
    async fn malformed_entry_is_skipped_and_the_rest_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_content(
            dir.path(),
            ContentKind::Npc,
            json!([
                { "name": "Guard", "script": "guard.lua" },
                { "name": "Broken" },
                { "name": "Merchant", "script": "merchant.lua" }
            ]),
            &[
                ("guard.lua", "function greet(who) return 'Halt, ' .. who end"),
                ("merchant.lua", "function price(item) return 12 end"),
            ],
        );
        let (mut registry, _host) = registry(dir.path(), ContentKind::Npc, DuplicatePolicy::Replace);

        let warnings = WarnCounter::default();
        let report = {
            let _guard = tracing::subscriber::set_default(
                tracing_subscriber::registry().with(warnings.clone()),
            );
            registry.load_all().await.expect("index loads")
        };
        assert_eq!(
            report,
            LoadReport {
                registered: 2,
                skipped: 1,
                replaced: 0
            }
        );
        assert_eq!(warnings.count(), 1);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Guard", "Merchant"]);
        assert_eq!(
            registry.call_definition_function("Guard", "greet", &["Ana".into()]),
            Some("Halt, Ana".into())
        );
        assert_eq!(registry.call_definition_function("Nobody", "greet", &[]), None);
    }

    #[tokio::test]
    async fn failing_script_is_not_registered_and_is_torn_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_content(
            dir.path(),
            ContentKind::Npc,
            json!([
                { "name": "Ghost", "script": "ghost.lua" },
                { "name": "Missing", "script": "missing.lua" },
                { "name": "Guard", "script": "guard.lua" }
            ]),
            &[
                ("ghost.lua", "error('cannot start')"),
                ("guard.lua", "x = 1"),
            ],
        );
        let (mut registry, host) = registry(dir.path(), ContentKind::Npc, DuplicatePolicy::Replace);

        let report = registry.load_all().await.expect("index loads");
        assert_eq!((report.registered, report.skipped), (1, 2));
        assert!(registry.get("Ghost").is_none());
        assert!(registry.get("Missing").is_none());
        let stats = host.stats();
        assert_eq!(stats.instances_created, 2);
        assert_eq!(stats.instances_closed, 1);

        registry.cleanup();
        let stats = host.stats();
        assert_eq!(stats.instances_closed, stats.instances_created);
    }

    #[tokio::test]
    async fn duplicates_follow_the_configured_policy() {
        for (policy, expected, replaced) in [
            (DuplicatePolicy::Replace, "second", 1),
            (DuplicatePolicy::KeepFirst, "first", 0),
        ] {
            let dir = tempfile::tempdir().expect("tempdir");
            write_content(
                dir.path(),
                ContentKind::Npc,
                json!([
                    { "name": "Guard", "script": "first.lua" },
                    { "name": "Guard", "script": "second.lua" }
                ]),
                &[
                    ("first.lua", "function which() return 'first' end"),
                    ("second.lua", "function which() return 'second' end"),
                ],
            );
            let (mut registry, host) = registry(dir.path(), ContentKind::Npc, policy);

            let report = registry.load_all().await.expect("index loads");
            assert_eq!(report.replaced, replaced);
            assert_eq!(registry.len(), 1);
            assert_eq!(
                registry.call_definition_function("Guard", "which", &[]),
                Some(expected.into())
            );
            let stats = host.stats();
            assert_eq!((stats.instances_created, stats.instances_closed), (2, 1));
        }
    }

    #[tokio::test]
    async fn missing_or_invalid_index_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut registry, _host) = registry(dir.path(), ContentKind::Npc, DuplicatePolicy::Replace);
        assert!(matches!(
            registry.load_all().await,
            Err(ContentError::IndexMissing { .. })
        ));

        write_content(dir.path(), ContentKind::Npc, json!({ "name": "Guard" }), &[]);
        assert!(matches!(
            registry.load_all().await,
            Err(ContentError::IndexInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn global_events_dispatch_by_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_content(
            dir.path(),
            ContentKind::GlobalEvent,
            json!([
                { "name": "Boot", "script": "boot.lua", "type": "startup" },
                { "name": "Save", "script": "save.lua", "type": "shutdown" },
                { "name": "Untyped", "script": "boot.lua" }
            ]),
            &[
                (
                    "boot.lua",
                    "started = false\nfunction onStartup() started = true end\nfunction didStart() return started end",
                ),
                ("save.lua", "function onShutdown() end"),
            ],
        );
        let (mut registry, _host) =
            registry(dir.path(), ContentKind::GlobalEvent, DuplicatePolicy::Replace);

        let report = registry.load_all().await.expect("index loads");
        assert_eq!((report.registered, report.skipped), (2, 1));
        assert_eq!(
            registry
                .definitions_of_type("startup")
                .map(ContentDefinition::name)
                .collect::<Vec<_>>(),
            vec!["Boot"]
        );
        assert_eq!(registry.dispatch("startup", "onStartup"), 1);
        assert_eq!(registry.dispatch("timer", "onTime"), 0);
        assert_eq!(
            registry.call_definition_function("Boot", "didStart", &[]),
            Some(true.into())
        );
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_content(
            dir.path(),
            ContentKind::Npc,
            json!([{ "name": "Guard", "script": "guard.lua" }]),
            &[("guard.lua", "function greet() return 'hi' end")],
        );
        let (mut registry, host) = registry(dir.path(), ContentKind::Npc, DuplicatePolicy::Replace);
        registry.load_all().await.expect("index loads");

        registry.cleanup();
        registry.cleanup();
        assert!(registry.is_empty());
        let stats = host.stats();
        assert_eq!((stats.instances_created, stats.instances_closed), (1, 1));
        assert_eq!(registry.call_definition_function("Guard", "greet", &[]), None);
    }
}
