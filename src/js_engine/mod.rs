//! Script engine seam.
//!
//! The window never interprets script itself. It owns a [`Realm`] created by
//! a [`ScriptEngine`] and forwards evaluation to it; the realm carries the
//! set of global constructors bound to that realm only.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::core::dom::DomError;
use crate::window::Window;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JSError {
    #[error("Realm initialization failed: {0}")]
    RealmInit(String),
    #[error("Script compilation failed: {0}")]
    Compilation(String),
    #[error("Script execution failed: {0}")]
    Execution(String),
    #[error("Uncaught {message} ({filename}:{line}:{column})")]
    Exception {
        message: String,
        filename: String,
        line: u32,
        column: u32,
    },
    #[error("Type conversion failed: {0}")]
    TypeConversion(String),
    #[error("Security violation: {0}")]
    Security(String),
    #[error("JavaScript evaluation is disabled")]
    Disabled,
    #[error("The realm has been destroyed")]
    RealmDestroyed,
    #[error(transparent)]
    Dom(#[from] DomError),
}

impl JSError {
    /// Message, filename, line and column as an `ErrorEvent` reports them.
    pub(crate) fn location(&self) -> (String, Option<String>, u32, u32) {
        match self {
            JSError::Exception {
                message,
                filename,
                line,
                column,
            } => (message.clone(), Some(filename.clone()), *line, *column),
            other => (other.to_string(), None, 0, 0),
        }
    }
}

pub type Result<T> = std::result::Result<T, JSError>;

static NEXT_REALM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmId(u64);

/// What an engine learns about the window it creates a realm for.
#[derive(Debug, Clone)]
pub struct RealmInfo {
    pub id: RealmId,
    pub url: Url,
    pub user_agent: String,
}

/// Creates isolated realms. One engine serves every window of a browser.
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_realm(&self, info: &RealmInfo) -> Result<Box<dyn EngineRealm>>;
}

/// One engine-side global environment.
pub trait EngineRealm: Send + Sync {
    fn evaluate(&self, window: &Window, source: &str, filename: &str) -> Result<Value>;

    /// Called once when the owning window closes.
    fn dispose(&self) {}
}

/// Names of the built-in constructors every realm binds.
pub const GLOBAL_CONSTRUCTORS: &[&str] = &[
    "Array", "ArrayBuffer", "Boolean", "Date", "Error", "EvalError", "Function", "Map",
    "Number", "Object", "Promise", "RangeError", "ReferenceError", "RegExp", "Set", "String",
    "Symbol", "SyntaxError", "TypeError", "URIError", "Uint8Array", "WeakMap", "WeakSet",
];

/// A global constructor bound to one realm. Two realms never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalConstructor {
    name: &'static str,
    realm: RealmId,
}

impl GlobalConstructor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn realm(&self) -> RealmId {
        self.realm
    }
}

/// A value created inside a realm through one of its constructors.
#[derive(Debug, Clone, PartialEq)]
pub struct RealmObject {
    constructor: GlobalConstructor,
    value: Value,
}

impl RealmObject {
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn constructor(&self) -> &GlobalConstructor {
        &self.constructor
    }

    /// `instanceof`: holds only for the constructor of the realm that made it.
    pub fn instance_of(&self, constructor: &GlobalConstructor) -> bool {
        self.constructor == *constructor
            || (constructor.name == "Object" && constructor.realm == self.constructor.realm)
    }
}

/// The window's realm.
pub struct Realm {
    id: RealmId,
    engine: &'static str,
    inner: Box<dyn EngineRealm>,
    globals: HashMap<&'static str, GlobalConstructor>,
    destroyed: AtomicBool,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Realm {
    pub(crate) fn new(engine: &dyn ScriptEngine, url: &Url, user_agent: &str) -> Result<Self> {
        let id = RealmId(NEXT_REALM_ID.fetch_add(1, Ordering::Relaxed));
        let info = RealmInfo {
            id,
            url: url.clone(),
            user_agent: user_agent.to_string(),
        };
        let inner = engine.create_realm(&info)?;
        Ok(Self::assemble(id, engine.name(), inner))
    }

    /// A realm that evaluates everything to `null`; creating it cannot fail.
    pub(crate) fn noop() -> Self {
        let id = RealmId(NEXT_REALM_ID.fetch_add(1, Ordering::Relaxed));
        Self::assemble(id, NoopScriptEngine.name(), Box::new(NoopRealm))
    }

    fn assemble(id: RealmId, engine: &'static str, inner: Box<dyn EngineRealm>) -> Self {
        let globals = GLOBAL_CONSTRUCTORS
            .iter()
            .map(|&name| (name, GlobalConstructor { name, realm: id }))
            .collect();
        debug!(realm = id.0, engine, "realm created");
        Self {
            id,
            engine,
            inner,
            globals,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> RealmId {
        self.id
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine
    }

    pub fn global(&self, name: &str) -> Option<GlobalConstructor> {
        self.globals.get(name).cloned()
    }

    /// Creates `value` through this realm's `constructor`.
    pub fn construct(&self, constructor: &str, value: Value) -> Result<RealmObject> {
        if self.is_destroyed() {
            return Err(JSError::RealmDestroyed);
        }
        let constructor = self.global(constructor).ok_or_else(|| {
            JSError::Exception {
                message: format!("ReferenceError: {constructor} is not defined"),
                filename: String::new(),
                line: 0,
                column: 0,
            }
        })?;
        Ok(RealmObject { constructor, value })
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Runs `source`; an engine panic surfaces as an execution error.
    pub(crate) fn evaluate(&self, window: &Window, source: &str, filename: &str) -> Result<Value> {
        if self.is_destroyed() {
            return Err(JSError::RealmDestroyed);
        }
        trace!(realm = self.id.0, filename, bytes = source.len(), "evaluate");
        std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.evaluate(window, source, filename)))
            .unwrap_or_else(|panic| {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(JSError::Execution(format!("panic caught: {message}")))
            })
    }

    pub(crate) fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.inner.dispose();
            debug!(realm = self.id.0, "realm destroyed");
        }
    }
}

/// Engine that accepts every script and evaluates it to `null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScriptEngine;

struct NoopRealm;

impl EngineRealm for NoopRealm {
    fn evaluate(&self, _window: &Window, _source: &str, _filename: &str) -> Result<Value> {
        Ok(Value::Null)
    }
}

impl ScriptEngine for NoopScriptEngine {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn create_realm(&self, _info: &RealmInfo) -> Result<Box<dyn EngineRealm>> {
        Ok(Box::new(NoopRealm))
    }
}

type EvalFn = dyn Fn(&Window, &str) -> Result<Value> + Send + Sync;

/// Engine whose every realm hands source text to a Rust closure. Embedders
/// use it to drive the DOM from "scripts" written in Rust.
#[derive(Clone)]
pub struct ClosureScriptEngine {
    eval: Arc<EvalFn>,
}

impl fmt::Debug for ClosureScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureScriptEngine").finish_non_exhaustive()
    }
}

impl ClosureScriptEngine {
    pub fn new(eval: impl Fn(&Window, &str) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self { eval: Arc::new(eval) }
    }
}

struct ClosureRealm {
    eval: Arc<EvalFn>,
}

impl EngineRealm for ClosureRealm {
    fn evaluate(&self, window: &Window, source: &str, _filename: &str) -> Result<Value> {
        (self.eval)(window, source)
    }
}

impl ScriptEngine for ClosureScriptEngine {
    fn name(&self) -> &'static str {
        "closure"
    }

    fn create_realm(&self, _info: &RealmInfo) -> Result<Box<dyn EngineRealm>> {
        Ok(Box::new(ClosureRealm {
            eval: self.eval.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm() -> Realm {
        Realm::new(&NoopScriptEngine, &Url::parse("about:blank").unwrap(), "test").unwrap()
    }

    #[test]
    fn destroyed_realm_constructs_nothing() {
        let realm = Realm::noop();
        assert_eq!(realm.engine_name(), "noop");
        realm.destroy();
        assert_eq!(realm.construct("Array", Value::Null), Err(JSError::RealmDestroyed));
    }

    #[test]
    fn constructors_are_bound_per_realm() {
        let a = realm();
        let b = realm();
        assert_ne!(a.id(), b.id());
        let array = a.construct("Array", serde_json::json!([1, 2])).unwrap();
        assert!(array.instance_of(&a.global("Array").unwrap()));
        assert!(array.instance_of(&a.global("Object").unwrap()));
        assert!(!array.instance_of(&b.global("Array").unwrap()));
        assert!(!array.instance_of(&a.global("Error").unwrap()));
    }

    #[test]
    fn unknown_constructor_is_a_reference_error() {
        let err = realm().construct("Nope", Value::Null).unwrap_err();
        assert!(err.to_string().contains("ReferenceError"));
    }

    #[test]
    fn exception_location_feeds_error_events() {
        let err = JSError::Exception {
            message: "boom".into(),
            filename: "a.js".into(),
            line: 3,
            column: 7,
        };
        assert_eq!(err.location(), ("boom".to_string(), Some("a.js".to_string()), 3, 7));
        assert_eq!(JSError::Disabled.location().2, 0);
    }
}
