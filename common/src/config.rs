//! Layered, namespaced key/value configuration.
//!
//! A [`Config`] is one scope in a tree: environment -> command -> experiment ->
//! presentation -> graph -> instance. Lookups walk from the queried scope up
//! through its ancestors and the nearest binding wins. A binding is either a
//! literal [`Value`] or a deferred function that is evaluated against the
//! scope the lookup *started* from, so a value bound on the environment can
//! read the sweep variable `x` bound on an instance far below it.
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use regex::Regex;
use serde_json::Value;
use tracing::trace;

use crate::error::ConfigError;

/// The scope levels a [`Config`] node can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Env,
    Cmd,
    Exp,
    Pres,
    Graph,
    /// Per-x instance; only binds the sweep value itself.
    Instance,
}

impl Namespace {
    /// Namespaces whose options may be spelled out explicitly from another scope.
    pub const OPTION_SCOPES: [Namespace; 5] = [
        Namespace::Env,
        Namespace::Cmd,
        Namespace::Exp,
        Namespace::Pres,
        Namespace::Graph,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Namespace::Env => "env",
            Namespace::Cmd => "cmd",
            Namespace::Exp => "exp",
            Namespace::Pres => "pres",
            Namespace::Graph => "graph",
            Namespace::Instance => "x",
        }
    }

    /// The option scope a key already names, if any (`cmd_trials` -> [`Namespace::Cmd`]).
    pub fn owner(key: &str) -> Option<Namespace> {
        Self::OPTION_SCOPES.into_iter().find(|ns| {
            key.strip_prefix(ns.tag())
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|rest| !rest.is_empty())
        })
    }

    /// Fully qualifies `key` for storage in a scope of this namespace.
    pub fn qualify(&self, key: &str) -> String {
        if Self::owner(key).is_some() {
            key.to_owned()
        } else {
            format!("{}_{key}", self.tag())
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

pub type Deferred = Arc<dyn Fn(&Config) -> Result<Value, ConfigError> + Send + Sync>;

#[derive(Clone)]
pub enum ConfigValue {
    Literal(Value),
    /// Evaluated on every lookup, against the scope the lookup started from.
    Deferred(Deferred),
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("placeholder pattern"));

impl ConfigValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ConfigValue::Literal(value.into())
    }

    pub fn deferred<F>(func: F) -> Self
    where
        F: Fn(&Config) -> Result<Value, ConfigError> + Send + Sync + 'static,
    {
        ConfigValue::Deferred(Arc::new(func))
    }

    /// Turns `${key}` placeholders anywhere inside `value` into a deferred lookup.
    ///
    /// A string that is exactly one placeholder resolves to the raw value of the
    /// key, so `"${x}"` stays a number. Values without placeholders stay literal.
    pub fn template(value: Value) -> Self {
        if has_placeholder(&value) {
            ConfigValue::deferred(move |config| interpolate(config, &value))
        } else {
            ConfigValue::Literal(value)
        }
    }
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Literal(value) => write!(f, "Literal({value})"),
            ConfigValue::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ConfigValue {
                fn from(value: $ty) -> Self {
                    ConfigValue::Literal(value.into())
                }
            }
        )*
    };
}
literal_from!(Value, &str, String, bool, i32, i64, u32, u64, usize, f64);

impl<T: Into<Value>> From<Vec<T>> for ConfigValue {
    fn from(value: Vec<T>) -> Self {
        ConfigValue::Literal(value.into())
    }
}

fn has_placeholder(value: &Value) -> bool {
    match value {
        Value::String(s) => PLACEHOLDER.is_match(s),
        Value::Array(items) => items.iter().any(has_placeholder),
        Value::Object(map) => map.values().any(has_placeholder),
        _ => false,
    }
}

fn interpolate(config: &Config, value: &Value) -> Result<Value, ConfigError> {
    match value {
        Value::String(s) => {
            if let Some(caps) = PLACEHOLDER.captures(s)
                && caps[0].len() == s.len()
            {
                return config.get(&caps[1]);
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in PLACEHOLDER.captures_iter(s) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                out.push_str(&s[last..whole.start()]);
                out.push_str(&config.get_string(&caps[1])?);
                last = whole.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate(config, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| interpolate(config, v).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Ordered, not-yet-namespaced bindings handed to a scope.
#[derive(Debug, Clone, Default)]
pub struct Overrides(Vec<(String, ConfigValue)>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.push(key, value);
        self
    }

    pub fn deferred<F>(self, key: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Config) -> Result<Value, ConfigError> + Send + Sync + 'static,
    {
        self.set(key, ConfigValue::deferred(func))
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.push((key.into(), value.into()));
    }

    /// Builds overrides from plain data, expanding `${key}` templates.
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), ConfigValue::template(v)))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>> FromIterator<(K, ConfigValue)> for Overrides {
    fn from_iter<T: IntoIterator<Item = (K, ConfigValue)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

thread_local! {
    /// `(scope, key)` pairs being resolved on this thread, outermost first.
    static RESOLVING: RefCell<Vec<(usize, String)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a key as being resolved from one scope until dropped.
///
/// Reading the same key from another scope (a deferred value consulting
/// `c.parent()`) is not a cycle.
struct ResolveGuard;

impl ResolveGuard {
    fn enter(scope: usize, key: &str) -> Result<Self, ConfigError> {
        RESOLVING.with_borrow_mut(|stack| {
            if let Some(start) = stack.iter().position(|(s, k)| *s == scope && k == key) {
                let chain = stack[start..]
                    .iter()
                    .map(|(_, k)| k.as_str())
                    .chain(std::iter::once(key))
                    .collect::<Vec<_>>();
                return Err(ConfigError::ResolutionCycle(chain.join(" -> ")));
            }
            stack.push((scope, key.to_owned()));
            Ok(ResolveGuard)
        })
    }
}

impl Drop for ResolveGuard {
    fn drop(&mut self) {
        RESOLVING.with_borrow_mut(|stack| {
            stack.pop();
        });
    }
}

struct Scope {
    prefix: Namespace,
    parent: Option<Config>,
    values: RwLock<HashMap<String, ConfigValue>>,
}

/// Handle to one scope of the configuration tree.
///
/// Cloning the handle shares the scope; use [`Config::new_child`],
/// [`Config::overlay`] or [`Config::rebase_under`] for a new one.
#[derive(Clone)]
pub struct Config {
    scope: Arc<Scope>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// A fresh root scope, owned by whoever creates it.
    pub fn new() -> Self {
        Self::with_parent(Namespace::Env, None, HashMap::new())
    }

    fn with_parent(
        prefix: Namespace,
        parent: Option<Config>,
        values: HashMap<String, ConfigValue>,
    ) -> Self {
        Self {
            scope: Arc::new(Scope {
                prefix,
                parent,
                values: RwLock::new(values),
            }),
        }
    }

    fn values(&self) -> RwLockReadGuard<'_, HashMap<String, ConfigValue>> {
        self.scope
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn values_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, ConfigValue>> {
        self.scope
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn prefix(&self) -> Namespace {
        self.scope.prefix
    }

    pub fn parent(&self) -> Option<&Config> {
        self.scope.parent.as_ref()
    }

    /// Keys bound directly on this scope, sorted.
    pub fn own_keys(&self) -> Vec<String> {
        let mut keys = self.values().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    fn lookup(&self, key: &str) -> Option<ConfigValue> {
        let mut scope = Some(self);
        while let Some(config) = scope {
            if let Some(value) = config.values().get(key) {
                return Some(value.clone());
            }
            scope = config.parent();
        }
        None
    }

    /// True if `key` is bound on this scope or any ancestor. Never evaluates.
    pub fn contains(&self, key: &str) -> bool {
        let mut scope = Some(self);
        while let Some(config) = scope {
            if config.values().contains_key(key) {
                return true;
            }
            scope = config.parent();
        }
        false
    }

    /// Resolves `key`, evaluating deferred values against `self`.
    pub fn get(&self, key: &str) -> Result<Value, ConfigError> {
        match self.lookup(key) {
            Some(ConfigValue::Literal(value)) => Ok(value),
            Some(ConfigValue::Deferred(func)) => {
                let _guard = ResolveGuard::enter(Arc::as_ptr(&self.scope) as usize, key)?;
                trace!("Resolving deferred {key} from {} scope", self.prefix());
                func(self)
            }
            None => Err(ConfigError::KeyNotFound(key.to_owned())),
        }
    }

    pub fn get_opt(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        if self.contains(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        scalar_string(key, &self.get(key)?)
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigError> {
        let value = self.get(key)?;
        let parsed = match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| mismatch(key, "unsigned integer", &value))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ConfigError> {
        let value = self.get(key)?;
        let parsed = match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| mismatch(key, "number", &value))
    }

    /// A list of scalars; `null` reads as empty and a lone scalar as a one-item list.
    pub fn get_string_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.get(key)? {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items.iter().map(|item| scalar_string(key, item)).collect(),
            other => Ok(vec![scalar_string(key, &other)?]),
        }
    }

    /// A mapping of scalars; `null` reads as empty.
    pub fn get_string_map(&self, key: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        match self.get(key)? {
            Value::Null => Ok(BTreeMap::new()),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| scalar_string(key, v).map(|v| (k.clone(), v)))
                .collect(),
            other => Err(mismatch(key, "mapping", &other)),
        }
    }

    /// Binds `key` on this scope only.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values_mut().insert(key.into(), value.into());
    }

    pub fn set_deferred<F>(&self, key: impl Into<String>, func: F)
    where
        F: Fn(&Config) -> Result<Value, ConfigError> + Send + Sync + 'static,
    {
        self.set(key, ConfigValue::deferred(func));
    }

    /// Binds `key` only if nothing in the chain resolves it yet.
    pub fn default(&self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        let key = key.into();
        if !self.contains(&key) {
            self.set(key, value);
        }
    }

    /// Binds every override, qualified by `prefix` unless it already names a scope.
    pub fn bulk_add(&self, prefix: Namespace, overrides: &Overrides) {
        let mut values = self.values_mut();
        for (key, value) in overrides.iter() {
            values.insert(prefix.qualify(key), value.clone());
        }
    }

    /// Like [`Config::bulk_add`] but never shadows an existing binding.
    pub fn defaults(&self, prefix: Namespace, overrides: &Overrides) {
        for (key, value) in overrides.iter() {
            self.default(prefix.qualify(key), value.clone());
        }
    }

    /// Creates a child scope; `root` is bound under the bare namespace tag.
    pub fn new_child(
        &self,
        prefix: Namespace,
        root: Option<Value>,
        overrides: &Overrides,
    ) -> Config {
        let mut values = HashMap::new();
        if let Some(root) = root {
            values.insert(prefix.tag().to_owned(), ConfigValue::Literal(root));
        }
        let child = Self::with_parent(prefix, Some(self.clone()), values);
        child.bulk_add(prefix, overrides);
        child
    }

    /// A new scope with this scope's own bindings and `overrides` on top,
    /// sharing this scope's parent. `self` is left untouched.
    pub fn overlay(&self, overrides: &Overrides) -> Config {
        let layered = Self::with_parent(
            self.prefix(),
            self.scope.parent.clone(),
            self.values().clone(),
        );
        layered.bulk_add(self.prefix(), overrides);
        layered
    }

    /// Copies this scope's own bindings into a new child of `other`,
    /// dropping its former ancestors.
    pub fn rebase_under(&self, other: &Config) -> Config {
        Self::with_parent(self.prefix(), Some(other.clone()), self.values().clone())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("prefix", &self.prefix())
            .field("keys", &self.own_keys())
            .field("parent", &self.scope.parent)
            .finish()
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

fn mismatch(key: &str, expected: &'static str, found: &Value) -> ConfigError {
    ConfigError::TypeMismatch {
        key: key.to_owned(),
        expected,
        found: kind(found).to_owned(),
    }
}

fn scalar_string(key: &str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(mismatch(key, "scalar", other)),
    }
}
