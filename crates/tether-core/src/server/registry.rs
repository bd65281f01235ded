//! Named method table for the server.
//!
//! Handlers are registered by name at startup; the dispatcher looks them up per
//! request. Methods registered with [`MethodRegistryBuilder::mutating`] feed the
//! autosave scheduler when they succeed.

use crate::error::EngineError;
use crate::filter::Predicate;
use crate::{Result, TetherError};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

/// Outcome of an engine handler.
pub type HandlerResult = std::result::Result<Value, EngineError>;

/// A registered method.
pub type Handler = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// One positional parameter after predicate compilation.
#[derive(Debug, Clone)]
pub enum Param {
    Value(Value),
    /// A top-level predicate parameter.
    Predicate(Arc<Predicate>),
    /// An options object with one or more predicate fields pulled out.
    Options {
        fields: Map<String, Value>,
        predicates: BTreeMap<String, Arc<Predicate>>,
    },
}

/// Arguments passed to a handler.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    params: Vec<Param>,
    collection: Option<String>,
}

impl CallArgs {
    pub fn new(params: Vec<Param>, collection: Option<String>) -> Self {
        Self { params, collection }
    }

    /// Plain JSON arguments, no predicates.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(values.into_iter().map(Param::Value).collect(), None)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// The JSON value at `index`, if it is a plain value. `null` counts as absent.
    pub fn value(&self, index: usize) -> Option<&Value> {
        match self.params.get(index) {
            Some(Param::Value(Value::Null)) | None => None,
            Some(Param::Value(value)) => Some(value),
            Some(_) => None,
        }
    }

    /// A required plain value.
    pub fn require(&self, index: usize) -> std::result::Result<&Value, EngineError> {
        self.value(index)
            .ok_or_else(|| EngineError::invalid_params(format!("missing argument {}", index)))
    }

    /// A required string argument.
    pub fn str(&self, index: usize) -> std::result::Result<&str, EngineError> {
        self.require(index)?
            .as_str()
            .ok_or_else(|| EngineError::invalid_params(format!("argument {} must be a string", index)))
    }

    /// The predicate at `index`, if that parameter was a callable.
    pub fn predicate(&self, index: usize) -> Option<&Predicate> {
        match self.params.get(index) {
            Some(Param::Predicate(predicate)) => Some(predicate),
            _ => None,
        }
    }

    /// A predicate nested as `field` inside the options object at `index`.
    pub fn option_predicate(&self, index: usize, field: &str) -> Option<&Predicate> {
        match self.params.get(index) {
            Some(Param::Options { predicates, .. }) => predicates.get(field).map(|p| p.as_ref()),
            _ => None,
        }
    }

    /// The non-callable fields of the options object at `index`.
    pub fn options(&self, index: usize) -> Option<&Map<String, Value>> {
        match self.params.get(index) {
            Some(Param::Value(Value::Object(fields))) => Some(fields),
            Some(Param::Options { fields, .. }) => Some(fields),
            _ => None,
        }
    }
}

/// Immutable table of handlers, shared by every connection.
pub struct MethodRegistry {
    methods: HashMap<String, Handler>,
    mutating: HashSet<String>,
}

impl MethodRegistry {
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.methods.get(name).cloned()
    }

    pub fn is_mutating(&self, name: &str) -> bool {
        self.mutating.contains(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .field("mutating", &self.mutating)
            .finish()
    }
}

#[derive(Default)]
pub struct MethodRegistryBuilder {
    entries: Vec<(String, Handler, bool)>,
}

impl MethodRegistryBuilder {
    /// Register a read-only method.
    pub fn method<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name.into(), handler, false)
    }

    /// Register a method whose successful calls count as mutations.
    pub fn mutating<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name.into(), handler, true)
    }

    fn register<F, Fut>(mut self, name: String, handler: F, mutating: bool) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        self.entries.push((name, handler, mutating));
        self
    }

    /// Validate names and freeze the table.
    pub fn build(self) -> Result<MethodRegistry> {
        let mut methods = HashMap::with_capacity(self.entries.len());
        let mut mutating = HashSet::new();

        for (name, handler, is_mutating) in self.entries {
            if name.trim().is_empty() {
                return Err(TetherError::Config {
                    field: "method".to_string(),
                    message: "method names must not be empty".to_string(),
                });
            }
            if methods.contains_key(&name) {
                return Err(TetherError::Config {
                    field: "method".to_string(),
                    message: format!("'{}' is registered twice", name),
                });
            }
            if is_mutating {
                mutating.insert(name.clone());
            }
            methods.insert(name, handler);
        }

        Ok(MethodRegistry { methods, mutating })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(args: CallArgs) -> HandlerResult {
        Ok(args.value(0).cloned().unwrap_or(Value::Null))
    }

    async fn insert(_args: CallArgs) -> HandlerResult {
        Ok(json!({"inserted": 1}))
    }

    #[tokio::test]
    async fn test_build_and_invoke() {
        let registry = MethodRegistry::builder()
            .method("echo", echo)
            .mutating("insert", insert)
            .build()
            .unwrap();

        assert_eq!(registry.names(), vec!["echo", "insert"]);
        assert!(registry.is_mutating("insert"));
        assert!(!registry.is_mutating("echo"));
        assert!(registry.get("frobnicate").is_none());

        let handler = registry.get("echo").unwrap();
        let result = handler(CallArgs::from_values(vec![json!("hi")])).await.unwrap();
        assert_eq!(result, json!("hi"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = MethodRegistry::builder()
            .method("get", echo)
            .mutating("get", echo)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = MethodRegistry::builder().method("  ", echo).build();
        assert!(matches!(result, Err(TetherError::Config { .. })));
    }

    #[test]
    fn test_call_args_accessors() {
        let predicate = Arc::new(Predicate::compile("d => d.n > 1").unwrap());
        let mut fields = Map::new();
        fields.insert("topK".into(), json!(5));
        let mut predicates = BTreeMap::new();
        predicates.insert("filter".to_string(), predicate.clone());

        let args = CallArgs::new(
            vec![
                Param::Value(json!("hello")),
                Param::Options { fields, predicates },
                Param::Predicate(predicate),
                Param::Value(Value::Null),
            ],
            Some("docs".into()),
        );

        assert_eq!(args.str(0).unwrap(), "hello");
        assert!(args.str(1).is_err());
        assert_eq!(args.options(1).unwrap()["topK"], json!(5));
        assert!(args.option_predicate(1, "filter").is_some());
        assert!(args.option_predicate(1, "missing").is_none());
        assert!(args.predicate(2).unwrap().matches(&json!({"n": 2})));
        assert!(args.value(3).is_none());
        assert!(matches!(
            args.require(9),
            Err(EngineError::InvalidParams { .. })
        ));
        assert_eq!(args.collection(), Some("docs"));
    }
}
