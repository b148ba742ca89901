// =====================================================
// FUNCTION REGISTRY
// Named transformation functions, validated at registration
// =====================================================

mod builtins;
mod plugin;

pub use builtins::{CoalesceNull, ToGuid};
pub use plugin::{NoPlugins, PluginLoader};

use crate::db_types::RowValue;
use crate::identity::IdentityCache;
use crate::schema::TableMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Value,
    Error,
}

/// Declared shape of a transformation function.
///
/// `parameters` counts the schema parameter slots; the running column value
/// is always appended as the final argument and is not counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub parameters: Option<usize>,
    pub returns: Vec<ReturnKind>,
}

impl Signature {
    pub fn value(parameters: usize) -> Self {
        Self {
            parameters: Some(parameters),
            returns: vec![ReturnKind::Value],
        }
    }

    pub fn fallible(parameters: usize) -> Self {
        Self {
            parameters: Some(parameters),
            returns: vec![ReturnKind::Value, ReturnKind::Error],
        }
    }

    pub fn variadic(returns: Vec<ReturnKind>) -> Self {
        Self {
            parameters: None,
            returns,
        }
    }
}

pub trait TransformFunction: Send + Sync {
    fn signature(&self) -> Signature;

    /// `args` holds the resolved parameters followed by the running value.
    fn apply(&self, args: &[RowValue]) -> Result<RowValue, String>;
}

/// Adapts a closure into a [`TransformFunction`].
pub struct FnTransform<F> {
    signature: Signature,
    body: F,
}

impl<F> FnTransform<F> {
    pub fn new(signature: Signature, body: F) -> Arc<dyn TransformFunction>
    where
        F: Fn(&[RowValue]) -> Result<RowValue, String> + Send + Sync + 'static,
    {
        Arc::new(Self { signature, body })
    }
}

impl<F> TransformFunction for FnTransform<F>
where
    F: Fn(&[RowValue]) -> Result<RowValue, String> + Send + Sync,
{
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn apply(&self, args: &[RowValue]) -> Result<RowValue, String> {
        (self.body)(args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Value,
    ValueOrError,
}

/// Accepts one result, or two results where the second is an error.
pub fn validate_signature(name: &str, signature: &Signature) -> Result<ReturnShape, String> {
    if name.trim().is_empty() {
        return Err("Cannot register a function without a name".to_string());
    }
    match signature.returns.as_slice() {
        [_] => Ok(ReturnShape::Value),
        [_, ReturnKind::Error] => Ok(ReturnShape::ValueOrError),
        [_, second] => Err(format!(
            "Can't install function '{}': second result must be an error, got {:?}",
            name, second
        )),
        other => Err(format!(
            "Can't install function '{}' with {} results",
            name,
            other.len()
        )),
    }
}

#[derive(Clone)]
pub struct RegisteredFunction {
    name: String,
    shape: ReturnShape,
    parameters: Option<usize>,
    body: Arc<dyn TransformFunction>,
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl RegisteredFunction {
    fn new(name: &str, body: Arc<dyn TransformFunction>) -> Result<Self, String> {
        let signature = body.signature();
        let shape = validate_signature(name, &signature)?;
        Ok(Self {
            name: name.trim().to_string(),
            shape,
            parameters: signature.parameters,
            body,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> ReturnShape {
        self.shape
    }

    pub fn parameters(&self) -> Option<usize> {
        self.parameters
    }

    pub fn call(&self, args: &[RowValue]) -> Result<RowValue, String> {
        match (self.shape, self.body.apply(args)) {
            (_, Ok(value)) => Ok(value),
            (ReturnShape::ValueOrError, Err(error)) => Err(error),
            (ReturnShape::Value, Err(error)) => Err(format!(
                "function '{}' has no error result but failed: {}",
                self.name, error
            )),
        }
    }
}

/// Immutable view of the registry handed to one session.
#[derive(Clone, Default, Debug)]
pub struct FunctionSet {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionSet {
    pub fn get(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Adds functions on top of this view; nothing is added if any is invalid.
    pub fn extend(
        &mut self,
        registrations: Vec<(String, Arc<dyn TransformFunction>)>,
    ) -> Result<(), String> {
        let validated = registrations
            .into_iter()
            .map(|(name, body)| RegisteredFunction::new(&name, body))
            .collect::<Result<Vec<_>, String>>()?;
        for function in validated {
            self.functions.insert(function.name.clone(), function);
        }
        Ok(())
    }

    /// Every function a table references must exist with a matching arity.
    pub fn check_tables(&self, tables: &TableMap) -> Result<(), String> {
        for table in tables.values() {
            for (column_name, column) in table.ordered_columns() {
                for function in &column.functions {
                    let registered = self.get(&function.name).ok_or_else(|| {
                        format!(
                            "Function '{}' used by column '{}' of table '{}' is not registered",
                            function.name, column_name, table.name
                        )
                    })?;
                    if let Some(expected) = registered.parameters {
                        if expected != function.parameters.len() {
                            return Err(format!(
                                "Function '{}' used by column '{}' of table '{}' takes {} parameter(s), {} given",
                                function.name,
                                column_name,
                                table.name,
                                expected,
                                function.parameters.len()
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Process-wide registry; sessions work on snapshots of it.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<FunctionSet>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `ToGuid` and `Nil`.
    pub fn with_builtins(identity: Arc<IdentityCache>) -> Result<Self, String> {
        let registry = Self::new();
        registry.register_all(vec![
            ("ToGuid".to_string(), Arc::new(ToGuid::new(identity)) as Arc<dyn TransformFunction>),
            ("Nil".to_string(), Arc::new(CoalesceNull) as Arc<dyn TransformFunction>),
        ])?;
        Ok(registry)
    }

    pub fn register(&self, name: &str, body: Arc<dyn TransformFunction>) -> Result<(), String> {
        self.register_all(vec![(name.to_string(), body)])
    }

    pub fn register_all(
        &self,
        registrations: Vec<(String, Arc<dyn TransformFunction>)>,
    ) -> Result<(), String> {
        let mut guard = self
            .functions
            .write()
            .map_err(|_| "Function registry lock is poisoned".to_string())?;
        guard.extend(registrations)
    }

    pub fn snapshot(&self) -> Result<FunctionSet, String> {
        self.functions
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| "Function registry lock is poisoned".to_string())
    }
}

#[cfg(test)]
mod tests;
