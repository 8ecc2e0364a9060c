// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use super::builtin;
use super::context::BuildContext;
use super::descriptor::OperatorDescriptor;
use super::Operator;
use crate::error::{Error, Result};

type BuildFn =
    Arc<dyn Fn(&OperatorDescriptor, &mut BuildContext) -> Result<Box<dyn Operator>> + Send + Sync>;

/// Registry maps an operator `type` name to the function that decodes its
/// configuration and builds an instance.
///
/// A process-wide default registry carries the builtin operators; pipeline
/// construction takes an explicit registry so tests can build against a
/// hermetic one.
#[derive(Clone, Default)]
pub struct Registry {
    builders: HashMap<String, BuildFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry populated with the builtin operators
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("file_input", builtin::file_input::build);
        registry.register("stdout", builtin::stdout::build);
        registry.register("copy", builtin::copy::build);
        registry.register("metadata", builtin::metadata::build);
        registry.register("noop", builtin::noop::build);
        registry
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, build: F)
    where
        F: Fn(&OperatorDescriptor, &mut BuildContext) -> Result<Box<dyn Operator>>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(type_name.into(), Arc::new(build));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.builders.contains_key(type_name)
    }

    /// Build an operator from its descriptor, failing on unknown types
    pub fn build(
        &self,
        descriptor: &OperatorDescriptor,
        context: &mut BuildContext,
    ) -> Result<Box<dyn Operator>> {
        let builder = self.builders.get(&descriptor.operator_type).ok_or_else(|| {
            Error::Config(format!(
                "unknown operator type '{}'",
                descriptor.operator_type
            ))
        })?;
        builder(descriptor, context)
    }
}

static DEFAULT_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::with_builtins);

/// The process-wide registry of builtin operators
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}
