//! Capability-keyed tool registry and the normalizing invoker

use super::{Tool, ToolInvocationResult, ToolMetadata};
use crate::error::{Result, WardenError};
use crate::types::Params;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Name → tool registry.
///
/// Shared by cloning; registration is last-writer-wins. The lock is never held
/// across an `.await`: lookups clone the `Arc` out first.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its metadata name; returns the tool it replaced
    pub fn register(&self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.metadata().name;
        tracing::debug!(tool = %name, "registering tool");
        self.tools.write().insert(name, tool)
    }

    /// Remove a tool
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().remove(name)
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// Metadata of a registered tool
    pub fn metadata(&self, name: &str) -> Option<ToolMetadata> {
        self.get(name).map(|t| t.metadata())
    }

    /// Sorted tool names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata of every tool, sorted by name
    pub fn catalog(&self) -> Vec<ToolMetadata> {
        let mut catalog: Vec<ToolMetadata> =
            self.tools.read().values().map(|t| t.metadata()).collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Whether no tools are registered
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

/// Dispatches by name and normalizes every failure mode into a result.
///
/// Does not retry.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    registry: ToolRegistry,
}

impl ToolInvoker {
    /// Invoker over a registry
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    /// Underlying registry
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invoke a tool.
    ///
    /// Only an unknown tool name is an `Err`; returned errors and panics come
    /// back as `success = false`.
    pub async fn invoke(&self, name: &str, input: &Params) -> Result<ToolInvocationResult> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| WardenError::ToolNotFound(name.to_string()))?;

        let outcome = AssertUnwindSafe(tool.execute(input)).catch_unwind().await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => ToolInvocationResult::failure(format!("{:#}", err)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %name, %message, "tool panicked");
                ToolInvocationResult::failure(format!("tool panicked: {}", message))
            }
        };

        if !result.success {
            tracing::warn!(tool = %name, error = %result.error_message(), "tool invocation failed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::read("echo", "echo input")
        }

        async fn execute(&self, input: &Params) -> anyhow::Result<ToolInvocationResult> {
            Ok(ToolInvocationResult::ok(serde_json::to_string(input)?))
        }
    }

    struct Exploding;

    #[async_trait]
    impl Tool for Exploding {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::write("explode", "always errors")
        }

        async fn execute(&self, _input: &Params) -> anyhow::Result<ToolInvocationResult> {
            anyhow::bail!("range is protected")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Tool for Panicking {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::write("panic", "always panics")
        }

        async fn execute(&self, _input: &Params) -> anyhow::Result<ToolInvocationResult> {
            panic!("index out of bounds")
        }
    }

    fn invoker() -> ToolInvoker {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(Exploding));
        registry.register(Arc::new(Panicking));
        ToolInvoker::new(registry)
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = invoker().invoke("missing", &Params::new()).await.unwrap_err();
        assert!(matches!(err, WardenError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn errors_and_panics_normalize_to_failures() {
        let invoker = invoker();

        let errored = invoker.invoke("explode", &Params::new()).await.unwrap();
        assert!(!errored.success);
        assert!(errored.error_message().contains("range is protected"));

        let panicked = invoker.invoke("panic", &Params::new()).await.unwrap();
        assert!(!panicked.success);
        assert!(panicked.error_message().contains("index out of bounds"));
    }

    #[test]
    fn registration_is_last_writer_wins() {
        let registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(Echo)).is_none());
        assert!(registry.register(Arc::new(Echo)).is_some());
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }
}
