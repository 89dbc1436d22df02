//! Configuration for execution contexts.
//!
//! A context's configuration is fixed at creation time. Workers inherit the
//! configuration of the context that spawned them.

use crate::runtime::error::ContextError;

/// Configuration for a single execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Script evaluated after the built-in bindings are installed
    pub bootstrap_script: Option<String>,

    /// Install a `console` object that forwards to `tracing` (default: true)
    pub enable_console: bool,

    /// Prefix for context thread names (default: "jsevent")
    pub thread_name_prefix: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            enable_console: true,
            thread_name_prefix: "jsevent".to_string(),
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Check heap limits for consistency before any thread is spawned.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(ContextError::validation(
                "initial_heap_size requires max_heap_size to be set as well",
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(ContextError::validation(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(ContextError::validation("thread_name_prefix cannot be empty"));
        }

        Ok(())
    }

    /// Heap limits in the `(initial, max)` form V8 expects, if any are set.
    pub(crate) fn heap_limits(&self) -> Option<(usize, usize)> {
        self.max_heap_size
            .map(|max| (self.initial_heap_size.unwrap_or(0), max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContextConfig::default();
        assert!(config.max_heap_size.is_none());
        assert!(config.initial_heap_size.is_none());
        assert!(config.bootstrap_script.is_none());
        assert!(config.enable_console);
        assert_eq!(config.thread_name_prefix, "jsevent");
        assert!(config.validate().is_ok());
        assert_eq!(config.heap_limits(), None);
    }

    #[test]
    fn test_config_builder() {
        let config = ContextConfig::new()
            .with_max_heap_size(100 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024)
            .with_bootstrap("globalThis.VERSION = '1.0.0';")
            .with_console(false);

        assert_eq!(config.max_heap_size, Some(100 * 1024 * 1024));
        assert_eq!(config.heap_limits(), Some((1024 * 1024, 100 * 1024 * 1024)));
        assert_eq!(
            config.bootstrap_script.as_deref(),
            Some("globalThis.VERSION = '1.0.0';")
        );
        assert!(!config.enable_console);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_heap_requires_max() {
        let config = ContextConfig::new().with_initial_heap_size(1024);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_initial_heap_cannot_exceed_max() {
        let config = ContextConfig::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(4096);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot exceed"));
    }

    #[test]
    fn test_empty_thread_prefix_rejected() {
        let config = ContextConfig::new().with_thread_name_prefix("  ");
        assert!(config.validate().is_err());
    }
}
