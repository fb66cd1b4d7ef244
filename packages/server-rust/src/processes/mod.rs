//! Built-in worker implementations and the registry that maps the `class`
//! name in a process configuration to a worker factory.

pub mod echo;
pub mod pass_through;

use std::collections::HashMap;
use std::sync::Arc;

use switchyard_core::{ProcessError, ProcessFactory};

use crate::config::ProcessConfig;
use crate::error::ConfigError;

pub use echo::Echo;
pub use pass_through::PassThrough;

/// Builds a worker factory from a process configuration.
pub type FactoryBuilder =
    Arc<dyn Fn(&ProcessConfig) -> Result<Arc<dyn ProcessFactory>, ProcessError> + Send + Sync>;

/// Named factory builders, consulted when the broker is built.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    builders: HashMap<String, FactoryBuilder>,
}

impl ProcessRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `Echo` and `PassThrough` registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(echo::NAME, Echo::factory);
        registry.register(pass_through::NAME, PassThrough::factory);
        registry
    }

    /// Registers a builder under `name`, replacing any earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F) -> &mut Self
    where
        F: Fn(&ProcessConfig) -> Result<Arc<dyn ProcessFactory>, ProcessError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Builds the factory named by `config.factory`.
    ///
    /// # Errors
    ///
    /// Returns an error if no builder is registered under that name or the
    /// builder rejects the process settings.
    pub fn build(&self, config: &ProcessConfig) -> Result<Arc<dyn ProcessFactory>, ConfigError> {
        let builder = self
            .builders
            .get(&config.factory)
            .ok_or_else(|| ConfigError::UnknownFactory {
                process: config.name.clone(),
                factory: config.factory.clone(),
            })?;
        builder(config).map_err(|source| ConfigError::Process {
            process: config.name.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ProcessRegistry")
            .field("builders", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::ProcessInstance;

    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = ProcessRegistry::with_builtins();
        assert!(registry.contains("Echo"));
        assert!(registry.contains("PassThrough"));
        assert!(!registry.contains("Adder"));
    }

    #[test]
    fn unknown_factory_names_the_process() {
        let registry = ProcessRegistry::new();
        let err = match registry.build(&ProcessConfig::new("add", "Adder")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(
            err,
            ConfigError::UnknownFactory { ref process, ref factory }
                if process == "add" && factory == "Adder"
        ));
    }

    #[test]
    fn custom_builders_see_the_configuration() {
        let mut registry = ProcessRegistry::new();
        registry.register("Echo", |config: &ProcessConfig| {
            if config.max_processes > 2 {
                return Err(ProcessError::Config("too many".to_string()));
            }
            let factory = |id: u64| -> Result<Box<dyn ProcessInstance>, ProcessError> {
                Ok(Box::new(Echo::new(id, switchyard_core::Payload::new())))
            };
            Ok(Arc::new(factory) as Arc<dyn ProcessFactory>)
        });

        let mut config = ProcessConfig::new("add", "Echo");
        assert!(registry.build(&config).is_ok());
        config.max_processes = 3;
        assert!(matches!(registry.build(&config), Err(ConfigError::Process { .. })));
    }

    #[test]
    fn debug_lists_names() {
        let text = format!("{:?}", ProcessRegistry::with_builtins());
        assert!(text.contains("Echo"));
        assert!(text.contains("PassThrough"));
    }
}
