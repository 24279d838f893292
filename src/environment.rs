use std::collections::HashMap;

use indexmap::IndexMap;

/// Environment handed to a spawned service.
///
/// Later `set` calls overwrite earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates an empty environment.
    ///
    /// # Returns
    /// * `Self` - An environment with no variables
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Snapshot of the harness's own environment.
    pub fn inherited() -> Self {
        Self(std::env::vars().collect())
    }

    /// Builds the child environment for a service.
    ///
    /// With `inherit` the harness environment is the base and `configured`
    /// is overlaid; without it the child sees `configured` only.
    ///
    /// # Arguments
    /// * `configured` - Variables from the service's `env` table
    /// * `inherit` - Whether to start from the harness's own environment
    ///
    /// # Examples
    /// ```
    /// use indexmap::IndexMap;
    /// use stagehand::environment::Environment;
    ///
    /// let mut configured = IndexMap::new();
    /// configured.insert("ORIGIN_PORT".to_string(), "8080".to_string());
    ///
    /// let env = Environment::for_service(&configured, false);
    /// assert_eq!(env.len(), 1);
    /// ```
    pub fn for_service(configured: &IndexMap<String, String>, inherit: bool) -> Self {
        let mut env = if inherit {
            Self::inherited()
        } else {
            Self::new()
        };
        for (key, value) in configured {
            env.set(key.clone(), value.clone());
        }
        env
    }

    /// Sets a variable, replacing any earlier value.
    ///
    /// # Arguments
    /// * `key` - The variable name
    /// * `value` - The variable value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}
