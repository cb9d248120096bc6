use std::collections::BTreeMap;

/// Builds a component from its descriptor.
pub type BuildFn<I, T> = Box<dyn Fn(&I) -> T + Send + Sync>;

/// Component builders keyed by the descriptor's `type` name.
///
/// Unknown names resolve to the fallback builder when one is installed.
pub struct Registry<I, T> {
    builders: BTreeMap<String, BuildFn<I, T>>,
    fallback: Option<BuildFn<I, T>>,
}

impl<I, T> Default for Registry<I, T> {
    fn default() -> Self {
        Self { builders: BTreeMap::new(), fallback: None }
    }
}

impl<I, T> std::fmt::Debug for Registry<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<I, T> Registry<I, T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `build` under `name`, replacing any earlier builder.
    pub fn register<F>(&mut self, name: impl Into<String>, build: F) -> &mut Self
    where
        F: Fn(&I) -> T + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(build));
        self
    }

    pub fn set_fallback<F>(&mut self, build: F) -> &mut Self
    where
        F: Fn(&I) -> T + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(build));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    /// Build with the builder registered for `name`, or the fallback.
    /// Returns `None` when neither exists.
    pub fn build(&self, name: &str, input: &I) -> Option<T> {
        self.builders
            .get(name)
            .or(self.fallback.as_ref())
            .map(|build| build(input))
    }
}
