//! Capabilities: optional fleet extensions loaded by name.
//!
//! Implementations are registered in a [`CapabilityCatalogue`], a static
//! name → factory table with declared dependencies. The fleet supervisor
//! loads them on request (see `FleetSupervisor::load_capability`).
//!
//! A dependency is either `"a"` (load capability `a` first) or `"a.b"`
//! (load `a`, then ask it to load its nested `b`). Deeper chains are
//! rejected.

pub mod status_feed;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use thiserror::Error;

use crate::fleet::FleetSupervisor;

#[async_trait]
pub trait Capability: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    /// Release everything the capability holds. Called exactly once, also
    /// after a failed start.
    async fn close(&self) -> anyhow::Result<()>;

    /// Load a nested capability by name.
    async fn load(&self, child: &str) -> anyhow::Result<()> {
        Err(anyhow!("nested capability '{child}' is not provided"))
    }

    /// JSON snapshot for operators.
    fn status(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// What a factory gets to build an instance.
#[derive(Clone)]
pub struct CapabilityContext {
    pub alias: String,
    pub fleet: Weak<FleetSupervisor>,
    /// `[capabilities.<name>]` table from the config, empty if absent
    pub settings: toml::Table,
}

pub type CapabilityFactory = fn(CapabilityContext) -> anyhow::Result<Arc<dyn Capability>>;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("'{0}' collides with a fleet operation name")]
    NameCollision(String),

    #[error("capability '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("no capability named '{0}'")]
    NotFound(String),

    #[error("capability '{0}' is registered more than once")]
    Ambiguous(String),

    #[error("dependency '{0}' nests more than one level")]
    DependencyTooDeep(String),

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("'{name}' needs '{dependency}'")]
    Dependency {
        name: String,
        dependency: String,
        #[source]
        cause: Box<CapabilityError>,
    },

    #[error("failed to construct '{name}': {reason:#}")]
    Construction { name: String, reason: anyhow::Error },

    #[error("failed to start '{name}': {reason:#}")]
    Start { name: String, reason: anyhow::Error },

    #[error("capability '{0}' is not loaded")]
    NotLoaded(String),
}

#[derive(Clone)]
pub struct CatalogueEntry {
    pub name: &'static str,
    pub dependencies: &'static [&'static str],
    pub factory: CapabilityFactory,
}

/// Name → factory table. Every name maps to exactly one implementation.
#[derive(Clone, Default)]
pub struct CapabilityCatalogue {
    entries: BTreeMap<&'static str, CatalogueEntry>,
}

impl CapabilityCatalogue {
    pub fn builder() -> CatalogueBuilder {
        CatalogueBuilder::default()
    }

    /// Capabilities bundled with the crate.
    pub fn builtin() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            status_feed::NAME,
            CatalogueEntry {
                name: status_feed::NAME,
                dependencies: &[],
                factory: status_feed::create,
            },
        );
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&CatalogueEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
pub struct CatalogueBuilder {
    entries: Vec<CatalogueEntry>,
}

impl CatalogueBuilder {
    #[must_use]
    pub fn register(
        mut self,
        name: &'static str,
        dependencies: &'static [&'static str],
        factory: CapabilityFactory,
    ) -> Self {
        self.entries.push(CatalogueEntry {
            name,
            dependencies,
            factory,
        });
        self
    }

    /// Add the bundled capabilities.
    #[must_use]
    pub fn with_builtins(mut self) -> Self {
        self.entries
            .extend(CapabilityCatalogue::builtin().entries.into_values());
        self
    }

    /// Fails with `Ambiguous` if a name was registered twice, or with
    /// `DependencyTooDeep` if a declared dependency nests too far.
    pub fn build(self) -> Result<CapabilityCatalogue, CapabilityError> {
        let mut entries = BTreeMap::new();
        for entry in self.entries {
            if let Some(dep) = entry
                .dependencies
                .iter()
                .find(|d| split_dependency(d).is_err())
            {
                return Err(CapabilityError::DependencyTooDeep((*dep).to_string()));
            }
            if entries.insert(entry.name, entry.clone()).is_some() {
                return Err(CapabilityError::Ambiguous(entry.name.to_string()));
            }
        }
        Ok(CapabilityCatalogue { entries })
    }
}

/// Split `"a"` or `"a.b"` into the top-level name and the nested one.
pub fn split_dependency(dependency: &str) -> Result<(&str, Option<&str>), CapabilityError> {
    let mut parts = dependency.split('.');
    let top = parts.next().unwrap_or_default();
    let nested = parts.next();
    if top.is_empty() || nested.is_some_and(str::is_empty) || parts.next().is_some() {
        return Err(CapabilityError::DependencyTooDeep(dependency.to_string()));
    }
    Ok((top, nested))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl Capability for Nothing {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn nothing(_: CapabilityContext) -> anyhow::Result<Arc<dyn Capability>> {
        Ok(Arc::new(Nothing))
    }

    #[test]
    fn test_duplicate_names_are_ambiguous() {
        let result = CapabilityCatalogue::builder()
            .register("camera", &[], nothing)
            .register("camera", &[], nothing)
            .build();
        assert!(matches!(result, Err(CapabilityError::Ambiguous(name)) if name == "camera"));
    }

    #[test]
    fn test_builtins_merge() {
        let catalogue = CapabilityCatalogue::builder()
            .register("camera", &["status_feed"], nothing)
            .with_builtins()
            .build()
            .unwrap();
        assert_eq!(catalogue.names().collect::<Vec<_>>(), vec!["camera", "status_feed"]);
        assert_eq!(catalogue.get("camera").unwrap().dependencies, &["status_feed"]);
    }

    #[test]
    fn test_dependency_depth() {
        assert_eq!(split_dependency("camera").unwrap(), ("camera", None));
        assert_eq!(split_dependency("mission.gimbal").unwrap(), ("mission", Some("gimbal")));
        assert!(matches!(
            split_dependency("a.b.c"),
            Err(CapabilityError::DependencyTooDeep(_))
        ));
        assert!(split_dependency(".b").is_err());

        let result = CapabilityCatalogue::builder()
            .register("deep", &["a.b.c"], nothing)
            .build();
        assert!(matches!(result, Err(CapabilityError::DependencyTooDeep(d)) if d == "a.b.c"));
    }
}
