//! Capability loading and unloading on the supervisor.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::FleetSupervisor;
use crate::background::{isolate, isolate_sync};
use crate::capability::{split_dependency, Capability, CapabilityContext, CapabilityError};
use crate::sync::{read, write};

/// Aliases a capability may not take: they name supervisor operations.
pub const RESERVED_NAMES: &[&str] = &[
    "connect",
    "disconnect",
    "dispatch",
    "arm",
    "disarm",
    "takeoff",
    "land",
    "goto",
    "set_fence",
    "manual_control",
    "action_stop",
    "kill",
    "pause",
    "resume",
    "wait",
    "close",
    "vehicle",
    "vehicles",
    "names",
    "config",
    "load_capability",
    "unload_capability",
    "capability",
    "capabilities",
];

pub(super) struct LoadedCapability {
    pub alias: String,
    pub name: &'static str,
    pub instance: Arc<dyn Capability>,
}

impl FleetSupervisor {
    /// Load catalogue entry `name` under `alias` (default: the name).
    ///
    /// `options`, when given, restricts which catalogue names are eligible.
    /// Declared dependencies are loaded first. If construction or start
    /// fails, the partial instance is closed and every dependency loaded
    /// by this call is unloaded again. Load hooks run once the lock is
    /// released.
    pub async fn load_capability(
        &self,
        name: &str,
        alias: Option<&str>,
        options: Option<&[&str]>,
    ) -> Result<Arc<dyn Capability>, CapabilityError> {
        let mut loaded = Vec::new();
        let result = {
            let _guard = self.capability_lock.lock().await;
            self.load_locked(name.to_string(), alias.map(str::to_string), options, Vec::new(), &mut loaded)
                .await
        };
        for (alias, instance) in &loaded {
            // Dependencies unwound after a failure never count as loaded.
            if self.capability(alias).is_some() {
                self.hooks.capability_loaded(alias, instance).await;
            }
        }
        result
    }

    fn load_locked<'a>(
        &'a self,
        name: String,
        alias: Option<String>,
        options: Option<&'a [&'a str]>,
        chain: Vec<String>,
        loaded: &'a mut Vec<(String, Arc<dyn Capability>)>,
    ) -> BoxFuture<'a, Result<Arc<dyn Capability>, CapabilityError>> {
        Box::pin(async move {
            let alias = alias.unwrap_or_else(|| name.clone());
            if RESERVED_NAMES.contains(&alias.as_str()) {
                return Err(CapabilityError::NameCollision(alias));
            }
            if self.capability(&alias).is_some() {
                return Err(CapabilityError::AlreadyLoaded(alias));
            }
            if options.is_some_and(|eligible| !eligible.contains(&name.as_str())) {
                return Err(CapabilityError::NotFound(name));
            }
            let entry = self
                .catalogue
                .get(&name)
                .cloned()
                .ok_or_else(|| CapabilityError::NotFound(name.clone()))?;

            let mut chain = chain;
            chain.push(name.clone());
            let mut ours: Vec<String> = Vec::new();

            for dependency in entry.dependencies {
                let resolved = self
                    .load_dependency(dependency, &chain, &mut ours, loaded)
                    .await;
                if let Err(cause) = resolved {
                    warn!(capability = %name, dependency = %dependency, error = %cause, "Dependency failed");
                    self.unwind(&ours).await;
                    return Err(CapabilityError::Dependency {
                        name,
                        dependency: (*dependency).to_string(),
                        cause: Box::new(cause),
                    });
                }
            }

            let ctx = CapabilityContext {
                alias: alias.clone(),
                fleet: self.me.clone(),
                settings: self.config.capabilities.settings_for(entry.name),
            };
            let instance = match isolate_sync(|| (entry.factory)(ctx)) {
                Ok(instance) => instance,
                Err(reason) => {
                    warn!(capability = %name, error = %format!("{reason:#}"), "Construction failed");
                    self.unwind(&ours).await;
                    return Err(CapabilityError::Construction { name, reason });
                }
            };

            write(&self.capabilities).push(LoadedCapability {
                alias: alias.clone(),
                name: entry.name,
                instance: Arc::clone(&instance),
            });
            if let Err(reason) = isolate(instance.start()).await {
                warn!(capability = %name, error = %format!("{reason:#}"), "Start failed, unwinding");
                write(&self.capabilities).retain(|c| c.alias != alias);
                if let Err(e) = isolate(instance.close()).await {
                    debug!(capability = %name, error = %format!("{e:#}"), "Close after failed start also failed");
                }
                self.unwind(&ours).await;
                return Err(CapabilityError::Start { name, reason });
            }

            info!(capability = %name, alias = %alias, "✓ Capability loaded");
            loaded.push((alias, Arc::clone(&instance)));
            Ok(instance)
        })
    }

    /// Load `"a"` or `"a.b"` unless already present. Names of top-level
    /// capabilities loaded here are appended to `ours`.
    async fn load_dependency(
        &self,
        dependency: &str,
        chain: &[String],
        ours: &mut Vec<String>,
        loaded: &mut Vec<(String, Arc<dyn Capability>)>,
    ) -> Result<(), CapabilityError> {
        let (top, nested) = split_dependency(dependency)?;
        if chain.iter().any(|c| c == top) {
            return Err(CapabilityError::DependencyCycle(
                chain.iter().map(String::as_str).chain([top]).collect::<Vec<_>>().join(" -> "),
            ));
        }
        let parent = match self.capability(top) {
            Some(existing) => existing,
            None => {
                let instance = self
                    .load_locked(top.to_string(), None, None, chain.to_vec(), loaded)
                    .await?;
                ours.push(top.to_string());
                instance
            }
        };
        if let Some(child) = nested {
            isolate(parent.load(child))
                .await
                .map_err(|reason| CapabilityError::Start {
                    name: dependency.to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Unload capabilities loaded as dependencies, newest first. No hooks
    /// run: these were never reported as loaded.
    async fn unwind(&self, aliases: &[String]) {
        for alias in aliases.iter().rev() {
            if let Err(e) = self.remove_capability(alias, false).await {
                debug!(capability = %alias, error = %e, "Nothing to unwind");
            }
        }
    }

    /// Unload `alias`. Hooks see the instance after it left the registry;
    /// their failures are logged and `close` is always called.
    pub async fn unload_capability(&self, alias: &str) -> Result<(), CapabilityError> {
        let _guard = self.capability_lock.lock().await;
        self.remove_capability(alias, true).await
    }

    async fn remove_capability(&self, alias: &str, notify: bool) -> Result<(), CapabilityError> {
        let removed = {
            let mut table = write(&self.capabilities);
            let index = table
                .iter()
                .position(|c| c.alias == alias)
                .ok_or_else(|| CapabilityError::NotLoaded(alias.to_string()))?;
            table.remove(index)
        };
        if notify {
            self.hooks
                .capability_unloaded(&removed.alias, &removed.instance)
                .await;
        }
        if let Err(e) = isolate(removed.instance.close()).await {
            warn!(capability = %alias, error = %format!("{e:#}"), "Close failed");
        }
        info!(capability = %alias, name = removed.name, "Capability unloaded");
        Ok(())
    }

    pub(super) async fn unload_all_capabilities(&self) {
        let _guard = self.capability_lock.lock().await;
        let aliases: Vec<String> = read(&self.capabilities)
            .iter()
            .rev()
            .map(|c| c.alias.clone())
            .collect();
        for alias in aliases {
            if let Err(e) = self.remove_capability(&alias, true).await {
                debug!(capability = %alias, error = %e, "Already unloaded");
            }
        }
    }

    /// Loaded instance by alias.
    pub fn capability(&self, alias: &str) -> Option<Arc<dyn Capability>> {
        read(&self.capabilities)
            .iter()
            .find(|c| c.alias == alias)
            .map(|c| Arc::clone(&c.instance))
    }

    /// Loaded aliases in load order.
    pub fn capabilities(&self) -> Vec<String> {
        read(&self.capabilities)
            .iter()
            .map(|c| c.alias.clone())
            .collect()
    }

    /// Load every capability in the config's autoload list. Failures are
    /// logged and returned; they do not stop the others.
    pub async fn autoload_capabilities(&self) -> Vec<(String, CapabilityError)> {
        let mut failures = Vec::new();
        for name in &self.config.capabilities.autoload {
            if let Err(e) = self.load_capability(name, None, None).await {
                warn!(capability = %name, error = %e, "Autoload failed");
                failures.push((name.clone(), e));
            }
        }
        failures
    }
}
