//! Observer hooks on fleet membership and capabilities.
//!
//! Every hook runs isolated: an error or panic is reported to the caller as
//! an `anyhow::Error` and never unwinds into the supervisor.

use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::background::isolate;
use crate::capability::Capability;
use crate::sync::{read, write};
use crate::vehicle::Vehicle;

pub type VehicleHook = Arc<dyn Fn(String, Arc<Vehicle>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type RemovalHook = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type CapabilityHook =
    Arc<dyn Fn(String, Arc<dyn Capability>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    vehicle_connected: RwLock<Vec<VehicleHook>>,
    vehicle_removed: RwLock<Vec<RemovalHook>>,
    capability_loaded: RwLock<Vec<CapabilityHook>>,
    capability_unloaded: RwLock<Vec<CapabilityHook>>,
}

impl Hooks {
    pub fn add_vehicle_connected<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Arc<Vehicle>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        write(&self.vehicle_connected).push(Arc::new(move |name: String, vehicle: Arc<Vehicle>| hook(name, vehicle).boxed()));
    }

    pub fn add_vehicle_removed<F, Fut>(&self, hook: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        write(&self.vehicle_removed).push(Arc::new(move |name: String| hook(name).boxed()));
    }

    pub fn add_capability_loaded<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Arc<dyn Capability>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        write(&self.capability_loaded).push(Arc::new(move |name: String, cap: Arc<dyn Capability>| hook(name, cap).boxed()));
    }

    pub fn add_capability_unloaded<F, Fut>(&self, hook: F)
    where
        F: Fn(String, Arc<dyn Capability>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        write(&self.capability_unloaded).push(Arc::new(move |name: String, cap: Arc<dyn Capability>| hook(name, cap).boxed()));
    }

    /// Stops at the first failing hook and returns its error.
    pub async fn vehicle_connected(&self, name: &str, vehicle: &Arc<Vehicle>) -> anyhow::Result<()> {
        let hooks = read(&self.vehicle_connected).clone();
        for hook in hooks {
            isolate(hook(name.to_string(), Arc::clone(vehicle))).await?;
        }
        Ok(())
    }

    /// Runs every hook; failures are logged.
    pub async fn vehicle_removed(&self, name: &str) {
        let hooks = read(&self.vehicle_removed).clone();
        for hook in hooks {
            if let Err(e) = isolate(hook(name.to_string())).await {
                warn!(vehicle = name, error = %format!("{e:#}"), "Vehicle removal hook failed");
            }
        }
    }

    pub async fn capability_loaded(&self, name: &str, capability: &Arc<dyn Capability>) {
        let hooks = read(&self.capability_loaded).clone();
        for hook in hooks {
            if let Err(e) = isolate(hook(name.to_string(), Arc::clone(capability))).await {
                warn!(capability = name, error = %format!("{e:#}"), "Capability load hook failed");
            }
        }
    }

    pub async fn capability_unloaded(&self, name: &str, capability: &Arc<dyn Capability>) {
        let hooks = read(&self.capability_unloaded).clone();
        for hook in hooks {
            if let Err(e) = isolate(hook(name.to_string(), Arc::clone(capability))).await {
                warn!(capability = name, error = %format!("{e:#}"), "Capability unload hook failed");
            }
        }
    }
}
