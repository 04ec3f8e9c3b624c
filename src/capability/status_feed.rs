//! UDP JSON status feed.
//!
//! A client sends `{"frequency": hz, "duration": secs}` to the feed's port
//! and receives `{"vehicles": {name: {...}}}` snapshots back at that rate
//! for that long. Frequency is clamped to [1/60, 20] Hz; a duration of 0
//! streams until the capability closes.
//!
//! Settings (`[capabilities.status_feed]`): `host` (default all
//! interfaces) and `port` (default 31659, 0 picks a free port).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Span};

use super::{Capability, CapabilityContext};
use crate::background::{JobGroup, JobName};
use crate::config::defaults::{STATUS_FEED_MAX_HZ, STATUS_FEED_MIN_HZ, STATUS_FEED_PORT};
use crate::fleet::FleetSupervisor;
use crate::sync::lock;

pub const NAME: &str = "status_feed";

const REQUEST_BUFFER_LEN: usize = 1024;

pub fn create(ctx: CapabilityContext) -> anyhow::Result<Arc<dyn Capability>> {
    let host = match ctx.settings.get("host") {
        None => "0.0.0.0".to_string(),
        Some(value) => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("'host' must be a string"))?,
    };
    let port = match ctx.settings.get("port") {
        None => STATUS_FEED_PORT,
        Some(value) => value
            .as_integer()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| anyhow!("'port' must be an integer in 0..=65535"))?,
    };
    let span = info_span!("capability", name = %ctx.alias);
    Ok(Arc::new(StatusFeed {
        fleet: ctx.fleet,
        host,
        port,
        jobs: Arc::new(JobGroup::new(span.clone())),
        local_addr: Mutex::new(None),
        span,
    }))
}

pub struct StatusFeed {
    fleet: Weak<FleetSupervisor>,
    host: String,
    port: u16,
    jobs: Arc<JobGroup>,
    local_addr: Mutex<Option<SocketAddr>>,
    span: Span,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    #[serde(default = "default_frequency")]
    frequency: f64,
    #[serde(default)]
    duration: f64,
}

fn default_frequency() -> f64 {
    1.0
}

impl StreamRequest {
    fn period(&self) -> Duration {
        let hz = if self.frequency.is_finite() {
            self.frequency.clamp(STATUS_FEED_MIN_HZ, STATUS_FEED_MAX_HZ)
        } else {
            STATUS_FEED_MIN_HZ
        };
        Duration::from_secs_f64(1.0 / hz)
    }

    /// `None` streams forever.
    fn lifetime(&self) -> Option<Duration> {
        (self.duration.is_finite() && self.duration > 0.0)
            .then(|| Duration::from_secs_f64(self.duration))
    }
}

#[async_trait]
impl Capability for StatusFeed {
    async fn start(&self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("binding status feed on {}:{}", self.host, self.port))?;
        let local = socket.local_addr()?;
        *lock(&self.local_addr) = Some(local);

        let socket = Arc::new(socket);
        let jobs = Arc::clone(&self.jobs);
        let fleet = self.fleet.clone();
        self.jobs
            .spawn(JobName::StatusFeed, serve(socket, jobs, fleet));
        info!(parent: &self.span, address = %local, "✓ Status feed listening");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.jobs.shutdown().await;
        lock(&self.local_addr).take();
        debug!(parent: &self.span, "Status feed closed");
        Ok(())
    }

    fn status(&self) -> Value {
        json!({
            "address": lock(&self.local_addr).map(|a| a.to_string()),
            "streams": self.jobs.len().saturating_sub(1),
        })
    }
}

async fn serve(socket: Arc<UdpSocket>, jobs: Arc<JobGroup>, fleet: Weak<FleetSupervisor>) {
    let mut buf = [0u8; REQUEST_BUFFER_LEN];
    loop {
        let (len, client) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Status feed read failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let request: StreamRequest = match serde_json::from_slice(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                debug!(%client, error = %e, "Ignoring malformed status request");
                continue;
            }
        };
        debug!(%client, ?request, "Status stream requested");
        jobs.spawn(
            JobName::StatusStream,
            stream(Arc::clone(&socket), client, request, fleet.clone()),
        );
    }
}

async fn stream(socket: Arc<UdpSocket>, client: SocketAddr, request: StreamRequest, fleet: Weak<FleetSupervisor>) {
    let deadline = request.lifetime().map(|d| tokio::time::Instant::now() + d);
    let mut ticker = tokio::time::interval(request.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return;
        }
        let Some(fleet) = fleet.upgrade() else { return };
        let payload = snapshot(&fleet).to_string();
        drop(fleet);
        if let Err(e) = socket.send_to(payload.as_bytes(), client).await {
            debug!(%client, error = %e, "Status stream ended");
            return;
        }
    }
}

/// Current state of every registered vehicle.
pub fn snapshot(fleet: &FleetSupervisor) -> Value {
    let vehicles: serde_json::Map<String, Value> = fleet
        .vehicles()
        .into_iter()
        .map(|vehicle| {
            let telemetry = vehicle.telemetry();
            let entry = json!({
                "position": telemetry.position,
                "heading": telemetry.heading_deg(),
                "armed": telemetry.armed,
                "connected": vehicle.is_connected(),
            });
            (vehicle.name().to_string(), entry)
        })
        .collect();
    json!({ "vehicles": vehicles })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frequency_is_clamped() {
        let fast: StreamRequest = serde_json::from_str(r#"{"frequency": 100}"#).unwrap();
        assert_eq!(fast.period(), Duration::from_millis(50));
        assert!(fast.lifetime().is_none());

        let slow: StreamRequest = serde_json::from_str(r#"{"frequency": 0.001, "duration": 2}"#).unwrap();
        assert_eq!(slow.period(), Duration::from_secs(60));
        assert_eq!(slow.lifetime(), Some(Duration::from_secs(2)));

        let default: StreamRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(default.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_settings_are_validated() {
        let ctx = |settings: &str| CapabilityContext {
            alias: NAME.to_string(),
            fleet: Weak::new(),
            settings: toml::from_str(settings).unwrap(),
        };
        assert!(create(ctx("port = 0\nhost = \"127.0.0.1\"")).is_ok());
        assert!(create(ctx("port = 70000")).is_err());
        assert!(create(ctx("host = 5")).is_err());
    }
}
