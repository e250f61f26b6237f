use std::sync::Arc;

use crate::config::Config;
use crate::engine::pending::PendingRequests;
use crate::geo::Presence;
use crate::observability::metrics::Metrics;
use crate::realtime::hub::{Hub, HubHandle};
use crate::store::Store;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub presence: Presence,
    pub pending: PendingRequests,
    pub hub: HubHandle,
    pub metrics: Metrics,
}

impl AppState {
    /// The returned [`Hub`] must be spawned (`tokio::spawn(hub.run())`)
    /// before any realtime traffic flows.
    pub fn new(config: Config, store: Arc<dyn Store>) -> (Self, Hub) {
        let metrics = Metrics::new();
        let (hub, handle) = Hub::new(config.hub_command_buffer, metrics.clone());

        (
            Self {
                presence: Presence::new(config.presence_ttl),
                pending: PendingRequests::new(config.pending_request_ttl),
                config,
                store,
                hub: handle,
                metrics,
            },
            hub,
        )
    }

    pub fn refresh_gauges(&self) {
        self.refresh_pending_gauge();
        self.metrics
            .online_drivers
            .set(i64::try_from(self.presence.online_count()).unwrap_or(i64::MAX));
    }

    pub fn refresh_pending_gauge(&self) {
        self.metrics
            .pending_requests
            .set(i64::try_from(self.pending.len()).unwrap_or(i64::MAX));
    }
}
