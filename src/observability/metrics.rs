use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub ride_transitions_total: IntCounterVec,
    pub accept_conflicts_total: IntCounter,
    pub ws_connections: IntGauge,
    pub ws_dropped_connections_total: IntCounter,
    pub dispatch_fanout_drivers: Histogram,
    pub pending_requests: IntGauge,
    pub online_drivers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let ride_transitions_total = IntCounterVec::new(
            Opts::new("ride_transitions_total", "Ride lifecycle transitions by event"),
            &["event"],
        )
        .expect("valid ride_transitions_total metric");

        let accept_conflicts_total = IntCounter::new(
            "accept_conflicts_total",
            "Accept attempts that lost the race or hit a busy driver",
        )
        .expect("valid accept_conflicts_total metric");

        let ws_connections = IntGauge::new("ws_connections", "Open websocket connections")
            .expect("valid ws_connections metric");

        let ws_dropped_connections_total = IntCounter::new(
            "ws_dropped_connections_total",
            "Websocket connections dropped because their send buffer was full",
        )
        .expect("valid ws_dropped_connections_total metric");

        let dispatch_fanout_drivers = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_fanout_drivers",
                "Drivers notified per new ride request",
            )
            .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0]),
        )
        .expect("valid dispatch_fanout_drivers metric");

        let pending_requests = IntGauge::new(
            "pending_requests",
            "Ride requests waiting in the pending index",
        )
        .expect("valid pending_requests metric");

        let online_drivers = IntGauge::new("online_drivers", "Drivers with a live presence marker")
            .expect("valid online_drivers metric");

        registry
            .register(Box::new(ride_transitions_total.clone()))
            .expect("register ride_transitions_total");
        registry
            .register(Box::new(accept_conflicts_total.clone()))
            .expect("register accept_conflicts_total");
        registry
            .register(Box::new(ws_connections.clone()))
            .expect("register ws_connections");
        registry
            .register(Box::new(ws_dropped_connections_total.clone()))
            .expect("register ws_dropped_connections_total");
        registry
            .register(Box::new(dispatch_fanout_drivers.clone()))
            .expect("register dispatch_fanout_drivers");
        registry
            .register(Box::new(pending_requests.clone()))
            .expect("register pending_requests");
        registry
            .register(Box::new(online_drivers.clone()))
            .expect("register online_drivers");

        Self {
            registry,
            ride_transitions_total,
            accept_conflicts_total,
            ws_connections,
            ws_dropped_connections_total,
            dispatch_fanout_drivers,
            pending_requests,
            online_drivers,
        }
    }

    pub fn record_transition(&self, event: &str) {
        self.ride_transitions_total.with_label_values(&[event]).inc();
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
