use std::sync::Arc;
use crate::forward::Forwarder;
use crate::rate_limit::AdmissionController;
use crate::routes::RoutingTable;

// app's shared state, one per config generation

#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<RoutingTable>,                 // read-only snapshot
    pub limiter: Arc<dyn AdmissionController>,     // the only cross-request mutable state
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn new(
        routes: RoutingTable,
        limiter: Arc<dyn AdmissionController>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            routes: Arc::new(routes),
            limiter,
            forwarder,
        }
    }
}
