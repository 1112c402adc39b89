use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    config::Config,
    multiplexer::Multiplexer,
    registry::RegistryParams,
    rotation::RotationCoordinator,
};
use crate::{
    events::Bus,
    policies::JoinThrottle,
    subscribers::{Subscribe, SubscriberSet},
    transport::{Transport, TransportAdapter},
};

/// Builder for constructing a [`Multiplexer`] over a transport.
pub struct MultiplexerBuilder {
    cfg: Config,
    transport: Arc<dyn Transport>,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl MultiplexerBuilder {
    /// Creates a builder with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            cfg: Config::default(),
            transport,
            subscribers: Vec::new(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, cfg: Config) -> Self {
        self.cfg = cfg;
        self
    }

    /// Sets lifecycle observers.
    ///
    /// Observers receive events through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the multiplexer.
    ///
    /// Must run inside a tokio runtime when observers were configured (their workers are
    /// spawned here).
    pub fn build(self) -> Arc<Multiplexer> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let token = CancellationToken::new();
        let throttle = Arc::new(Mutex::new(JoinThrottle::new(self.cfg.min_join_interval)));

        let rotation = Arc::new(RotationCoordinator::new(
            self.cfg.settle_delay,
            Arc::clone(&throttle),
            bus.clone(),
            token.clone(),
        ));

        let params = RegistryParams {
            adapter: TransportAdapter::new(self.transport, bus.clone(), self.cfg.join_deadline()),
            bus: bus.clone(),
            throttle,
            backoff: self.cfg.backoff,
            max_retries: self.cfg.retry_limit(),
            gate: rotation.gate(),
            token: token.clone(),
        };

        let mux = Multiplexer::new_internal(self.cfg, bus.clone(), params, rotation, token);
        if !self.subscribers.is_empty() {
            mux.observer_listener(SubscriberSet::new(self.subscribers, bus));
        }
        Arc::new(mux)
    }
}

impl Multiplexer {
    /// Starts building a multiplexer over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> MultiplexerBuilder {
        MultiplexerBuilder::new(transport)
    }
}
