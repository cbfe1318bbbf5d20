use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::room::Registry;
use crate::store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    config: Arc<Config>,
    registry: Arc<Registry>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> Self {
        let registry = Registry::new(store, config.room.clone());
        Self {
            started_at: Instant::now(),
            config: Arc::new(config),
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
