//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;

use crate::config::Config;
use crate::tunnel::broker::Broker;

/// Shared application state for the management API.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// The tunnel registry every handler operates on.
    pub broker: Broker,
}

impl AppState {
    pub fn new(config: Config, broker: Broker) -> Self {
        Self {
            config: Arc::new(config),
            broker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::broker::BrokerSettings;

    #[tokio::test]
    async fn test_clones_share_config_and_broker() {
        let state = AppState::new(Config::default(), Broker::new(BrokerSettings::default()));
        let other = state.clone();
        assert!(Arc::ptr_eq(&state.config, &other.config));

        state.broker.close().await;
        assert!(other.broker.add("late", "::1", 80, 0).await.is_err());
    }
}
