pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use tokio::task::JoinHandle;

use auth::AuthService;
use bus::MessageBus;
use config::Config;
use gateway::connection::ConnectionTable;
use gateway::diagnostics::Diagnostics;
use gateway::directory::SessionDirectory;
use gateway::probe::NegotiationCache;
use gateway::router::MessageRouter;

/// Shared application state available to all route handlers and workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<dyn AuthService>,
    pub bus: Arc<dyn MessageBus>,
    pub directory: Arc<SessionDirectory>,
    pub connections: Arc<ConnectionTable>,
    pub router: Arc<MessageRouter>,
    pub negotiation: Arc<NegotiationCache>,
    pub diagnostics: Arc<Diagnostics>,
}

impl AppState {
    pub fn new(config: Config, auth: Arc<dyn AuthService>, bus: Arc<dyn MessageBus>) -> Self {
        let directory = Arc::new(SessionDirectory::new());
        let diagnostics = Arc::new(Diagnostics::new());
        let router = Arc::new(MessageRouter::new(
            directory.clone(),
            bus.clone(),
            diagnostics.clone(),
            config.no_route_policy,
        ));
        Self {
            negotiation: Arc::new(NegotiationCache::new(config.negotiation_ttl)),
            config: Arc::new(config),
            auth,
            bus,
            directory,
            connections: Arc::new(ConnectionTable::new()),
            router,
            diagnostics,
        }
    }

    /// Start the liveness sweeper and the backend pump.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            gateway::lifecycle::spawn_sweeper(self.clone()),
            gateway::router::spawn_backend_pump(
                self.router.clone(),
                self.bus.clone(),
                self.config.backend_namespaces.clone(),
            ),
        ]
    }
}
