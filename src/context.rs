use std::sync::Arc;

use crate::config::Config;
use crate::metrics::Metrics;

/// Process-wide value constructed once at startup and threaded through
/// every component that needs config or metrics, rather than reaching
/// for file-scope global singletons.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Installs a `tracing` subscriber honoring `config.logging.verbose`.
    /// Idempotent: a second call is a no-op if a global subscriber is
    /// already installed.
    pub fn init_logging(&self) {
        let filter = if self.config.logging.verbose {
            "debug"
        } else {
            "info"
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .try_init();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
