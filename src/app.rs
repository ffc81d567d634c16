use crate::config::{load_operations, GatewayConfig};
use crate::errors::GatewayError;
use crate::managers::gateway::Gateway;
use crate::managers::pool::session::{SessionConnector, SshConnector};
use crate::managers::pool::PoolManager;
use crate::managers::targets::TargetRegistry;
use crate::services::audit::AuditService;
use crate::services::auth::AuthService;
use crate::services::cache::CacheService;
use crate::services::introspection::{HttpIntrospector, TokenIntrospector};
use crate::services::logger::Logger;
use crate::services::policy::PolicyService;
use crate::services::rate_limit::RateLimiter;
use crate::services::secret_ref::{CredentialResolver, RefResolver};
use crate::services::vault_client::VaultClient;
use std::path::Path;
use std::sync::Arc;

/// Composition root: every component is constructed exactly once here and
/// wired by handle, and the background sweeps live and die with the app.
pub struct App {
    pub logger: Logger,
    pub gateway: Arc<Gateway>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl App {
    pub async fn initialize(operations_file: Option<&Path>) -> Result<Self, GatewayError> {
        let config = GatewayConfig::from_env();
        let logger = Logger::new("sshgate");

        let cache = Arc::new(CacheService::initialize(logger.clone(), config.cache.clone()).await);
        let audit = Arc::new(AuditService::new(logger.clone()));

        let introspector: Arc<dyn TokenIntrospector> = Arc::new(HttpIntrospector::new(
            logger.clone(),
            config.introspection.clone(),
        )?);
        let auth = Arc::new(AuthService::new(
            logger.clone(),
            config.security.clone(),
            cache.clone(),
            introspector,
        ));

        let vault = match config.vault.addr.as_deref() {
            Some(_) => Some(Arc::new(VaultClient::new(logger.clone(), config.vault.clone())?)),
            None => None,
        };
        let resolver: Arc<dyn CredentialResolver> =
            Arc::new(RefResolver::new(logger.clone(), vault));

        let operations = load_operations(operations_file)?;
        let policy = Arc::new(PolicyService::new(logger.clone(), operations));
        let rate_limiter = Arc::new(RateLimiter::new(
            logger.clone(),
            config.security.clone(),
            cache.clone(),
        ));

        let connector: Arc<dyn SessionConnector> = Arc::new(SshConnector::new(
            logger.clone(),
            resolver,
            config.pool.handshake_timeout,
        ));
        let pools = Arc::new(PoolManager::new(
            logger.clone(),
            config.pool.clone(),
            connector,
        ));
        let registry = Arc::new(TargetRegistry::new(logger.clone()));

        let gateway = Arc::new(Gateway::new(
            logger.clone(),
            config.security.clone(),
            auth,
            policy,
            rate_limiter,
            audit,
            cache.clone(),
            registry,
            pools,
        ));

        let janitor_cache = cache.clone();
        let sweep_interval = config.cache.sweep_interval;
        let janitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                janitor_cache.sweep_local();
            }
        });

        logger.info("Gateway initialized", None);
        Ok(Self {
            logger,
            gateway,
            background: vec![janitor],
        })
    }

    pub async fn shutdown(&self) {
        for task in self.background.iter() {
            task.abort();
        }
        self.gateway.shutdown().await;
        self.logger.info("Shutdown complete", None);
    }
}
