use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::provider::{CalendarBackend, Credentials};
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + reaper.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    calendar: Arc<dyn CalendarBackend>,
    credentials: Arc<Credentials>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        calendar: Arc<dyn CalendarBackend>,
        credentials: Arc<Credentials>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            calendar,
            credentials,
            config,
            shutdown,
        }
    }

    /// Bearer tokens shared by every tenant; calendar identities are global.
    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.calendar.clone(), self.config.clone())?);

        tokio::spawn(reaper::run_reaper(engine.clone(), self.shutdown.child_token()));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.shutdown.child_token(),
        ));

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(engine)
    }
}
