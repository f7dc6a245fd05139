//! Wiring: build every store client and engine once and share them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::artifacts::DurableArtifactWriter;
use crate::catalog::{ProjectCatalog, TestCaseCatalog};
use crate::health::{self, HealthReport};
use crate::kv::{KeyValueStore, MemoryKv, RedisKv};
use crate::lifecycle::{Execution, ExecutionLifecycle};
use crate::notify::TaskNotifier;
use crate::objects::{FsObjectStore, MemoryObjectStore, ObjectStore, S3ObjectStore, S3Options};
use crate::resolver::ConfigResolver;
use crate::settings::{KvBackend, ObjectBackend, Settings};
use crate::storage::SqliteStore;

pub struct Services {
    pub store: SqliteStore,
    pub kv: Arc<dyn KeyValueStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub resolver: Arc<ConfigResolver>,
    pub writer: Arc<DurableArtifactWriter>,
    pub lifecycle: Arc<ExecutionLifecycle>,
    pub projects: Arc<ProjectCatalog>,
    pub test_cases: Arc<TestCaseCatalog>,
    pub notifier: Option<Arc<TaskNotifier>>,
}

impl Services {
    /// Open the stores named in `settings` and assemble the engines.
    pub fn build(settings: &Settings) -> Result<Self> {
        let db_path = settings
            .database
            .path
            .to_str()
            .context("database path is not valid UTF-8")?;

        // Pool size and cache location are needed before the shared cache
        // exists, so they are read straight from the table.
        let bootstrap_store = SqliteStore::open(db_path, 1)?;
        let bootstrap = ConfigResolver::new(
            Arc::new(MemoryKv::new()),
            Arc::new(bootstrap_store.clone()),
        );
        let pool_size = bootstrap.resolve_u64(
            "db_connection_pool_size",
            u64::from(settings.database.pool_size),
        );
        let pool_size = u32::try_from(pool_size).unwrap_or(settings.database.pool_size);
        let store = SqliteStore::open(db_path, pool_size)?;
        info!(path = %db_path, pool_size, "database ready");

        let kv: Arc<dyn KeyValueStore> = match settings.cache.backend {
            KvBackend::Memory => Arc::new(MemoryKv::new()),
            KvBackend::Redis => {
                let host = bootstrap.resolve_str("redis_host", &settings.cache.redis_host);
                let port = bootstrap.resolve_u64("redis_port", u64::from(settings.cache.redis_port));
                let port = u16::try_from(port).unwrap_or(settings.cache.redis_port);
                info!(%host, port, "using redis cache");
                Arc::new(RedisKv::new(
                    &host,
                    port,
                    settings.cache.pool_size,
                    Duration::from_millis(settings.cache.io_timeout_ms),
                ))
            }
        };

        let objects: Arc<dyn ObjectStore> = match settings.objects.backend {
            ObjectBackend::Memory => Arc::new(MemoryObjectStore::new()),
            ObjectBackend::Filesystem => Arc::new(
                FsObjectStore::new(&settings.objects.root).with_context(|| {
                    format!(
                        "failed to open object store at {}",
                        settings.objects.root.display()
                    )
                })?,
            ),
            ObjectBackend::S3 => {
                let o = &settings.objects;
                let options = S3Options {
                    endpoint: bootstrap.resolve_str("minio_endpoint", &o.endpoint),
                    access_key: bootstrap.resolve_str("minio_access_key", &o.access_key),
                    secret_key: bootstrap.resolve_str("minio_secret_key", &o.secret_key),
                    secure: bootstrap.resolve_bool("minio_secure", o.secure),
                    region: o.region.clone(),
                    timeout: Duration::from_millis(o.timeout_ms),
                    max_attempts: o.max_attempts,
                };
                info!(endpoint = %options.endpoint, "using s3 object store");
                Arc::new(S3ObjectStore::new(&options).context("failed to configure s3 object store")?)
            }
        };

        Self::assemble(settings, store, kv, objects)
    }

    /// Assemble engines over already-open stores.
    pub fn assemble(
        settings: &Settings,
        store: SqliteStore,
        kv: Arc<dyn KeyValueStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let resolver = ConfigResolver::new(kv.clone(), Arc::new(store.clone()));

        let timeout = resolver.resolve_u64("db_query_timeout", settings.database.query_timeout_sec);
        store.set_query_timeout(Duration::from_secs(timeout));

        let ttl = resolver.resolve_u64("cache_ttl_default", settings.cache.ttl_sec);
        let policy = settings.cache.policy(Duration::from_secs(ttl));
        let resolver = Arc::new(resolver.with_invalidation(&policy));

        let bucket = resolver.resolve_str("minio_bucket", &settings.objects.bucket);
        let writer = Arc::new(
            DurableArtifactWriter::new(
                objects.clone(),
                store.clone(),
                kv.clone(),
                policy.clone(),
                bucket.as_str(),
            )
            .with_context(|| format!("invalid artifact bucket {bucket:?}"))?,
        );

        let lifecycle = Arc::new(ExecutionLifecycle::new(
            store.clone(),
            writer.clone(),
            kv.clone(),
            policy.clone(),
        ));
        let projects = Arc::new(ProjectCatalog::new(store.clone(), kv.clone(), policy.clone()));
        let test_cases = Arc::new(TestCaseCatalog::new(store.clone(), kv.clone(), policy));

        let notifier = match &settings.notify.task_service_url {
            Some(url) => Some(Arc::new(TaskNotifier::new(
                url.as_str(),
                Duration::from_millis(settings.notify.timeout_ms),
            )?)),
            None => None,
        };

        info!(%bucket, ttl_sec = ttl, "services assembled");
        Ok(Self {
            store,
            kv,
            objects,
            resolver,
            writer,
            lifecycle,
            projects,
            test_cases,
            notifier,
        })
    }

    pub fn health(&self) -> HealthReport {
        health::check(&self.store, self.kv.as_ref(), self.objects.as_ref())
    }

    /// Tell the task service about new executions, in the background.
    pub fn notify_created(&self, executions: Vec<Execution>) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        tokio::spawn(async move {
            for execution in &executions {
                notifier.notify(execution).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ConfigSource;

    #[test]
    fn test_build_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.database.path = dir.path().join("veritas.db");
        settings.objects.root = dir.path().join("objects");

        let services = Services::build(&settings).unwrap();
        assert_eq!(services.writer.bucket(), "veritas-storage");
        assert!(services.notifier.is_none());
        assert!(services.health().is_healthy());
    }

    #[test]
    fn test_runtime_parameters_come_from_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.database.path = dir.path().join("veritas.db");
        settings.objects.backend = ObjectBackend::Memory;

        let store = SqliteStore::open(settings.database.path.to_str().unwrap(), 2).unwrap();
        store.store_config("minio_bucket", "qa-evidence").unwrap();
        drop(store);

        let services = Services::build(&settings).unwrap();
        assert_eq!(services.writer.bucket(), "qa-evidence");
    }

    #[test]
    fn test_s3_backend_uses_minio_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.database.path = dir.path().join("veritas.db");
        settings.objects.backend = ObjectBackend::S3;

        let store = SqliteStore::open(settings.database.path.to_str().unwrap(), 2).unwrap();
        store.store_config("minio_endpoint", "minio.qa:9898").unwrap();
        drop(store);

        let services = Services::build(&settings).unwrap();
        assert_eq!(
            services.writer.public_url_for("evidence/2024/01/02/a.json").as_deref(),
            Some("http://minio.qa:9898/veritas-storage/evidence/2024/01/02/a.json")
        );
    }
}
