use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::scheduler;

/// Per-tenant engines, keyed by sanitized name. Each tenant gets its own
/// Engine, WAL file and compactor. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = self
            .engines
            .entry(name.clone())
            .or_try_insert_with(|| {
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let engine = Arc::new(Engine::new(name.clone(), wal_path)?);
                tokio::spawn(scheduler::run_compactor(engine.clone(), self.compact_threshold));
                tracing::info!(tenant = %name, "tenant opened");
                Ok::<_, io::Error>(engine)
            })?
            .value()
            .clone();
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Open every tenant that has a WAL in the data directory, so the
    /// automation cycle sees tenants persisted by earlier runs.
    pub fn open_existing(&self) -> io::Result<usize> {
        let mut opened = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get_or_create(stem) {
                Ok(_) => opened += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping WAL file"),
            }
        }
        Ok(opened)
    }

    /// Loaded tenants in name order.
    pub fn tenants(&self) -> Vec<(String, Arc<Engine>)> {
        let mut all: Vec<_> = self
            .engines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn add_contact(engine: &Engine) -> Ulid {
        let id = Ulid::new();
        engine
            .upsert_contact(Contact {
                id,
                name: None,
                email: Some("a@example.com".into()),
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = TenantManager::new(test_data_dir("isolation"), 1000);
        let a = tm.get_or_create("tenant_a").unwrap();
        let b = tm.get_or_create("tenant_b").unwrap();

        let contact = add_contact(&a).await;
        assert!(a.contact(contact).is_some());
        assert!(b.contact(contact).is_none());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = TenantManager::new(test_data_dir("same_eng"), 1000);
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);
        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Both spellings resolve to the same file, so to the same engine.
        assert!(Arc::ptr_eq(&evil, &tm.get_or_create("evil").unwrap()));
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = TenantManager::new(test_data_dir("name_too_long"), 1000);
        let err = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = TenantManager::new(test_data_dir("count_limit"), 1000);
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn open_existing_loads_persisted_tenants() {
        let dir = test_data_dir("open_existing");
        let contact = {
            let tm = TenantManager::new(dir.clone(), 1000);
            let engine = tm.get_or_create("zeta").unwrap();
            tm.get_or_create("alpha").unwrap();
            add_contact(&engine).await
        };
        fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let tm = TenantManager::new(dir, 1000);
        assert_eq!(tm.open_existing().unwrap(), 2);
        let names: Vec<_> = tm.tenants().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(tm.get_or_create("zeta").unwrap().contact(contact).is_some());
    }
}
