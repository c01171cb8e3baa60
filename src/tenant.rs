use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reconciler;

/// Background work every tenant engine gets.
#[derive(Debug, Clone, Copy)]
pub struct TenantTasks {
    pub compact_threshold: u64,
    pub reconcile_interval: Duration,
    pub auto_reconcile: bool,
}

impl Default for TenantTasks {
    fn default() -> Self {
        Self {
            compact_threshold: 1_000,
            reconcile_interval: Duration::from_secs(30),
            auto_reconcile: true,
        }
    }
}

/// One engine per tenant, created on first use. The tenant is the database
/// name of the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    tasks: TenantTasks,
}

/// The tenant name doubles as its WAL file stem, so only names made of
/// ASCII letters, digits, `_` and `-` are accepted. Names are never
/// rewritten, so distinct tenants never share a file.
fn wal_file_stem(tenant: &str) -> io::Result<&str> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name may only contain ASCII letters, digits, '_' and '-'",
        ));
    }
    Ok(tenant)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, tasks: TenantTasks) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            tasks,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry guard serializes concurrent first connections of a tenant.
        let entry = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v,
        };

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);

        tokio::spawn(reconciler::run_reconciler(
            engine.clone(),
            self.tasks.reconcile_interval,
            self.tasks.auto_reconcile,
        ));
        tokio::spawn(reconciler::run_compactor(engine.clone(), self.tasks.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant engine started");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewPool;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("agendad_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(name: &str) -> (TenantManager, PathBuf) {
        let dir = test_data_dir(name);
        (TenantManager::new(dir.clone(), TenantTasks::default()), dir)
    }

    fn morning_pool() -> NewPool {
        NewPool {
            date: NaiveDate::from_ymd_opt(2031, 3, 2).unwrap(),
            shift: ShiftTemplate {
                id: Ulid::new(),
                name: "Manhã".into(),
                start: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            },
            region_id: Ulid::new(),
            capacity: 1,
            reservations_allowed: false,
        }
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let (tm, _) = manager("isolation");
        let a = tm.get_or_create("tenant_a").unwrap();
        let b = tm.get_or_create("tenant_b").unwrap();

        let pool_id = Ulid::new();
        a.create_pool(pool_id, morning_pool(), 0).await.unwrap();
        // The same id and slot are free in the other tenant.
        b.create_pool(pool_id, morning_pool(), 0).await.unwrap();

        a.book(Ulid::new(), pool_id, Ulid::new(), None, 0).await.unwrap();
        assert_eq!(a.pool_info(pool_id).await.unwrap().occupied, 1);
        assert_eq!(b.pool_info(pool_id).await.unwrap().occupied, 0);
    }

    #[tokio::test]
    async fn engines_are_created_lazily_and_reused() {
        let (tm, dir) = manager("lazy");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let first = tm.get_or_create("acme").unwrap();
        assert!(dir.join("acme.wal").exists());
        let second = tm.get_or_create("acme").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_names_outside_the_file_alphabet_are_refused() {
        let (tm, dir) = manager("name_alphabet");
        for name in ["../evil", "../..", "acme.co", "acme co", "", "açme"] {
            let err = tm.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{name:?}");
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert_eq!(tm.tenant_count(), 0);
    }

    #[tokio::test]
    async fn similar_tenant_names_never_share_a_wal() {
        let (tm, dir) = manager("no_shared_wal");
        let dotted = tm.get_or_create("acme.co");
        assert!(dotted.is_err());

        let plain = tm.get_or_create("acmeco").unwrap();
        let dashed = tm.get_or_create("acme-co").unwrap();
        assert!(!Arc::ptr_eq(&plain, &dashed));

        let pool_id = Ulid::new();
        dashed.create_pool(pool_id, morning_pool(), 0).await.unwrap();
        assert!(plain.pool_info(pool_id).await.is_err());
        assert!(dir.join("acmeco.wal").exists());
        assert!(dir.join("acme-co.wal").exists());
    }

    #[tokio::test]
    async fn overlong_tenant_name_is_refused() {
        let (tm, _) = manager("too_long");
        let err = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_is_bounded() {
        let (tm, _) = manager("count_limit");
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
