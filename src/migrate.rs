//! Versioned schema patches.
//!
//! Each [`Schema`] is a named module with numbered patches. [`migrate`] keeps
//! one `(module, version)` row per module in `_schema_versions` and applies,
//! in id order, only the patches newer than the stored version. All modules
//! are migrated in a single transaction, so a failing patch leaves every
//! module at its previous version. On PostgreSQL the transaction first takes
//! an advisory lock so concurrent processes migrate one at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Backend;
use crate::error::{Error, Result};
use crate::executor::TransactionMode;
use crate::pool::{Database, Transaction};
use crate::sqlite::ScalarFunction;
use crate::types::{TypeDef, TypeRegistry};

/// Key of the advisory lock serializing migrations on PostgreSQL.
pub const MIGRATION_LOCK_KEY: i64 = 0x6462_6b69_745f_6d67;

const CREATE_VERSIONS: &str = "CREATE TABLE IF NOT EXISTS _schema_versions (
    module TEXT PRIMARY KEY,
    version BIGINT NOT NULL
)";

const SELECT_VERSION: &str = "SELECT version FROM _schema_versions WHERE module = ?";

const UPSERT_VERSION: &str = "INSERT INTO _schema_versions (module, version) VALUES (?, ?)
ON CONFLICT (module) DO UPDATE SET version = excluded.version";

pub type PatchFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Patch implemented in code; runs inside the migration transaction.
pub type PatchFn = Arc<dyn Fn(Transaction) -> PatchFuture + Send + Sync>;

#[derive(Clone)]
pub enum Patch {
    Sql(String),
    Callback(PatchFn),
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Patch::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A named set of numbered patches.
#[derive(Clone, Debug)]
pub struct Schema {
    pub module: String,
    patches: BTreeMap<u32, Patch>,
    types: Vec<TypeDef>,
    functions: Vec<ScalarFunction>,
}

impl Schema {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            patches: BTreeMap::new(),
            types: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Patch `id` as SQL text, run with `exec` (may hold several statements).
    ///
    /// Ids start at 1; a module whose stored version is 0 has no patches
    /// applied. Registering an id twice replaces the earlier patch.
    pub fn patch(mut self, id: u32, sql: impl Into<String>) -> Self {
        self.patches.insert(id, Patch::Sql(sql.into()));
        self
    }

    /// Patch `id` as a callback receiving the migration transaction.
    pub fn callback<F, Fut>(mut self, id: u32, f: F) -> Self
    where
        F: Fn(Transaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f: PatchFn = Arc::new(move |tx| Box::pin(f(tx)));
        self.patches.insert(id, Patch::Callback(f));
        self
    }

    /// Column type this module's tables use. See [`registry`].
    pub fn type_def(mut self, def: TypeDef) -> Self {
        self.types.push(def);
        self
    }

    /// Scalar function installed before patches run. SQLite only; ignored
    /// on PostgreSQL, where functions belong in SQL patches.
    pub fn function(mut self, function: ScalarFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Highest patch id, 0 without patches.
    pub fn latest(&self) -> u32 {
        self.patches.keys().next_back().copied().unwrap_or(0)
    }

    pub fn patches(&self) -> impl Iterator<Item = (u32, &Patch)> {
        self.patches.iter().map(|(id, patch)| (*id, patch))
    }
}

/// Built-in types plus every type the schemas declare, for
/// [`Database::connect_with`].
pub fn registry(schemas: &[Schema]) -> TypeRegistry {
    let mut registry = TypeRegistry::with_builtins();
    for def in schemas.iter().flat_map(|s| s.types.iter()) {
        registry.register(def.clone());
    }
    registry
}

/// What [`migrate`] did to one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub module: String,
    pub from: u32,
    pub to: u32,
    pub applied: Vec<u32>,
}

impl MigrationReport {
    pub fn is_current(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Bring every schema up to its latest patch.
///
/// Reports come back in `schemas` order. Any failure rolls the whole run
/// back and is returned as is.
pub async fn migrate(db: &Database, schemas: &[Schema]) -> Result<Vec<MigrationReport>> {
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = schemas.iter().find(|s| !seen.insert(s.module.as_str())) {
        return Err(Error::Usage(format!("Schema module {} listed twice", dup.module)));
    }

    if db.backend() == Backend::Sqlite {
        for function in schemas.iter().flat_map(|s| s.functions.iter()) {
            db.register_function(function.clone()).await?;
        }
    }

    let backend = db.backend();
    let reports = db
        .begin(TransactionMode::Default, |tx| async move {
            if backend == Backend::Postgres {
                debug!(key = MIGRATION_LOCK_KEY, "taking migration lock");
                tx.exec(format!("SELECT pg_advisory_xact_lock({MIGRATION_LOCK_KEY})"))
                    .await?;
            }
            tx.exec(CREATE_VERSIONS).await?;
            let mut reports = Vec::with_capacity(schemas.len());
            for schema in schemas {
                reports.push(migrate_module(&tx, schema).await?);
            }
            Ok::<_, Error>(reports)
        })
        .await?;

    for report in reports.iter().filter(|r| !r.is_current()) {
        info!(
            module = %report.module,
            from = report.from,
            to = report.to,
            "schema migrated"
        );
    }
    Ok(reports)
}

async fn migrate_module(tx: &Transaction, schema: &Schema) -> Result<MigrationReport> {
    let from = stored_version(tx, &schema.module).await?;
    let mut applied = Vec::new();

    for (id, patch) in schema.patches.range(from.saturating_add(1)..) {
        debug!(module = %schema.module, patch = id, "applying patch");
        let result = match patch {
            Patch::Sql(sql) => tx.exec(sql.as_str()).await.map(drop),
            Patch::Callback(f) => f(tx.clone()).await,
        };
        result.map_err(|e| annotate(e, &schema.module, *id))?;
        applied.push(*id);
    }

    let to = applied.last().copied().unwrap_or(from);
    if to != from {
        tx.execute((
            UPSERT_VERSION,
            crate::params![schema.module.as_str(), i64::from(to)],
        ))
        .await?;
    }

    Ok(MigrationReport {
        module: schema.module.clone(),
        from,
        to,
        applied,
    })
}

async fn stored_version(tx: &Transaction, module: &str) -> Result<u32> {
    let row = tx.select_row((SELECT_VERSION, crate::params![module])).await?;
    let Some(value) = row.as_ref().and_then(|r| r.get("version")) else {
        return Ok(0);
    };
    value
        .as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            Error::Type(format!(
                "Stored version of {} is not a patch id: {:?}",
                module, value
            ))
        })
}

/// Prefix statement failures with the patch that caused them. Server errors
/// keep their variant so callers can still match on the SQLSTATE code.
fn annotate(error: Error, module: &str, id: u32) -> Error {
    match error {
        Error::Usage(m) => Error::Usage(format!("{module} patch {id}: {m}")),
        Error::Type(m) => Error::Type(format!("{module} patch {id}: {m}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::value::Value;

    async fn memory() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn users() -> Schema {
        Schema::new("users")
            .patch(1, "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .patch(2, "ALTER TABLE users ADD COLUMN email TEXT")
    }

    async fn version(db: &Database, module: &str) -> Option<i64> {
        db.select_row((SELECT_VERSION, crate::params![module]))
            .await
            .unwrap()
            .and_then(|r| r.get("version").and_then(Value::as_i64))
    }

    async fn tables<E: Executor>(db: &E) -> Vec<String> {
        db.select("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_applies_patches_in_order_once() {
        let db = memory().await;

        let reports = migrate(&db, &[users()]).await.unwrap();
        assert_eq!(
            reports,
            vec![MigrationReport {
                module: "users".into(),
                from: 0,
                to: 2,
                applied: vec![1, 2],
            }]
        );
        assert_eq!(version(&db, "users").await, Some(2));

        let reports = migrate(&db, &[users()]).await.unwrap();
        assert!(reports[0].is_current());
        assert_eq!((reports[0].from, reports[0].to), (2, 2));
    }

    #[tokio::test]
    async fn test_only_newer_patches_run() {
        let db = memory().await;
        migrate(&db, &[users()]).await.unwrap();

        let next = users().patch(3, "CREATE INDEX users_email ON users (email)");
        let reports = migrate(&db, &[next]).await.unwrap();
        assert_eq!(reports[0].applied, vec![3]);
        assert_eq!(version(&db, "users").await, Some(3));
    }

    #[tokio::test]
    async fn test_failed_patch_rolls_back_every_module() {
        let db = memory().await;
        let broken = Schema::new("orders")
            .patch(1, "CREATE TABLE orders (id INTEGER PRIMARY KEY)")
            .patch(2, "ALTER TABLE missing ADD COLUMN x TEXT");

        let err = migrate(&db, &[users(), broken]).await.unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));

        // Nothing survives, not even the version table
        assert!(tables(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_callback_patch_and_function() {
        let db = memory().await;
        let schema = users()
            .function(ScalarFunction::new("slug", 1, |args| match args {
                [Value::Text(s)] => Ok(Value::Text(s.to_lowercase().replace(' ', "-"))),
                _ => Ok(Value::Null),
            }))
            .callback(3, |tx| async move {
                tx.execute((
                    "INSERT INTO users (name, email) VALUES (slug(?), ?)",
                    crate::params!["Ada Lovelace", "ada@example.com"],
                ))
                .await?;
                Ok::<_, Error>(())
            });
        assert_eq!(schema.latest(), 3);

        let reports = migrate(&db, &[schema]).await.unwrap();
        assert_eq!(reports[0].applied, vec![1, 2, 3]);

        let row = db.select_row("SELECT name FROM users").await.unwrap().unwrap();
        assert_eq!(row.get("name").and_then(Value::as_str), Some("ada-lovelace"));
    }

    #[tokio::test]
    async fn test_duplicate_module_is_rejected() {
        let db = memory().await;
        let err = migrate(&db, &[users(), users()]).await.unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_registry_includes_schema_types() {
        fn encode(v: &Value) -> Result<String> {
            Ok(v.as_str().unwrap_or_default().to_string())
        }
        fn decode(raw: &[u8]) -> Result<Value> {
            Ok(Value::Text(String::from_utf8_lossy(raw).to_uppercase()))
        }

        let schema = Schema::new("tags").type_def(TypeDef::new(&["tag"], &[], encode, decode));
        let registry = registry(&[schema]);
        assert!(registry.by_name("tag").is_some());
        assert!(registry.by_name("int4").is_some());
    }

    #[tokio::test]
    async fn test_runs_against_executor_generic_code() {
        let db = memory().await;
        migrate(&db, &[users()]).await.unwrap();
        assert_eq!(tables(&db).await, vec!["_schema_versions", "users"]);
    }
}
