//! Test fixtures and database helpers.

use std::path::PathBuf;

use serde_json::json;
use sofadb::{Config, Context, Database};
use tempfile::TempDir;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            db: Database::open_in_memory().expect("failed to open in-memory database"),
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test database.
    #[must_use]
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("test.sofa");
        let db = Database::open(&path, Config::default()).expect("failed to open file database");
        Self {
            db,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("test.sofa"))
    }

    /// Seeds `n` trivially-shaped documents (`doc000`, `doc001`, ...).
    pub fn seed(&self, n: usize) {
        let ctx = Context::background();
        for i in 0..n {
            self.db
                .put(&ctx, &format!("doc{i:03}"), &json!({"n": i}))
                .expect("seed put failed");
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test against a temporary in-memory database.
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Context) -> R,
{
    let test_db = TestDatabase::memory();
    let ctx = Context::background();
    f(&test_db.db, &ctx)
}

/// Runs a test against a temporary file-backed database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Context, &std::path::Path) -> R,
{
    let test_db = TestDatabase::file();
    let ctx = Context::background();
    let path = test_db.path().expect("file database has a path");
    f(&test_db.db, &ctx, &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fixture_works() {
        with_temp_db(|db, ctx| {
            db.put(ctx, "a", &json!({"x": 1})).unwrap();
            let (body, _) = db.get(ctx, "a").unwrap();
            assert_eq!(body["x"], json!(1));
        });
    }

    #[test]
    fn file_fixture_persists_within_session() {
        with_file_db(|db, ctx, path| {
            assert!(path.parent().unwrap().exists());
            db.put(ctx, "a", &json!({})).unwrap();
            assert!(db.get(ctx, "a").is_ok());
        });
    }

    #[test]
    fn seeding_creates_documents() {
        let db = TestDatabase::memory();
        db.seed(5);
        let stats = db.stats(&Context::background()).unwrap();
        assert_eq!(stats.doc_count, 5);
    }
}
