//! Target registry: the endpoints participating in a run.
//!
//! The registry only grows. A target added between runs is adopted by the
//! next `ProgressStore::load` with an empty outcome table.

use std::path::Path;

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use super::Pool;
use crate::error::{Result, SimError};

/// One recipient endpoint, identified by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Target {
    pub name: String,
    pub email: Option<String>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
        }
    }
}

/// Target names end up in URLs (usually as a host label), so only a
/// conservative character set is accepted.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(SimError::config(format!("invalid target name '{name}'")))
    }
}

#[derive(Clone)]
pub struct TargetRegistry {
    pool: Pool,
}

impl TargetRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Register a target. Returns `false` if the name already existed.
    pub fn add(&self, name: &str, email: Option<&str>) -> Result<bool> {
        validate_name(name)?;
        let conn = self.pool.get()?;
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM targets WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            debug!(target_name = %name, "target already registered");
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO targets (name, email) VALUES (?1, ?2)",
            params![name, email],
        )?;
        info!(target_name = %name, "target registered");
        Ok(true)
    }

    /// Import targets from a text file: one `name[,email]` per line, blank
    /// lines and `#` comments skipped. Returns the number of new targets.
    pub fn import(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SimError::config(format!("cannot read target file {}: {e}", path.display()))
        })?;

        let mut added = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, ',').map(str::trim);
            let name = parts.next().unwrap_or_default();
            let email = parts.next().filter(|e| !e.is_empty());
            if self.add(name, email)? {
                added += 1;
            }
        }
        info!(path = %path.display(), added, "imported targets");
        Ok(added)
    }

    /// All registered targets, ordered by name.
    pub fn list(&self) -> Result<Vec<Target>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT name, email FROM targets ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Target {
                name: row.get(0)?,
                email: row.get(1)?,
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn registry() -> (tempfile::TempDir, TargetRegistry) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        (dir, TargetRegistry::new(pool))
    }

    #[test]
    fn test_add_is_idempotent() {
        let (_dir, reg) = registry();
        assert!(reg.add("team-a", Some("a@example.com")).unwrap());
        assert!(!reg.add("team-a", None).unwrap());
        let list = reg.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let (_dir, reg) = registry();
        assert!(reg.add("", None).is_err());
        assert!(reg.add("evil.com/path", None).is_err());
        assert!(reg.add("has space", None).is_err());
    }

    #[test]
    fn test_import_skips_comments_and_existing() {
        let (dir, reg) = registry();
        reg.add("zeta", None).unwrap();
        let path = dir.path().join("targets.txt");
        std::fs::write(&path, "# cohort 3\nalpha, alpha@example.com\n\nzeta\nbeta\n").unwrap();

        assert_eq!(reg.import(&path).unwrap(), 2);
        let names: Vec<String> = reg.list().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "beta", "zeta"]);
    }
}
