//! Cross-repository index
//!
//! One shared embedded database relates dumps to the packages they export
//! (`lsif_packages`), the packages they import (`lsif_references`, each row
//! carrying a bloom filter over the referenced identifiers), and the commit
//! graph used to pick the nearest dump for a query commit. The job queue
//! rides the same database; see `queue`.
//!
//! Writes are serialized through one connection behind a mutex and always
//! run in a transaction; reads open short-lived connections.

pub mod bloom;
mod migrations;

use crate::db::{now_millis, open_database, row_blob, row_i64, row_opt_text, row_text};
use crate::error::Result;
use crate::models::{Dump, Package, PackageReference};
use bloom::BloomFilter;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};
use turso::{Connection, Database, Row, Value};

/// Upper bound on commits visited while searching for the nearest dump.
const MAX_TRAVERSAL_LIMIT: usize = 100;

pub struct CrossRepoIndex {
    db: Database,
    /// All mutations go through this connection, one transaction at a time.
    write: Mutex<Connection>,
}

fn dump_from_row(row: &Row) -> Result<Dump> {
    Ok(Dump {
        id: row_i64(row, 0)?,
        repository: row_text(row, 1)?,
        commit: row_text(row, 2)?,
        root: row_text(row, 3)?,
        visible_at_tip: row_i64(row, 4)? != 0,
        uploaded_at: row_i64(row, 5)?,
    })
}

const DUMP_COLUMNS: &str = "id, repository, commit_hash, root, visible_at_tip, uploaded_at";

impl CrossRepoIndex {
    pub async fn open(path: &Path) -> Result<Self> {
        let db = open_database(path).await?;
        let conn = db.connect()?;
        migrations::migrate(&conn).await?;
        Ok(Self {
            db,
            write: Mutex::new(conn),
        })
    }

    fn read_conn(&self) -> Result<Connection> {
        Ok(self.db.connect()?)
    }

    /// The job queue shares this database (and its write serialization) so
    /// queue and index mutations never contend across connections.
    pub(crate) fn write_lock(&self) -> &Mutex<Connection> {
        &self.write
    }

    pub(crate) fn read_connection(&self) -> Result<Connection> {
        self.read_conn()
    }

    /// Whether any commit-graph edge mentions `commit`.
    pub async fn known_commit(&self, repository: &str, commit: &str) -> Result<bool> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM lsif_commits WHERE repository = ? AND commit_hash = ? LIMIT 1",
                [
                    Value::Text(repository.to_string()),
                    Value::Text(commit.to_string()),
                ],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Upsert the dump row for `(repository, commit, root)` and replace its
    /// package and reference rows. Transactional: a retried conversion
    /// replaces the previous dump instead of duplicating it.
    pub async fn add_packages_and_references(
        &self,
        repository: &str,
        commit: &str,
        root: &str,
        packages: &[Package],
        references: &[PackageReference],
    ) -> Result<Dump> {
        let conn = self.write.lock().await;
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = self
            .upsert_dump_tx(&conn, repository, commit, root, packages, references)
            .await;
        match result {
            Ok(dump) => {
                conn.execute("COMMIT", ()).await?;
                info!(
                    repository,
                    commit,
                    root,
                    dump_id = dump.id,
                    packages = packages.len(),
                    references = references.len(),
                    "registered dump"
                );
                Ok(dump)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    async fn upsert_dump_tx(
        &self,
        conn: &Connection,
        repository: &str,
        commit: &str,
        root: &str,
        packages: &[Package],
        references: &[PackageReference],
    ) -> Result<Dump> {
        let uploaded_at = now_millis();
        let existing = {
            let mut rows = conn
                .query(
                    "SELECT id FROM lsif_dumps
                     WHERE repository = ? AND commit_hash = ? AND root = ?",
                    [
                        Value::Text(repository.to_string()),
                        Value::Text(commit.to_string()),
                        Value::Text(root.to_string()),
                    ],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Some(row_i64(&row, 0)?),
                None => None,
            }
        };

        let dump_id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE lsif_dumps SET uploaded_at = ? WHERE id = ?",
                    [Value::Integer(uploaded_at), Value::Integer(id)],
                )
                .await?;
                conn.execute(
                    "DELETE FROM lsif_packages WHERE dump_id = ?",
                    [Value::Integer(id)],
                )
                .await?;
                conn.execute(
                    "DELETE FROM lsif_references WHERE dump_id = ?",
                    [Value::Integer(id)],
                )
                .await?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO lsif_dumps (repository, commit_hash, root, visible_at_tip, uploaded_at)
                     VALUES (?, ?, ?, 0, ?)",
                    [
                        Value::Text(repository.to_string()),
                        Value::Text(commit.to_string()),
                        Value::Text(root.to_string()),
                        Value::Integer(uploaded_at),
                    ],
                )
                .await?;
                let mut rows = conn
                    .query(
                        "SELECT id FROM lsif_dumps
                         WHERE repository = ? AND commit_hash = ? AND root = ?",
                        [
                            Value::Text(repository.to_string()),
                            Value::Text(commit.to_string()),
                            Value::Text(root.to_string()),
                        ],
                    )
                    .await?;
                let row = rows.next().await?.ok_or_else(|| {
                    crate::error::Error::Fatal("dump row vanished mid-transaction".to_string())
                })?;
                row_i64(&row, 0)?
            }
        };

        for package in packages {
            conn.execute(
                "INSERT INTO lsif_packages (scheme, name, version, dump_id) VALUES (?, ?, ?, ?)",
                [
                    Value::Text(package.scheme.clone()),
                    Value::Text(package.name.clone()),
                    Value::Text(package.version.clone()),
                    Value::Integer(dump_id),
                ],
            )
            .await?;
        }

        for reference in references {
            let filter = BloomFilter::from_keys(&reference.identifiers).encode()?;
            conn.execute(
                "INSERT INTO lsif_references (scheme, name, version, dump_id, filter)
                 VALUES (?, ?, ?, ?, ?)",
                [
                    Value::Text(reference.package.scheme.clone()),
                    Value::Text(reference.package.name.clone()),
                    Value::Text(reference.package.version.clone()),
                    Value::Integer(dump_id),
                    Value::Blob(filter),
                ],
            )
            .await?;
        }

        Ok(Dump {
            id: dump_id,
            repository: repository.to_string(),
            commit: commit.to_string(),
            root: root.to_string(),
            visible_at_tip: false,
            uploaded_at,
        })
    }

    pub async fn get_dump(&self, repository: &str, commit: &str, root: &str) -> Result<Option<Dump>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DUMP_COLUMNS} FROM lsif_dumps
                     WHERE repository = ? AND commit_hash = ? AND root = ?"
                ),
                [
                    Value::Text(repository.to_string()),
                    Value::Text(commit.to_string()),
                    Value::Text(root.to_string()),
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(dump_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_dump_by_id(&self, id: i64) -> Result<Option<Dump>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {DUMP_COLUMNS} FROM lsif_dumps WHERE id = ?"),
                [Value::Integer(id)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(dump_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Every dump for a repository, newest first. Operator visibility.
    pub async fn get_dumps(&self, repository: &str) -> Result<Vec<Dump>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DUMP_COLUMNS} FROM lsif_dumps
                     WHERE repository = ? ORDER BY uploaded_at DESC, id DESC"
                ),
                [Value::Text(repository.to_string())],
            )
            .await?;
        let mut dumps = Vec::new();
        while let Some(row) = rows.next().await? {
            dumps.push(dump_from_row(&row)?);
        }
        Ok(dumps)
    }

    /// Remove a dump's rows. The caller owns removing the file.
    pub async fn delete_dump(&self, id: i64) -> Result<()> {
        let conn = self.write.lock().await;
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let result: Result<()> = async {
            conn.execute("DELETE FROM lsif_packages WHERE dump_id = ?", [Value::Integer(id)])
                .await?;
            conn.execute(
                "DELETE FROM lsif_references WHERE dump_id = ?",
                [Value::Integer(id)],
            )
            .await?;
            conn.execute("DELETE FROM lsif_dumps WHERE id = ?", [Value::Integer(id)])
                .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => conn.execute("COMMIT", ()).await.map(|_| ()).map_err(Into::into),
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    /// The dump that provides `package`, preferring the most recent upload
    /// when several claim it.
    pub async fn find_defining_dump(&self, package: &Package) -> Result<Option<Dump>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                "SELECT dump_id FROM lsif_packages
                 WHERE scheme = ? AND name = ? AND version = ?
                 ORDER BY dump_id DESC LIMIT 1",
                [
                    Value::Text(package.scheme.clone()),
                    Value::Text(package.name.clone()),
                    Value::Text(package.version.clone()),
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => self.get_dump_by_id(row_i64(&row, 0)?).await,
            None => Ok(None),
        }
    }

    /// Dumps importing `package` whose reference filter admits
    /// `identifier`. The filter test prunes candidates before any dump
    /// file is opened.
    pub async fn find_referencing_dumps(
        &self,
        package: &Package,
        identifier: &str,
    ) -> Result<Vec<Dump>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                "SELECT dump_id, filter FROM lsif_references
                 WHERE scheme = ? AND name = ? AND version = ?
                 ORDER BY dump_id",
                [
                    Value::Text(package.scheme.clone()),
                    Value::Text(package.name.clone()),
                    Value::Text(package.version.clone()),
                ],
            )
            .await?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await? {
            let dump_id = row_i64(&row, 0)?;
            let filter = BloomFilter::decode(&row_blob(&row, 1)?)?;
            if filter.may_contain(identifier) {
                candidates.push(dump_id);
            }
        }
        let mut dumps = Vec::with_capacity(candidates.len());
        for dump_id in candidates {
            if let Some(dump) = self.get_dump_by_id(dump_id).await? {
                dumps.push(dump);
            }
        }
        debug!(
            scheme = %package.scheme,
            name = %package.name,
            identifier,
            candidates = dumps.len(),
            "reference filter scan"
        );
        Ok(dumps)
    }

    /// Merge `(commit, parent)` edges for a repository. Idempotent.
    pub async fn update_commits(
        &self,
        repository: &str,
        edges: &[(String, Option<String>)],
    ) -> Result<()> {
        let conn = self.write.lock().await;
        for (commit, parent) in edges {
            let parent_value = match parent {
                Some(parent) => Value::Text(parent.clone()),
                None => Value::Null,
            };
            let mut rows = conn
                .query(
                    "SELECT 1 FROM lsif_commits
                     WHERE repository = ? AND commit_hash = ?
                       AND ((parent_hash IS NULL AND ? IS NULL) OR parent_hash = ?)",
                    [
                        Value::Text(repository.to_string()),
                        Value::Text(commit.clone()),
                        parent_value.clone(),
                        parent_value.clone(),
                    ],
                )
                .await?;
            if rows.next().await?.is_some() {
                continue;
            }
            conn.execute(
                "INSERT INTO lsif_commits (repository, commit_hash, parent_hash) VALUES (?, ?, ?)",
                [
                    Value::Text(repository.to_string()),
                    Value::Text(commit.clone()),
                    parent_value,
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Flip `visible_at_tip` so that exactly the dumps at `tip` carry it.
    pub async fn update_dumps_visible_from_tip(&self, repository: &str, tip: &str) -> Result<()> {
        let conn = self.write.lock().await;
        conn.execute(
            "UPDATE lsif_dumps SET visible_at_tip = 0 WHERE repository = ?",
            [Value::Text(repository.to_string())],
        )
        .await?;
        conn.execute(
            "UPDATE lsif_dumps SET visible_at_tip = 1
             WHERE repository = ? AND commit_hash = ?",
            [
                Value::Text(repository.to_string()),
                Value::Text(tip.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Repositories that have at least one dump; drives the update-tips
    /// job.
    pub async fn repositories_with_dumps(&self) -> Result<Vec<String>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query("SELECT DISTINCT repository FROM lsif_dumps ORDER BY repository", ())
            .await?;
        let mut repositories = Vec::new();
        while let Some(row) = rows.next().await? {
            repositories.push(row_text(&row, 0)?);
        }
        Ok(repositories)
    }

    /// Nearest dump to `commit` whose root covers `path`, searching
    /// ancestors and descendants breadth-first up to a bounded horizon. At
    /// equal distance ancestors win; remaining ties take the most specific
    /// root, then the lowest dump id.
    pub async fn find_closest_dump(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Dump>> {
        if let Some(dump) = self.best_dump_at(repository, commit, path).await? {
            return Ok(Some(dump));
        }

        let mut visited: HashSet<String> = HashSet::from([commit.to_string()]);
        let mut ancestors: VecDeque<String> = self
            .parents(repository, commit)
            .await?
            .into_iter()
            .collect();
        let mut descendants: VecDeque<String> = self
            .children(repository, commit)
            .await?
            .into_iter()
            .collect();

        while (!ancestors.is_empty() || !descendants.is_empty())
            && visited.len() < MAX_TRAVERSAL_LIMIT
        {
            let mut next_ancestors = VecDeque::new();
            while let Some(candidate) = ancestors.pop_front() {
                if !visited.insert(candidate.clone()) {
                    continue;
                }
                if let Some(dump) = self.best_dump_at(repository, &candidate, path).await? {
                    return Ok(Some(dump));
                }
                for parent in self.parents(repository, &candidate).await? {
                    next_ancestors.push_back(parent);
                }
                if visited.len() >= MAX_TRAVERSAL_LIMIT {
                    break;
                }
            }

            let mut next_descendants = VecDeque::new();
            while let Some(candidate) = descendants.pop_front() {
                if !visited.insert(candidate.clone()) {
                    continue;
                }
                if let Some(dump) = self.best_dump_at(repository, &candidate, path).await? {
                    return Ok(Some(dump));
                }
                for child in self.children(repository, &candidate).await? {
                    next_descendants.push_back(child);
                }
                if visited.len() >= MAX_TRAVERSAL_LIMIT {
                    break;
                }
            }

            ancestors = next_ancestors;
            descendants = next_descendants;
        }

        Ok(None)
    }

    /// Dumps at exactly this commit whose root is a prefix of `path`,
    /// preferring the most specific root.
    async fn best_dump_at(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Dump>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DUMP_COLUMNS} FROM lsif_dumps
                     WHERE repository = ? AND commit_hash = ?
                     ORDER BY id"
                ),
                [
                    Value::Text(repository.to_string()),
                    Value::Text(commit.to_string()),
                ],
            )
            .await?;
        let mut best: Option<Dump> = None;
        while let Some(row) = rows.next().await? {
            let dump = dump_from_row(&row)?;
            if !path.starts_with(&dump.root) {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => dump.root.len() > current.root.len(),
            };
            if better {
                best = Some(dump);
            }
        }
        Ok(best)
    }

    async fn parents(&self, repository: &str, commit: &str) -> Result<Vec<String>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                "SELECT parent_hash FROM lsif_commits
                 WHERE repository = ? AND commit_hash = ? AND parent_hash IS NOT NULL
                 ORDER BY parent_hash",
                [
                    Value::Text(repository.to_string()),
                    Value::Text(commit.to_string()),
                ],
            )
            .await?;
        let mut parents = Vec::new();
        while let Some(row) = rows.next().await? {
            if let Some(parent) = row_opt_text(&row, 0)? {
                parents.push(parent);
            }
        }
        Ok(parents)
    }

    async fn children(&self, repository: &str, commit: &str) -> Result<Vec<String>> {
        let conn = self.read_conn()?;
        let mut rows = conn
            .query(
                "SELECT commit_hash FROM lsif_commits
                 WHERE repository = ? AND parent_hash = ?
                 ORDER BY commit_hash",
                [
                    Value::Text(repository.to_string()),
                    Value::Text(commit.to_string()),
                ],
            )
            .await?;
        let mut children = Vec::new();
        while let Some(row) = rows.next().await? {
            children.push(row_text(&row, 0)?);
        }
        Ok(children)
    }
}
