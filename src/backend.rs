//! Backend facade
//!
//! Resolves `(repository, commit, path)` requests: picks the nearest dump
//! through the cross-repo index, opens its query database through the
//! connection cache, and — for references — joins results across dumps via
//! package/moniker matching. Commits observed on queries and uploads feed
//! the commit graph so later nearest-dump searches have edges to walk.

use crate::cache::CacheTier;
use crate::error::{Error, Result};
use crate::models::{
    Dump, Hover, Location, MonikerData, MonikerKind, Package, PackageInformationData, Position,
    ResolvedLocation,
};
use crate::query::QueryDatabase;
use crate::repohost::RepoHost;
use crate::storage::StorageLayout;
use crate::xrepo::CrossRepoIndex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct Backend {
    storage: StorageLayout,
    xrepo: Arc<CrossRepoIndex>,
    caches: Arc<CacheTier>,
    repo_host: Arc<dyn RepoHost>,
}

impl Backend {
    pub fn new(
        storage: StorageLayout,
        xrepo: Arc<CrossRepoIndex>,
        caches: Arc<CacheTier>,
        repo_host: Arc<dyn RepoHost>,
    ) -> Self {
        Self {
            storage,
            xrepo,
            caches,
            repo_host,
        }
    }

    pub fn xrepo(&self) -> &Arc<CrossRepoIndex> {
        &self.xrepo
    }

    pub fn caches(&self) -> &Arc<CacheTier> {
        &self.caches
    }

    /// Record a commit we had not seen before, pulling its parentage from
    /// the repository host so the nearest-dump search has edges to walk.
    pub async fn discover_commit(&self, repository: &str, commit: &str) -> Result<()> {
        crate::repohost::discover_and_update_commit(
            &self.xrepo,
            self.repo_host.as_ref(),
            repository,
            commit,
        )
        .await
    }

    pub async fn exists(&self, repository: &str, commit: &str, file: &str) -> Result<bool> {
        match self.database_for(repository, commit, file).await {
            Ok((database, relative)) => database.exists(&relative).await,
            Err(err) if matches!(err, Error::NotIndexed) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn definitions(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Vec<ResolvedLocation>> {
        let (database, relative) = self.database_for(repository, commit, path).await?;
        let local = database.definitions(&relative, position).await?;
        if !local.is_empty() {
            return self.resolve_locations(database.dump(), local).await;
        }

        // No local result: chase import monikers to the defining dump.
        for (moniker, package) in database.monikers_at(&relative, position).await? {
            let Some(package) = package_of(&moniker, &package) else {
                continue;
            };
            if moniker.kind != MonikerKind::Import {
                continue;
            }
            let Some(defining) = self.xrepo.find_defining_dump(&package).await? else {
                continue;
            };
            let remote = self.open_database(defining);
            let locations = remote
                .moniker_definitions(&moniker.scheme, &moniker.identifier)
                .await?;
            if !locations.is_empty() {
                return self.resolve_locations(remote.dump(), locations).await;
            }
        }
        Ok(Vec::new())
    }

    /// Union of the local reference result and every dump reachable through
    /// the range's monikers: the defining dump plus all importers whose
    /// reference filter admits the identifier.
    pub async fn references(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Vec<ResolvedLocation>> {
        let (database, relative) = self.database_for(repository, commit, path).await?;
        let current_dump = database.dump().clone();

        let mut seen: HashSet<Location> = HashSet::new();
        let mut resolved: Vec<ResolvedLocation> = Vec::new();
        let mut consulted: HashSet<i64> = HashSet::from([current_dump.id]);

        let local = database.references(&relative, position).await?;
        self.append_locations(&current_dump, local, &mut seen, &mut resolved)
            .await?;

        for (moniker, package) in database.monikers_at(&relative, position).await? {
            if moniker.kind == MonikerKind::Local {
                continue;
            }
            let Some(package) = package_of(&moniker, &package) else {
                continue;
            };

            let mut candidates: Vec<Dump> = Vec::new();
            if let Some(defining) = self.xrepo.find_defining_dump(&package).await? {
                candidates.push(defining);
            }
            candidates.extend(
                self.xrepo
                    .find_referencing_dumps(&package, &moniker.identifier)
                    .await?,
            );

            for dump in candidates {
                if !consulted.insert(dump.id) {
                    continue;
                }
                let remote = self.open_database(dump);
                let mut locations = remote
                    .moniker_definitions(&moniker.scheme, &moniker.identifier)
                    .await?;
                locations.extend(
                    remote
                        .moniker_references(&moniker.scheme, &moniker.identifier)
                        .await?,
                );
                let dump = remote.dump().clone();
                self.append_locations(&dump, locations, &mut seen, &mut resolved)
                    .await?;
            }
        }

        debug!(
            repository,
            commit,
            path,
            dumps_consulted = consulted.len(),
            locations = resolved.len(),
            "references resolved"
        );
        Ok(resolved)
    }

    pub async fn hover(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Option<Hover>> {
        let (database, relative) = self.database_for(repository, commit, path).await?;
        database.hover(&relative, position).await
    }

    /// Pick the dump for a request and return a query database plus the
    /// dump-relative path. `Error::NotIndexed` when nothing covers it.
    async fn database_for(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<(QueryDatabase, String)> {
        self.discover_commit(repository, commit).await?;
        let dump = self
            .xrepo
            .find_closest_dump(repository, commit, path)
            .await?
            .ok_or(Error::NotIndexed)?;
        let relative = path
            .strip_prefix(&dump.root)
            .unwrap_or(path)
            .to_string();
        debug!(
            repository,
            commit,
            path,
            dump_id = dump.id,
            dump_commit = %dump.commit,
            "selected dump"
        );
        Ok((self.open_database(dump), relative))
    }

    fn open_database(&self, dump: Dump) -> QueryDatabase {
        let path = self.storage.dump_path(dump.id);
        QueryDatabase::new(dump, path, self.caches.clone())
    }

    async fn append_locations(
        &self,
        dump: &Dump,
        locations: Vec<Location>,
        seen: &mut HashSet<Location>,
        resolved: &mut Vec<ResolvedLocation>,
    ) -> Result<()> {
        for location in locations {
            if !seen.insert(location.clone()) {
                continue;
            }
            resolved.push(ResolvedLocation {
                repository: dump.repository.clone(),
                commit: dump.commit.clone(),
                path: format!("{}{}", dump.root, location.path),
                range: location.range,
            });
        }
        Ok(())
    }

    async fn resolve_locations(
        &self,
        dump: &Dump,
        locations: Vec<Location>,
    ) -> Result<Vec<ResolvedLocation>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        self.append_locations(dump, locations, &mut seen, &mut resolved)
            .await?;
        Ok(resolved)
    }
}

fn package_of(
    moniker: &MonikerData,
    package: &Option<PackageInformationData>,
) -> Option<Package> {
    package.as_ref().map(|info| Package {
        scheme: moniker.scheme.clone(),
        name: info.name.clone(),
        version: info.version.clone(),
    })
}
