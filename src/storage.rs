//! On-disk layout under the storage root
//!
//! ```text
//! <root>/
//!   uploads/<uuid>        raw gzipped inputs awaiting conversion
//!   tmp/<uuid>            in-progress dump databases
//!   <dump-id>.lsif.db     finished dump databases
//!   xrepo.db              shared cross-repository index (and job queue)
//!   id-based-filenames    marker: legacy-filename migration has run
//! ```
//!
//! Dump files earlier than the id-based scheme were named
//! `<urlencoded repository>@<commit>.lsif.db`. `migrate_filenames` renames
//! any such file whose coordinates match a registered dump and removes the
//! rest, then drops a marker so the scan runs once.

use crate::error::Result;
use crate::xrepo::CrossRepoIndex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

const MIGRATION_MARKER: &str = "id-based-filenames";
const DUMP_SUFFIX: &str = ".lsif.db";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Bind to `root`, creating the directory skeleton.
    pub fn init(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("uploads"))?;
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn xrepo_db_path(&self) -> PathBuf {
        self.root.join("xrepo.db")
    }

    /// A fresh spool file for an incoming upload.
    pub fn new_upload_path(&self) -> PathBuf {
        self.root.join("uploads").join(Uuid::new_v4().to_string())
    }

    /// A fresh path for an in-progress conversion database.
    pub fn new_temp_db_path(&self) -> PathBuf {
        self.root.join("tmp").join(Uuid::new_v4().to_string())
    }

    /// Final location of a converted dump.
    pub fn dump_path(&self, dump_id: i64) -> PathBuf {
        self.root.join(format!("{dump_id}{DUMP_SUFFIX}"))
    }

    /// Rename a finished conversion into place. The rename is atomic on the
    /// same filesystem, which `tmp/` guarantees by living under the root.
    pub fn promote_temp_db(&self, temp: &Path, dump_id: i64) -> Result<PathBuf> {
        let target = self.dump_path(dump_id);
        std::fs::rename(temp, &target)?;
        Ok(target)
    }

    /// One-shot migration from the legacy `<repo>@<commit>.lsif.db` naming.
    pub async fn migrate_filenames(&self, xrepo: &CrossRepoIndex) -> Result<()> {
        let marker = self.root.join(MIGRATION_MARKER);
        if marker.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(DUMP_SUFFIX) else {
                continue;
            };
            // Id-based files are untouched.
            if stem.parse::<i64>().is_ok() {
                continue;
            }
            let Some((encoded_repo, commit)) = stem.rsplit_once('@') else {
                continue;
            };
            let repository = percent_decode(encoded_repo);

            match xrepo.get_dump(&repository, commit, "").await? {
                Some(dump) => {
                    let target = self.dump_path(dump.id);
                    std::fs::rename(entry.path(), &target)?;
                    info!(%repository, commit, dump_id = dump.id, "migrated legacy dump file");
                }
                None => {
                    warn!(file = %name, "removing legacy dump file with no matching dump row");
                    std::fs::remove_file(entry.path())?;
                }
            }
        }

        std::fs::write(&marker, b"")?;
        Ok(())
    }
}

/// Minimal percent-decoding for the legacy filename scheme, which only
/// encoded `/` and `%`. Operates on raw bytes the whole way through:
/// filenames are untrusted, so the input is never sliced at byte offsets
/// that could fall inside a multi-byte character. A `%` not followed by
/// two ASCII hex digits passes through verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = hex_byte(bytes[i + 1], bytes[i + 2]) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_byte(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high << 4 | low) as u8)
}
