//! Flat-file snapshots: `MASTER<stamp>.csv` and `ADDED<stamp>.csv`.
//!
//! Stamps sort lexicographically in chronological order, so the latest
//! master is simply the greatest matching file name.

use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tabby_core::{Observation, ParseError};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic;

pub const SNAPSHOT_STAMP_FORMAT: &str = "%Y-%m-%d_%H:%M";
pub const SNAPSHOT_EXTENSION: &str = "csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Every observation seen in a run.
    Master,
    /// Only the observations that were new in a run.
    Added,
}

impl SnapshotKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::Added => "ADDED",
        }
    }

    pub fn file_name(self, captured_at: NaiveDateTime) -> String {
        format!(
            "{}{}.{SNAPSHOT_EXTENSION}",
            self.prefix(),
            captured_at.format(SNAPSHOT_STAMP_FORMAT)
        )
    }

    fn matches(self, file_name: &str) -> bool {
        file_name.starts_with(self.prefix())
            && file_name.ends_with(&format!(".{SNAPSHOT_EXTENSION}"))
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{}:{line}: {source}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: ParseError,
    },
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SnapshotError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone)]
pub struct WrittenRun {
    pub master_path: PathBuf,
    pub added_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot files of `kind`, oldest first. A missing root is an empty store.
    pub async fn list(&self, kind: SnapshotKind) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SnapshotError::io("listing", &self.root)(err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(SnapshotError::io("listing", &self.root))?
        {
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            match entry.file_name().into_string() {
                Ok(name) if is_file && kind.matches(&name) => names.push(name),
                _ => {}
            }
        }
        names.sort();

        Ok(names.into_iter().map(|name| self.root.join(name)).collect())
    }

    /// The newest master snapshot, parsed, or `None` on a first run.
    pub async fn latest_master(&self) -> Result<Option<LoadedSnapshot>, SnapshotError> {
        let Some(path) = self.list(SnapshotKind::Master).await?.pop() else {
            return Ok(None);
        };
        let observations = read_snapshot(&path).await?;
        debug!(path = %path.display(), records = observations.len(), "loaded latest master");
        Ok(Some(LoadedSnapshot { path, observations }))
    }

    /// Observations of the newest master, or an empty sequence if there is none.
    pub async fn load_previous(&self) -> Result<Vec<Observation>, SnapshotError> {
        Ok(self
            .latest_master()
            .await?
            .map(|loaded| loaded.observations)
            .unwrap_or_default())
    }

    pub fn snapshot_path(&self, kind: SnapshotKind, captured_at: NaiveDateTime) -> PathBuf {
        self.root.join(kind.file_name(captured_at))
    }

    pub async fn write_snapshot(
        &self,
        kind: SnapshotKind,
        captured_at: NaiveDateTime,
        observations: &[Observation],
    ) -> Result<PathBuf, SnapshotError> {
        self.ensure_root().await?;
        let path = self.snapshot_path(kind, captured_at);
        let staged = self.stage(observations, &path).await?;
        atomic::commit(&staged, &path)
            .await
            .map_err(SnapshotError::io("renaming into", &path))?;
        info!(path = %path.display(), records = observations.len(), "wrote snapshot");
        Ok(path)
    }

    /// Write the master and additions of one run: both files land, or neither.
    ///
    /// Both are staged before either is renamed into place. If the additions
    /// cannot be moved into place the freshly renamed master is removed again,
    /// so the next run still diffs against the last complete run.
    pub async fn write_run(
        &self,
        captured_at: NaiveDateTime,
        master: &[Observation],
        added: &[Observation],
    ) -> Result<WrittenRun, SnapshotError> {
        self.ensure_root().await?;
        let master_path = self.snapshot_path(SnapshotKind::Master, captured_at);
        let added_path = self.snapshot_path(SnapshotKind::Added, captured_at);

        let staged_master = self.stage(master, &master_path).await?;
        let staged_added = match self.stage(added, &added_path).await {
            Ok(path) => path,
            Err(err) => {
                atomic::discard(&staged_master).await;
                return Err(err);
            }
        };

        if let Err(err) = atomic::commit(&staged_master, &master_path).await {
            atomic::discard(&staged_added).await;
            return Err(SnapshotError::io("renaming into", &master_path)(err));
        }
        if let Err(err) = atomic::commit(&staged_added, &added_path).await {
            warn!(master = %master_path.display(), "additions not written; rolling back master");
            atomic::discard(&master_path).await;
            return Err(SnapshotError::io("renaming into", &added_path)(err));
        }

        info!(
            master = %master_path.display(),
            master_records = master.len(),
            added = %added_path.display(),
            added_records = added.len(),
            "wrote run snapshots"
        );
        Ok(WrittenRun {
            master_path,
            added_path,
        })
    }

    async fn ensure_root(&self) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(SnapshotError::io("creating", &self.root))
    }

    async fn stage(
        &self,
        observations: &[Observation],
        target: &Path,
    ) -> Result<PathBuf, SnapshotError> {
        atomic::stage(&self.root, render_rows(observations).as_bytes())
            .await
            .map_err(SnapshotError::io("staging", target))
    }
}

/// Parse a snapshot file, one observation per non-blank line.
pub async fn read_snapshot(path: impl AsRef<Path>) -> Result<Vec<Observation>, SnapshotError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .map_err(SnapshotError::io("reading", path))?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            Observation::from_row(line).map_err(|source| SnapshotError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

fn render_rows(observations: &[Observation]) -> String {
    let mut out = String::new();
    for obs in observations {
        out.push_str(&obs.to_row());
        out.push('\n');
    }
    out
}
