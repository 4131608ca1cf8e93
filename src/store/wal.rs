//! Write-ahead log: one JSON object per line, appended and synced before the
//! in-memory state it describes is changed.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::types::job::{JobId, JobRecord};

const LOG_FILE: &str = "jobs.wal";
const COMPACT_FILE: &str = "jobs.wal.tmp";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub(crate) enum Entry<'a> {
    /// Insert or replace a job record.
    Put { job: Cow<'a, JobRecord> },
    /// Forget a job record.
    Remove { id: JobId },
    /// Lowest id that may still be handed out; written at the top of a
    /// compacted log so ids of pruned jobs are never reused.
    Seq { next_id: u64 },
}

/// What was recovered from an existing log.
#[derive(Debug, Default)]
pub(crate) struct Replayed {
    pub(crate) jobs: BTreeMap<JobId, JobRecord>,
    pub(crate) next_id: u64,
}

pub(crate) struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the log up to the last entry known to be on disk.
    len: u64,
    /// Set when a failed append couldn't be rolled back.
    poisoned: bool,
    /// Makes the next append write only this many bytes, then fail.
    #[cfg(test)]
    pub(super) fail_after: Option<usize>,
}

impl Wal {
    /// Reads the log in `dir`, if there is one. Later entries win. A final
    /// line without its newline is a write torn by a crash and is dropped;
    /// any other unreadable line is corruption.
    pub(crate) async fn replay(dir: &Path) -> Result<Replayed, QueueError> {
        let path = dir.join(LOG_FILE);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replayed {
                    next_id: 1,
                    ..Default::default()
                })
            },
            Err(e) => return Err(e.into()),
        };

        let mut replayed = Replayed {
            next_id: 1,
            ..Default::default()
        };
        let complete = data.ends_with(b"\n");
        let lines: Vec<&[u8]> = data.split(|b| *b == b'\n').collect();
        let last = lines.len() - 1;

        for (n, line) in lines.into_iter().enumerate() {
            if line.is_empty() {
                continue;
            }

            let entry: Entry = match serde_json::from_slice(line) {
                Ok(entry) => entry,
                Err(_) if n == last && !complete => {
                    warn!(
                        path = %path.display(),
                        "dropping torn final log entry"
                    );
                    break;
                },
                Err(source) => {
                    return Err(QueueError::CorruptLog {
                        line: n + 1,
                        source,
                    })
                },
            };

            match entry {
                Entry::Put { job } => {
                    let job = job.into_owned();
                    replayed.next_id = replayed.next_id.max(job.id.0 + 1);
                    replayed.jobs.insert(job.id, job);
                },
                Entry::Remove { id } => {
                    replayed.next_id = replayed.next_id.max(id.0 + 1);
                    replayed.jobs.remove(&id);
                },
                Entry::Seq { next_id } => {
                    replayed.next_id = replayed.next_id.max(next_id);
                },
            }
        }

        info!(
            path = %path.display(),
            jobs = replayed.jobs.len(),
            next_id = replayed.next_id,
            "replayed log"
        );

        Ok(replayed)
    }

    /// Writes a fresh log holding exactly `jobs`, atomically swaps it in for
    /// the old one, and opens it for appending.
    pub(crate) async fn compact(
        dir: &Path,
        jobs: &BTreeMap<JobId, JobRecord>,
        next_id: u64,
    ) -> Result<Self, QueueError> {
        fs::create_dir_all(dir).await?;

        let tmp_path = dir.join(COMPACT_FILE);
        let path = dir.join(LOG_FILE);

        let mut snapshot = encode(&Entry::Seq { next_id })?;
        for job in jobs.values() {
            snapshot.extend(encode(&Entry::Put {
                job: Cow::Borrowed(job),
            })?);
        }

        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&snapshot).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &path).await?;
        debug!(path = %path.display(), bytes = snapshot.len(), "compacted log");

        let file = OpenOptions::new().append(true).open(&path).await?;

        Ok(Self {
            file,
            path,
            len: snapshot.len() as u64,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Appends one entry and waits until it is on disk. On failure the log is
    /// cut back to its previous length so no partial line is left behind; if
    /// even that fails, every later append is refused.
    pub(crate) async fn append(
        &mut self,
        entry: &Entry<'_>,
    ) -> Result<(), QueueError> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write-ahead log is in an unknown state",
            )
            .into());
        }

        let line = encode(entry)?;

        if let Err(e) = self.write(&line).await {
            warn!(path = %self.path.display(), error = %e, "append failed");
            if let Err(rollback) = self.truncate().await {
                error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial append, refusing writes"
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }

        self.len += line.len() as u64;

        Ok(())
    }

    async fn write(&mut self, line: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(n) = self.fail_after.take() {
            self.file.write_all(&line[..n.min(line.len())]).await?;
            self.file.flush().await?;
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }

        self.file.write_all(line).await?;
        // Surfaces errors from the write itself, which sync_data won't.
        self.file.flush().await?;
        self.file.sync_data().await
    }

    async fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(self.len).await?;
        self.file.sync_data().await
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn encode(entry: &Entry<'_>) -> Result<Vec<u8>, QueueError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    Ok(line)
}
