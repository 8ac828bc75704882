//! Background bundle job table using heed (LMDB) + rkyv
//!
//! One record per source path, lifecycle `absent -> building -> available |
//! failed`. The lookup and the insert of a new `building` record happen in
//! the same write transaction, so two requests for the same source can never
//! both start a build.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, warn};

use bam_core::protocol::BundleStatus;

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum JobState {
    Building,
    Available,
    Failed,
}

impl From<JobState> for BundleStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Building => Self::Building,
            JobState::Available => Self::Available,
            JobState::Failed => Self::Failed,
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct JobRecord {
    pub state: JobState,
    /// Archive path once available
    pub bundle_path: Option<String>,
    /// Seconds since the epoch of the last transition
    pub updated: u64,
}

/// Outcome of asking for a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// No usable record existed; the caller owns the build now
    Started,
    AlreadyBuilding,
    Available(String),
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn encode(record: &JobRecord) -> color_eyre::Result<AlignedVec> {
    rkyv::to_bytes::<RkyvError>(record)
        .map_err(|e| color_eyre::eyre::eyre!("rkyv serialization failed: {e}"))
}

fn decode(data: &[u8]) -> color_eyre::Result<JobRecord> {
    // LMDB values carry no alignment guarantee
    let mut aligned = AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(data);
    rkyv::from_bytes::<JobRecord, RkyvError>(&aligned)
        .map_err(|e| color_eyre::eyre::eyre!("corrupt job record: {e}"))
}

/// Persistent job status table
pub struct JobTable {
    env: Env,
    /// Maps source path -> job record (rkyv serialized)
    jobs: Database<Bytes, Bytes>,
}

impl JobTable {
    /// Open or create a job table at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> color_eyre::Result<Self> {
        std::fs::create_dir_all(path)?;

        // SAFETY: heed requires unsafe for memory-mapped I/O. The database
        // file must not be modified externally while the Env is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(16 * 1024 * 1024)
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let jobs: Database<Bytes, Bytes> = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name("jobs")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, jobs })
    }

    /// Current record for `source`
    pub fn get(&self, source: &str) -> color_eyre::Result<Option<JobRecord>> {
        let rtxn = self.env.read_txn()?;
        self.jobs
            .get(&rtxn, source.as_bytes())?
            .map(decode)
            .transpose()
    }

    /// Claim the build for `source` unless one is running or usable.
    ///
    /// `exists` reports whether a recorded archive is still on disk; an
    /// `available` record whose archive vanished is rebuilt.
    pub fn begin(&self, source: &str, exists: impl Fn(&str) -> bool) -> color_eyre::Result<Begin> {
        let mut wtxn = self.env.write_txn()?;
        let current = self
            .jobs
            .get(&wtxn, source.as_bytes())?
            .map(decode)
            .transpose()?;

        match current {
            Some(JobRecord {
                state: JobState::Building,
                ..
            }) => return Ok(Begin::AlreadyBuilding),
            Some(JobRecord {
                state: JobState::Available,
                bundle_path: Some(path),
                ..
            }) if exists(&path) => return Ok(Begin::Available(path)),
            Some(record) => debug!("rebuilding {source} (was {:?})", record.state),
            None => {}
        }

        let record = JobRecord {
            state: JobState::Building,
            bundle_path: None,
            updated: now(),
        };
        self.jobs
            .put(&mut wtxn, source.as_bytes(), &encode(&record)?)?;
        wtxn.commit()?;
        Ok(Begin::Started)
    }

    /// Mark the build for `source` as available at `bundle_path`
    pub fn finish(&self, source: &str, bundle_path: &str) -> color_eyre::Result<()> {
        self.set(source, JobState::Available, Some(bundle_path.to_string()))
    }

    /// Mark the build for `source` as failed
    pub fn fail(&self, source: &str) -> color_eyre::Result<()> {
        self.set(source, JobState::Failed, None)
    }

    fn set(
        &self,
        source: &str,
        state: JobState,
        bundle_path: Option<String>,
    ) -> color_eyre::Result<()> {
        let record = JobRecord {
            state,
            bundle_path,
            updated: now(),
        };
        let mut wtxn = self.env.write_txn()?;
        self.jobs
            .put(&mut wtxn, source.as_bytes(), &encode(&record)?)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Fail every build left `building` by a previous process.
    ///
    /// Returns the number of records changed.
    pub fn recover(&self) -> color_eyre::Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let mut stale = Vec::new();
        for item in self.jobs.iter(&wtxn)? {
            let (key, value) = item?;
            if decode(value)?.state == JobState::Building {
                stale.push(key.to_vec());
            }
        }

        let record = encode(&JobRecord {
            state: JobState::Failed,
            bundle_path: None,
            updated: now(),
        })?;
        for key in &stale {
            warn!(
                "bundle build for {} interrupted",
                String::from_utf8_lossy(key)
            );
            self.jobs.put(&mut wtxn, key, &record)?;
        }
        wtxn.commit()?;
        Ok(stale.len())
    }
}
