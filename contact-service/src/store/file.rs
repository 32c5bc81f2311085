//! JSON file record store.
//!
//! Each table is a single file `<data_dir>/<table>.json`:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "records": {
//!     "a@b.com": { "email": "a@b.com" }
//!   }
//! }
//! ```
//!
//! Every `save` rewrites the table through a temp file and an atomic rename,
//! so a crash mid-write leaves the previous table intact. The data directory
//! must already exist; creating it is a provisioning concern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Record, RecordStore};
use crate::error::IntakeError;

/// Table file format version.
const TABLE_FILE_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    version: String,
    records: HashMap<String, Record>,
}

/// File-backed record store.
///
/// The mutex is held for the duration of one save (insert plus rewrite), which
/// keeps concurrent saves from interleaving their temp-file writes.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    records: Mutex<HashMap<String, Record>>,
}

impl FileRecordStore {
    /// Open the table `table` under `data_dir`.
    ///
    /// A missing table file is an empty table. A missing directory or an
    /// unreadable table is an error.
    pub async fn open(data_dir: impl AsRef<Path>, table: &str) -> Result<Self, IntakeError> {
        Self::open_inner(data_dir.as_ref(), table)
            .await
            .map_err(|e| IntakeError::persistence(format!("{e:#}")))
    }

    async fn open_inner(data_dir: &Path, table: &str) -> Result<Self> {
        if !data_dir.is_dir() {
            bail!("data directory {} does not exist", data_dir.display());
        }

        let path = data_dir.join(format!("{table}.json"));
        let records = load_table(&path).await?;

        info!(
            table = table,
            path = %path.display(),
            records = records.len(),
            "record_store_opened"
        );

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Path of the backing table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_table(&self, records: &HashMap<String, Record>) -> Result<()> {
        let table = TableFile {
            version: TABLE_FILE_VERSION.to_string(),
            records: records.clone(),
        };
        let json = serde_json::to_vec_pretty(&table).context("failed to serialize table")?;

        let mut temp_path = self.path.clone();
        temp_path.set_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(&json)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), records = records.len(), "record_table_written");
        Ok(())
    }
}

async fn load_table(path: &Path) -> Result<HashMap<String, Record>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
    {
        return Ok(HashMap::new());
    }

    let content = fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let table: TableFile = serde_json::from_slice(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    if table.version != TABLE_FILE_VERSION {
        warn!(
            path = %path.display(),
            expected = TABLE_FILE_VERSION,
            found = %table.version,
            "record_table_version_mismatch"
        );
    }

    Ok(table.records)
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn save(&self, email: &str) -> Result<(), IntakeError> {
        let mut records = self.records.lock().await;

        if records.contains_key(email) {
            return Ok(());
        }

        records.insert(email.to_string(), Record::new(email));
        if let Err(e) = self.write_table(&records).await {
            // Keep memory consistent with what is on disk.
            records.remove(email);
            return Err(IntakeError::persistence(format!("{e:#}")));
        }

        Ok(())
    }

    async fn get(&self, email: &str) -> Result<Option<Record>, IntakeError> {
        Ok(self.records.lock().await.get(email).cloned())
    }

    async fn count(&self) -> Result<usize, IntakeError> {
        Ok(self.records.lock().await.len())
    }
}
