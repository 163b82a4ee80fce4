//! Durable parameter store
//!
//! Address to value table written by `update_param` frames. The table is
//! kept in memory and persisted as JSON after every batch, replacing the
//! file atomically so a reader never sees a partial table.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use a55lib::{LinkError, LinkResult, ParamRecord, ParamTable};
use log::{info, warn};

/// Parameter store shared by the dispatcher and reporting collaborators
pub struct ParamStore {
    path: PathBuf,
    table: Mutex<BTreeMap<u32, i64>>,
}

impl ParamStore {
    /// Open the store, loading any table already on disk
    pub fn open<P: AsRef<Path>>(path: P) -> LinkResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let table = match ParamTable::load(&path) {
            Ok(table) => table.into_map(),
            Err(LinkError::Json(e)) => {
                warn!("Parameter store {} unreadable ({}), starting empty", path.display(), e);
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        info!("Parameter store {} loaded with {} entries", path.display(), table.len());

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    fn lock(&self) -> LinkResult<std::sync::MutexGuard<'_, BTreeMap<u32, i64>>> {
        self.table
            .lock()
            .map_err(|_| LinkError::collaborator("parameter store lock poisoned"))
    }

    /// Upsert a batch; last write wins per address. Returns records written.
    pub fn upsert_many(&self, records: &[ParamRecord]) -> LinkResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut table = self.lock()?;
        for record in records {
            table.insert(record.addr, record.value);
        }
        self.persist(&*table)?;
        Ok(records.len())
    }

    pub fn get(&self, addr: u32) -> LinkResult<Option<i64>> {
        Ok(self.lock()?.get(&addr).copied())
    }

    /// All records sorted by address
    pub fn snapshot(&self) -> LinkResult<Vec<ParamRecord>> {
        let table = self.lock()?;
        Ok(ParamTable::from_map(&*table).params)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, table: &BTreeMap<u32, i64>) -> LinkResult<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &ParamTable::from_map(table))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
