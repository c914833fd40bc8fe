//! Loaded batches and their bookkeeping.

use std::collections::HashMap;
use std::sync::RwLock;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use datafusion::prelude::DataFrame;
use tracing::debug;

use crate::error::{MetricError, Result};

/// Raw data behind a batch, one variant per backend.
#[derive(Debug, Clone)]
pub enum BatchData {
    /// Materialized Arrow data for the in-process engine.
    InMemory {
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    },
    /// A table registered in the SQL engine's session.
    SqlTable { table_name: String },
    /// A lazy dataframe for the dataframe engine.
    DataFrame(DataFrame),
}

impl BatchData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InMemory { .. } => "in-memory",
            Self::SqlTable { .. } => "sql table",
            Self::DataFrame(_) => "dataframe",
        }
    }
}

/// One loaded slice of data addressable by `batch_id`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub data: BatchData,
    pub loaded_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: impl Into<String>, data: BatchData) -> Self {
        Self {
            id: id.into(),
            data,
            loaded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct BatchState {
    batches: HashMap<String, Batch>,
    active: Option<String>,
}

/// Tracks the batches loaded into one engine.
///
/// Every resolution call works on a [`BatchSnapshot`] taken when the call
/// starts, so loading a batch concurrently never changes the data a running
/// call sees.
#[derive(Debug, Default)]
pub struct BatchManager {
    state: RwLock<BatchState>,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a batch and makes it the active one.
    pub fn load_batch(&self, batch: Batch) -> Result<()> {
        let mut state = self.write()?;
        debug!(batch_id = %batch.id, kind = batch.data.kind(), "loading batch");
        state.active = Some(batch.id.clone());
        state.batches.insert(batch.id.clone(), batch);
        Ok(())
    }

    /// Removes a batch; clears the active id when it pointed at it.
    pub fn remove_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let mut state = self.write()?;
        if state.active.as_deref() == Some(batch_id) {
            state.active = None;
        }
        Ok(state.batches.remove(batch_id))
    }

    pub fn active_batch_id(&self) -> Result<Option<String>> {
        Ok(self.read()?.active.clone())
    }

    /// Makes an already loaded batch the active one.
    pub fn set_active(&self, batch_id: &str) -> Result<()> {
        let mut state = self.write()?;
        if !state.batches.contains_key(batch_id) {
            return Err(MetricError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }
        state.active = Some(batch_id.to_string());
        Ok(())
    }

    pub fn batch_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.read()?.batches.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn get(&self, batch_id: &str) -> Result<Batch> {
        self.read()?
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| MetricError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    /// Point-in-time copy of the loaded batches.
    pub fn snapshot(&self) -> Result<BatchSnapshot> {
        let state = self.read()?;
        Ok(BatchSnapshot {
            batches: state.batches.clone(),
            active: state.active.clone(),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BatchState>> {
        self.state
            .read()
            .map_err(|_| MetricError::Internal("batch manager lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BatchState>> {
        self.state
            .write()
            .map_err(|_| MetricError::Internal("batch manager lock poisoned".to_string()))
    }
}

/// Batches visible to one resolution call.
#[derive(Debug, Clone)]
pub struct BatchSnapshot {
    batches: HashMap<String, Batch>,
    active: Option<String>,
}

impl BatchSnapshot {
    /// Looks up the batch named by the domain, or the active batch.
    pub fn resolve(&self, batch_id: Option<&str>) -> Result<&Batch> {
        let id = match batch_id {
            Some(id) => id,
            None => self.active.as_deref().ok_or_else(|| MetricError::BatchNotFound {
                batch_id: "<active>".to_string(),
            })?,
        };
        self.batches.get(id).ok_or_else(|| MetricError::BatchNotFound {
            batch_id: id.to_string(),
        })
    }
}
