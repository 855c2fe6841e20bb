use std::sync::{Arc, Mutex, PoisonError};

use fogagent_core::model::{Snapshot, StageReport};

/// Append-only log of stage reports. The stage id is the position in the log,
/// so ids are gapless and assigned under the same lock as the insert.
#[derive(Default)]
pub struct StageReportStore {
    stages: Mutex<Vec<Arc<StageReport>>>,
}

impl StageReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `snapshot` under the next stage id and returns that id.
    pub fn append(&self, batch_id: &str, snapshot: Snapshot) -> u64 {
        let mut stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let stage = stages.len() as u64;
        stages.push(Arc::new(StageReport {
            stage,
            batch_id: batch_id.to_string(),
            snapshot,
        }));
        stage
    }

    /// `None` until the stage has been appended.
    pub fn get(&self, stage: u64) -> Option<Arc<StageReport>> {
        let stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        usize::try_from(stage)
            .ok()
            .and_then(|i| stages.get(i))
            .cloned()
    }

    pub fn len(&self) -> u64 {
        self.stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
