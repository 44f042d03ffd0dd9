use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dicom_dictionary_std::tags;
use dimse::{RetrieveListener, StoredObject, SubOperationCounters};
use tracing::{info, warn};

/// One object received during a retrieve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedEntry {
    pub path: PathBuf,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: String,
    /// Status sent back to the archive
    pub status: u16,
    pub received_at: DateTime<Utc>,
}

/// Records every object the engine stores and logs the archive's progress
#[derive(Debug, Default)]
pub struct RetrievedObjectLog {
    entries: Mutex<Vec<RetrievedEntry>>,
    last_progress: Mutex<Option<SubOperationCounters>>,
}

impl RetrievedObjectLog {
    pub fn entries(&self) -> Vec<RetrievedEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Counters of the most recent pending C-MOVE response
    pub fn last_progress(&self) -> Option<SubOperationCounters> {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RetrieveListener for RetrievedObjectLog {
    fn on_object_stored(&self, object: StoredObject) {
        if object.status == 0 {
            info!(
                "Retrieved {} -> {}",
                object.sop_instance_uid,
                object.path.display()
            );
        } else {
            warn!(
                "Retrieved {} with status 0x{:04X} -> {}",
                object.sop_instance_uid,
                object.status,
                object.path.display()
            );
        }

        let entry = RetrievedEntry {
            study_instance_uid: object.attribute(tags::STUDY_INSTANCE_UID),
            series_instance_uid: object.attribute(tags::SERIES_INSTANCE_UID),
            path: object.path,
            sop_instance_uid: object.sop_instance_uid,
            status: object.status,
            received_at: object.received_at,
        };
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }

    fn on_progress(&self, counters: &SubOperationCounters) {
        info!("Retrieve in progress: {}", counters);
        *self
            .last_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(*counters);
    }
}
