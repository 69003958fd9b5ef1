use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::models::RefreshMeta;

/// Process-wide refresh metadata, replaced as a whole by the refresh job.
#[derive(Debug)]
pub struct RefreshMetaCell {
    current: RwLock<Arc<RefreshMeta>>,
}

impl RefreshMetaCell {
    pub fn new(initial: RefreshMeta) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<RefreshMeta> {
        Arc::clone(&self.current.read())
    }

    pub fn replace(&self, next: RefreshMeta) -> Arc<RefreshMeta> {
        info!(
            data_last_updated = %next.data_last_updated,
            model_version = %next.model_version,
            feature_version = %next.feature_version,
            "replacing refresh metadata"
        );
        std::mem::replace(&mut *self.current.write(), Arc::new(next))
    }
}
