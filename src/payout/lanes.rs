use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One serialized lane per payee.
///
/// Settlements for the same payee queue behind each other; different payees
/// never contend.
#[derive(Default)]
pub struct PayeeLanes {
    lanes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PayeeLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the payee's lane; it is held until the guard is dropped
    pub async fn acquire(&self, payee_id: &str) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock();
            lanes
                .entry(payee_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lane.lock_owned().await
    }

    /// Drop lanes nobody holds or waits on
    pub fn prune(&self) -> usize {
        let mut lanes = self.lanes.lock();
        let before = lanes.len();
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        before - lanes.len()
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
