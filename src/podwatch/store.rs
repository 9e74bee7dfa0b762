use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{PodKey, PodSnapshot};

/// Local cache of pods on this node, written by the informer and read by
/// reconcile workers.
#[derive(Clone, Default)]
pub struct PodStore {
    inner: Arc<RwLock<HashMap<PodKey, Arc<PodSnapshot>>>>,
}

impl PodStore {
    pub fn get(&self, key: &PodKey) -> Option<Arc<PodSnapshot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<PodKey> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<PodSnapshot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Stores `pod`, returning the snapshot it replaced.
    pub(crate) fn insert(&self, pod: Arc<PodSnapshot>) -> Option<Arc<PodSnapshot>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pod.key.clone(), pod)
    }

    pub(crate) fn remove(&self, key: &PodKey) -> Option<Arc<PodSnapshot>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}
