use std::sync::{Arc, PoisonError, RwLock};

/**
 * \brief Per-adapter model cache.
 *
 * The listing is held as an immutable snapshot behind a lock and replaced
 * wholesale on refresh, so readers always see a complete listing.
 */
#[derive(Debug, Default)]
pub struct ModelDirectory {
    snapshot: RwLock<Option<Arc<Vec<String>>>>,
}

impl ModelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief Current listing, only if one has been cached and it is non-empty.
     */
    pub fn cached(&self) -> Option<Arc<Vec<String>>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|models| !models.is_empty())
            .cloned()
    }

    /**
     * \brief Swap in a new listing and return the stored snapshot.
     */
    pub fn replace(&self, models: Vec<String>) -> Arc<Vec<String>> {
        let snapshot = Arc::new(models);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        snapshot
    }
}
