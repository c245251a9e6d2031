use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::storage::Storage;

#[derive(Clone)]
pub struct State {
    pub storage: Arc<Storage>,
    pub cfg: Arc<Config>,
}

impl State {
    pub async fn new(cfg: Config) -> Result<Self> {
        let storage = Arc::new(Storage::new(&cfg.db_path).await?);

        Ok(Self::with_storage(cfg, storage))
    }

    pub fn with_storage(cfg: Config, storage: Arc<Storage>) -> Self {
        State {
            storage,
            cfg: Arc::new(cfg),
        }
    }
}
