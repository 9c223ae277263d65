//! One [`StateStore`] per (venue, symbol), shared by every task of that pair

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::persistence::{StateStore, DEFAULT_CACHE_TTL_SECS, DEFAULT_HISTORY_CAP};
use crate::types::{canonical_symbol, Venue};

pub struct InstanceRegistry {
    data_dir: PathBuf,
    history_cap: usize,
    cache_ttl: Duration,
    stores: Mutex<HashMap<(Venue, String), Arc<StateStore>>>,
}

impl InstanceRegistry {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            history_cap: DEFAULT_HISTORY_CAP,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &PersistenceConfig) -> Self {
        Self {
            history_cap: cfg.history_cap,
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            ..Self::new(&cfg.data_dir)
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The store for `(venue, symbol)`, created on first use. Repeated calls
    /// return the same instance.
    pub fn store(&self, venue: Venue, symbol: &str) -> Result<Arc<StateStore>> {
        let key = (venue, canonical_symbol(symbol));
        let mut stores = self.stores.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(store) = stores.get(&key) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(
            StateStore::new(&self.data_dir, venue, &key.1)?
                .with_history_cap(self.history_cap)
                .with_cache_ttl(self.cache_ttl),
        );
        debug!(venue = %venue, symbol = %key.1, "State store registered");
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }

    /// Registered pairs, sorted
    pub fn instances(&self) -> Vec<(Venue, String)> {
        let stores = self.stores.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<(Venue, String)> = stores.keys().cloned().collect();
        keys.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
        keys
    }

    pub fn len(&self) -> usize {
        self.stores.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(std::env::temp_dir().join(format!("venuebot_registry_{}", uuid::Uuid::new_v4())))
    }

    #[test]
    fn same_pair_shares_one_store() {
        let reg = registry();
        let a = reg.store(Venue::Bybit, "BTCUSDT").unwrap();
        let b = reg.store(Venue::Bybit, "btc/usdt").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn pairs_are_isolated() {
        let reg = registry();
        let bybit = reg.store(Venue::Bybit, "BTCUSDT").unwrap();
        let okx = reg.store(Venue::Okx, "BTCUSDT").unwrap();
        assert!(!Arc::ptr_eq(&bybit, &okx));
        assert_ne!(bybit.cache_file(), okx.cache_file());
        assert_eq!(
            reg.instances(),
            vec![(Venue::Bybit, "BTCUSDT".to_string()), (Venue::Okx, "BTCUSDT".to_string())]
        );
    }
}
