use std::sync::Arc;

use arc_swap::ArcSwap;
use mrelay_adapters::AdapterRegistry;
use mrelay_billing::{Ledger, PriceTable, TokenEstimator};
use mrelay_common::GlobalConfig;
use mrelay_storage::Storage;

use crate::ability::AbilityCache;
use crate::limit::RateGuard;

/// Process-wide relay state. Hot-reloadable config and the price table go
/// through `ArcSwap` snapshots; everything else is immutable wiring.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub storage: Arc<dyn Storage>,
    pub ledger: Arc<Ledger>,
    pub abilities: Arc<AbilityCache>,
    pub adapters: Arc<AdapterRegistry>,
    pub prices: ArcSwap<PriceTable>,
    pub estimator: Arc<TokenEstimator>,
    pub limiter: Arc<RateGuard>,
}

impl AppState {
    pub fn new(global: GlobalConfig, storage: Arc<dyn Storage>) -> Self {
        let batch_updates = global.batch_update_enabled;
        Self {
            global: ArcSwap::from_pointee(global),
            ledger: Arc::new(Ledger::new(storage.clone(), batch_updates)),
            storage,
            abilities: Arc::new(AbilityCache::new()),
            adapters: Arc::new(AdapterRegistry::with_builtin()),
            prices: ArcSwap::from_pointee(PriceTable::default()),
            estimator: Arc::new(TokenEstimator::new()),
            limiter: Arc::new(RateGuard::new()),
        }
    }
}
