use crate::backends::GenerationRequest;
use crate::chain::{BackendHealth, Generated, ProviderChain};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// Health of every backend in one role's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainHealth {
    pub role: Role,
    pub backends: Vec<BackendHealth>,
}

/// The provider chains of all roles, swappable at runtime.
///
/// Calls in flight keep the chain they started with; a reload only affects
/// calls made after it.
#[derive(Default)]
pub struct ProviderSet {
    chains: RwLock<HashMap<Role, Arc<ProviderChain>>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the chain for its role.
    pub fn insert(&self, chain: ProviderChain) {
        let role = chain.role();
        info!(role = %role, backends = ?chain.backend_names(), "Provider chain installed");
        self.chains.write().insert(role, Arc::new(chain));
    }

    /// Replace every chain at once.
    pub fn replace_all(&self, chains: Vec<ProviderChain>) {
        let map: HashMap<Role, Arc<ProviderChain>> = chains
            .into_iter()
            .map(|c| (c.role(), Arc::new(c)))
            .collect();
        info!(roles = map.len(), "Provider chains reloaded");
        *self.chains.write() = map;
    }

    pub fn chain(&self, role: Role) -> WorkforgeResult<Arc<ProviderChain>> {
        self.chains
            .read()
            .get(&role)
            .cloned()
            .ok_or_else(|| WorkforgeError::Config(format!("No provider chain configured for role: {role}")))
    }

    /// Generate with the role's current chain.
    pub async fn generate(&self, role: Role, request: &GenerationRequest) -> WorkforgeResult<Generated> {
        let chain = self.chain(role)?;
        chain.generate(request).await
    }

    /// Health of all chains, in role order.
    pub fn health(&self) -> Vec<ChainHealth> {
        let chains = self.chains.read();
        let mut out: Vec<ChainHealth> = chains
            .values()
            .map(|c| ChainHealth {
                role: c.role(),
                backends: c.health(),
            })
            .collect();
        out.sort_by_key(|c| c.role);
        out
    }
}
