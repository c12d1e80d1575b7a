//! Multi-engine client pool.
//!
//! A [`Pool`] aggregates N clients (one per engine) behind a single
//! surface: broadcast app loading, cluster-wide counters, and
//! round-robin member selection so originate traffic spreads evenly.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::app::Application;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::identifiers::AppId;
use crate::protocol::OriginateConfig;
use crate::transport::ConnectConfig;

// ============================================================================
// Pool
// ============================================================================

/// A fixed set of clients addressed round-robin.
pub struct Pool {
    clients: Vec<Arc<Client>>,
    cursor: AtomicUsize,
    /// Per-member live-call ceiling for [`Pool::next_available`];
    /// members at or above it are skipped.
    member_call_limit: Option<usize>,
}

impl Pool {
    /// Creates a pool from existing clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty member list.
    pub fn new(clients: Vec<Arc<Client>>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::config("pool needs at least one client"));
        }
        Ok(Self {
            clients,
            cursor: AtomicUsize::new(0),
            member_call_limit: None,
        })
    }

    /// Creates a pool with one client per engine endpoint.
    pub fn from_configs(configs: impl IntoIterator<Item = ConnectConfig>) -> Result<Self> {
        let clients = configs
            .into_iter()
            .map(|config| Arc::new(Client::new(config)))
            .collect();
        Self::new(clients)
    }

    /// Sets the per-member live-call ceiling used by
    /// [`Pool::next_available`].
    #[must_use]
    pub fn with_member_call_limit(mut self, limit: usize) -> Self {
        self.member_call_limit = Some(limit);
        self
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Number of member clients.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Always `false`; pools are non-empty by construction.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of the member clients.
    #[must_use]
    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    /// Applies a function to every member, collecting the results.
    ///
    /// The cluster-wide equivalent of evaluating an expression on
    /// each engine.
    pub fn map<R>(&self, f: impl FnMut(&Arc<Client>) -> R) -> Vec<R> {
        self.clients.iter().map(f).collect()
    }

    /// Returns the next member, plain round-robin.
    #[must_use]
    pub fn next_client(&self) -> Arc<Client> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Arc::clone(&self.clients[index])
    }

    /// Returns the next member under its call ceiling, or `None`
    /// when every member is saturated.
    #[must_use]
    pub fn next_available(&self) -> Option<Arc<Client>> {
        let Some(limit) = self.member_call_limit else {
            return Some(self.next_client());
        };
        for _ in 0..self.clients.len() {
            let client = self.next_client();
            if client.listener().count_calls() < limit {
                return Some(client);
            }
        }
        None
    }

    // ========================================================================
    // Lifecycle broadcast
    // ========================================================================

    /// Connects every member.
    ///
    /// # Errors
    ///
    /// Fails on the first member that cannot connect.
    pub async fn connect_all(&self) -> Result<()> {
        for client in &self.clients {
            client.connect().await?;
        }
        info!(members = self.len(), "Pool connected");
        Ok(())
    }

    /// Starts every member's event pump.
    pub fn start_all(&self) -> Result<()> {
        for client in &self.clients {
            client.start()?;
        }
        Ok(())
    }

    /// Stops every member.
    pub async fn stop_all(&self) {
        for client in &self.clients {
            client.stop().await;
        }
        info!(members = self.len(), "Pool stopped");
    }

    /// Issues a scoped `hupall` on every member.
    pub async fn hupall_all(&self) -> Result<()> {
        for client in &self.clients {
            if let Err(e) = client.hupall().await {
                warn!(host = %client.host(), error = %e, "hupall failed");
            }
        }
        Ok(())
    }

    // ========================================================================
    // App & template broadcast
    // ========================================================================

    /// Loads one shared application instance on every member.
    ///
    /// Rolls already-loaded members back when any member fails, so
    /// the cluster state stays uniform.
    pub async fn load_app_all(
        &self,
        app: Arc<dyn Application>,
        app_id: Option<AppId>,
    ) -> Result<AppId> {
        let app_id = app_id.unwrap_or_else(|| AppId::new(app.name()));
        let mut loaded = Vec::new();

        for client in &self.clients {
            match client
                .load_app(Arc::clone(&app), Some(app_id.clone()))
                .await
            {
                Ok(_) => loaded.push(Arc::clone(client)),
                Err(e) => {
                    warn!(host = %client.host(), app = %app_id, error = %e, "Load failed");
                    for client in loaded {
                        let _ = client.unload_app(&app_id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(app_id)
    }

    /// Unloads an app from every member.
    pub fn unload_app_all(&self, app_id: &AppId) -> Result<()> {
        for client in &self.clients {
            client.unload_app(app_id)?;
        }
        Ok(())
    }

    /// Caches the same originate template on every member.
    pub fn set_originate_config_all(&self, config: OriginateConfig) {
        for client in &self.clients {
            client.set_originate_config(config.clone());
        }
    }

    // ========================================================================
    // Aggregated counters
    // ========================================================================

    /// Live sessions across the cluster.
    #[must_use]
    pub fn count_sessions(&self) -> usize {
        self.clients
            .iter()
            .map(|c| c.listener().count_sessions())
            .sum()
    }

    /// Live calls across the cluster (the erlang estimate).
    #[must_use]
    pub fn count_calls(&self) -> usize {
        self.clients
            .iter()
            .map(|c| c.listener().count_calls())
            .sum()
    }

    /// Unresolved background jobs across the cluster.
    #[must_use]
    pub fn count_jobs(&self) -> usize {
        self.clients.iter().map(|c| c.listener().count_jobs()).sum()
    }

    /// Unsuccessful sessions across the cluster.
    #[must_use]
    pub fn count_failed(&self) -> u64 {
        self.clients
            .iter()
            .map(|c| c.listener().count_failed())
            .sum()
    }

    /// Total originated sessions across the cluster.
    #[must_use]
    pub fn total_originated_sessions(&self) -> u64 {
        self.clients
            .iter()
            .map(|c| c.listener().total_originated_sessions())
            .sum()
    }

    /// Hangup causes merged across the cluster.
    #[must_use]
    pub fn hangup_causes(&self) -> FxHashMap<String, u64> {
        let mut merged: FxHashMap<String, u64> = FxHashMap::default();
        for client in &self.clients {
            for (cause, count) in client.listener().hangup_causes() {
                *merged.entry(cause).or_insert(0) += count;
            }
        }
        merged
    }

    /// Failed background jobs merged across the cluster.
    #[must_use]
    pub fn failed_jobs(&self) -> FxHashMap<String, u64> {
        let mut merged: FxHashMap<String, u64> = FxHashMap::default();
        for client in &self.clients {
            for (cause, count) in client.listener().failed_jobs() {
                *merged.entry(cause).or_insert(0) += count;
            }
        }
        merged
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("members", &self.len())
            .field("calls", &self.count_calls())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> Pool {
        let clients = (0..n)
            .map(|i| {
                Arc::new(Client::new(ConnectConfig::new(
                    format!("fs{i}"),
                    "ClueCon",
                )))
            })
            .collect();
        Pool::new(clients).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(Pool::new(Vec::new()).is_err());
    }

    #[test]
    fn test_round_robin_cycles_members() {
        let pool = pool(3);
        let hosts: Vec<_> = (0..6).map(|_| pool.next_client().host().to_string()).collect();
        assert_eq!(hosts, vec!["fs0", "fs1", "fs2", "fs0", "fs1", "fs2"]);
    }

    #[test]
    fn test_next_available_without_limit() {
        let pool = pool(2);
        assert!(pool.next_available().is_some());
    }

    #[test]
    fn test_next_available_all_saturated() {
        // Limit of zero saturates every member immediately.
        let pool = pool(2).with_member_call_limit(0);
        assert!(pool.next_available().is_none());
    }

    #[test]
    fn test_aggregate_counts_start_empty() {
        let pool = pool(2);
        assert_eq!(pool.count_sessions(), 0);
        assert_eq!(pool.count_calls(), 0);
        assert_eq!(pool.count_jobs(), 0);
        assert_eq!(pool.total_originated_sessions(), 0);
    }
}
