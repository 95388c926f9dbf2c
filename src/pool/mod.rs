//! Pool-map collaborator and the shared pool/container handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::placement::Placement;
use crate::transport::Transport;
use crate::txn::TxConfig;
use crate::utils::{BackoffSeq, ErrCode, ShardTxError};
use crate::wire::MapVersion;

use async_trait::async_trait;

use rand::Rng;

use tokio::task::JoinHandle;

/// Pool-map collaborator trait. The map is owned and updated elsewhere; the
/// coordinator only reads its version and asks for refreshes.
#[async_trait]
pub trait PoolMap: Send + Sync {
    /// Locally known pool map version.
    fn current_version(&self) -> MapVersion;

    /// Refreshes the local view to at least `min_version` if the pool has
    /// it, returning the version known afterwards.
    async fn refresh(
        &self,
        min_version: MapVersion,
    ) -> Result<MapVersion, ShardTxError>;
}

/// Connected pool handle, shared by every container opened on it.
pub struct PoolHandle {
    /// Pool ID.
    pool_id: u64,

    /// Pool map view.
    map: Arc<dyn PoolMap>,

    /// Placement view.
    placement: Arc<dyn Placement>,

    /// RPC transport.
    transport: Arc<dyn Transport>,
}

impl PoolHandle {
    /// Creates a new pool handle over the given collaborators.
    pub fn new(
        pool_id: u64,
        map: Arc<dyn PoolMap>,
        placement: Arc<dyn Placement>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(PoolHandle {
            pool_id,
            map,
            placement,
            transport,
        })
    }

    /// Pool ID.
    #[inline]
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Pool map view.
    #[inline]
    pub fn map(&self) -> &Arc<dyn PoolMap> {
        &self.map
    }

    /// Placement view.
    #[inline]
    pub fn placement(&self) -> &Arc<dyn Placement> {
        &self.placement
    }

    /// RPC transport.
    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Spawns an asynchronous pool map refresh task.
    pub fn refresh_task(
        &self,
        min_version: MapVersion,
    ) -> JoinHandle<Result<MapVersion, ShardTxError>> {
        let map = self.map.clone();
        tokio::spawn(async move {
            let version = map.refresh(min_version).await?;
            pf_debug!(
                "pool map refreshed to {} (asked {})",
                version,
                min_version
            );
            Ok(version)
        })
    }
}

/// Open container handle. Transactions are opened against one of these.
pub struct ContainerHandle {
    /// Owning pool.
    pool: Arc<PoolHandle>,

    /// Container ID.
    co_id: u64,

    /// Randomly generated open-handle ID.
    co_hdl: u64,

    /// Transaction configuration parameters.
    config: TxConfig,

    /// Cleared once the container is closed.
    valid: AtomicBool,
}

impl ContainerHandle {
    /// Opens a container, parsing transaction parameters from an optional
    /// TOML string.
    pub fn new(
        pool: Arc<PoolHandle>,
        co_id: u64,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, ShardTxError> {
        let config = parsed_config!(config_str => TxConfig;
                                    inline_limit, update_bulk_limit,
                                    init_slots, backoff_nzeros,
                                    backoff_factor, backoff_next_us,
                                    backoff_max_us, starve_threshold,
                                    rpc_timeout_ms, ec_cell_len)?;
        if config.inline_limit == 0 {
            return logged_err!(ErrCode::Inval;
                               "invalid config.inline_limit '{}'",
                               config.inline_limit);
        }
        if config.init_slots == 0 {
            return logged_err!(ErrCode::Inval;
                               "invalid config.init_slots '{}'",
                               config.init_slots);
        }
        if config.ec_cell_len == 0 {
            return logged_err!(ErrCode::Inval;
                               "invalid config.ec_cell_len '{}'",
                               config.ec_cell_len);
        }
        BackoffSeq::new(
            config.backoff_nzeros,
            config.backoff_factor,
            config.backoff_next_us,
            config.backoff_max_us,
        )?;

        Ok(Arc::new(ContainerHandle {
            pool,
            co_id,
            co_hdl: rand::thread_rng().gen(),
            config,
            valid: AtomicBool::new(true),
        }))
    }

    /// Owning pool.
    #[inline]
    pub fn pool(&self) -> &Arc<PoolHandle> {
        &self.pool
    }

    /// Container ID.
    #[inline]
    pub fn co_id(&self) -> u64 {
        self.co_id
    }

    /// Open-handle ID.
    #[inline]
    pub fn co_hdl(&self) -> u64 {
        self.co_hdl
    }

    /// Transaction configuration.
    #[inline]
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Is the handle still open?
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Closes the handle. Transactions cannot be opened on it afterwards.
    pub fn close(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::sim::SimCluster;

    #[test]
    fn container_config() -> Result<(), ShardTxError> {
        let sim = SimCluster::new(1, 4);
        let pool = sim.pool_handle();
        let cont = ContainerHandle::new(pool.clone(), 7, None)?;
        assert_eq!(cont.config().inline_limit, 2048);
        assert_eq!(cont.co_id(), 7);
        assert!(cont.is_valid());
        cont.close();
        assert!(!cont.is_valid());

        let cont = ContainerHandle::new(
            pool.clone(),
            8,
            Some("inline_limit = 64\ninit_slots = 4"),
        )?;
        assert_eq!(cont.config().inline_limit, 64);
        assert_eq!(cont.config().init_slots, 4);

        let bad = ContainerHandle::new(pool.clone(), 9, Some("nope = 1"));
        assert_eq!(bad.err().map(|e| e.errcode()), Some(ErrCode::Inval));
        let bad = ContainerHandle::new(pool, 9, Some("init_slots = 0"));
        assert_eq!(bad.err().map(|e| e.errcode()), Some(ErrCode::Inval));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_refresh_task() -> Result<(), ShardTxError> {
        let sim = SimCluster::new(1, 4);
        let pool = sim.pool_handle();
        sim.bump_version(&[]);
        assert_eq!(pool.refresh_task(2).await??, 2);
        assert_eq!(pool.map().current_version(), 2);
        Ok(())
    }
}
