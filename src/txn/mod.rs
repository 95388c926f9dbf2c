//! Distributed transaction handle and its compound-commit pipeline.

mod attach;
mod cache;
mod classify;
mod commit;
mod ecreasb;
mod epoch;
mod pack;
mod reduce;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pool::ContainerHandle;
use crate::transport::Transport;
use crate::utils::{BackoffSeq, ErrCode, ShardTxError};
use crate::wire::{
    BulkHandle, CompoundRequest, DtxId, Epoch, MapVersion, ShardTarget,
};

use cache::SubReqCache;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time;

pub use attach::{CondFlags, TxOp};
pub use epoch::{EpochChooser, EpochGrant};

pub(crate) use ecreasb::ec_extract;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct TxConfig {
    /// Compound request sections larger than this many bytes are sent via
    /// bulk transfer instead of inline.
    pub inline_limit: usize,

    /// Update values larger than this many bytes in total are registered
    /// for bulk transfer.
    pub update_bulk_limit: usize,

    /// Initial sub-request cache capacity.
    pub init_slots: u32,

    /// Number of leading zero delays of the backoff sequence.
    pub backoff_nzeros: u8,
    /// Growth factor of the backoff upper bound.
    pub backoff_factor: u32,
    /// Initial backoff upper bound in microsecs.
    pub backoff_next_us: u64,
    /// Maximum backoff upper bound in microsecs.
    pub backoff_max_us: u64,

    /// Consecutive commit resends after which the transaction is reported as
    /// possibly starving.
    pub starve_threshold: u32,

    /// RPC reply timeout in millisecs, used by the TCP transport.
    pub rpc_timeout_ms: u64,

    /// Erasure-coding cell size in bytes.
    pub ec_cell_len: u32,
}

#[allow(clippy::derivable_impls)]
impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            inline_limit: 2048,
            update_bulk_limit: 512,
            init_slots: 16,
            backoff_nzeros: 1,
            backoff_factor: 4,
            backoff_next_us: 1000,
            backoff_max_us: 4_096_000,
            starve_threshold: 8,
            rpc_timeout_ms: 5000,
            ec_cell_len: 4096,
        }
    }
}

/// Transaction status.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum TxStatus {
    /// Accepting sub-requests.
    Open,

    /// A commit attempt is in flight.
    Committing,

    /// Committed; terminal.
    Committed,

    /// Epoch or identifier conflict; must be restarted.
    Failed,

    /// Backing off before becoming `Open` again.
    Restarting,

    /// Aborted explicitly or by an unrecoverable error; terminal.
    Aborted,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

flag_set! {
    /// Transaction open flags.
    pub struct TxFlags: u32 {
        /// No write sub-requests are allowed.
        const RDONLY = 1 << 0;
        /// Attached keys and values are shared rather than copied.
        const ZERO_COPY = 1 << 1;
    }
}

/// Prepared compound request of the current commit attempt.
#[derive(Debug)]
struct Prepared {
    /// Request without per-send flags.
    cpd: CompoundRequest,

    /// Leader target to send to.
    leader: ShardTarget,

    /// Pool map version the request was classified at.
    map_version: MapVersion,

    /// Bulk registrations of the request sections.
    section_bulks: Vec<BulkHandle>,
}

/// Mutable transaction state, guarded by the handle's lock.
struct TxState {
    status: TxStatus,
    xid: DtxId,
    epoch: Epoch,
    flags: TxFlags,

    /// The epoch was supplied by the application.
    fixed_epoch: bool,

    /// Pool map version first observed, 0 if none yet.
    pm_ver: MapVersion,

    leader: Option<ShardTarget>,
    cache: SubReqCache,
    prepared: Option<Prepared>,

    /// The next commit attempt resends the prepared request.
    retry: bool,
    /// The next commit attempt carries the resend flag.
    set_resend: bool,
    /// The next commit attempt must rebuild the request against a newer
    /// pool map.
    reprepare: bool,

    /// Consecutive resends of the current commit.
    retry_cnt: u32,

    /// A commit call is driving the transaction.
    in_flight: bool,

    /// Generation of the current commit attempt.
    attempt: u64,

    /// The application closed the handle.
    closed: bool,

    backoff: BackoffSeq,

    /// Generation of the active epoch chooser, if any.
    chooser: Option<u64>,
    chooser_gen: u64,
}

impl TxState {
    /// Releases the prepared request's section bulks.
    fn release_prepared(&mut self, transport: &dyn Transport) {
        if let Some(prepared) = self.prepared.take() {
            for handle in &prepared.section_bulks {
                if let Err(e) = transport.release_bulk(handle) {
                    pf_warn!("error releasing bulk {}: {}", handle.id, e);
                }
            }
        }
    }

    /// Releases every buffered sub-request and the prepared request.
    fn release_all(&mut self, transport: &dyn Transport) {
        self.release_prepared(transport);
        let released = self.cache.release_all(transport);
        pf_trace!("tx {:?} released {} value bulks", self.xid, released);
    }

    /// Validates that new sub-requests may be attached.
    fn check_attachable(&self, is_write: bool) -> Result<(), ShardTxError> {
        if self.closed {
            return Err(ShardTxError::code(ErrCode::NoHdl, "tx closed"));
        }
        match self.status {
            TxStatus::Open => {}
            TxStatus::Aborted => {
                return Err(ShardTxError::code(
                    ErrCode::Already,
                    "tx already aborted",
                ))
            }
            status => {
                return Err(ShardTxError::code(
                    ErrCode::NoPerm,
                    format!("cannot attach in status {}", status),
                ))
            }
        }
        if is_write && self.flags.contains(TxFlags::RDONLY) {
            return Err(ShardTxError::code(
                ErrCode::NoPerm,
                "write in read-only tx",
            ));
        }
        Ok(())
    }
}

/// State shared between the application's handle and in-flight tasks.
struct TxShared {
    /// Owning container.
    cont: Arc<ContainerHandle>,

    state: Mutex<TxState>,

    /// Bumped whenever an epoch chooser finishes or the transaction ends,
    /// waking tasks waiting for the epoch.
    epoch_tx: watch::Sender<u64>,
}

/// Distributed transaction handle. Cloning yields another reference to the
/// same transaction.
#[derive(Clone)]
pub struct TxHandle(Arc<TxShared>);

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.state();
        write!(f, "TxHandle({:?} {} {:?})", st.xid, st.status, st.epoch)
    }
}

impl TxHandle {
    /// Opens a transaction on a container. Epoch 0 lets the epoch be chosen
    /// in flight; a nonzero epoch opens a read-only transaction at that
    /// fixed epoch.
    pub fn open(
        cont: &Arc<ContainerHandle>,
        epoch: u64,
        flags: TxFlags,
    ) -> Result<Self, ShardTxError> {
        if !cont.is_valid() {
            return logged_err!(ErrCode::NoHdl; "container handle invalid");
        }

        let mut flags = flags;
        let fixed_epoch = epoch != 0;
        let epoch = if fixed_epoch {
            flags.insert(TxFlags::RDONLY);
            Epoch::fixed(epoch)
        } else {
            Epoch::unchosen()
        };

        let config = cont.config();
        let state = TxState {
            status: TxStatus::Open,
            xid: DtxId::generate(),
            epoch,
            flags,
            fixed_epoch,
            pm_ver: 0,
            leader: None,
            cache: SubReqCache::new(
                config.init_slots,
                flags.contains(TxFlags::RDONLY),
            ),
            prepared: None,
            retry: false,
            set_resend: false,
            reprepare: false,
            retry_cnt: 0,
            in_flight: false,
            attempt: 0,
            closed: false,
            backoff: BackoffSeq::new(
                config.backoff_nzeros,
                config.backoff_factor,
                config.backoff_next_us,
                config.backoff_max_us,
            )?,
            chooser: None,
            chooser_gen: 0,
        };
        pf_debug!(
            "opened tx {:?} epoch {} flags {:?}",
            state.xid,
            state.epoch.value,
            flags
        );

        let (epoch_tx, _) = watch::channel(0);
        Ok(TxHandle(Arc::new(TxShared {
            cont: cont.clone(),
            state: Mutex::new(state),
            epoch_tx,
        })))
    }

    /// Opens a read-only transaction at a fixed snapshot epoch.
    pub fn open_snapshot(
        cont: &Arc<ContainerHandle>,
        epoch: u64,
    ) -> Result<Self, ShardTxError> {
        if epoch == 0 {
            return logged_err!(ErrCode::Inval; "snapshot epoch must be nonzero");
        }
        Self::open(cont, epoch, TxFlags::RDONLY)
    }

    /// Locks the transaction state.
    fn state(&self) -> MutexGuard<'_, TxState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes every task waiting on the epoch chooser.
    fn notify_epoch_waiters(&self, st: &mut TxState) {
        st.chooser_gen += 1;
        self.0.epoch_tx.send_replace(st.chooser_gen);
    }

    #[inline]
    fn transport(&self) -> &Arc<dyn Transport> {
        self.0.cont.pool().transport()
    }

    /// Aborts the transaction, releasing every buffered sub-request. An
    /// in-flight commit attempt discards its outcome.
    pub fn abort(&self) -> Result<(), ShardTxError> {
        let mut st = self.state();
        if st.closed {
            return logged_err!(ErrCode::NoHdl; "abort on closed tx");
        }
        match st.status {
            TxStatus::Aborted => {
                return Err(ShardTxError::code(
                    ErrCode::Already,
                    "tx already aborted",
                ))
            }
            TxStatus::Committed => {
                return Err(ShardTxError::code(
                    ErrCode::NoPerm,
                    "tx already committed",
                ))
            }
            _ => {}
        }

        st.status = TxStatus::Aborted;
        st.release_all(self.transport().as_ref());
        self.notify_epoch_waiters(&mut st);
        pf_debug!("aborted tx {:?}", st.xid);
        Ok(())
    }

    /// Closes the handle, releasing every buffered sub-request. An in-flight
    /// commit attempt discards its outcome.
    pub fn close(&self) -> Result<(), ShardTxError> {
        let mut st = self.state();
        if st.closed {
            return logged_err!(ErrCode::NoHdl; "tx already closed");
        }
        st.closed = true;
        if st.status == TxStatus::Committing {
            pf_debug!("closing tx {:?} while committing", st.xid);
        }
        st.release_all(self.transport().as_ref());
        self.notify_epoch_waiters(&mut st);
        Ok(())
    }

    /// Restarts a failed transaction: backs off, then reopens it with an
    /// unchosen epoch and pool map version. Buffered sub-requests are kept
    /// and replayed by the next commit.
    pub async fn restart(&self) -> Result<(), ShardTxError> {
        let delay = {
            let mut st = self.state();
            if st.closed {
                return logged_err!(ErrCode::NoHdl; "restart on closed tx");
            }
            match st.status {
                TxStatus::Failed => {}
                TxStatus::Restarting => {
                    return Err(ShardTxError::code(
                        ErrCode::InProgress,
                        "tx already restarting",
                    ))
                }
                status => {
                    return logged_err!(ErrCode::NoPerm;
                                       "cannot restart tx in status {}", status);
                }
            }
            st.status = TxStatus::Restarting;
            st.backoff.next_delay()
        };

        if !delay.is_zero() {
            pf_trace!("restart backing off {:?}", delay);
            time::sleep(delay).await;
        }

        let mut st = self.state();
        if st.closed {
            return Err(ShardTxError::code(ErrCode::NoHdl, "tx closed"));
        }
        if st.status != TxStatus::Restarting {
            return Err(ShardTxError::code(
                ErrCode::Canceled,
                format!("restart interrupted in status {}", st.status),
            ));
        }

        st.release_prepared(self.transport().as_ref());
        if !st.fixed_epoch {
            st.epoch = Epoch {
                first: st.epoch.first,
                ..Epoch::unchosen()
            };
        }
        st.pm_ver = 0;
        st.leader = None;
        st.retry = false;
        st.set_resend = false;
        st.reprepare = false;
        st.retry_cnt = 0;
        st.chooser = None;
        st.status = TxStatus::Open;
        self.notify_epoch_waiters(&mut st);
        pf_debug!(
            "restarted tx {:?} with {} reads {} writes",
            st.xid,
            st.cache.read_count(),
            st.cache.write_count()
        );
        Ok(())
    }

    /// Current status.
    pub fn status(&self) -> TxStatus {
        self.state().status
    }

    /// Chosen epoch value.
    pub fn epoch(&self) -> Result<u64, ShardTxError> {
        let st = self.state();
        if st.epoch.is_chosen() {
            Ok(st.epoch.value)
        } else {
            Err(ShardTxError::code(ErrCode::Uninit, "epoch not chosen yet"))
        }
    }

    /// Full epoch record.
    pub fn epoch_record(&self) -> Epoch {
        self.state().epoch
    }

    /// Transaction identifier.
    pub fn dtx_id(&self) -> DtxId {
        self.state().xid
    }

    /// Leader target elected by the last prepared commit attempt.
    pub fn leader(&self) -> Option<ShardTarget> {
        self.state().leader
    }

    /// Number of buffered read sub-requests.
    pub fn read_count(&self) -> u32 {
        self.state().cache.read_count()
    }

    /// Number of buffered write sub-requests.
    pub fn write_count(&self) -> u32 {
        self.state().cache.write_count()
    }

    /// Consecutive resends of the current commit.
    pub fn retry_count(&self) -> u32 {
        self.state().retry_cnt
    }

    /// Pool map version the transaction is bound to, 0 if none yet.
    pub fn map_version(&self) -> MapVersion {
        self.state().pm_ver
    }

    /// Open flags.
    pub fn flags(&self) -> TxFlags {
        self.state().flags
    }
}

#[cfg(test)]
mod txn_tests {
    use super::*;
    use crate::sim::SimCluster;
    use crate::wire::ObjectId;
    use bytes::Bytes;

    pub(super) fn setup(
        config_str: Option<&str>,
    ) -> Result<(Arc<SimCluster>, Arc<ContainerHandle>), ShardTxError> {
        let sim = SimCluster::new(1, 8);
        let cont = ContainerHandle::new(sim.pool_handle(), 1, config_str)?;
        Ok((sim, cont))
    }

    #[test]
    fn open_flags() -> Result<(), ShardTxError> {
        let (_, cont) = setup(None)?;
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        assert_eq!(tx.status(), TxStatus::Open);
        assert_eq!(tx.epoch().unwrap_err().errcode(), ErrCode::Uninit);
        assert!(tx.epoch_record().uncertain);

        let snap = TxHandle::open(&cont, 42, TxFlags::empty())?;
        assert!(snap.flags().contains(TxFlags::RDONLY));
        assert_eq!(snap.epoch()?, 42);
        assert!(TxHandle::open_snapshot(&cont, 0).is_err());

        cont.close();
        let err = TxHandle::open(&cont, 0, TxFlags::empty()).unwrap_err();
        assert_eq!(err.errcode(), ErrCode::NoHdl);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_and_close() -> Result<(), ShardTxError> {
        let (sim, cont) = setup(None)?;
        let oid = ObjectId::new(0, 1);
        sim.add_replicated(oid, 3, 1)?;

        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        tx.attach(TxOp::Update {
            oid,
            dkey: Bytes::from_static(b"d"),
            iods: vec![(Bytes::from_static(b"a"), Bytes::from_static(b"v"))],
            cond: CondFlags::empty(),
        })
        .await?;
        tx.abort()?;
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert_eq!(tx.write_count(), 0);
        assert_eq!(tx.abort().unwrap_err().errcode(), ErrCode::Already);
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.errcode(), ErrCode::NoPerm);

        tx.close()?;
        assert_eq!(tx.close().unwrap_err().errcode(), ErrCode::NoHdl);
        assert_eq!(tx.abort().unwrap_err().errcode(), ErrCode::NoHdl);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_only_when_failed() -> Result<(), ShardTxError> {
        let (_, cont) = setup(None)?;
        let tx = TxHandle::open(&cont, 0, TxFlags::empty())?;
        assert_eq!(tx.restart().await.unwrap_err().errcode(), ErrCode::NoPerm);
        tx.state().status = TxStatus::Failed;
        tx.restart().await?;
        assert_eq!(tx.status(), TxStatus::Open);
        Ok(())
    }
}
