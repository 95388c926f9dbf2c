//! In-process simulated cluster: placement, a versioned pool map, a bulk
//! registry, and leader-side compound request execution over a key-value
//! store, with scripted fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::placement::{ObjAttrs, ObjClass, Placement, PlacementMap};
use crate::pool::{PoolHandle, PoolMap};
use crate::transport::{BulkRegistry, BulkStats, Transport};
use crate::txn::ec_extract;
use crate::utils::{ErrCode, ShardTxError};
use crate::wire::{
    BulkHandle, CompoundRequest, CpdFlags, CpdReply, DispatchEntry, Endpoint,
    FetchReply, FetchRequest, MapVersion, ObjectId, RpcBody, RpcReply,
    RpcRequest, ShardTarget, SubReqBody, TargetId, TransactionHead,
    UpdateValues, WireSubReq,
};

use async_trait::async_trait;

use bytes::Bytes;

use rand::Rng;

use tokio::time;

/// Number of targets hosted by one simulated server rank.
const TGTS_PER_RANK: u32 = 4;

/// Scripted outcome of the next compound request.
#[derive(Debug, Clone)]
pub enum SimFault {
    /// Reply with the given status.
    Reply(ErrCode),

    /// Reply with the given status and pool map version.
    ReplyWithVersion(ErrCode, MapVersion),

    /// Fail the send with the given transport error.
    TransportErr(ErrCode),

    /// Hold the reply for a while, then process normally.
    Delay(Duration),
}

/// A compound request as received by the simulated leader.
#[derive(Debug, Clone)]
pub struct SentCpd {
    pub endpoint: Endpoint,
    pub flags: CpdFlags,
    pub map_version: MapVersion,
    pub head: TransactionHead,
    pub sub_reqs: Vec<WireSubReq>,
    pub disp: Vec<DispatchEntry>,
    pub tgts: Vec<ShardTarget>,

    /// Was the head section sent via bulk transfer?
    pub head_bulk: bool,

    /// Number of bulk handles referenced.
    pub bulk_cnt: usize,

    /// Status replied.
    pub reply: ErrCode,

    /// Epoch replied.
    pub reply_epoch: u64,
}

/// Map from (object, dkey) -> map from akey -> value.
type KvStore = HashMap<(ObjectId, Bytes), HashMap<Bytes, Bytes>>;

/// Mutable cluster state.
struct SimState {
    /// Placement at the cluster's current pool map version.
    truth: PlacementMap,

    /// Placement as last refreshed by the client.
    view: Arc<PlacementMap>,

    script: VecDeque<SimFault>,
    sent: Vec<SentCpd>,
    fetches: Vec<FetchRequest>,
    kv: KvStore,

    /// Last epoch handed out.
    clock: u64,

    /// Probability of replying `Busy` to an unscripted request.
    fault_rate: f64,

    refreshes: u32,
}

/// In-process simulated cluster.
pub struct SimCluster {
    pool_id: u64,
    num_targets: u32,
    state: Mutex<SimState>,
    bulks: BulkRegistry,
}

impl SimCluster {
    /// Creates a cluster of `num_targets` targets at pool map version 1.
    pub fn new(pool_id: u64, num_targets: u32) -> Arc<Self> {
        let truth = PlacementMap::new(1);
        Arc::new(SimCluster {
            pool_id,
            num_targets,
            state: Mutex::new(SimState {
                view: Arc::new(truth.clone()),
                truth,
                script: VecDeque::new(),
                sent: vec![],
                fetches: vec![],
                kv: HashMap::new(),
                clock: 0,
                fault_rate: 0.0,
                refreshes: 0,
            }),
            bulks: BulkRegistry::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pool handle backed by this cluster.
    pub fn pool_handle(self: &Arc<Self>) -> Arc<PoolHandle> {
        PoolHandle::new(self.pool_id, self.clone(), self.clone(), self.clone())
    }

    fn target(&self, tgt_id: TargetId) -> ShardTarget {
        ShardTarget {
            rank: tgt_id / TGTS_PER_RANK,
            tgt_id,
            tag: tgt_id % TGTS_PER_RANK,
        }
    }

    /// Registers an object at the current version, in both the cluster's
    /// and the client's placement. Shards are laid out round-robin over the
    /// targets starting from an offset derived from the object ID.
    pub fn add_object(
        &self,
        oid: ObjectId,
        class: ObjClass,
        grp_nr: u32,
    ) -> Result<(), ShardTxError> {
        if class.grp_size() > self.num_targets {
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!(
                    "group of {} exceeds {} targets",
                    class.grp_size(),
                    self.num_targets
                ),
            ));
        }
        let attrs = ObjAttrs { class, grp_nr };
        let start = (oid.hi.wrapping_add(oid.lo) % self.num_targets as u64) as u32;
        let shards = (0..attrs.shard_nr())
            .map(|i| self.target((start + i) % self.num_targets))
            .collect::<Vec<_>>();

        let mut st = self.state();
        st.truth.insert(oid, attrs, shards.clone())?;
        let mut view = (*st.view).clone();
        view.insert(oid, attrs, shards)?;
        st.view = Arc::new(view);
        Ok(())
    }

    /// Registers a replicated object.
    pub fn add_replicated(
        &self,
        oid: ObjectId,
        replicas: u16,
        grp_nr: u32,
    ) -> Result<(), ShardTxError> {
        self.add_object(oid, ObjClass::Replicated { replicas }, grp_nr)
    }

    /// Registers an erasure-coded object.
    pub fn add_ec(
        &self,
        oid: ObjectId,
        data: u16,
        parity: u16,
        grp_nr: u32,
    ) -> Result<(), ShardTxError> {
        self.add_object(oid, ObjClass::ErasureCoded { data, parity }, grp_nr)
    }

    /// Advances the cluster's pool map version, marking the given object
    /// shards lost. The client sees it only after a refresh.
    pub fn bump_version(&self, lost: &[(ObjectId, u32)]) -> MapVersion {
        let mut st = self.state();
        st.truth = st.truth.next_version(lost);
        pf_debug!("sim pool map bumped to {}", st.truth.version());
        st.truth.version()
    }

    /// Refreshes the client's view synchronously.
    pub fn refresh_now(&self) -> MapVersion {
        let mut st = self.state();
        st.view = Arc::new(st.truth.clone());
        st.refreshes += 1;
        st.view.version()
    }

    /// Target of an object shard in the cluster's current placement.
    pub fn shard_target(&self, oid: ObjectId, shard_idx: u32) -> Option<ShardTarget> {
        self.state()
            .truth
            .shards_of(&oid)
            .and_then(|shards| shards.get(shard_idx as usize).copied().flatten())
    }

    /// Queues the outcome of the next unscripted compound request.
    pub fn script(&self, fault: SimFault) {
        self.state().script.push_back(fault);
    }

    /// Sets the probability of random `Busy` replies.
    pub fn set_fault_rate(&self, rate: f64) {
        self.state().fault_rate = rate.clamp(0.0, 1.0);
    }

    /// Compound requests received so far.
    pub fn sent_cpds(&self) -> Vec<SentCpd> {
        self.state().sent.clone()
    }

    /// Number of compound requests received so far.
    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }

    /// Number of conditional fetches received so far.
    pub fn fetches_sent(&self) -> usize {
        self.state().fetches.len()
    }

    /// Number of client pool map refreshes.
    pub fn refresh_count(&self) -> u32 {
        self.state().refreshes
    }

    /// Bulk registry accounting.
    pub fn bulk_stats(&self) -> BulkStats {
        self.bulks.stats()
    }

    /// Stores a value directly, bypassing transactions.
    pub fn put_value(&self, oid: ObjectId, dkey: Bytes, akey: Bytes, value: Bytes) {
        self.state()
            .kv
            .entry((oid, dkey))
            .or_default()
            .insert(akey, value);
    }

    /// Committed value of a key.
    pub fn get_value(&self, oid: ObjectId, dkey: &Bytes, akey: &Bytes) -> Option<Bytes> {
        self.state()
            .kv
            .get(&(oid, dkey.clone()))
            .and_then(|akeys| akeys.get(akey).cloned())
    }

    /// Decodes the sections of a compound request.
    fn decode_cpd(
        &self,
        endpoint: Endpoint,
        cpd: &CompoundRequest,
    ) -> Result<SentCpd, ShardTxError> {
        let fetch = |h: &BulkHandle| self.bulks.lookup(h);
        Ok(SentCpd {
            endpoint,
            flags: cpd.flags,
            map_version: cpd.map_version,
            head: cpd.head.decode(fetch)?,
            sub_reqs: cpd.sub_reqs.decode(fetch)?,
            disp: cpd.disp.decode(fetch)?,
            tgts: cpd.tgts.decode(fetch)?,
            head_bulk: cpd.head.is_bulk(),
            bulk_cnt: cpd.bulks.len(),
            reply: ErrCode::Success,
            reply_epoch: 0,
        })
    }

    /// Applies the writes of a committed request to the store.
    fn apply_writes(&self, kv: &mut KvStore, reqs: &[WireSubReq]) -> Result<(), ShardTxError> {
        for req in reqs {
            let key = (req.oid, req.dkey.clone());
            match &req.body {
                SubReqBody::Update { iods, values, ec } => {
                    let payloads = match values {
                        UpdateValues::Inline(values) => values.clone(),
                        UpdateValues::Bulk(handles) => handles
                            .iter()
                            .map(|h| self.bulks.lookup(h))
                            .collect::<Result<Vec<_>, _>>()?,
                    };
                    let akeys = kv.entry(key).or_default();
                    for (iod, payload) in iods.iter().zip(payloads) {
                        let value = match ec {
                            Some(ec) => {
                                let shards: Vec<u16> =
                                    ec.tgts.iter().map(|t| t.shard).collect();
                                ec_extract(&payload, iod.size, iod.ec_cell, ec.data, &shards)?
                            }
                            None => payload,
                        };
                        akeys.insert(iod.akey.clone(), value);
                    }
                }
                SubReqBody::PunchObj => kv.retain(|(oid, _), _| *oid != req.oid),
                SubReqBody::PunchDkey => {
                    kv.remove(&key);
                }
                SubReqBody::PunchAkeys { akeys } => {
                    if let Some(stored) = kv.get_mut(&key) {
                        for akey in akeys {
                            stored.remove(akey);
                        }
                    }
                }
                SubReqBody::Read { .. } => {}
            }
        }
        Ok(())
    }

    async fn handle_cpd(
        &self,
        endpoint: Endpoint,
        cpd: CompoundRequest,
    ) -> Result<CpdReply, ShardTxError> {
        // sections are pulled on arrival, before any processing delay
        let mut record = self.decode_cpd(endpoint, &cpd)?;

        let mut fault = self.state().script.pop_front();
        if let Some(SimFault::Delay(delay)) = fault {
            time::sleep(delay).await;
            fault = None;
        }

        let mut st = self.state();
        let truth_ver = st.truth.version();
        let (status, reply_ver) = match fault {
            Some(SimFault::Reply(code)) => (code, truth_ver),
            Some(SimFault::ReplyWithVersion(code, ver)) => (code, ver),
            Some(SimFault::TransportErr(code)) => {
                record.reply = code;
                st.sent.push(record);
                return Err(ShardTxError::code(code, "injected transport error"));
            }
            _ if cpd.map_version < truth_ver => (ErrCode::Stale, truth_ver),
            _ if st.fault_rate > 0.0 && rand::thread_rng().gen_bool(st.fault_rate) => {
                (ErrCode::Busy, truth_ver)
            }
            _ => (ErrCode::Success, truth_ver),
        };

        st.clock += 1;
        let epoch = if record.head.epoch.is_chosen() {
            record.head.epoch.value
        } else {
            st.clock
        };
        if status == ErrCode::Success {
            self.apply_writes(&mut st.kv, &record.sub_reqs)?;
        }

        record.reply = status;
        record.reply_epoch = epoch;
        let sub_rets = vec![status; record.sub_reqs.len()];
        st.sent.push(record);
        Ok(CpdReply {
            status,
            sub_rets,
            epoch,
            map_version: reply_ver,
        })
    }

    fn handle_fetch(&self, req: FetchRequest) -> FetchReply {
        let mut st = self.state();
        let truth_ver = st.truth.version();
        st.clock += 1;
        let epoch = if req.epoch.is_chosen() {
            req.epoch.value
        } else {
            st.clock
        };

        let status = if req.map_version < truth_ver {
            ErrCode::Stale
        } else {
            match st.kv.get(&(req.oid.oid, req.dkey.clone())) {
                Some(akeys) if req.akeys.is_empty() && !akeys.is_empty() => ErrCode::Success,
                Some(akeys)
                    if !req.akeys.is_empty() && req.akeys.iter().all(|a| akeys.contains_key(a)) =>
                {
                    ErrCode::Success
                }
                _ => ErrCode::NonExist,
            }
        };
        st.fetches.push(req);
        FetchReply {
            status,
            epoch,
            map_version: truth_ver,
        }
    }
}

#[async_trait]
impl Transport for SimCluster {
    async fn send(&self, req: RpcRequest) -> Result<RpcReply, ShardTxError> {
        match req.body {
            RpcBody::Cpd(cpd) => Ok(RpcReply::Cpd(self.handle_cpd(req.endpoint, cpd).await?)),
            RpcBody::Fetch(fetch) => Ok(RpcReply::Fetch(self.handle_fetch(fetch))),
        }
    }

    fn register_bulk(&self, data: Bytes) -> Result<BulkHandle, ShardTxError> {
        self.bulks.register(data)
    }

    fn release_bulk(&self, handle: &BulkHandle) -> Result<(), ShardTxError> {
        self.bulks.release(handle)
    }
}

#[async_trait]
impl PoolMap for SimCluster {
    fn current_version(&self) -> MapVersion {
        self.state().view.version()
    }

    async fn refresh(&self, min_version: MapVersion) -> Result<MapVersion, ShardTxError> {
        let version = self.refresh_now();
        if version < min_version {
            pf_warn!("sim pool map {} behind requested {}", version, min_version);
        }
        Ok(version)
    }
}

impl Placement for SimCluster {
    fn object_attrs(&self, oid: &ObjectId) -> Result<ObjAttrs, ShardTxError> {
        let view = self.state().view.clone();
        view.object_attrs(oid)
    }

    fn resolve_group(
        &self,
        oid: &ObjectId,
        dkey_hash: u64,
        map_ver: MapVersion,
    ) -> Result<u32, ShardTxError> {
        let view = self.state().view.clone();
        view.resolve_group(oid, dkey_hash, map_ver)
    }

    fn open_shard(
        &self,
        oid: &ObjectId,
        shard_idx: u32,
        map_ver: MapVersion,
    ) -> Result<ShardTarget, ShardTxError> {
        let view = self.state().view.clone();
        view.open_shard(oid, shard_idx, map_ver)
    }
}
