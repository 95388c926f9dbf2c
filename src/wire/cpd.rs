//! Compound (CPD) commit request layout.

use crate::utils::{ErrCode, ShardTxError};
use crate::wire::{
    DtxId, Epoch, MapVersion, ObjectId, ShardTarget, TargetId, UnitObjectId,
};

use bytes::Bytes;

use get_size::GetSize;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Handle of a buffer registered for out-of-band bulk transfer.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct BulkHandle {
    /// Registry-assigned ID.
    pub id: u64,

    /// Length of the registered buffer in bytes.
    pub len: u64,
}

/// One serialized section of a compound request, either embedded in the
/// request or registered for bulk transfer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Section {
    Inline(Bytes),
    Bulk(BulkHandle),
}

impl Section {
    /// Is this section transferred out-of-band?
    #[inline]
    pub fn is_bulk(&self) -> bool {
        matches!(self, Section::Bulk(_))
    }

    /// Byte length of the serialized section content.
    pub fn len(&self) -> usize {
        match self {
            Section::Inline(data) => data.len(),
            Section::Bulk(handle) => handle.len as usize,
        }
    }

    /// Is the serialized content empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the section content, resolving bulk handles through `fetch`.
    pub fn decode<T, F>(&self, fetch: F) -> Result<T, ShardTxError>
    where
        T: DeserializeOwned,
        F: FnOnce(&BulkHandle) -> Result<Bytes, ShardTxError>,
    {
        let data = match self {
            Section::Inline(data) => data.clone(),
            Section::Bulk(handle) => fetch(handle)?,
        };
        Ok(rmp_serde::decode::from_slice(&data)?)
    }
}

/// Kind of a buffered sub-request.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum SubOpc {
    Update,
    PunchObj,
    PunchDkey,
    PunchAkeys,
    Read,
}

impl GetSize for SubOpc {}

impl SubOpc {
    /// Does the sub-request modify data?
    #[inline]
    pub fn is_write(&self) -> bool {
        !matches!(self, SubOpc::Read)
    }
}

/// Value descriptor of one akey in an update.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct IoDesc {
    /// Attribute key.
    pub akey: Bytes,

    /// Original value size in bytes.
    pub size: u64,

    /// Erasure-coding cell size the value was split into, 0 if replicated.
    pub ec_cell: u32,
}

impl GetSize for IoDesc {
    fn get_heap_size(&self) -> usize {
        self.akey.len()
    }
}

/// A (shard, target) pair touched by an erasure-coded update.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct EcShardTgt {
    /// Shard index within the redundancy group.
    pub shard: u16,

    /// Target hosting the shard.
    pub tgt_id: TargetId,
}

/// Layout of an erasure-coded update: the value of every akey is carried
/// as the concatenation of the cells of the touched shards, in ascending
/// shard order.
#[derive(
    Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize, GetSize,
)]
pub struct EcLayout {
    /// Number of data cells of a stripe.
    pub data: u16,

    /// Number of parity cells of a stripe.
    pub parity: u16,

    /// Touched shards.
    pub tgts: Vec<EcShardTgt>,
}

/// Value payload of an update.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum UpdateValues {
    /// Values embedded, one per akey.
    Inline(Vec<Bytes>),

    /// Values registered for bulk transfer, one per akey.
    Bulk(Vec<BulkHandle>),
}

impl GetSize for UpdateValues {
    fn get_heap_size(&self) -> usize {
        match self {
            UpdateValues::Inline(values) => values
                .iter()
                .map(|v| v.len() + std::mem::size_of::<Bytes>())
                .sum(),
            UpdateValues::Bulk(handles) => handles.get_heap_size(),
        }
    }
}

/// Opcode-specific body of a sub-request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum SubReqBody {
    Update {
        iods: Vec<IoDesc>,
        values: UpdateValues,
        ec: Option<EcLayout>,
    },
    PunchObj,
    PunchDkey,
    PunchAkeys {
        akeys: Vec<Bytes>,
    },
    Read {
        akeys: Vec<Bytes>,
    },
}

impl GetSize for SubReqBody {
    fn get_heap_size(&self) -> usize {
        match self {
            SubReqBody::Update { iods, values, ec } => {
                iods.get_heap_size()
                    + values.get_heap_size()
                    + ec.get_heap_size()
            }
            SubReqBody::PunchObj | SubReqBody::PunchDkey => 0,
            SubReqBody::PunchAkeys { akeys } | SubReqBody::Read { akeys } => {
                akeys
                    .iter()
                    .map(|k| k.len() + std::mem::size_of::<Bytes>())
                    .sum()
            }
        }
    }
}

/// One sub-request of a compound request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct WireSubReq {
    /// Target object.
    pub oid: ObjectId,

    /// Distribution key, empty for object-level reads.
    pub dkey: Bytes,

    /// Hash of the distribution key used for group selection.
    pub dkey_hash: u64,

    /// Conditional-operation flags from the application.
    pub api_flags: u32,

    /// Opcode-specific body.
    pub body: SubReqBody,
}

impl WireSubReq {
    /// Opcode of the sub-request.
    pub fn opc(&self) -> SubOpc {
        match self.body {
            SubReqBody::Update { .. } => SubOpc::Update,
            SubReqBody::PunchObj => SubOpc::PunchObj,
            SubReqBody::PunchDkey => SubOpc::PunchDkey,
            SubReqBody::PunchAkeys { .. } => SubOpc::PunchAkeys,
            SubReqBody::Read { .. } => SubOpc::Read,
        }
    }
}

impl GetSize for WireSubReq {
    fn get_heap_size(&self) -> usize {
        self.dkey.len() + self.body.get_heap_size()
    }
}

/// Member of the transaction's target array.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct TargetDescriptor {
    pub id: TargetId,

    /// The target only serves reads for this transaction.
    pub rdonly: bool,
}

/// Set of targets that together hold one replica set or EC stripe.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct RedundancyGroup {
    /// Member targets in visiting order.
    pub ids: Vec<TargetId>,

    /// Minimum number of members needed to guarantee durability.
    pub redundancy: u32,

    /// Only read sub-requests touched this group.
    pub rdonly: bool,
}

flag_set! {
    /// Membership flags.
    pub struct MbsFlags: u32 {
        /// The target array contains the leader as its first entry.
        const CONTAIN_LEADER = 1 << 0;
        /// All touched targets form a single redundancy group, so the
        /// group list is omitted.
        const SINGLE_RDG = 1 << 1;
    }
}

/// Transaction membership, built once per commit attempt.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Membership {
    pub leader: TargetId,
    pub flags: MbsFlags,
    pub tgt_cnt: u32,
    pub grp_cnt: u32,
    pub tgts: Vec<TargetDescriptor>,

    /// Reduced redundancy groups, empty if `SINGLE_RDG` is set.
    pub groups: Vec<RedundancyGroup>,
}

/// Reference from a dispatch entry into the sub-request array.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ReqIndex {
    /// Object shard index the sub-request is executed on.
    pub shard_idx: u32,

    /// Position in the sub-request array.
    pub req_idx: u32,
}

/// Per-target dispatch list.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct DispatchEntry {
    pub tgt: ShardTarget,
    pub read_cnt: u32,
    pub write_cnt: u32,
    pub reqs: Vec<ReqIndex>,
}

flag_set! {
    /// Transaction head flags.
    pub struct HeadFlags: u32 {
        /// The epoch was chosen without a global ordering guarantee.
        const EPOCH_UNCERTAIN = 1 << 0;
    }
}

/// Head section of a compound request.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct TransactionHead {
    pub xid: DtxId,

    /// An object shard hosted on the leader target.
    pub leader_oid: UnitObjectId,

    pub epoch: Epoch,
    pub flags: HeadFlags,
    pub membership: Membership,
}

flag_set! {
    /// Compound request flags.
    pub struct CpdFlags: u32 {
        /// Sent to the elected leader.
        const LEADER = 1 << 0;
        /// A resend of a request that may have been seen before.
        const RESEND = 1 << 1;
        /// Contains no write sub-requests.
        const READONLY = 1 << 2;
        /// The transaction has been resent many times in a row.
        const MAYBE_STARVING = 1 << 3;
    }
}

/// Compound commit request sent to the leader target.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CompoundRequest {
    pub pool_id: u64,
    pub co_hdl: u64,
    pub co_id: u64,
    pub map_version: MapVersion,
    pub flags: CpdFlags,

    /// Serialized `TransactionHead`.
    pub head: Section,

    /// Serialized `Vec<WireSubReq>`, reads first then writes.
    pub sub_reqs: Section,

    /// Serialized `Vec<DispatchEntry>`, leader first.
    pub disp: Section,

    /// Serialized `Vec<ShardTarget>`, same order as `disp`.
    pub tgts: Section,

    /// Every bulk handle referenced by the request, sections and update
    /// values alike.
    pub bulks: Vec<BulkHandle>,
}

/// Reply to a compound commit request.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct CpdReply {
    /// Overall status.
    pub status: ErrCode,

    /// Per-sub-request status.
    pub sub_rets: Vec<ErrCode>,

    /// Committed epoch on success.
    pub epoch: u64,

    /// Pool map version known by the replying server.
    pub map_version: MapVersion,
}

#[cfg(test)]
mod cpd_tests {
    use super::*;

    #[test]
    fn section_decode_inline() -> Result<(), ShardTxError> {
        let data = rmp_serde::encode::to_vec(&vec![1u32, 2, 3])?;
        let sec = Section::Inline(Bytes::from(data));
        let v: Vec<u32> = sec.decode(|_| {
            Err(ShardTxError::code(ErrCode::Proto, "unexpected bulk"))
        })?;
        assert_eq!(v, vec![1, 2, 3]);
        assert!(!sec.is_bulk());
        Ok(())
    }

    #[test]
    fn section_decode_bulk() -> Result<(), ShardTxError> {
        let data = Bytes::from(rmp_serde::encode::to_vec("hello")?);
        let sec = Section::Bulk(BulkHandle {
            id: 3,
            len: data.len() as u64,
        });
        let s: String = sec.decode(|h| {
            assert_eq!(h.id, 3);
            Ok(data.clone())
        })?;
        assert_eq!(s, "hello");
        assert_eq!(sec.len(), data.len());
        Ok(())
    }

    #[test]
    fn sub_req_opc() {
        let req = WireSubReq {
            oid: ObjectId::new(1, 2),
            dkey: Bytes::from_static(b"d"),
            dkey_hash: 0,
            api_flags: 0,
            body: SubReqBody::Read { akeys: vec![] },
        };
        assert_eq!(req.opc(), SubOpc::Read);
        assert!(!req.opc().is_write());
        assert!(SubOpc::PunchAkeys.is_write());
        assert!(req.get_size() >= 1);
    }
}
