//! On-the-wire types exchanged with storage targets: identifiers, epochs,
//! the compound (CPD) commit request and its sections, and the RPC envelope.

mod cpd;
mod rpc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use get_size::GetSize;

use rand::RngCore;

use serde::{Deserialize, Serialize};

pub use cpd::{
    BulkHandle, CompoundRequest, CpdFlags, CpdReply, DispatchEntry,
    EcLayout, EcShardTgt, HeadFlags, IoDesc, MbsFlags, Membership,
    RedundancyGroup, ReqIndex, Section, SubOpc, SubReqBody,
    TargetDescriptor, TransactionHead, UpdateValues, WireSubReq,
};
pub use rpc::{
    Endpoint, FetchReply, FetchRequest, RpcBody, RpcOpcode, RpcReply,
    RpcRequest,
};

/// Pool map version type.
pub type MapVersion = u32;

/// Storage target ID type.
pub type TargetId = u32;

/// Storage server rank type.
pub type Rank = u32;

/// Object identifier.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    /// Creates an object ID.
    pub fn new(hi: u64, lo: u64) -> Self {
        ObjectId { hi, lo }
    }
}

/// Object ID plus shard index, naming one shard of an object.
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
pub struct UnitObjectId {
    pub oid: ObjectId,
    pub shard: u32,
}

/// Placement of one object shard: the hosting target and its endpoint.
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
pub struct ShardTarget {
    /// Rank of the server hosting the target.
    pub rank: Rank,

    /// Pool-wide target ID.
    pub tgt_id: TargetId,

    /// Context tag within the server.
    pub tag: u32,
}

impl ShardTarget {
    /// RPC endpoint of this target.
    #[inline]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            rank: self.rank,
            tag: self.tag,
        }
    }
}

/// Distributed transaction identifier: random bytes plus a hybrid-logical
/// clock timestamp.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Default, Serialize, Deserialize,
)]
pub struct DtxId {
    pub uuid: [u8; 16],
    pub hlc: u64,
}

impl GetSize for DtxId {}

static LAST_HLC: AtomicU64 = AtomicU64::new(0);

impl DtxId {
    /// Generates a fresh identifier. Timestamps are strictly increasing
    /// within the process.
    pub fn generate() -> Self {
        let mut uuid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid);
        DtxId {
            uuid,
            hlc: hlc_now(),
        }
    }
}

/// Returns a strictly increasing nanosecond timestamp.
fn hlc_now() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let mut last = LAST_HLC.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_HLC.compare_exchange_weak(
            last,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(cur) => last = cur,
        }
    }
}

/// Epoch record of a transaction.
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
pub struct Epoch {
    /// Chosen epoch value, 0 if not chosen yet.
    pub value: u64,

    /// First epoch value ever chosen for this transaction.
    pub first: u64,

    /// Is the value chosen by a server without a global ordering guarantee?
    pub uncertain: bool,
}

impl Epoch {
    /// An epoch to be chosen in flight by the first server touched.
    pub fn unchosen() -> Self {
        Epoch {
            value: 0,
            first: 0,
            uncertain: true,
        }
    }

    /// A fixed epoch supplied by the application.
    pub fn fixed(value: u64) -> Self {
        Epoch {
            value,
            first: value,
            uncertain: false,
        }
    }

    /// Has a value been chosen?
    #[inline]
    pub fn is_chosen(&self) -> bool {
        self.value != 0
    }
}

/// Hashes a distribution key with 64-bit FNV-1a. Every client must hash
/// identically for placement to agree.
pub fn dkey_hash(dkey: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    dkey.iter().fold(FNV_OFFSET, |h, b| {
        (h ^ (*b as u64)).wrapping_mul(FNV_PRIME)
    })
}
