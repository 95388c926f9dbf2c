//! RPC envelope and the conditional-check fetch messages.

use crate::utils::ErrCode;
use crate::wire::{
    BulkHandle, CompoundRequest, CpdReply, Epoch, HeadFlags, MapVersion,
    Rank, UnitObjectId,
};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Address of a server-side execution context.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct Endpoint {
    pub rank: Rank,
    pub tag: u32,
}

/// RPC opcodes issued by the coordinator.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum RpcOpcode {
    /// Compound transaction commit.
    TxCommit,

    /// Key fetch, used for conditional-operation existence checks.
    Fetch,
}

/// Existence-check fetch request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub pool_id: u64,
    pub co_id: u64,

    /// Shard to check on.
    pub oid: UnitObjectId,

    pub dkey: Bytes,
    pub dkey_hash: u64,

    /// Akeys whose existence is checked; if empty, the dkey is checked.
    pub akeys: Vec<Bytes>,

    /// Epoch to read at; value 0 lets the server choose.
    pub epoch: Epoch,

    pub flags: HeadFlags,
    pub map_version: MapVersion,
}

/// Reply to an existence-check fetch.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct FetchReply {
    /// `Success` if every checked key exists, `NonExist` otherwise.
    pub status: ErrCode,

    /// Epoch the read was executed at.
    pub epoch: u64,

    pub map_version: MapVersion,
}

/// Body of an RPC request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcBody {
    Cpd(CompoundRequest),
    Fetch(FetchRequest),
}

/// Reply of an RPC request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Cpd(CpdReply),
    Fetch(FetchReply),
}

impl RpcReply {
    /// Overall status carried by the reply.
    pub fn status(&self) -> ErrCode {
        match self {
            RpcReply::Cpd(reply) => reply.status,
            RpcReply::Fetch(reply) => reply.status,
        }
    }
}

/// RPC request addressed to an endpoint.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub endpoint: Endpoint,
    pub opcode: RpcOpcode,
    pub body: RpcBody,
}

impl RpcRequest {
    /// Bulk handles the receiver has to pull to process this request.
    pub fn bulk_refs(&self) -> &[BulkHandle] {
        match &self.body {
            RpcBody::Cpd(cpd) => &cpd.bulks,
            RpcBody::Fetch(_) => &[],
        }
    }
}
