//! Transport collaborator: RPC send/receive and bulk-transfer registration.

mod tcp;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::utils::{ErrCode, ShardTxError};
use crate::wire::{BulkHandle, Endpoint, RpcBody, RpcOpcode, RpcReply, RpcRequest};

use async_trait::async_trait;

use bytes::Bytes;

pub use tcp::TcpTransport;

/// Transport collaborator trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Creates a request addressed to `endpoint`.
    fn create_request(
        &self,
        endpoint: Endpoint,
        opcode: RpcOpcode,
        body: RpcBody,
    ) -> Result<RpcRequest, ShardTxError> {
        let matching = matches!(
            (opcode, &body),
            (RpcOpcode::TxCommit, RpcBody::Cpd(_))
                | (RpcOpcode::Fetch, RpcBody::Fetch(_))
        );
        if !matching {
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!("opcode {:?} mismatches request body", opcode),
            ));
        }
        Ok(RpcRequest {
            endpoint,
            opcode,
            body,
        })
    }

    /// Sends a request and waits for its reply.
    async fn send(&self, req: RpcRequest) -> Result<RpcReply, ShardTxError>;

    /// Registers a buffer for out-of-band bulk transfer.
    fn register_bulk(&self, data: Bytes) -> Result<BulkHandle, ShardTxError>;

    /// Releases a registered buffer. Every handle must be released exactly
    /// once.
    fn release_bulk(&self, handle: &BulkHandle) -> Result<(), ShardTxError>;
}

/// Bulk registration accounting counters.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct BulkStats {
    pub registered: u64,
    pub released: u64,
    pub outstanding: u64,

    /// Releases of unknown or already released handles.
    pub bad_releases: u64,
}

#[derive(Debug, Default)]
struct BulkRegistryInner {
    next_id: u64,
    bufs: HashMap<u64, Bytes>,
    stats: BulkStats,
}

/// Table of buffers registered for bulk transfer.
#[derive(Debug, Default)]
pub struct BulkRegistry {
    inner: Mutex<BulkRegistryInner>,
}

impl BulkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a buffer, returning its handle.
    pub fn register(&self, data: Bytes) -> Result<BulkHandle, ShardTxError> {
        let mut inner = self.inner.lock()?;
        inner.next_id += 1;
        let handle = BulkHandle {
            id: inner.next_id,
            len: data.len() as u64,
        };
        inner.bufs.insert(handle.id, data);
        inner.stats.registered += 1;
        inner.stats.outstanding += 1;
        Ok(handle)
    }

    /// Releases a registered buffer.
    pub fn release(&self, handle: &BulkHandle) -> Result<(), ShardTxError> {
        let mut inner = self.inner.lock()?;
        if inner.bufs.remove(&handle.id).is_none() {
            inner.stats.bad_releases += 1;
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!("bulk handle {} not registered", handle.id),
            ));
        }
        inner.stats.released += 1;
        inner.stats.outstanding -= 1;
        Ok(())
    }

    /// Looks up the content of a registered buffer.
    pub fn lookup(&self, handle: &BulkHandle) -> Result<Bytes, ShardTxError> {
        let inner = self.inner.lock()?;
        match inner.bufs.get(&handle.id) {
            Some(data) if data.len() as u64 == handle.len => Ok(data.clone()),
            _ => Err(ShardTxError::code(
                ErrCode::Proto,
                format!("bulk handle {:?} invalid", handle),
            )),
        }
    }

    /// Returns the accounting counters.
    pub fn stats(&self) -> BulkStats {
        self.inner.lock().map_or(BulkStats::default(), |i| i.stats)
    }
}
