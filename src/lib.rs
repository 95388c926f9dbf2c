//! Shardtx client-side coordinator for distributed multi-shard transactions.
//!
//! Application operations are buffered in a transaction handle, then
//! committed in one compound request sent to a leader target, which runs
//! the commit across every touched shard.

#[macro_use]
mod utils;

mod placement;
mod pool;
mod sim;
mod transport;
mod txn;
mod wire;

pub use placement::{ObjAttrs, ObjClass, Placement, PlacementMap};
pub use pool::{ContainerHandle, PoolHandle, PoolMap};
pub use sim::{SentCpd, SimCluster, SimFault};
pub use transport::{BulkRegistry, BulkStats, TcpTransport, Transport};
pub use txn::{
    CondFlags, EpochChooser, EpochGrant, TxConfig, TxFlags, TxHandle, TxOp,
    TxStatus,
};
pub use utils::{
    logger_init, BackoffSeq, Bitmap, Deadline, ErrCode, ShardTxError, ME,
};
pub use wire::*;
