//! TCP transport: one connection per request, length-prefixed rmp-serde
//! frames.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::transport::{BulkRegistry, BulkStats, Transport};
use crate::utils::{Deadline, ErrCode, ShardTxError};
use crate::wire::{BulkHandle, Rank, RpcReply, RpcRequest};

use async_trait::async_trait;

use bytes::Bytes;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;

/// Request frame: the request plus the content of every bulk buffer it
/// references, so the server side never pulls separately.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct ReqFrame {
    pub(crate) req: RpcRequest,
    pub(crate) bulks: Vec<(BulkHandle, Bytes)>,
}

/// Writes an object as a u64 length-prefixed frame.
pub(crate) async fn write_frame<T, Conn>(
    conn: &mut Conn,
    obj: &T,
) -> Result<(), ShardTxError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn.write_all(&obj_bytes[..]).await?;
    Ok(())
}

/// Reads one u64 length-prefixed frame and decodes it.
pub(crate) async fn read_frame<T, Conn>(
    conn: &mut Conn,
) -> Result<T, ShardTxError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = conn.read_u64().await?; // receive length first
    let mut obj_buf: Vec<u8> = vec![0; usize::try_from(obj_len)?];
    conn.read_exact(&mut obj_buf[..]).await?;
    Ok(decode_from_slice(&obj_buf)?)
}

/// Transport over plain TCP connections to per-rank server addresses.
pub struct TcpTransport {
    /// Map from server rank -> socket address.
    addrs: HashMap<Rank, SocketAddr>,

    /// Locally registered bulk buffers.
    bulks: BulkRegistry,

    /// Reply timeout of a request.
    timeout: Duration,
}

impl TcpTransport {
    /// Creates a new TCP transport.
    pub fn new(
        addrs: HashMap<Rank, SocketAddr>,
        timeout_ms: u64,
    ) -> Result<Self, ShardTxError> {
        if timeout_ms == 0 {
            return logged_err!(ErrCode::Inval; "invalid rpc timeout 0 ms");
        }
        Ok(TcpTransport {
            addrs,
            bulks: BulkRegistry::new(),
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Bulk registration counters.
    pub fn bulk_stats(&self) -> BulkStats {
        self.bulks.stats()
    }

    async fn exchange(
        addr: SocketAddr,
        frame: ReqFrame,
    ) -> Result<RpcReply, ShardTxError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &frame).await?;
        read_frame(&mut stream).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, req: RpcRequest) -> Result<RpcReply, ShardTxError> {
        let addr = match self.addrs.get(&req.endpoint.rank) {
            Some(addr) => *addr,
            None => {
                return Err(ShardTxError::code(
                    ErrCode::Unreachable,
                    format!("no address for rank {}", req.endpoint.rank),
                ))
            }
        };

        let mut bulks = Vec::with_capacity(req.bulk_refs().len());
        for handle in req.bulk_refs() {
            bulks.push((*handle, self.bulks.lookup(handle)?));
        }
        let opcode = req.opcode;
        let frame = ReqFrame { req, bulks };

        let mut deadline = Deadline::after(self.timeout)?;
        tokio::select! {
            reply = Self::exchange(addr, frame) => {
                let reply = reply.map_err(|e| {
                    if e.errcode() == ErrCode::Misc {
                        ShardTxError::code(ErrCode::Unreachable, e)
                    } else {
                        e
                    }
                })?;
                pf_trace!("{:?} reply from {}: {:?}", opcode, addr, reply.status());
                Ok(reply)
            },

            _ = deadline.expired() => {
                pf_warn!("{:?} to {} timed out after {:?}",
                         opcode, addr, deadline.budget());
                Err(ShardTxError::code(
                    ErrCode::TimedOut,
                    format!("rpc to {} timed out", addr),
                ))
            }
        }
    }

    fn register_bulk(&self, data: Bytes) -> Result<BulkHandle, ShardTxError> {
        self.bulks.register(data)
    }

    fn release_bulk(&self, handle: &BulkHandle) -> Result<(), ShardTxError> {
        self.bulks.release(handle)
    }
}

#[cfg(test)]
mod tcp_tests {
    use super::*;
    use crate::wire::{
        CompoundRequest, CpdFlags, CpdReply, Endpoint, RpcBody, RpcOpcode,
        Section,
    };
    use tokio::net::TcpListener;

    fn test_cpd(bulks: Vec<BulkHandle>, head: Section) -> RpcBody {
        RpcBody::Cpd(CompoundRequest {
            pool_id: 1,
            co_hdl: 2,
            co_id: 3,
            map_version: 1,
            flags: CpdFlags::LEADER,
            head,
            sub_reqs: Section::Inline(Bytes::new()),
            disp: Section::Inline(Bytes::new()),
            tgts: Section::Inline(Bytes::new()),
            bulks,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_send_recv() -> Result<(), ShardTxError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let frame: ReqFrame = read_frame(&mut stream).await?;
            assert_eq!(frame.req.opcode, RpcOpcode::TxCommit);
            assert_eq!(frame.bulks.len(), 1);
            assert_eq!(frame.bulks[0].1, Bytes::from_static(b"payload"));
            let reply = RpcReply::Cpd(CpdReply {
                status: ErrCode::Success,
                sub_rets: vec![],
                epoch: 99,
                map_version: 1,
            });
            write_frame(&mut stream, &reply).await?;
            Ok::<(), ShardTxError>(())
        });

        let transport = TcpTransport::new(HashMap::from([(0, addr)]), 2000)?;
        let handle = transport.register_bulk(Bytes::from_static(b"payload"))?;
        let req = transport.create_request(
            Endpoint { rank: 0, tag: 0 },
            RpcOpcode::TxCommit,
            test_cpd(vec![handle], Section::Bulk(handle)),
        )?;
        match transport.send(req).await? {
            RpcReply::Cpd(reply) => assert_eq!(reply.epoch, 99),
            reply => panic!("unexpected reply {:?}", reply),
        }
        server.await??;

        transport.release_bulk(&handle)?;
        assert_eq!(transport.bulk_stats().outstanding, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_timeout() -> Result<(), ShardTxError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
            Ok::<(), ShardTxError>(())
        });

        let transport = TcpTransport::new(HashMap::from([(0, addr)]), 100)?;
        let req = transport.create_request(
            Endpoint { rank: 0, tag: 0 },
            RpcOpcode::TxCommit,
            test_cpd(vec![], Section::Inline(Bytes::new())),
        )?;
        let err = transport.send(req).await.unwrap_err();
        assert_eq!(err.errcode(), ErrCode::TimedOut);
        server.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tcp_unreachable() -> Result<(), ShardTxError> {
        let transport = TcpTransport::new(HashMap::new(), 100)?;
        let req = transport.create_request(
            Endpoint { rank: 3, tag: 0 },
            RpcOpcode::TxCommit,
            test_cpd(vec![], Section::Inline(Bytes::new())),
        )?;
        let err = transport.send(req).await.unwrap_err();
        assert_eq!(err.errcode(), ErrCode::Unreachable);
        assert!(transport
            .create_request(
                Endpoint { rank: 3, tag: 0 },
                RpcOpcode::Fetch,
                test_cpd(vec![], Section::Inline(Bytes::new())),
            )
            .is_err());
        Ok(())
    }
}
