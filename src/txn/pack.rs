//! Compound request packer: size-estimated two-phase encoding of request
//! sections, with inline vs. bulk placement, and commit-time preparation of
//! update values.

use std::io;

use crate::placement::ObjClass;
use crate::transport::Transport;
use crate::txn::cache::{SubReq, SubReqKind, UpdatePrep};
use crate::txn::ecreasb::ec_reassemble;
use crate::txn::TxConfig;
use crate::utils::{ErrCode, ShardTxError};
use crate::wire::{IoDesc, Section};

use bytes::Bytes;

use get_size::GetSize;

use serde::Serialize;

/// A bounded encode ran out of buffer space; `required` is the exact
/// serialized size.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct NeedsLargerBuffer {
    pub(crate) required: usize,
}

/// Writer that stores at most `cap` bytes but keeps counting past it.
struct BoundedWriter {
    buf: Vec<u8>,
    cap: usize,
    total: usize,
}

impl io::Write for BoundedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.total += data.len();
        if self.total <= self.cap {
            self.buf.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes `value` into a buffer of `cap` bytes.
pub(crate) fn encode_bounded<T: Serialize>(
    value: &T,
    cap: usize,
) -> Result<Result<Bytes, NeedsLargerBuffer>, ShardTxError> {
    let mut writer = BoundedWriter {
        buf: Vec::with_capacity(cap),
        cap,
        total: 0,
    };
    rmp_serde::encode::write(&mut writer, value)?;
    if writer.total > cap {
        Ok(Err(NeedsLargerBuffer {
            required: writer.total,
        }))
    } else {
        Ok(Ok(Bytes::from(writer.buf)))
    }
}

/// A packed section.
#[derive(Debug)]
pub(crate) struct Packed {
    pub(crate) section: Section,

    /// Number of re-encodes after an under-estimate.
    pub(crate) repacks: u32,
}

/// Packs a section using its in-memory size as the size estimate.
pub(crate) fn pack_section<T: Serialize + GetSize>(
    value: &T,
    inline_limit: usize,
    transport: &dyn Transport,
) -> Result<Packed, ShardTxError> {
    pack_section_with_estimate(value, value.get_size(), inline_limit, transport)
}

/// Packs a section: encodes into a buffer of `estimate` bytes, re-encoding
/// once with the exact size if that was too small, then embeds the result
/// if it is at most `inline_limit` bytes or registers it for bulk transfer
/// otherwise.
pub(crate) fn pack_section_with_estimate<T: Serialize>(
    value: &T,
    estimate: usize,
    inline_limit: usize,
    transport: &dyn Transport,
) -> Result<Packed, ShardTxError> {
    let mut repacks = 0;
    let data = match encode_bounded(value, estimate)? {
        Ok(data) => data,
        Err(NeedsLargerBuffer { required }) => {
            repacks += 1;
            pf_debug!("section estimate {} < {}, re-packing", estimate, required);
            match encode_bounded(value, required)? {
                Ok(data) => data,
                Err(miss) => {
                    return logged_err!(ErrCode::Proto;
                                       "section re-pack still needs {} bytes",
                                       miss.required);
                }
            }
        }
    };

    let section = if data.len() <= inline_limit {
        Section::Inline(data)
    } else {
        Section::Bulk(transport.register_bulk(data)?)
    };
    Ok(Packed { section, repacks })
}

/// Prepares the values of an update sub-request for sending: EC objects
/// get their values split into stripe cells, and values larger than the
/// update bulk limit are registered for bulk transfer. A prepared update is
/// left untouched, so registrations are reused across resends.
pub(crate) fn prepare_update(
    req: &mut SubReq,
    class: ObjClass,
    config: &TxConfig,
    transport: &dyn Transport,
) -> Result<(), ShardTxError> {
    let (akeys, values, prep) = match &mut req.kind {
        SubReqKind::Update {
            akeys,
            values,
            prep,
        } => (akeys, values, prep),
        _ => return Ok(()),
    };
    if prep.is_some() {
        return Ok(());
    }

    let (wire_values, cell_sizes, ec) = match class {
        ObjClass::ErasureCoded { data, parity } => {
            let reasb =
                ec_reassemble(values, data, parity, config.ec_cell_len)?;
            (
                reasb.payloads,
                reasb.cell_sizes,
                Some((data, parity, reasb.tgt_bitmap)),
            )
        }
        ObjClass::Replicated { .. } => {
            (values.clone(), vec![0; values.len()], None)
        }
    };

    let iods = akeys
        .iter()
        .zip(values.iter())
        .zip(cell_sizes)
        .map(|((akey, value), ec_cell)| IoDesc {
            akey: akey.clone(),
            size: value.len() as u64,
            ec_cell,
        })
        .collect();

    let packed_size: usize = wire_values.iter().map(|v| v.len()).sum();
    let bulks = if packed_size > config.update_bulk_limit {
        let mut handles = Vec::with_capacity(wire_values.len());
        for value in &wire_values {
            match transport.register_bulk(value.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        if let Err(re) = transport.release_bulk(handle) {
                            pf_warn!(
                                "error releasing value bulk {}: {}",
                                handle.id,
                                re
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Some(handles)
    } else {
        None
    };

    *prep = Some(UpdatePrep {
        iods,
        values: wire_values,
        ec,
        bulks,
    });
    Ok(())
}

#[cfg(test)]
mod pack_tests {
    use super::*;
    use crate::sim::SimCluster;
    use crate::transport::BulkRegistry;
    use crate::wire::{BulkHandle, ObjectId, RpcReply, RpcRequest};
    use async_trait::async_trait;

    /// Transport whose bulk registrations fail once `cap` are outstanding.
    struct CappedBulks {
        reg: BulkRegistry,
        cap: u64,
    }

    #[async_trait]
    impl Transport for CappedBulks {
        async fn send(&self, _req: RpcRequest) -> Result<RpcReply, ShardTxError> {
            Err(ShardTxError::code(ErrCode::Unreachable, "no network"))
        }

        fn register_bulk(&self, data: Bytes) -> Result<BulkHandle, ShardTxError> {
            if self.reg.stats().outstanding >= self.cap {
                return Err(ShardTxError::code(ErrCode::NoMem, "bulk table full"));
            }
            self.reg.register(data)
        }

        fn release_bulk(&self, handle: &BulkHandle) -> Result<(), ShardTxError> {
            self.reg.release(handle)
        }
    }

    #[test]
    fn bounded_fits_and_misses() -> Result<(), ShardTxError> {
        let value = Bytes::from(vec![1u8; 100]);
        let exact = rmp_serde::encode::to_vec(&value)?.len();
        assert_eq!(exact, 102);
        assert_eq!(encode_bounded(&value, exact)?.map(|b| b.len()), Ok(exact));
        assert_eq!(
            encode_bounded(&value, exact - 1)?,
            Err(NeedsLargerBuffer { required: exact })
        );
        Ok(())
    }

    #[test]
    fn inline_bulk_threshold() -> Result<(), ShardTxError> {
        let sim = SimCluster::new(1, 2);
        let limit = 2048;
        // bin16 framing adds 3 bytes of header
        for (len, bulk) in [(2044, false), (2045, false), (2046, true)] {
            let value = Bytes::from(vec![9u8; len]);
            let packed =
                pack_section_with_estimate(&value, len + 8, limit, &*sim)?;
            assert_eq!(packed.section.len(), len + 3);
            assert_eq!(packed.section.is_bulk(), bulk);
            assert_eq!(packed.repacks, 0);
        }
        assert_eq!(sim.bulk_stats().registered, 1);
        Ok(())
    }

    #[test]
    fn underestimate_repacks_once() -> Result<(), ShardTxError> {
        let sim = SimCluster::new(1, 2);
        let value = vec![7u64; 64];
        let packed = pack_section_with_estimate(&value, 4, 4096, &*sim)?;
        assert_eq!(packed.repacks, 1);
        let back: Vec<u64> = packed.section.decode(|_| {
            Err(ShardTxError::code(ErrCode::Proto, "unexpected bulk"))
        })?;
        assert_eq!(back, value);

        let packed =
            pack_section_with_estimate(&value, 1 << 16, 4096, &*sim)?;
        assert_eq!(packed.repacks, 0);
        Ok(())
    }

    fn update(values: Vec<Bytes>) -> SubReq {
        SubReq {
            oid: ObjectId::new(0, 1),
            dkey: Bytes::from_static(b"d"),
            dkey_hash: 0,
            api_flags: 0,
            kind: SubReqKind::Update {
                akeys: (0..values.len())
                    .map(|i| Bytes::from(format!("a{}", i)))
                    .collect(),
                values,
                prep: None,
            },
        }
    }

    #[test]
    fn prepare_update_bulk_once() -> Result<(), ShardTxError> {
        let sim = SimCluster::new(1, 2);
        let config = TxConfig::default();
        let class = ObjClass::Replicated { replicas: 2 };

        let mut small = update(vec![Bytes::from(vec![1u8; 64])]);
        prepare_update(&mut small, class, &config, &*sim)?;
        assert_eq!(sim.bulk_stats().registered, 0);

        let mut big = update(vec![
            Bytes::from(vec![1u8; 400]),
            Bytes::from(vec![2u8; 400]),
        ]);
        prepare_update(&mut big, class, &config, &*sim)?;
        prepare_update(&mut big, class, &config, &*sim)?;
        assert_eq!(sim.bulk_stats().registered, 2);
        assert_eq!(big.release(&*sim), 2);
        assert_eq!(big.release(&*sim), 0);
        assert_eq!(sim.bulk_stats().outstanding, 0);
        Ok(())
    }

    #[test]
    fn prepare_update_ec() -> Result<(), ShardTxError> {
        let sim = SimCluster::new(1, 2);
        let config = TxConfig::default();
        let class = ObjClass::ErasureCoded { data: 2, parity: 1 };
        let mut req = update(vec![Bytes::from(vec![5u8; 10])]);
        prepare_update(&mut req, class, &config, &*sim)?;
        let map = req.ec_bitmap().cloned();
        assert_eq!(map.map(|m| m.count()), Some(2));
        match &req.kind {
            SubReqKind::Update { prep: Some(p), .. } => {
                assert_eq!(p.iods[0].size, 10);
                assert_eq!(p.iods[0].ec_cell, 10);
                assert_eq!(p.values[0].len(), 20);
            }
            kind => panic!("unexpected kind {:?}", kind),
        }
        Ok(())
    }

    #[test]
    fn prepare_update_register_failure() {
        let transport = CappedBulks {
            reg: BulkRegistry::new(),
            cap: 2,
        };
        let config = TxConfig::default();
        let class = ObjClass::Replicated { replicas: 2 };
        let mut req = update(vec![Bytes::from(vec![3u8; 300]); 3]);
        let err =
            prepare_update(&mut req, class, &config, &transport).unwrap_err();
        assert_eq!(err.errcode(), ErrCode::NoMem);
        let stats = transport.reg.stats();
        assert_eq!((stats.registered, stats.released), (2, 2));
        assert_eq!(stats.outstanding, 0);
        assert!(req.ec_bitmap().is_none());
        assert!(matches!(req.kind, SubReqKind::Update { prep: None, .. }));
    }
}
