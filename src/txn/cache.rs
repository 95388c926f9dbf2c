//! Sub-request cache: pending read and write sub-requests of a transaction,
//! kept in two disjoint regions sharing one capacity budget.

use crate::transport::Transport;
use crate::utils::{Bitmap, ErrCode, ShardTxError};
use crate::wire::{
    BulkHandle, EcLayout, EcShardTgt, IoDesc, ObjectId, SubOpc, SubReqBody,
    UpdateValues, WireSubReq,
};

use bytes::Bytes;

/// Hard cap on write sub-requests of one transaction (16-bit on-wire
/// sub-request counter).
pub(crate) const WRITE_MAX: u32 = u16::MAX as u32;

/// Hard cap on total sub-requests of one transaction.
pub(crate) const TOTAL_MAX: u32 = u32::MAX;

/// Commit-time preparation of an update: encoded values, the EC shard
/// subset, and bulk registrations. Kept across resends and restarts.
#[derive(Debug, Clone)]
pub(crate) struct UpdatePrep {
    /// Value descriptors as sent on the wire.
    pub(crate) iods: Vec<IoDesc>,

    /// Values as sent on the wire, one per akey.
    pub(crate) values: Vec<Bytes>,

    /// For EC objects: (data cells, parity cells, touched shard bitmap).
    pub(crate) ec: Option<(u16, u16, Bitmap)>,

    /// Bulk registrations of `values`, if they exceeded the inline limit.
    pub(crate) bulks: Option<Vec<BulkHandle>>,
}

/// Opcode-specific content of a buffered sub-request.
#[derive(Debug, Clone)]
pub(crate) enum SubReqKind {
    Update {
        akeys: Vec<Bytes>,
        values: Vec<Bytes>,
        prep: Option<UpdatePrep>,
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

/// One buffered sub-request.
#[derive(Debug, Clone)]
pub(crate) struct SubReq {
    pub(crate) oid: ObjectId,

    /// Distribution key, empty for object-level reads.
    pub(crate) dkey: Bytes,

    pub(crate) dkey_hash: u64,
    pub(crate) api_flags: u32,
    pub(crate) kind: SubReqKind,
}

impl SubReq {
    /// Opcode of the sub-request.
    pub(crate) fn opc(&self) -> SubOpc {
        match self.kind {
            SubReqKind::Update { .. } => SubOpc::Update,
            SubReqKind::PunchObj => SubOpc::PunchObj,
            SubReqKind::PunchDkey => SubOpc::PunchDkey,
            SubReqKind::PunchAkeys { .. } => SubOpc::PunchAkeys,
            SubReqKind::Read { .. } => SubOpc::Read,
        }
    }

    /// Touched-shard bitmap of a prepared EC update, if any.
    pub(crate) fn ec_bitmap(&self) -> Option<&Bitmap> {
        match &self.kind {
            SubReqKind::Update {
                prep: Some(UpdatePrep { ec: Some((_, _, map)), .. }),
                ..
            } => Some(map),
            _ => None,
        }
    }

    /// Builds the on-wire form. Updates must have been prepared.
    pub(crate) fn to_wire(
        &self,
        ec_tgts: Option<Vec<EcShardTgt>>,
    ) -> Result<WireSubReq, ShardTxError> {
        let body = match &self.kind {
            SubReqKind::Update { prep, .. } => {
                let prep = prep.as_ref().ok_or_else(|| {
                    ShardTxError::code(
                        ErrCode::Uninit,
                        "update not prepared before packing",
                    )
                })?;
                let values = match &prep.bulks {
                    Some(bulks) => UpdateValues::Bulk(bulks.clone()),
                    None => UpdateValues::Inline(prep.values.clone()),
                };
                let ec = prep.ec.as_ref().map(|(data, parity, _)| EcLayout {
                    data: *data,
                    parity: *parity,
                    tgts: ec_tgts.unwrap_or_default(),
                });
                SubReqBody::Update {
                    iods: prep.iods.clone(),
                    values,
                    ec,
                }
            }
            SubReqKind::PunchObj => SubReqBody::PunchObj,
            SubReqKind::PunchDkey => SubReqBody::PunchDkey,
            SubReqKind::PunchAkeys { akeys } => SubReqBody::PunchAkeys {
                akeys: akeys.clone(),
            },
            SubReqKind::Read { akeys } => SubReqBody::Read {
                akeys: akeys.clone(),
            },
        };
        Ok(WireSubReq {
            oid: self.oid,
            dkey: self.dkey.clone(),
            dkey_hash: self.dkey_hash,
            api_flags: self.api_flags,
            body,
        })
    }

    /// Releases bulk registrations held by the sub-request. Returns the
    /// number of handles released.
    pub(crate) fn release(&mut self, transport: &dyn Transport) -> usize {
        let mut released = 0;
        if let SubReqKind::Update {
            prep: Some(UpdatePrep { bulks, .. }),
            ..
        } = &mut self.kind
        {
            for handle in bulks.take().unwrap_or_default() {
                if let Err(e) = transport.release_bulk(&handle) {
                    pf_warn!("error releasing bulk {}: {}", handle.id, e);
                } else {
                    released += 1;
                }
            }
        }
        released
    }
}

/// Sub-request cache. The write region is `min(capacity / 2, WRITE_MAX)`
/// slots (none for read-only transactions) and the read region is the rest;
/// the whole capacity doubles when either region is exhausted.
#[derive(Debug)]
pub(crate) struct SubReqCache {
    /// Read region, in attach order.
    reads: Vec<SubReq>,

    /// Write region, in attach order.
    writes: Vec<SubReq>,

    /// Total slot capacity.
    capacity: u32,

    /// Read-only transactions reserve no write slots.
    rdonly: bool,
}

impl SubReqCache {
    /// Creates an empty cache with the given initial capacity.
    pub(crate) fn new(init_slots: u32, rdonly: bool) -> Self {
        let init_slots = init_slots.max(1);
        SubReqCache {
            reads: Vec::with_capacity(init_slots as usize),
            writes: if rdonly {
                Vec::new()
            } else {
                Vec::with_capacity(init_slots as usize / 2)
            },
            capacity: init_slots,
            rdonly,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots of the write region.
    #[inline]
    pub(crate) fn write_slots(&self) -> u32 {
        if self.rdonly {
            0
        } else {
            (self.capacity / 2).min(WRITE_MAX)
        }
    }

    /// Number of slots of the read region.
    #[inline]
    pub(crate) fn read_slots(&self) -> u32 {
        self.capacity - self.write_slots()
    }

    #[inline]
    pub(crate) fn read_count(&self) -> u32 {
        self.reads.len() as u32
    }

    #[inline]
    pub(crate) fn write_count(&self) -> u32 {
        self.writes.len() as u32
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Doubles the capacity.
    fn grow(&mut self) -> Result<(), ShardTxError> {
        if self.capacity == TOTAL_MAX {
            return Err(ShardTxError::code(
                ErrCode::Overflow,
                format!("too many sub-requests ({})", self.capacity),
            ));
        }
        self.capacity = self.capacity.saturating_mul(2);
        pf_trace!(
            "sub-request cache grown to {} (r {} w {})",
            self.capacity,
            self.read_slots(),
            self.write_slots()
        );
        Ok(())
    }

    /// Appends a sub-request to its region, growing the cache if needed.
    pub(crate) fn push(&mut self, req: SubReq) -> Result<(), ShardTxError> {
        if req.opc().is_write() {
            if self.rdonly {
                return Err(ShardTxError::code(
                    ErrCode::NoPerm,
                    "write sub-request in read-only transaction",
                ));
            }
            if self.write_count() >= WRITE_MAX {
                return Err(ShardTxError::code(
                    ErrCode::Overflow,
                    format!("too many write sub-requests ({})", WRITE_MAX),
                ));
            }
            while self.write_count() >= self.write_slots() {
                self.grow()?;
            }
            self.writes.push(req);
        } else {
            while self.read_count() >= self.read_slots() {
                self.grow()?;
            }
            self.reads.push(req);
        }
        Ok(())
    }

    /// Iterates over sub-requests in wire order: reads then writes.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubReq> {
        self.reads.iter().chain(self.writes.iter())
    }

    /// Mutable iteration in wire order.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubReq> {
        self.reads.iter_mut().chain(self.writes.iter_mut())
    }

    /// Sub-request at a wire-order index.
    pub(crate) fn get(&self, idx: usize) -> Option<&SubReq> {
        if idx < self.reads.len() {
            self.reads.get(idx)
        } else {
            self.writes.get(idx - self.reads.len())
        }
    }

    /// Does any sub-request carry conditional-operation flags?
    pub(crate) fn has_conditions(&self) -> bool {
        self.iter().any(|req| req.api_flags != 0)
    }

    /// Drops every sub-request, releasing their bulk registrations. Returns
    /// the number of bulk handles released.
    pub(crate) fn release_all(&mut self, transport: &dyn Transport) -> usize {
        let released =
            self.iter_mut().map(|req| req.release(transport)).sum();
        self.reads.clear();
        self.writes.clear();
        released
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use rand::Rng;

    fn read_req(n: u64) -> SubReq {
        SubReq {
            oid: ObjectId::new(0, n),
            dkey: Bytes::from(format!("d{}", n)),
            dkey_hash: n,
            api_flags: 0,
            kind: SubReqKind::Read { akeys: vec![] },
        }
    }

    fn write_req(n: u64) -> SubReq {
        SubReq {
            oid: ObjectId::new(0, n),
            dkey: Bytes::from(format!("d{}", n)),
            dkey_hash: n,
            api_flags: 0,
            kind: SubReqKind::PunchDkey,
        }
    }

    fn check_invariants(cache: &SubReqCache) {
        assert!(cache.read_count() + cache.write_count() <= cache.capacity());
        assert!(cache.write_count() <= cache.write_slots());
        assert!(cache.read_count() <= cache.read_slots());
        assert!(cache.write_count() <= WRITE_MAX);
    }

    #[test]
    fn cache_growth_invariant() -> Result<(), ShardTxError> {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut cache = SubReqCache::new(rng.gen_range(1..=16), false);
            let mut next = 0u64;
            for _ in 0..rng.gen_range(0..300) {
                next += 1;
                if rng.gen_bool(0.5) {
                    cache.push(read_req(next))?;
                } else {
                    cache.push(write_req(next))?;
                }
                check_invariants(&cache);
            }
            // attach order preserved within each region
            let reads: Vec<u64> = cache.reads.iter().map(|r| r.oid.lo).collect();
            let writes: Vec<u64> =
                cache.writes.iter().map(|r| r.oid.lo).collect();
            assert!(reads.windows(2).all(|w| w[0] < w[1]));
            assert!(writes.windows(2).all(|w| w[0] < w[1]));
        }
        Ok(())
    }

    #[test]
    fn cache_doubles() -> Result<(), ShardTxError> {
        let mut cache = SubReqCache::new(16, false);
        assert_eq!(cache.write_slots(), 8);
        assert_eq!(cache.read_slots(), 8);
        for i in 0..9 {
            cache.push(write_req(i))?;
        }
        assert_eq!(cache.capacity(), 32);
        assert_eq!(cache.write_slots(), 16);
        check_invariants(&cache);
        Ok(())
    }

    #[test]
    fn cache_rdonly() -> Result<(), ShardTxError> {
        let mut cache = SubReqCache::new(4, true);
        assert_eq!(cache.write_slots(), 0);
        assert_eq!(cache.read_slots(), 4);
        assert_eq!(
            cache.push(write_req(1)).unwrap_err().errcode(),
            ErrCode::NoPerm
        );
        for i in 0..5 {
            cache.push(read_req(i))?;
        }
        assert_eq!(cache.capacity(), 8);
        Ok(())
    }

    #[test]
    fn cache_wire_order() -> Result<(), ShardTxError> {
        let mut cache = SubReqCache::new(4, false);
        cache.push(write_req(1))?;
        cache.push(read_req(2))?;
        cache.push(write_req(3))?;
        cache.push(read_req(4))?;
        let order: Vec<u64> = cache.iter().map(|r| r.oid.lo).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert_eq!(cache.get(1).map(|r| r.oid.lo), Some(4));
        assert_eq!(cache.get(2).map(|r| r.oid.lo), Some(1));
        assert!(cache.get(4).is_none());
        assert!(!cache.has_conditions());
        Ok(())
    }

    #[test]
    fn update_needs_prep() {
        let req = SubReq {
            oid: ObjectId::new(0, 1),
            dkey: Bytes::from_static(b"d"),
            dkey_hash: 0,
            api_flags: 0,
            kind: SubReqKind::Update {
                akeys: vec![Bytes::from_static(b"a")],
                values: vec![Bytes::from_static(b"v")],
                prep: None,
            },
        };
        assert_eq!(req.to_wire(None).unwrap_err().errcode(), ErrCode::Uninit);
    }
}
