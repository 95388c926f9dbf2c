//! Attaching application operations to a transaction, including the
//! precondition checks of conditional writes.

use super::*;

use crate::txn::cache::{SubReq, SubReqKind};
use crate::wire::{
    dkey_hash, FetchReply, FetchRequest, HeadFlags, ObjectId, RpcBody,
    RpcOpcode, RpcReply, UnitObjectId,
};

use bytes::Bytes;

flag_set! {
    /// Conditional-operation flags of a write.
    pub struct CondFlags: u32 {
        /// Fail with `Exist` if the dkey is present.
        const DKEY_INSERT = 1 << 0;
        /// Fail with `NonExist` if the dkey is absent.
        const DKEY_UPDATE = 1 << 1;
        /// Fail with `Exist` if any akey is present.
        const AKEY_INSERT = 1 << 2;
        /// Fail with `NonExist` if any akey is absent.
        const AKEY_UPDATE = 1 << 3;
        /// Fail with `NonExist` if a punched key is absent.
        const PUNCH = 1 << 4;
    }
}

/// Application operation to attach to a transaction.
#[derive(Debug, Clone)]
pub enum TxOp {
    /// Writes `(akey, value)` pairs under one dkey.
    Update {
        oid: ObjectId,
        dkey: Bytes,
        iods: Vec<(Bytes, Bytes)>,
        cond: CondFlags,
    },

    /// Punches a whole object.
    PunchObj { oid: ObjectId, cond: CondFlags },

    /// Punches dkeys; each becomes its own sub-request.
    PunchDkeys {
        oid: ObjectId,
        dkeys: Vec<Bytes>,
        cond: CondFlags,
    },

    /// Punches akeys under one dkey.
    PunchAkeys {
        oid: ObjectId,
        dkey: Bytes,
        akeys: Vec<Bytes>,
        cond: CondFlags,
    },

    Fetch {
        oid: ObjectId,
        dkey: Bytes,
        akeys: Vec<Bytes>,
    },

    /// Queries the max/min dkey, akey, or record extent.
    QueryKey {
        oid: ObjectId,
        dkey: Option<Bytes>,
        akey: Option<Bytes>,
    },

    ListRecx {
        oid: ObjectId,
        dkey: Bytes,
        akey: Bytes,
    },

    ListAkeys { oid: ObjectId, dkey: Bytes },

    ListDkeys { oid: ObjectId },
}

/// One precondition to verify before buffering a conditional write.
#[derive(Debug, Clone)]
struct CondCheck {
    oid: ObjectId,
    dkey: Bytes,
    akeys: Vec<Bytes>,

    /// Insert semantics: the key must be absent.
    insert: bool,
}

/// Hash of a dkey; operations without a dkey land on group 0.
fn hash_of(dkey: &Bytes) -> u64 {
    if dkey.is_empty() {
        0
    } else {
        dkey_hash(dkey)
    }
}

impl TxOp {
    /// Is this a write operation?
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            TxOp::Update { .. }
                | TxOp::PunchObj { .. }
                | TxOp::PunchDkeys { .. }
                | TxOp::PunchAkeys { .. }
        )
    }

    fn cond(&self) -> CondFlags {
        match self {
            TxOp::Update { cond, .. }
            | TxOp::PunchObj { cond, .. }
            | TxOp::PunchDkeys { cond, .. }
            | TxOp::PunchAkeys { cond, .. } => *cond,
            _ => CondFlags::empty(),
        }
    }

    /// Preconditions implied by the conditional flags.
    fn cond_checks(&self) -> Result<Vec<CondCheck>, ShardTxError> {
        let cond = self.cond();
        let mut checks = vec![];
        match self {
            TxOp::Update {
                oid, dkey, iods, ..
            } => {
                if cond.intersects(CondFlags::DKEY_INSERT | CondFlags::DKEY_UPDATE)
                {
                    checks.push(CondCheck {
                        oid: *oid,
                        dkey: dkey.clone(),
                        akeys: vec![],
                        insert: cond.contains(CondFlags::DKEY_INSERT),
                    });
                }
                if cond.intersects(CondFlags::AKEY_INSERT | CondFlags::AKEY_UPDATE)
                {
                    checks.push(CondCheck {
                        oid: *oid,
                        dkey: dkey.clone(),
                        akeys: iods.iter().map(|(akey, _)| akey.clone()).collect(),
                        insert: cond.contains(CondFlags::AKEY_INSERT),
                    });
                }
            }
            TxOp::PunchObj { oid, .. } => {
                if !cond.is_empty() {
                    return logged_err!(ErrCode::Inval;
                                       "conditional punch of object {:?}", oid);
                }
            }
            TxOp::PunchDkeys { oid, dkeys, .. } => {
                if cond.contains(CondFlags::PUNCH) {
                    checks.extend(dkeys.iter().map(|dkey| CondCheck {
                        oid: *oid,
                        dkey: dkey.clone(),
                        akeys: vec![],
                        insert: false,
                    }));
                }
            }
            TxOp::PunchAkeys {
                oid, dkey, akeys, ..
            } => {
                if cond.contains(CondFlags::PUNCH) {
                    checks.push(CondCheck {
                        oid: *oid,
                        dkey: dkey.clone(),
                        akeys: akeys.clone(),
                        insert: false,
                    });
                }
            }
            _ => {}
        }
        Ok(checks)
    }

    /// Converts into buffered sub-requests. Without `copy`, key and value
    /// buffers are shared with the caller.
    fn into_sub_reqs(self, copy: bool) -> Vec<SubReq> {
        let own = |b: Bytes| {
            if copy {
                Bytes::copy_from_slice(&b)
            } else {
                b
            }
        };
        let own_all = |v: Vec<Bytes>| v.into_iter().map(own).collect::<Vec<_>>();
        let api_flags = self.cond().bits();
        let req = |oid: ObjectId, dkey: Bytes, kind: SubReqKind| SubReq {
            oid,
            dkey_hash: hash_of(&dkey),
            dkey,
            api_flags,
            kind,
        };

        match self {
            TxOp::Update {
                oid, dkey, iods, ..
            } => {
                let (akeys, values): (Vec<Bytes>, Vec<Bytes>) =
                    iods.into_iter().unzip();
                vec![req(
                    oid,
                    own(dkey),
                    SubReqKind::Update {
                        akeys: own_all(akeys),
                        values: own_all(values),
                        prep: None,
                    },
                )]
            }
            TxOp::PunchObj { oid, .. } => {
                vec![req(oid, Bytes::new(), SubReqKind::PunchObj)]
            }
            TxOp::PunchDkeys { oid, dkeys, .. } => dkeys
                .into_iter()
                .map(|dkey| req(oid, own(dkey), SubReqKind::PunchDkey))
                .collect(),
            TxOp::PunchAkeys {
                oid, dkey, akeys, ..
            } => vec![req(
                oid,
                own(dkey),
                SubReqKind::PunchAkeys {
                    akeys: own_all(akeys),
                },
            )],
            TxOp::Fetch { oid, dkey, akeys } => vec![req(
                oid,
                own(dkey),
                SubReqKind::Read {
                    akeys: own_all(akeys),
                },
            )],
            TxOp::QueryKey { oid, dkey, akey } => vec![req(
                oid,
                dkey.map(own).unwrap_or_default(),
                SubReqKind::Read {
                    akeys: akey.map(own).into_iter().collect(),
                },
            )],
            TxOp::ListRecx { oid, dkey, akey } => vec![req(
                oid,
                own(dkey),
                SubReqKind::Read {
                    akeys: vec![own(akey)],
                },
            )],
            TxOp::ListAkeys { oid, dkey } => vec![req(
                oid,
                own(dkey),
                SubReqKind::Read { akeys: vec![] },
            )],
            TxOp::ListDkeys { oid } => vec![req(
                oid,
                Bytes::new(),
                SubReqKind::Read { akeys: vec![] },
            )],
        }
    }
}

impl TxHandle {
    /// Attaches an operation to the transaction. Conditional writes first
    /// verify their precondition with a fetch, suspending until it replies;
    /// the operation is buffered only if every precondition holds.
    pub async fn attach(&self, op: TxOp) -> Result<(), ShardTxError> {
        let is_write = op.is_write();
        let current = self.0.cont.pool().map().current_version();
        {
            let mut st = self.state();
            st.check_attachable(is_write)?;
            Self::check_pool_map_locked(&mut st, current)?;
        }

        for check in op.cond_checks()? {
            self.cond_check(check).await?;
        }

        // status may have changed while the checks were in flight
        let mut st = self.state();
        st.check_attachable(is_write)?;
        let copy = !st.flags.contains(TxFlags::ZERO_COPY);
        for req in op.into_sub_reqs(copy) {
            pf_trace!(
                "tx {:?} cache {:?} obj {:?} dkey {:?} flags {:#x}",
                st.xid,
                req.opc(),
                req.oid,
                req.dkey,
                req.api_flags
            );
            st.cache.push(req)?;
        }
        Ok(())
    }

    /// Verifies one precondition, running the fetch as an epoch-choosing I/O
    /// if no epoch is known yet.
    async fn cond_check(&self, check: CondCheck) -> Result<(), ShardTxError> {
        let (epoch, chooser) = match self.io_epoch().await? {
            EpochGrant::Chosen(epoch) => (epoch, None),
            EpochGrant::Choosing(chooser) => (self.epoch_record(), Some(chooser)),
        };

        let res = self.cond_fetch(&check, epoch).await;
        // the fetch itself succeeded if the server evaluated the condition
        let io_status = match &res {
            Ok(reply) if reply.status == ErrCode::NonExist => ErrCode::Success,
            Ok(reply) => reply.status,
            Err(e) => e.errcode(),
        };
        match chooser {
            Some(chooser) => {
                let reply_epoch = res.as_ref().map_or(0, |r| r.epoch);
                chooser.complete(io_status, reply_epoch)?;
            }
            None => {
                let mut st = self.state();
                self.epoch_io_done(&mut st, io_status)?;
            }
        }

        match (check.insert, res?.status) {
            (true, ErrCode::NonExist) | (false, ErrCode::Success) => Ok(()),
            (true, ErrCode::Success) => Err(ShardTxError::code(
                ErrCode::Exist,
                format!("key {:?} of {:?} exists", check.dkey, check.oid),
            )),
            (_, code) => Err(ShardTxError::code(
                code,
                format!("condition on {:?} of {:?} failed", check.dkey, check.oid),
            )),
        }
    }

    /// Sends the conditional fetch of a check to the first live shard of
    /// the key's group.
    async fn cond_fetch(
        &self,
        check: &CondCheck,
        epoch: Epoch,
    ) -> Result<FetchReply, ShardTxError> {
        let pool = self.0.cont.pool();
        let placement = pool.placement();
        let map_version = self.state().pm_ver;

        let hash = hash_of(&check.dkey);
        let grp_size = placement.object_attrs(&check.oid)?.class.grp_size();
        let grp = placement.resolve_group(&check.oid, hash, map_version)?;
        let mut target = None;
        for shard_idx in grp * grp_size..(grp + 1) * grp_size {
            match placement.open_shard(&check.oid, shard_idx, map_version) {
                Ok(tgt) => {
                    target = Some((shard_idx, tgt));
                    break;
                }
                Err(e) if e.errcode() == ErrCode::NonExist => continue,
                Err(e) => return Err(e),
            }
        }
        let (shard, tgt) = match target {
            Some(target) => target,
            None => {
                return logged_err!(ErrCode::Io;
                                   "no live shard in group {} of {:?}",
                                   grp, check.oid);
            }
        };

        let body = RpcBody::Fetch(FetchRequest {
            pool_id: pool.pool_id(),
            co_id: self.0.cont.co_id(),
            oid: UnitObjectId {
                oid: check.oid,
                shard,
            },
            dkey: check.dkey.clone(),
            dkey_hash: hash,
            akeys: check.akeys.clone(),
            epoch,
            flags: if epoch.uncertain {
                HeadFlags::EPOCH_UNCERTAIN
            } else {
                HeadFlags::empty()
            },
            map_version,
        });
        let transport = pool.transport();
        let req = transport.create_request(tgt.endpoint(), RpcOpcode::Fetch, body)?;
        match transport.send(req).await? {
            RpcReply::Fetch(reply) => Ok(reply),
            reply => logged_err!(ErrCode::Proto;
                                 "unexpected reply to fetch: {:?}", reply),
        }
    }
}
