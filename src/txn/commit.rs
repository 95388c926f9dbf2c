//! Commit state machine: prepares the compound request, sends it to the
//! leader target, and interprets the reply.

use super::*;

use std::time::Duration;

use crate::txn::classify::{classify, DispatchGroup};
use crate::txn::pack::{pack_section, prepare_update};
use crate::txn::reduce::{is_single_rdg, reduce_rdgs};
use crate::wire::{
    CpdFlags, DispatchEntry, HeadFlags, MbsFlags, Membership, RpcBody,
    RpcOpcode, RpcReply, RpcRequest, Section, SubOpc, SubReqBody,
    TargetDescriptor, TransactionHead, UpdateValues, WireSubReq,
};

use get_size::GetSize;

use serde::Serialize;

/// What the commit loop does after a reply was interpreted.
#[derive(Debug)]
enum Next {
    /// The commit call returns.
    Done(Result<(), ShardTxError>),

    /// Refresh the pool map to at least the given version, back off, then
    /// resend.
    Refresh(MapVersion, Duration),

    /// Back off, then resend.
    Resend(Duration),
}

/// Clears the in-flight mark when the commit call finishes or is dropped.
/// A commit dropped mid-attempt leaves the transaction open with the
/// prepared request marked for resend.
struct InFlightGuard<'a>(&'a TxHandle);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.0.state();
        st.in_flight = false;
        if st.status == TxStatus::Committing {
            pf_debug!("commit of tx {:?} dropped mid-attempt", st.xid);
            st.status = TxStatus::Open;
            st.retry = st.prepared.is_some();
            st.set_resend = true;
        }
    }
}

/// Packs one section, recording its bulk registration if any.
fn pack_one<T: Serialize + GetSize>(
    name: &str,
    value: &T,
    inline_limit: usize,
    transport: &dyn Transport,
    bulks: &mut Vec<BulkHandle>,
) -> Result<Section, ShardTxError> {
    let packed = pack_section(value, inline_limit, transport)?;
    if packed.repacks > 0 {
        pf_debug!("section {} re-packed {} times", name, packed.repacks);
    }
    if let Section::Bulk(handle) = &packed.section {
        bulks.push(*handle);
    }
    Ok(packed.section)
}

/// Short description of a packed section for logging.
fn section_desc(section: &Section) -> String {
    format!(
        "{}{}",
        section.len(),
        if section.is_bulk() { "b" } else { "i" }
    )
}

impl TxHandle {
    /// Commits the transaction. Transient failures are retried internally;
    /// the call returns once the transaction committed, must be restarted
    /// (`TxRestart`), or failed for good.
    pub async fn commit(&self) -> Result<(), ShardTxError> {
        {
            let mut st = self.state();
            if st.closed {
                return logged_err!(ErrCode::NoHdl; "commit on closed tx");
            }
            match st.status {
                TxStatus::Open => {}
                TxStatus::Committed => {
                    return Err(ShardTxError::code(
                        ErrCode::Already,
                        "tx already committed",
                    ))
                }
                TxStatus::Committing => {
                    return Err(ShardTxError::code(
                        ErrCode::InProgress,
                        "tx commit in progress",
                    ))
                }
                status => {
                    return Err(ShardTxError::code(
                        ErrCode::NoPerm,
                        format!("cannot commit tx in status {}", status),
                    ))
                }
            }

            if st.cache.is_empty() {
                st.status = TxStatus::Committed;
                self.notify_epoch_waiters(&mut st);
                pf_debug!("committed empty tx {:?}", st.xid);
                return Ok(());
            }
            st.status = TxStatus::Committing;
            st.in_flight = true;
        }

        let _guard = InFlightGuard(self);
        self.commit_loop().await
    }

    async fn commit_loop(&self) -> Result<(), ShardTxError> {
        let pool = self.0.cont.pool();
        let transport = pool.transport();

        loop {
            let current = pool.map().current_version();
            let (req, attempt) = {
                let mut st = self.state();
                self.check_committing(&st)?;
                match self.build_request(&mut st, current) {
                    Ok(built) => built,
                    Err(e) => {
                        if st.status == TxStatus::Committing {
                            st.status = TxStatus::Open;
                            st.retry = false;
                        }
                        self.notify_epoch_waiters(&mut st);
                        return Err(e);
                    }
                }
            };

            pf_trace!(
                "sending commit attempt {} to rank {} tag {}",
                attempt,
                req.endpoint.rank,
                req.endpoint.tag
            );
            let res = transport.send(req).await;

            let next = {
                let mut st = self.state();
                if st.attempt != attempt {
                    return Err(ShardTxError::code(
                        ErrCode::Canceled,
                        "commit attempt superseded",
                    ));
                }
                self.check_committing(&st)?;
                self.on_reply(&mut st, res)
            };

            match next {
                Next::Done(res) => return res,
                Next::Refresh(min_version, delay) => {
                    match pool.refresh_task(min_version).await {
                        Ok(Ok(version)) => {
                            let mut st = self.state();
                            if version != st.pm_ver {
                                st.reprepare = true;
                            }
                        }
                        Ok(Err(e)) => pf_warn!("pool map refresh failed: {}", e),
                        Err(e) => pf_warn!("pool map refresh task error: {}", e),
                    }
                    if !delay.is_zero() {
                        time::sleep(delay).await;
                    }
                }
                Next::Resend(delay) => {
                    if !delay.is_zero() {
                        time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Fails with `Canceled` if the transaction was closed or aborted while
    /// a commit attempt was in flight.
    fn check_committing(&self, st: &TxState) -> Result<(), ShardTxError> {
        if st.closed {
            pf_debug!("tx {:?} closed during commit", st.xid);
            return Err(ShardTxError::code(
                ErrCode::Canceled,
                "tx closed during commit",
            ));
        }
        if st.status != TxStatus::Committing {
            pf_debug!("tx {:?} became {} during commit", st.xid, st.status);
            return Err(ShardTxError::code(
                ErrCode::Canceled,
                format!("tx became {} during commit", st.status),
            ));
        }
        Ok(())
    }

    /// Builds the request of the next commit attempt, preparing it first
    /// unless the prepared one is being resent.
    fn build_request(
        &self,
        st: &mut TxState,
        current: MapVersion,
    ) -> Result<(RpcRequest, u64), ShardTxError> {
        let transport = self.transport().clone();
        if st.reprepare {
            st.release_prepared(transport.as_ref());
            st.pm_ver = current;
            st.reprepare = false;
        } else if st.prepared.is_none() {
            Self::check_pool_map_locked(st, current)?;
        }

        if st.prepared.is_none() || !st.retry {
            st.release_prepared(transport.as_ref());
            let prepared = match self.prepare(st) {
                Ok(prepared) => prepared,
                Err(e) if e.errcode() == ErrCode::Stale => {
                    st.status = TxStatus::Failed;
                    return Err(ShardTxError::code(
                        ErrCode::TxRestart,
                        format!("pool map changed during classification: {}", e),
                    ));
                }
                Err(e) => return Err(e),
            };
            st.leader = Some(prepared.leader);
            st.prepared = Some(prepared);
        }

        let starve_threshold = self.0.cont.config().starve_threshold;
        let (mut cpd, leader) = match &st.prepared {
            Some(prepared) => {
                pf_trace!(
                    "tx {:?} attempt {} at map version {}",
                    st.xid,
                    st.attempt + 1,
                    prepared.map_version
                );
                (prepared.cpd.clone(), prepared.leader)
            }
            None => {
                return logged_err!(ErrCode::Proto; "tx {:?} not prepared", st.xid);
            }
        };
        if st.set_resend {
            cpd.flags.insert(CpdFlags::RESEND);
        }
        if st.retry_cnt > starve_threshold {
            cpd.flags.insert(CpdFlags::MAYBE_STARVING);
        }

        st.attempt += 1;
        let req = transport.create_request(
            leader.endpoint(),
            RpcOpcode::TxCommit,
            RpcBody::Cpd(cpd),
        )?;
        Ok((req, st.attempt))
    }

    /// Prepares the compound request: prepares update values, classifies
    /// every sub-request, reduces redundancy groups, orders the targets
    /// leader-first, and packs the four sections.
    fn prepare(&self, st: &mut TxState) -> Result<Prepared, ShardTxError> {
        let cont = &self.0.cont;
        let pool = cont.pool();
        let placement = pool.placement().as_ref();
        let transport = pool.transport().as_ref();
        let config = cont.config();

        for req in st.cache.iter_mut() {
            if req.opc() == SubOpc::Update {
                let class = placement.object_attrs(&req.oid)?.class;
                prepare_update(req, class, config, transport)?;
            }
        }

        let cls = classify(&st.cache, placement, st.pm_ver)?;
        let leader = cls.leader.tgt;
        let leader_oid = cls.leader.oid;
        let reduced = reduce_rdgs(cls.rdgs, cls.leader.rdg);
        let single = is_single_rdg(&reduced, cls.groups.keys());

        let leader_grp = match cls.groups.get(&leader) {
            Some(grp) => grp,
            None => {
                return logged_err!(ErrCode::Proto;
                                   "leader {} has no dispatch group", leader);
            }
        };
        let ordered: Vec<&DispatchGroup> = std::iter::once(leader_grp)
            .chain(cls.groups.values().filter(|g| g.tgt.tgt_id != leader))
            .collect();

        let mut mbs_flags = MbsFlags::CONTAIN_LEADER;
        if single {
            mbs_flags.insert(MbsFlags::SINGLE_RDG);
        }
        let membership = Membership {
            leader,
            flags: mbs_flags,
            tgt_cnt: u32::try_from(ordered.len())?,
            grp_cnt: u32::try_from(reduced.len())?,
            tgts: ordered
                .iter()
                .map(|g| TargetDescriptor {
                    id: g.tgt.tgt_id,
                    rdonly: g.write_cnt == 0,
                })
                .collect(),
            groups: if single { vec![] } else { reduced },
        };

        let head = TransactionHead {
            xid: st.xid,
            leader_oid,
            epoch: st.epoch,
            flags: if st.epoch.uncertain {
                HeadFlags::EPOCH_UNCERTAIN
            } else {
                HeadFlags::empty()
            },
            membership,
        };
        let sub_reqs = st
            .cache
            .iter()
            .enumerate()
            .map(|(idx, req)| {
                req.to_wire(cls.ec_tgts.get(&(idx as u32)).cloned())
            })
            .collect::<Result<Vec<WireSubReq>, _>>()?;
        let disp: Vec<DispatchEntry> = ordered
            .iter()
            .map(|g| DispatchEntry {
                tgt: g.tgt,
                read_cnt: g.read_cnt,
                write_cnt: g.write_cnt,
                reqs: g.reqs.clone(),
            })
            .collect();
        let tgts: Vec<ShardTarget> = ordered.iter().map(|g| g.tgt).collect();

        let limit = config.inline_limit;
        let mut section_bulks = vec![];
        let packed = (|| {
            Ok::<_, ShardTxError>((
                pack_one("head", &head, limit, transport, &mut section_bulks)?,
                pack_one("sub_reqs", &sub_reqs, limit, transport, &mut section_bulks)?,
                pack_one("disp", &disp, limit, transport, &mut section_bulks)?,
                pack_one("tgts", &tgts, limit, transport, &mut section_bulks)?,
            ))
        })();
        let (head_sec, reqs_sec, disp_sec, tgts_sec) = match packed {
            Ok(sections) => sections,
            Err(e) => {
                for handle in &section_bulks {
                    if let Err(re) = transport.release_bulk(handle) {
                        pf_warn!(
                            "error releasing section bulk {}: {}",
                            handle.id,
                            re
                        );
                    }
                }
                return Err(e);
            }
        };

        let mut bulks = section_bulks.clone();
        for req in &sub_reqs {
            if let SubReqBody::Update {
                values: UpdateValues::Bulk(handles),
                ..
            } = &req.body
            {
                bulks.extend(handles.iter().copied());
            }
        }

        let mut flags = CpdFlags::LEADER;
        if st.cache.write_count() == 0 {
            flags.insert(CpdFlags::READONLY);
        }

        pf_debug!(
            "prepared tx {:?} epoch {} flags {:?} ver {} leader {} r {} w {} \
             tgts {} grps {} sections {}/{}/{}/{} bulks {}",
            st.xid,
            st.epoch.value,
            flags,
            st.pm_ver,
            leader,
            st.cache.read_count(),
            st.cache.write_count(),
            head.membership.tgt_cnt,
            head.membership.grp_cnt,
            section_desc(&head_sec),
            section_desc(&reqs_sec),
            section_desc(&disp_sec),
            section_desc(&tgts_sec),
            bulks.len()
        );

        Ok(Prepared {
            cpd: CompoundRequest {
                pool_id: pool.pool_id(),
                co_hdl: cont.co_hdl(),
                co_id: cont.co_id(),
                map_version: st.pm_ver,
                flags,
                head: head_sec,
                sub_reqs: reqs_sec,
                disp: disp_sec,
                tgts: tgts_sec,
                bulks,
            },
            leader: leader_grp.tgt,
            map_version: st.pm_ver,
            section_bulks,
        })
    }

    /// Marks the next attempt as a resend.
    fn mark_resend(&self, st: &mut TxState) {
        st.retry = true;
        st.set_resend = true;
        st.retry_cnt += 1;
        let threshold = self.0.cont.config().starve_threshold;
        if st.retry_cnt > threshold {
            pf_warn!(
                "tx {:?} resent {} times, may be starving",
                st.xid,
                st.retry_cnt
            );
        }
    }

    /// Interprets the outcome of a commit attempt. This is the only place
    /// commit status transitions happen.
    fn on_reply(
        &self,
        st: &mut TxState,
        res: Result<RpcReply, ShardTxError>,
    ) -> Next {
        let (status, reply_epoch, reply_ver) = match res {
            Ok(RpcReply::Cpd(reply)) => {
                for (idx, ret) in reply.sub_rets.iter().enumerate() {
                    if *ret != ErrCode::Success {
                        pf_debug!(
                            "tx {:?} sub-request {} replied {:?}",
                            st.xid,
                            idx,
                            ret
                        );
                    }
                }
                (reply.status, reply.epoch, reply.map_version)
            }
            Ok(reply) => {
                pf_error!("unexpected reply to commit: {:?}", reply);
                (ErrCode::Proto, 0, 0)
            }
            Err(e) => {
                pf_debug!("commit of tx {:?} send error: {}", st.xid, e);
                (e.errcode(), 0, 0)
            }
        };
        let transport = self.transport().clone();

        match status {
            ErrCode::Success => {
                if !st.epoch.is_chosen() {
                    if reply_epoch == 0 {
                        pf_warn!("server forgot the epoch of tx {:?}", st.xid);
                    } else {
                        st.epoch.value = reply_epoch;
                        if st.epoch.first == 0 {
                            st.epoch.first = reply_epoch;
                        }
                    }
                } else if reply_epoch != 0 && reply_epoch != st.epoch.value {
                    pf_warn!(
                        "server epoch {} contradicts tx {:?} epoch {}",
                        reply_epoch,
                        st.xid,
                        st.epoch.value
                    );
                }
                st.epoch.uncertain = false;
                st.status = TxStatus::Committed;
                st.retry = false;
                st.release_all(transport.as_ref());
                self.notify_epoch_waiters(st);
                pf_debug!(
                    "committed tx {:?} at epoch {} after {} resends",
                    st.xid,
                    st.epoch.value,
                    st.retry_cnt
                );
                Next::Done(Ok(()))
            }

            ErrCode::TxIdRepeated | ErrCode::EpochOld
                if status == ErrCode::TxIdRepeated
                    || !st.cache.has_conditions() =>
            {
                let old = st.xid;
                st.xid = DtxId::generate();
                st.status = TxStatus::Failed;
                st.release_prepared(transport.as_ref());
                self.notify_epoch_waiters(st);
                pf_info!("tx {:?} got {:?}, renamed to {:?}", old, status, st.xid);
                Next::Done(Err(ShardTxError::code(
                    ErrCode::TxRestart,
                    format!("commit replied {:?}", status),
                )))
            }

            ErrCode::TxRestart => {
                st.status = TxStatus::Failed;
                if reply_ver > st.pm_ver {
                    // detached; the restarted attempt picks the new map up
                    drop(self.0.cont.pool().refresh_task(reply_ver));
                }
                self.notify_epoch_waiters(st);
                Next::Done(Err(ShardTxError::code(
                    ErrCode::TxRestart,
                    "server requires tx restart",
                )))
            }

            code if code.needs_map_refresh() => {
                self.mark_resend(st);
                Next::Refresh(reply_ver.max(st.pm_ver), st.backoff.next_delay())
            }

            code if code.is_retryable() => {
                self.mark_resend(st);
                Next::Resend(st.backoff.next_delay())
            }

            code => {
                st.status = TxStatus::Aborted;
                st.retry = false;
                st.release_all(transport.as_ref());
                self.notify_epoch_waiters(st);
                pf_warn!("commit of tx {:?} failed: {:?}", st.xid, code);
                Next::Done(Err(ShardTxError::code(
                    code,
                    format!("commit failed with {:?}", code),
                )))
            }
        }
    }
}
