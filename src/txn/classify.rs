//! Redundancy-group classifier: resolves every buffered sub-request to its
//! shards, builds per-target dispatch groups and per-sub-request redundancy
//! group records, and elects the leader target.

use std::collections::{BTreeMap, HashMap};

use crate::placement::{ObjClass, Placement};
use crate::txn::cache::{SubReq, SubReqCache};
use crate::utils::{ErrCode, ShardTxError};
use crate::wire::{
    EcShardTgt, MapVersion, RedundancyGroup, ReqIndex, ShardTarget, SubOpc,
    TargetId, UnitObjectId,
};

/// Sub-requests assigned to one storage target.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct DispatchGroup {
    pub(crate) tgt: ShardTarget,
    pub(crate) read_cnt: u32,
    pub(crate) write_cnt: u32,

    /// Assigned sub-requests in attach order.
    pub(crate) reqs: Vec<ReqIndex>,
}

impl DispatchGroup {
    fn new(tgt: ShardTarget) -> Self {
        DispatchGroup {
            tgt,
            read_cnt: 0,
            write_cnt: 0,
            reqs: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn total(&self) -> u32 {
        self.read_cnt + self.write_cnt
    }
}

/// Elected leader target, with the redundancy group record and the object
/// shard whose classification elected it.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub(crate) struct Leader {
    pub(crate) tgt: TargetId,

    /// Index into `Classified::rdgs`.
    pub(crate) rdg: usize,

    pub(crate) oid: UnitObjectId,
}

/// Output of classifying all sub-requests of a transaction.
#[derive(Debug, Clone)]
pub(crate) struct Classified {
    /// Map from target ID -> dispatch group.
    pub(crate) groups: BTreeMap<TargetId, DispatchGroup>,

    /// One record per touched redundancy group per sub-request, in
    /// sub-request order.
    pub(crate) rdgs: Vec<RedundancyGroup>,

    /// Map from sub-request index -> touched (shard, target) pairs, for EC
    /// updates only.
    pub(crate) ec_tgts: HashMap<u32, Vec<EcShardTgt>>,

    pub(crate) leader: Leader,

    /// Has any shard been assigned yet?
    elected: bool,
}

/// Leader preference: a target with writes beats one with only reads;
/// among targets with writes, more sub-requests wins; among read-only
/// targets, more reads wins.
pub(crate) fn better_leader(cand: &DispatchGroup, cur: &DispatchGroup) -> bool {
    match (cand.write_cnt > 0, cur.write_cnt > 0) {
        (true, false) => true,
        (false, true) => false,
        (true, true) => cand.total() > cur.total(),
        (false, false) => cand.read_cnt > cur.read_cnt,
    }
}

/// Does `cand` replace the current leader? The first touched target is
/// always elected; afterwards only a strictly better target takes over, so
/// ties keep the earlier one.
pub(crate) fn takes_over(
    cand: &DispatchGroup,
    cur: Option<&DispatchGroup>,
) -> bool {
    match cur {
        None => true,
        Some(cur) => {
            cand.tgt.tgt_id != cur.tgt.tgt_id && better_leader(cand, cur)
        }
    }
}

/// Classifies every sub-request of the cache against the placement view at
/// `map_ver`.
pub(crate) fn classify(
    cache: &SubReqCache,
    placement: &dyn Placement,
    map_ver: MapVersion,
) -> Result<Classified, ShardTxError> {
    let mut out = Classified {
        groups: BTreeMap::new(),
        rdgs: Vec::new(),
        ec_tgts: HashMap::new(),
        leader: Leader::default(),
        elected: false,
    };

    for (req_idx, req) in cache.iter().enumerate() {
        let req_idx = u32::try_from(req_idx)?;
        let attrs = placement.object_attrs(&req.oid)?;
        let grps = if req.opc() == SubOpc::PunchObj {
            0..attrs.grp_nr
        } else {
            let grp =
                placement.resolve_group(&req.oid, req.dkey_hash, map_ver)?;
            grp..grp + 1
        };
        for grp in grps {
            classify_group(
                &mut out,
                req,
                req_idx,
                grp,
                attrs.class,
                placement,
                map_ver,
            )?;
        }
    }

    if !out.elected {
        return logged_err!(ErrCode::Inval; "no target touched by transaction");
    }
    pf_trace!(
        "classified {} targets {} rdgs leader {:?}",
        out.groups.len(),
        out.rdgs.len(),
        out.leader
    );
    Ok(out)
}

/// Classifies one sub-request against one redundancy group of its object.
/// Shards are visited from the highest index down, so parity shards of EC
/// groups come first. The leader is re-evaluated after every assigned
/// shard.
fn classify_group(
    out: &mut Classified,
    req: &SubReq,
    req_idx: u32,
    grp: u32,
    class: ObjClass,
    placement: &dyn Placement,
    map_ver: MapVersion,
) -> Result<(), ShardTxError> {
    let grp_size = class.grp_size();
    let start = grp * grp_size;
    let is_write = req.opc().is_write();
    let bitmap = req.ec_bitmap();

    let mut rdg = RedundancyGroup {
        ids: Vec::with_capacity(grp_size as usize),
        redundancy: 0,
        rdonly: !is_write,
    };
    let mut ec_tgts = Vec::new();
    let mut lost = 0;

    for off in (0..grp_size).rev() {
        if let Some(map) = bitmap {
            if !map.get(off as u16) {
                continue;
            }
        }
        let shard_idx = start + off;
        let tgt = match placement.open_shard(&req.oid, shard_idx, map_ver) {
            Ok(tgt) => tgt,
            Err(e) if e.errcode() == ErrCode::NonExist => {
                lost += 1;
                if lost > class.lost_budget() {
                    return logged_err!(ErrCode::Io;
                                       "too many group members lost: obj {:?} grp {} lost {}",
                                       req.oid, grp, lost);
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let group = out
            .groups
            .entry(tgt.tgt_id)
            .or_insert_with(|| DispatchGroup::new(tgt));
        if is_write {
            group.write_cnt += 1;
        } else {
            group.read_cnt += 1;
        }
        group.reqs.push(ReqIndex { shard_idx, req_idx });

        let cur = if out.elected {
            out.groups.get(&out.leader.tgt)
        } else {
            None
        };
        if let Some(cand) = out.groups.get(&tgt.tgt_id) {
            if takes_over(cand, cur) {
                out.leader = Leader {
                    tgt: tgt.tgt_id,
                    rdg: out.rdgs.len(),
                    oid: UnitObjectId {
                        oid: req.oid,
                        shard: shard_idx,
                    },
                };
                out.elected = true;
            }
        }
        rdg.ids.push(tgt.tgt_id);
        if bitmap.is_some() {
            ec_tgts.push(EcShardTgt {
                shard: off as u16,
                tgt_id: tgt.tgt_id,
            });
        }
    }

    if rdg.ids.is_empty() {
        return logged_err!(ErrCode::Io;
                           "no live shard in group {} of obj {:?}",
                           grp, req.oid);
    }

    // punching a whole object touches every group member
    rdg.redundancy = match class {
        ObjClass::ErasureCoded { parity, .. }
            if req.opc() != SubOpc::PunchObj =>
        {
            parity as u32 + 1
        }
        _ => rdg.ids.len() as u32,
    };
    out.rdgs.push(rdg);

    if !ec_tgts.is_empty() {
        ec_tgts.sort_by_key(|t| t.shard);
        out.ec_tgts.entry(req_idx).or_default().extend(ec_tgts);
    }
    Ok(())
}

#[cfg(test)]
mod classify_tests {
    use super::*;
    use crate::placement::{ObjAttrs, PlacementMap};
    use crate::txn::cache::{SubReqKind, UpdatePrep};
    use crate::utils::Bitmap;
    use crate::wire::{dkey_hash, ObjectId};
    use bytes::Bytes;
    use rand::seq::SliceRandom;

    fn tgt(id: u32) -> ShardTarget {
        ShardTarget {
            rank: id / 2,
            tgt_id: id,
            tag: id % 2,
        }
    }

    fn group(id: u32, reads: u32, writes: u32) -> DispatchGroup {
        DispatchGroup {
            tgt: tgt(id),
            read_cnt: reads,
            write_cnt: writes,
            reqs: vec![],
        }
    }

    fn punch(oid: ObjectId, dkey: &str) -> SubReq {
        SubReq {
            oid,
            dkey: Bytes::from(dkey.to_string()),
            dkey_hash: dkey_hash(dkey.as_bytes()),
            api_flags: 0,
            kind: SubReqKind::PunchDkey,
        }
    }

    fn read(oid: ObjectId, dkey: &str) -> SubReq {
        SubReq {
            kind: SubReqKind::Read { akeys: vec![] },
            ..punch(oid, dkey)
        }
    }

    #[test]
    fn leader_rules() {
        assert!(better_leader(&group(1, 0, 1), &group(2, 9, 0)));
        assert!(!better_leader(&group(1, 9, 0), &group(2, 0, 1)));
        assert!(better_leader(&group(1, 2, 2), &group(2, 0, 3)));
        assert!(!better_leader(&group(1, 1, 2), &group(2, 0, 3)));
        assert!(better_leader(&group(1, 3, 0), &group(2, 2, 0)));
    }

    fn fold_leader<'a>(
        groups: impl IntoIterator<Item = &'a DispatchGroup>,
    ) -> Option<TargetId> {
        let mut cur: Option<&DispatchGroup> = None;
        for cand in groups {
            if takes_over(cand, cur) {
                cur = Some(cand);
            }
        }
        cur.map(|g| g.tgt.tgt_id)
    }

    #[test]
    fn leader_determinism() {
        let mut rng = rand::thread_rng();
        let mut groups = vec![
            group(4, 1, 2),
            group(9, 0, 2),
            group(2, 3, 0),
            group(7, 1, 1),
            group(5, 0, 0),
        ];
        for _ in 0..50 {
            groups.shuffle(&mut rng);
            assert_eq!(fold_leader(groups.iter()), Some(4));
        }
        assert_eq!(fold_leader(std::iter::empty()), None);
    }

    #[test]
    fn leader_ties_keep_first() {
        let tied = [group(3, 0, 2), group(1, 0, 2)];
        assert_eq!(fold_leader(tied.iter()), Some(3));
        assert_eq!(fold_leader(tied.iter().rev()), Some(1));
        assert!(!takes_over(&group(3, 0, 5), Some(&group(3, 0, 2))));
    }

    fn replicated_map(replicas: u16, grp_nr: u32) -> (PlacementMap, ObjectId) {
        let mut map = PlacementMap::new(1);
        let oid = ObjectId::new(1, 1);
        let attrs = ObjAttrs {
            class: ObjClass::Replicated { replicas },
            grp_nr,
        };
        let shards = (0..attrs.shard_nr()).map(tgt).collect();
        assert!(map.insert(oid, attrs, shards).is_ok());
        (map, oid)
    }

    #[test]
    fn classify_single_group() -> Result<(), ShardTxError> {
        let (map, oid) = replicated_map(3, 1);
        let mut cache = SubReqCache::new(16, false);
        cache.push(punch(oid, "d1"))?;
        cache.push(punch(oid, "d2"))?;
        cache.push(read(oid, "d3"))?;

        let out = classify(&cache, &map, 1)?;
        assert_eq!(out.groups.len(), 3);
        assert_eq!(out.rdgs.len(), 3);
        for g in out.groups.values() {
            assert_eq!((g.read_cnt, g.write_cnt), (1, 2));
            // read first in wire order, then writes in attach order
            let idxs: Vec<u32> = g.reqs.iter().map(|r| r.req_idx).collect();
            assert_eq!(idxs, vec![0, 1, 2]);
        }
        assert_eq!(out.rdgs[0].ids, vec![2, 1, 0]);
        assert!(out.rdgs[0].rdonly);
        assert!(!out.rdgs[1].rdonly);
        assert_eq!(out.rdgs[1].redundancy, 3);
        // first visited shard of the first punch, never outgrown after
        assert_eq!(out.leader.tgt, 2);
        assert_eq!(out.leader.rdg, 0);
        assert_eq!(out.leader.oid, UnitObjectId { oid, shard: 2 });
        Ok(())
    }

    #[test]
    fn classify_punch_obj_all_groups() -> Result<(), ShardTxError> {
        let (map, oid) = replicated_map(2, 3);
        let mut cache = SubReqCache::new(4, false);
        cache.push(SubReq {
            kind: SubReqKind::PunchObj,
            ..punch(oid, "")
        })?;
        let out = classify(&cache, &map, 1)?;
        assert_eq!(out.groups.len(), 6);
        assert_eq!(out.rdgs.len(), 3);
        Ok(())
    }

    #[test]
    fn classify_lost_budget() -> Result<(), ShardTxError> {
        let (map, oid) = replicated_map(3, 1);
        let mut cache = SubReqCache::new(4, false);
        cache.push(punch(oid, "d"))?;

        let map1 = map.next_version(&[(oid, 0), (oid, 2)]);
        let out = classify(&cache, &map1, 2)?;
        assert_eq!(out.rdgs[0].ids, vec![1]);
        assert_eq!(out.leader.tgt, 1);

        let map2 = map.next_version(&[(oid, 0), (oid, 1), (oid, 2)]);
        let err = classify(&cache, &map2, 2).unwrap_err();
        assert_eq!(err.errcode(), ErrCode::Io);
        Ok(())
    }

    #[test]
    fn classify_stale() -> Result<(), ShardTxError> {
        let (map, oid) = replicated_map(2, 1);
        let mut cache = SubReqCache::new(4, false);
        cache.push(punch(oid, "d"))?;
        let err = classify(&cache, &map, 7).unwrap_err();
        assert_eq!(err.errcode(), ErrCode::Stale);
        Ok(())
    }

    #[test]
    fn classify_ec_bitmap() -> Result<(), ShardTxError> {
        let mut map = PlacementMap::new(1);
        let oid = ObjectId::new(2, 2);
        let attrs = ObjAttrs {
            class: ObjClass::ErasureCoded { data: 4, parity: 2 },
            grp_nr: 1,
        };
        map.insert(oid, attrs, (10..16).map(tgt).collect())?;

        let mut cache = SubReqCache::new(4, false);
        cache.push(SubReq {
            kind: SubReqKind::Update {
                akeys: vec![Bytes::from_static(b"a")],
                values: vec![Bytes::from_static(b"v")],
                prep: Some(UpdatePrep {
                    iods: vec![],
                    values: vec![],
                    ec: Some((4, 2, Bitmap::from_ones(6, [0, 4, 5])?)),
                    bulks: None,
                }),
            },
            ..punch(oid, "d")
        })?;
        let out = classify(&cache, &map, 1)?;
        assert_eq!(out.groups.len(), 3);
        assert_eq!(out.rdgs[0].ids, vec![15, 14, 10]);
        assert_eq!(out.rdgs[0].redundancy, 3);
        let shards: Vec<u16> =
            out.ec_tgts[&0].iter().map(|t| t.shard).collect();
        assert_eq!(shards, vec![0, 4, 5]);
        Ok(())
    }

    #[test]
    fn classify_leader_record_mixed() -> Result<(), ShardTxError> {
        let mut map = PlacementMap::new(1);
        let (oa, ob) = (ObjectId::new(3, 1), ObjectId::new(3, 2));
        let attrs = ObjAttrs {
            class: ObjClass::Replicated { replicas: 3 },
            grp_nr: 1,
        };
        map.insert(oa, attrs, vec![tgt(0), tgt(1), tgt(2)])?;
        map.insert(ob, attrs, vec![tgt(0), tgt(3), tgt(4)])?;

        let mut cache = SubReqCache::new(8, false);
        cache.push(read(oa, "d1"))?;
        cache.push(punch(ob, "d2"))?;
        let out = classify(&cache, &map, 1)?;

        // target 0 serves both, so it outranks the write-only targets
        assert_eq!(out.leader.tgt, 0);
        assert_eq!(out.leader.rdg, 1);
        assert_eq!(out.leader.oid, UnitObjectId { oid: ob, shard: 0 });
        let reduced = crate::txn::reduce::reduce_rdgs(out.rdgs, out.leader.rdg);
        assert_eq!(reduced[0].ids, vec![4, 3, 0]);
        assert!(!reduced[0].rdonly);
        assert!(reduced[1].rdonly);
        Ok(())
    }

    #[test]
    fn classify_ec_redundancy() -> Result<(), ShardTxError> {
        let mut map = PlacementMap::new(1);
        let oid = ObjectId::new(2, 3);
        let attrs = ObjAttrs {
            class: ObjClass::ErasureCoded { data: 4, parity: 2 },
            grp_nr: 1,
        };
        map.insert(oid, attrs, (20..26).map(tgt).collect())?;

        let mut cache = SubReqCache::new(8, false);
        cache.push(read(oid, "d1"))?;
        cache.push(punch(oid, "d2"))?;
        cache.push(SubReq {
            kind: SubReqKind::PunchObj,
            ..punch(oid, "")
        })?;
        let out = classify(&cache, &map, 1)?;
        assert_eq!(out.rdgs.len(), 3);
        assert_eq!(out.rdgs[0].ids.len(), 6);
        assert_eq!(out.rdgs[0].redundancy, 3);
        assert_eq!(out.rdgs[1].redundancy, 3);
        assert_eq!(out.rdgs[2].redundancy, 6);
        Ok(())
    }
}
