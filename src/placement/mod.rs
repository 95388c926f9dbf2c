//! Placement/object-class collaborator: maps an object key to its
//! redundancy group and the group's shards to storage targets.

use std::collections::HashMap;

use crate::utils::{ErrCode, ShardTxError};
use crate::wire::{MapVersion, ObjectId, ShardTarget};

/// Redundancy class of an object.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ObjClass {
    /// Every group holds `replicas` full copies.
    Replicated { replicas: u16 },

    /// Every group holds a stripe of `data` data cells and `parity` parity
    /// cells; parity shards occupy the last `parity` positions of a group.
    ErasureCoded { data: u16, parity: u16 },
}

impl ObjClass {
    /// Number of shards per redundancy group.
    #[inline]
    pub fn grp_size(&self) -> u32 {
        match self {
            ObjClass::Replicated { replicas } => *replicas as u32,
            ObjClass::ErasureCoded { data, parity } => {
                *data as u32 + *parity as u32
            }
        }
    }

    /// Number of group members that may be missing without losing data.
    #[inline]
    pub fn lost_budget(&self) -> u32 {
        match self {
            ObjClass::Replicated { replicas } => {
                (*replicas as u32).saturating_sub(1)
            }
            ObjClass::ErasureCoded { parity, .. } => *parity as u32,
        }
    }

    /// Is the object erasure-coded?
    #[inline]
    pub fn is_ec(&self) -> bool {
        matches!(self, ObjClass::ErasureCoded { .. })
    }
}

/// Placement attributes of an object.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ObjAttrs {
    pub class: ObjClass,

    /// Number of redundancy groups the object is striped over.
    pub grp_nr: u32,
}

impl ObjAttrs {
    /// Total number of shards of the object.
    #[inline]
    pub fn shard_nr(&self) -> u32 {
        self.class.grp_size() * self.grp_nr
    }
}

/// Placement collaborator trait.
pub trait Placement: Send + Sync {
    /// Returns the object's redundancy attributes.
    fn object_attrs(&self, oid: &ObjectId) -> Result<ObjAttrs, ShardTxError>;

    /// Selects the redundancy group holding the given key hash. Fails with
    /// `Stale` if `map_ver` is not the placement's pool map version.
    fn resolve_group(
        &self,
        oid: &ObjectId,
        dkey_hash: u64,
        map_ver: MapVersion,
    ) -> Result<u32, ShardTxError>;

    /// Looks up the target of one object shard. Fails with `NonExist` if the
    /// shard currently has no live target.
    fn open_shard(
        &self,
        oid: &ObjectId,
        shard_idx: u32,
        map_ver: MapVersion,
    ) -> Result<ShardTarget, ShardTxError>;
}

/// Shard layout of one object.
#[derive(Debug, Clone)]
struct ObjLayout {
    attrs: ObjAttrs,

    /// Target of each shard, `None` if lost.
    shards: Vec<Option<ShardTarget>>,
}

/// Immutable placement snapshot at one pool map version.
#[derive(Debug, Clone, Default)]
pub struct PlacementMap {
    /// Pool map version this snapshot was computed at.
    version: MapVersion,

    /// Map from object ID -> shard layout.
    objects: HashMap<ObjectId, ObjLayout>,
}

impl PlacementMap {
    /// Creates an empty placement snapshot.
    pub fn new(version: MapVersion) -> Self {
        PlacementMap {
            version,
            objects: HashMap::new(),
        }
    }

    /// Pool map version of this snapshot.
    #[inline]
    pub fn version(&self) -> MapVersion {
        self.version
    }

    /// Adds an object layout. The shard list must cover every group.
    pub fn insert(
        &mut self,
        oid: ObjectId,
        attrs: ObjAttrs,
        shards: Vec<ShardTarget>,
    ) -> Result<(), ShardTxError> {
        if attrs.grp_nr == 0 || attrs.class.grp_size() == 0 {
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!("invalid object attrs {:?}", attrs),
            ));
        }
        if shards.len() != attrs.shard_nr() as usize {
            return Err(ShardTxError::code(
                ErrCode::Inval,
                format!(
                    "object {:?} expects {} shards, got {}",
                    oid,
                    attrs.shard_nr(),
                    shards.len()
                ),
            ));
        }
        self.objects.insert(
            oid,
            ObjLayout {
                attrs,
                shards: shards.into_iter().map(Some).collect(),
            },
        );
        Ok(())
    }

    /// Derives the snapshot of the next pool map version, optionally marking
    /// some object shards as lost.
    pub fn next_version(&self, lost: &[(ObjectId, u32)]) -> Self {
        let mut next = self.clone();
        next.version += 1;
        for (oid, shard_idx) in lost {
            if let Some(slot) = next
                .objects
                .get_mut(oid)
                .and_then(|l| l.shards.get_mut(*shard_idx as usize))
            {
                *slot = None;
            }
        }
        next
    }

    /// Targets of all shards of an object in shard order.
    pub fn shards_of(&self, oid: &ObjectId) -> Option<Vec<Option<ShardTarget>>> {
        self.objects.get(oid).map(|l| l.shards.clone())
    }

    fn layout(&self, oid: &ObjectId) -> Result<&ObjLayout, ShardTxError> {
        self.objects.get(oid).ok_or_else(|| {
            ShardTxError::code(
                ErrCode::NonExist,
                format!("object {:?} not found", oid),
            )
        })
    }

    fn check_version(&self, map_ver: MapVersion) -> Result<(), ShardTxError> {
        if map_ver != self.version {
            return Err(ShardTxError::code(
                ErrCode::Stale,
                format!(
                    "pool map version {} mismatches placement {}",
                    map_ver, self.version
                ),
            ));
        }
        Ok(())
    }
}

impl Placement for PlacementMap {
    fn object_attrs(&self, oid: &ObjectId) -> Result<ObjAttrs, ShardTxError> {
        Ok(self.layout(oid)?.attrs)
    }

    fn resolve_group(
        &self,
        oid: &ObjectId,
        dkey_hash: u64,
        map_ver: MapVersion,
    ) -> Result<u32, ShardTxError> {
        let layout = self.layout(oid)?;
        self.check_version(map_ver)?;
        Ok((dkey_hash % layout.attrs.grp_nr as u64) as u32)
    }

    fn open_shard(
        &self,
        oid: &ObjectId,
        shard_idx: u32,
        map_ver: MapVersion,
    ) -> Result<ShardTarget, ShardTxError> {
        let layout = self.layout(oid)?;
        self.check_version(map_ver)?;
        match layout.shards.get(shard_idx as usize) {
            Some(Some(tgt)) => Ok(*tgt),
            Some(None) => Err(ShardTxError::code(
                ErrCode::NonExist,
                format!("shard {} of {:?} lost", shard_idx, oid),
            )),
            None => Err(ShardTxError::code(
                ErrCode::Inval,
                format!("shard {} of {:?} out of range", shard_idx, oid),
            )),
        }
    }
}

#[cfg(test)]
mod placement_tests {
    use super::*;

    fn tgt(id: u32) -> ShardTarget {
        ShardTarget {
            rank: id / 4,
            tgt_id: id,
            tag: id % 4,
        }
    }

    #[test]
    fn class_budgets() {
        let rep = ObjClass::Replicated { replicas: 3 };
        assert_eq!(rep.grp_size(), 3);
        assert_eq!(rep.lost_budget(), 2);
        let ec = ObjClass::ErasureCoded { data: 4, parity: 2 };
        assert_eq!(ec.grp_size(), 6);
        assert_eq!(ec.lost_budget(), 2);
        assert!(ec.is_ec());
    }

    #[test]
    fn insert_validates() {
        let mut map = PlacementMap::new(1);
        let attrs = ObjAttrs {
            class: ObjClass::Replicated { replicas: 2 },
            grp_nr: 2,
        };
        let oid = ObjectId::new(0, 1);
        assert!(map.insert(oid, attrs, vec![tgt(0), tgt(1)]).is_err());
        assert!(map
            .insert(oid, attrs, vec![tgt(0), tgt(1), tgt(2), tgt(3)])
            .is_ok());
    }

    #[test]
    fn resolve_and_open() -> Result<(), ShardTxError> {
        let mut map = PlacementMap::new(5);
        let attrs = ObjAttrs {
            class: ObjClass::Replicated { replicas: 2 },
            grp_nr: 2,
        };
        let oid = ObjectId::new(0, 1);
        map.insert(oid, attrs, vec![tgt(0), tgt(1), tgt(2), tgt(3)])?;
        assert_eq!(map.resolve_group(&oid, 7, 5)?, 1);
        assert_eq!(
            map.resolve_group(&oid, 7, 4).unwrap_err().errcode(),
            ErrCode::Stale
        );
        assert_eq!(map.open_shard(&oid, 2, 5)?, tgt(2));

        let next = map.next_version(&[(oid, 2)]);
        assert_eq!(next.version(), 6);
        assert_eq!(
            next.open_shard(&oid, 2, 6).unwrap_err().errcode(),
            ErrCode::NonExist
        );
        assert_eq!(
            next.object_attrs(&ObjectId::new(9, 9)).unwrap_err().errcode(),
            ErrCode::NonExist
        );
        Ok(())
    }
}
