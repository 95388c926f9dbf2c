//! Redundancy-group reducer: merges identical per-sub-request redundancy
//! group records into a minimal list headed by the leader's record.

use std::collections::{BTreeSet, VecDeque};

use crate::wire::{RedundancyGroup, TargetId};

/// Are two records the same redundancy group? Members are compared
/// positionally, so the same set visited in a different order counts as a
/// different group.
pub(crate) fn same_rdg(a: &RedundancyGroup, b: &RedundancyGroup) -> bool {
    a.ids.len() == b.ids.len() && a.redundancy == b.redundancy && a.ids == b.ids
}

/// Reduces the records: the record at `leader_rdg` (the one whose
/// classification elected the leader) is moved to the front, then every
/// record absorbs all later identical ones until the remainder is empty. A
/// merged record is read-only only if all of its inputs were.
pub(crate) fn reduce_rdgs(
    rdgs: Vec<RedundancyGroup>,
    leader_rdg: usize,
) -> Vec<RedundancyGroup> {
    let mut rest: VecDeque<RedundancyGroup> = rdgs.into();
    if let Some(rec) = rest.remove(leader_rdg) {
        rest.push_front(rec);
    }

    let mut reduced = Vec::with_capacity(rest.len());
    while let Some(mut head) = rest.pop_front() {
        rest.retain(|rec| {
            if same_rdg(&head, rec) {
                head.rdonly &= rec.rdonly;
                false
            } else {
                true
            }
        });
        reduced.push(head);
    }
    reduced
}

/// Can the group list be omitted from the membership? True if exactly one
/// group remains and it covers every touched target.
pub(crate) fn is_single_rdg<'a>(
    reduced: &[RedundancyGroup],
    touched: impl IntoIterator<Item = &'a TargetId>,
) -> bool {
    match reduced {
        [only] => {
            let members: BTreeSet<TargetId> = only.ids.iter().copied().collect();
            let touched: BTreeSet<TargetId> = touched.into_iter().copied().collect();
            members == touched
        }
        _ => false,
    }
}
