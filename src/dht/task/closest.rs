//! Candidate bookkeeping for iterative lookups.

use crate::dht::{ALPHA, K};
use crate::id::Id;
use crate::types::NodeInfo;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Known but not yet queried.
    Fresh,
    /// Query sent, awaiting response.
    InFlight,
    /// Query quiet past the stall mark; slot freed, call still pending.
    Stalled,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub info: NodeInfo,
    pub state: CandidateState,
    pub token: Option<u32>,
}

/// The ordered working set of a lookup: candidates by XOR distance to the
/// target, bounded to α+K. State transitions are monotonic per candidate
/// (fresh → in-flight → stalled/responded/failed).
#[derive(Debug)]
pub struct ClosestSet {
    target: Id,
    capacity: usize,
    candidates: Vec<Candidate>,
    inserted: HashSet<Id>,
}

impl ClosestSet {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            capacity: ALPHA + K,
            candidates: Vec::with_capacity(ALPHA + K + 1),
            inserted: HashSet::new(),
        }
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Insert a candidate, keeping distance order and the size bound.
    /// Re-insertions of anything seen before are ignored.
    pub fn add(&mut self, info: NodeInfo) {
        if !self.inserted.insert(info.id) {
            return;
        }
        let pos = self
            .candidates
            .partition_point(|c| self.target.three_way_compare(&c.info.id, &info.id)
                != std::cmp::Ordering::Greater);
        self.candidates.insert(
            pos,
            Candidate {
                info,
                state: CandidateState::Fresh,
                token: None,
            },
        );
        self.prune();
    }

    fn prune(&mut self) {
        while self.candidates.len() > self.capacity {
            // drop the farthest candidate that is not being queried
            let Some(pos) = self
                .candidates
                .iter()
                .rposition(|c| {
                    !matches!(
                        c.state,
                        CandidateState::InFlight | CandidateState::Stalled
                    )
                })
            else {
                return;
            };
            self.candidates.remove(pos);
        }
    }

    fn responded(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
    }

    /// Id of the K-th closest responded candidate, if K have responded.
    fn kth_responded(&self) -> Option<&Id> {
        self.responded().nth(K - 1).map(|c| &c.info.id)
    }

    /// Next fresh candidate worth querying: either fewer than K responses
    /// exist, or it is closer than the current K-th best.
    pub fn next_fresh(&self) -> Option<NodeInfo> {
        let kth = self.kth_responded();
        self.candidates
            .iter()
            .find(|c| {
                c.state == CandidateState::Fresh
                    && match kth {
                        None => true,
                        Some(kth) => {
                            self.target.three_way_compare(&c.info.id, kth)
                                == std::cmp::Ordering::Less
                        }
                    }
            })
            .map(|c| c.info.clone())
    }

    pub fn set_state(&mut self, id: &Id, state: CandidateState) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.info.id == *id) {
            c.state = state;
        }
    }

    pub fn set_token(&mut self, id: &Id, token: u32) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.info.id == *id) {
            c.token = Some(token);
        }
    }

    pub fn state_of(&self, id: &Id) -> Option<CandidateState> {
        self.candidates
            .iter()
            .find(|c| c.info.id == *id)
            .map(|c| c.state)
    }

    pub fn in_flight(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::InFlight)
            .count()
    }

    /// Calls that may still produce progress (in flight or stalled).
    pub fn has_active(&self) -> bool {
        self.candidates.iter().any(|c| {
            matches!(
                c.state,
                CandidateState::InFlight | CandidateState::Stalled
            )
        })
    }

    /// Termination per the lookup algorithm: nothing active and no fresh
    /// candidate closer than the K-th best response.
    pub fn is_done(&self) -> bool {
        !self.has_active() && self.next_fresh().is_none()
    }

    /// The K closest responded nodes, best first.
    pub fn closest_responded(&self, k: usize) -> Vec<NodeInfo> {
        self.responded().take(k).map(|c| c.info.clone()).collect()
    }

    /// Responded nodes that issued a write token.
    pub fn responded_with_tokens(&self, k: usize) -> Vec<(NodeInfo, u32)> {
        self.responded()
            .filter_map(|c| c.token.map(|t| (c.info.clone(), t)))
            .take(k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: Id) -> NodeInfo {
        NodeInfo::new(id, "20.0.0.1:1000".parse().unwrap())
    }

    fn id_at_distance(target: &Id, byte: u8) -> Id {
        let mut bytes = *target.as_bytes();
        bytes[0] ^= byte;
        Id::from_bytes(bytes)
    }

    #[test]
    fn keeps_distance_order() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);
        for byte in [0x80u8, 0x01, 0x40, 0x02, 0x20] {
            set.add(info(id_at_distance(&target, byte)));
        }
        let fresh = set.next_fresh().unwrap();
        assert_eq!(fresh.id, id_at_distance(&target, 0x01));
    }

    #[test]
    fn duplicate_insertions_ignored() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);
        let node = info(id_at_distance(&target, 1));
        set.add(node.clone());
        set.set_state(&node.id, CandidateState::Failed);
        set.add(node.clone());
        assert_eq!(set.state_of(&node.id), Some(CandidateState::Failed));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn prunes_farthest_fresh_beyond_capacity() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);
        for i in 1..=(ALPHA + K + 4) as u8 {
            set.add(info(id_at_distance(&target, i)));
        }
        assert_eq!(set.len(), ALPHA + K);
        // the closest survived
        assert!(set.state_of(&id_at_distance(&target, 1)).is_some());
        assert!(set.state_of(&id_at_distance(&target, (ALPHA + K + 4) as u8)).is_none());
    }

    #[test]
    fn termination_requires_quiescence_and_no_closer_fresh() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);
        assert!(set.is_done()); // empty set is trivially done

        let a = info(id_at_distance(&target, 1));
        set.add(a.clone());
        assert!(!set.is_done());

        set.set_state(&a.id, CandidateState::InFlight);
        assert!(!set.is_done());

        set.set_state(&a.id, CandidateState::Responded);
        assert!(set.is_done());
    }

    #[test]
    fn fresh_candidates_stop_mattering_once_k_closer_responded() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);

        // K closest all responded
        for i in 1..=K as u8 {
            let node = info(id_at_distance(&target, i));
            set.add(node.clone());
            set.set_state(&node.id, CandidateState::Responded);
        }
        // one farther fresh candidate remains
        set.add(info(id_at_distance(&target, 0xf0)));
        assert!(set.next_fresh().is_none());
        assert!(set.is_done());

        // but a closer fresh candidate reopens the search
        set.add(info(id_at_distance(&target, 0)));
        // distance 0 == target itself; craft one closer than the kth
        assert!(set.next_fresh().is_some());
        assert!(!set.is_done());
    }

    #[test]
    fn tokens_ride_along() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);
        let node = info(id_at_distance(&target, 1));
        set.add(node.clone());
        set.set_state(&node.id, CandidateState::Responded);
        set.set_token(&node.id, 99);
        assert_eq!(set.responded_with_tokens(K), vec![(node, 99)]);
    }

    #[test]
    fn closest_responded_is_bounded_and_sorted() {
        let target = Id::random();
        let mut set = ClosestSet::new(target);
        for i in 1..=6u8 {
            let node = info(id_at_distance(&target, i));
            set.add(node.clone());
            set.set_state(&node.id, CandidateState::Responded);
        }
        let best = set.closest_responded(4);
        assert_eq!(best.len(), 4);
        assert_eq!(best[0].id, id_at_distance(&target, 1));
        assert_eq!(best[3].id, id_at_distance(&target, 4));
    }
}
