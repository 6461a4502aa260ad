//! The iterative closest-node search and its value/peer variants.

use super::closest::{CandidateState, ClosestSet};
use super::{CallRequest, CandidateFilter, Family, TaskOutcome};
use crate::dht::codec::{Request, Response};
use crate::dht::{ALPHA, K, TASK_DEADLINE};
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::{LookupOption, NodeInfo};
use crate::value::Value;
use std::collections::HashSet;
use std::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
pub enum LookupKind {
    /// `find_node`; optionally asks responders for write tokens.
    Node { want_token: bool },
    /// `find_value`; responders return the value or closer nodes.
    Value { expected_seq: Option<i32> },
    /// `find_peer`; aggregates announcements until `expected` are found.
    Peer { expected: usize },
}

#[derive(Debug)]
pub struct LookupTask {
    target: Id,
    kind: LookupKind,
    option: LookupOption,
    filter: CandidateFilter,
    set: ClosestSet,
    found_value: Option<Value>,
    found_peers: Vec<PeerInfo>,
    seen_peers: HashSet<(Id, Id, Option<Id>, u64)>,
    exact: Option<NodeInfo>,
    started_at: Instant,
    finished: bool,
}

impl LookupTask {
    pub fn new(
        target: Id,
        kind: LookupKind,
        option: LookupOption,
        filter: CandidateFilter,
        seeds: Vec<NodeInfo>,
    ) -> Self {
        let mut set = ClosestSet::new(target);
        for seed in seeds {
            if filter.allows(&seed) {
                set.add(seed);
            }
        }
        Self {
            target,
            kind,
            option,
            filter,
            set,
            found_value: None,
            found_peers: Vec::new(),
            seen_peers: HashSet::new(),
            exact: None,
            started_at: Instant::now(),
            finished: false,
        }
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    fn build_request(&self) -> Request {
        let want4 = self.filter.family == Family::V4;
        let want6 = self.filter.family == Family::V6;
        match &self.kind {
            LookupKind::Node { want_token } => Request::FindNode {
                target: self.target,
                want4,
                want6,
                want_token: *want_token,
            },
            LookupKind::Value { expected_seq } => Request::FindValue {
                target: self.target,
                want4,
                want6,
                want_token: false,
                expected_seq: *expected_seq,
            },
            LookupKind::Peer { .. } => Request::FindPeer {
                target: self.target,
                want4,
                want6,
                want_token: false,
            },
        }
    }

    /// Launch calls while parallelism and useful candidates remain; then
    /// check termination.
    pub fn step(&mut self, out: &mut Vec<CallRequest>) {
        if self.finished {
            return;
        }
        while self.set.in_flight() < ALPHA {
            let Some(info) = self.set.next_fresh() else {
                break;
            };
            self.set.set_state(&info.id, CandidateState::InFlight);
            trace!("lookup {} querying {}", self.target, info);
            out.push(CallRequest {
                target: info,
                request: self.build_request(),
            });
        }
        if self.set.is_done() || self.started_at.elapsed() >= TASK_DEADLINE {
            self.finished = true;
        }
    }

    pub fn on_response(
        &mut self,
        from: &NodeInfo,
        response: &Response,
        out: &mut Vec<CallRequest>,
    ) {
        if self.finished {
            return;
        }
        self.set.set_state(&from.id, CandidateState::Responded);
        if let Some(token) = response.token() {
            self.set.set_token(&from.id, token);
        }
        for node in response.nodes() {
            if self.filter.allows(node) {
                self.set.add(node.clone());
            }
        }

        match (&self.kind, response) {
            (LookupKind::Node { .. }, _) => {
                if from.id == self.target {
                    self.exact = Some(from.clone());
                    if self.option == LookupOption::Optimistic {
                        self.finished = true;
                    }
                }
            }
            (LookupKind::Value { expected_seq }, Response::FindValue { value: Some(v), .. }) => {
                let acceptable = v.id() == self.target
                    && v.is_valid()
                    && expected_seq.is_none_or(|seq| {
                        !v.is_mutable() || v.sequence_number >= seq
                    });
                if acceptable {
                    if !v.is_mutable() {
                        // an immutable match is final
                        self.found_value = Some(v.clone());
                        self.finished = true;
                    } else {
                        // keep hunting for a higher sequence
                        let better = self
                            .found_value
                            .as_ref()
                            .is_none_or(|held| v.sequence_number > held.sequence_number);
                        if better {
                            self.found_value = Some(v.clone());
                        }
                    }
                }
            }
            (LookupKind::Peer { expected }, Response::FindPeer { peers: Some(peers), .. }) => {
                for peer in peers {
                    if peer.peer_id == self.target
                        && peer.is_valid()
                        && self.seen_peers.insert(peer.dedup_key())
                    {
                        self.found_peers.push(peer.clone());
                    }
                }
                if *expected > 0 && self.found_peers.len() >= *expected {
                    self.finished = true;
                }
            }
            _ => {}
        }

        self.step(out);
    }

    pub fn on_timeout(&mut self, from: &Id, out: &mut Vec<CallRequest>) {
        self.set.set_state(from, CandidateState::Failed);
        self.step(out);
    }

    /// A call went quiet past the stall mark: free its parallelism slot
    /// but keep the transaction alive.
    pub fn on_stall(&mut self, from: &Id, out: &mut Vec<CallRequest>) {
        if self.set.state_of(from) == Some(CandidateState::InFlight) {
            self.set.set_state(from, CandidateState::Stalled);
        }
        self.step(out);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cancel(&mut self) {
        self.finished = true;
    }

    pub fn closest_responded(&self, k: usize) -> Vec<NodeInfo> {
        self.set.closest_responded(k)
    }

    pub fn responded_with_tokens(&self, k: usize) -> Vec<(NodeInfo, u32)> {
        self.set.responded_with_tokens(k)
    }

    pub fn outcome(&self) -> TaskOutcome {
        match &self.kind {
            LookupKind::Node { .. } => TaskOutcome::Nodes {
                closest: self.set.closest_responded(K),
                exact: self.exact.clone(),
            },
            LookupKind::Value { .. } => TaskOutcome::Value(self.found_value.clone()),
            LookupKind::Peer { .. } => TaskOutcome::Peers(self.found_peers.clone()),
        }
    }
}
