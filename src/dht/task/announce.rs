//! Announce tasks: a token-requesting node lookup continued by a store
//! fan-out to the K closest responders.

use super::lookup::{LookupKind, LookupTask};
use super::{CallRequest, CandidateFilter, TaskOutcome};
use crate::dht::codec::{Request, Response};
use crate::dht::K;
use crate::error::Error;
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::{LookupOption, NodeInfo};
use crate::value::Value;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum AnnouncePayload {
    Value(Value),
    Peer(PeerInfo),
}

impl AnnouncePayload {
    pub fn target(&self) -> Id {
        match self {
            AnnouncePayload::Value(v) => v.id(),
            AnnouncePayload::Peer(p) => p.peer_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Lookup,
    Announce,
}

/// The lookup-then-store continuation, expressed as one flat state
/// machine. Per-destination write conflicts are recorded, never fatal.
#[derive(Debug)]
pub struct AnnounceTask {
    lookup: LookupTask,
    payload: AnnouncePayload,
    phase: Phase,
    pending: HashSet<Id>,
    stored: usize,
    conflicts: usize,
    finished: bool,
}

impl AnnounceTask {
    pub fn new(payload: AnnouncePayload, filter: CandidateFilter, seeds: Vec<NodeInfo>) -> Self {
        let lookup = LookupTask::new(
            payload.target(),
            LookupKind::Node { want_token: true },
            LookupOption::Conservative,
            filter,
            seeds,
        );
        Self {
            lookup,
            payload,
            phase: Phase::Lookup,
            pending: HashSet::new(),
            stored: 0,
            conflicts: 0,
            finished: false,
        }
    }

    pub fn target(&self) -> Id {
        self.payload.target()
    }

    fn store_request(&self, token: u32) -> Request {
        match &self.payload {
            AnnouncePayload::Value(value) => Request::StoreValue {
                token,
                value: value.clone(),
                expected_seq: None,
            },
            AnnouncePayload::Peer(peer) => Request::AnnouncePeer {
                token,
                peer: peer.clone(),
            },
        }
    }

    fn maybe_begin_announce(&mut self, out: &mut Vec<CallRequest>) {
        if self.phase != Phase::Lookup || !self.lookup.is_finished() {
            return;
        }
        self.phase = Phase::Announce;
        let targets = self.lookup.responded_with_tokens(K);
        debug!(
            "announce {}: fanning out to {} token holders",
            self.target(),
            targets.len()
        );
        for (info, token) in targets {
            self.pending.insert(info.id);
            out.push(CallRequest {
                target: info,
                request: self.store_request(token),
            });
        }
        if self.pending.is_empty() {
            self.finished = true;
        }
    }

    pub fn step(&mut self, out: &mut Vec<CallRequest>) {
        if self.finished {
            return;
        }
        if self.phase == Phase::Lookup {
            self.lookup.step(out);
            self.maybe_begin_announce(out);
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
        match self.phase {
            Phase::Lookup => {
                self.lookup.on_response(from, response, out);
                self.maybe_begin_announce(out);
            }
            Phase::Announce => {
                if self.pending.remove(&from.id) {
                    if matches!(
                        response,
                        Response::StoreValue {} | Response::AnnouncePeer {}
                    ) {
                        self.stored += 1;
                    }
                    self.finished = self.pending.is_empty();
                }
            }
        }
    }

    /// A wire error came back for one of our calls. During the announce
    /// fan-out, write conflicts are counted and the task moves on.
    pub fn on_error(&mut self, from: &Id, error: &Error, out: &mut Vec<CallRequest>) {
        match self.phase {
            Phase::Lookup => self.on_timeout(from, out),
            Phase::Announce => {
                if self.pending.remove(from) {
                    debug!("announce {}: {} rejected with {}", self.target(), from, error);
                    self.conflicts += 1;
                    self.finished = self.pending.is_empty();
                }
            }
        }
    }

    pub fn on_timeout(&mut self, from: &Id, out: &mut Vec<CallRequest>) {
        if self.finished {
            return;
        }
        match self.phase {
            Phase::Lookup => {
                self.lookup.on_timeout(from, out);
                self.maybe_begin_announce(out);
            }
            Phase::Announce => {
                if self.pending.remove(from) {
                    self.finished = self.pending.is_empty();
                }
            }
        }
    }

    pub fn on_stall(&mut self, from: &Id, out: &mut Vec<CallRequest>) {
        if self.phase == Phase::Lookup {
            self.lookup.on_stall(from, out);
            self.maybe_begin_announce(out);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cancel(&mut self) {
        self.lookup.cancel();
        self.finished = true;
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome::Announced {
            stored: self.stored,
            conflicts: self.conflicts,
        }
    }
}
