//! Bucket liveness refresh: one ping per eligible entry.

use super::{CallRequest, TaskOutcome};
use crate::dht::codec::Request;
use crate::id::Id;
use crate::types::NodeInfo;
use std::collections::HashSet;

#[derive(Debug)]
pub struct PingRefreshTask {
    queue: Vec<NodeInfo>,
    pending: HashSet<Id>,
    pinged: usize,
    finished: bool,
}

impl PingRefreshTask {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            queue: nodes,
            pending: HashSet::new(),
            pinged: 0,
            finished: false,
        }
    }

    pub fn step(&mut self, out: &mut Vec<CallRequest>) {
        if self.finished {
            return;
        }
        for node in self.queue.drain(..) {
            if self.pending.insert(node.id) {
                out.push(CallRequest {
                    target: node,
                    request: Request::Ping {},
                });
            }
        }
        if self.pending.is_empty() {
            self.finished = true;
        }
    }

    pub fn on_response(&mut self, from: &Id) {
        if self.pending.remove(from) {
            self.pinged += 1;
        }
        self.finished = self.pending.is_empty() && self.queue.is_empty();
    }

    pub fn on_timeout(&mut self, from: &Id) {
        self.pending.remove(from);
        self.finished = self.pending.is_empty() && self.queue.is_empty();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cancel(&mut self) {
        self.queue.clear();
        self.pending.clear();
        self.finished = true;
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome::Refreshed {
            pinged: self.pinged,
        }
    }
}
