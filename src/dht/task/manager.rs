//! Task scheduling on the reactor.

use super::announce::AnnounceTask;
use super::lookup::LookupTask;
use super::ping::PingRefreshTask;
use super::{CallRequest, TaskId, TaskOutcome};
use crate::dht::codec::Response;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::types::NodeInfo;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::debug;

/// Concurrently running tasks; excess submissions queue.
const MAX_ACTIVE_TASKS: usize = 8;

#[derive(Debug)]
pub enum Task {
    Lookup(LookupTask),
    Announce(AnnounceTask),
    Ping(PingRefreshTask),
}

impl Task {
    fn step(&mut self, out: &mut Vec<CallRequest>) {
        match self {
            Task::Lookup(t) => t.step(out),
            Task::Announce(t) => t.step(out),
            Task::Ping(t) => t.step(out),
        }
    }

    fn on_response(&mut self, from: &NodeInfo, response: &Response, out: &mut Vec<CallRequest>) {
        match self {
            Task::Lookup(t) => t.on_response(from, response, out),
            Task::Announce(t) => t.on_response(from, response, out),
            Task::Ping(t) => t.on_response(&from.id),
        }
    }

    fn on_error(&mut self, from: &Id, error: &Error, out: &mut Vec<CallRequest>) {
        match self {
            // a wire error ends the exchange like a timeout would
            Task::Lookup(t) => t.on_timeout(from, out),
            Task::Announce(t) => t.on_error(from, error, out),
            Task::Ping(t) => t.on_timeout(from),
        }
    }

    fn on_timeout(&mut self, from: &Id, out: &mut Vec<CallRequest>) {
        match self {
            Task::Lookup(t) => t.on_timeout(from, out),
            Task::Announce(t) => t.on_timeout(from, out),
            Task::Ping(t) => t.on_timeout(from),
        }
    }

    fn on_stall(&mut self, from: &Id, out: &mut Vec<CallRequest>) {
        match self {
            Task::Lookup(t) => t.on_stall(from, out),
            Task::Announce(t) => t.on_stall(from, out),
            Task::Ping(_) => {}
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Task::Lookup(t) => t.is_finished(),
            Task::Announce(t) => t.is_finished(),
            Task::Ping(t) => t.is_finished(),
        }
    }

    fn cancel(&mut self) {
        match self {
            Task::Lookup(t) => t.cancel(),
            Task::Announce(t) => t.cancel(),
            Task::Ping(t) => t.cancel(),
        }
    }

    fn outcome(&self) -> TaskOutcome {
        match self {
            Task::Lookup(t) => t.outcome(),
            Task::Announce(t) => t.outcome(),
            Task::Ping(t) => t.outcome(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Task::Lookup(_) => "lookup",
            Task::Announce(_) => "announce",
            Task::Ping(_) => "ping-refresh",
        }
    }
}

struct Slot {
    task: Task,
    reply: Option<oneshot::Sender<Result<TaskOutcome>>>,
    started: bool,
}

/// Owns all in-progress tasks, starts queued ones as capacity frees, and
/// routes call events to their owners. `drive` runs after every reactor
/// event and on the periodic tick.
pub struct TaskManager {
    next_id: TaskId,
    slots: HashMap<TaskId, Slot>,
    queue: VecDeque<TaskId>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            slots: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn submit(
        &mut self,
        task: Task,
        reply: Option<oneshot::Sender<Result<TaskOutcome>>>,
    ) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        debug!("task {} submitted: {}", id, task.name());
        self.slots.insert(
            id,
            Slot {
                task,
                reply,
                started: false,
            },
        );
        self.queue.push_back(id);
        id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.slots.contains_key(&id)
    }

    fn active_count(&self) -> usize {
        self.slots.values().filter(|s| s.started).count()
    }

    /// Start queued tasks up to the cap, collect their outgoing calls and
    /// retire finished ones.
    pub fn drive(&mut self, out: &mut Vec<(TaskId, CallRequest)>) {
        while self.active_count() < MAX_ACTIVE_TASKS {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.started = true;
                let mut calls = Vec::new();
                slot.task.step(&mut calls);
                out.extend(calls.into_iter().map(|c| (id, c)));
            }
        }
        self.reap();
    }

    pub fn on_response(
        &mut self,
        id: TaskId,
        from: &NodeInfo,
        response: &Response,
        out: &mut Vec<(TaskId, CallRequest)>,
    ) {
        if let Some(slot) = self.slots.get_mut(&id) {
            let mut calls = Vec::new();
            slot.task.on_response(from, response, &mut calls);
            out.extend(calls.into_iter().map(|c| (id, c)));
        }
        self.reap();
    }

    pub fn on_error(
        &mut self,
        id: TaskId,
        from: &Id,
        error: &Error,
        out: &mut Vec<(TaskId, CallRequest)>,
    ) {
        if let Some(slot) = self.slots.get_mut(&id) {
            let mut calls = Vec::new();
            slot.task.on_error(from, error, &mut calls);
            out.extend(calls.into_iter().map(|c| (id, c)));
        }
        self.reap();
    }

    pub fn on_timeout(&mut self, id: TaskId, from: &Id, out: &mut Vec<(TaskId, CallRequest)>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            let mut calls = Vec::new();
            slot.task.on_timeout(from, &mut calls);
            out.extend(calls.into_iter().map(|c| (id, c)));
        }
        self.reap();
    }

    pub fn on_stall(&mut self, id: TaskId, from: &Id, out: &mut Vec<(TaskId, CallRequest)>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            let mut calls = Vec::new();
            slot.task.on_stall(from, &mut calls);
            out.extend(calls.into_iter().map(|c| (id, c)));
        }
        self.reap();
    }

    fn reap(&mut self) {
        let finished: Vec<TaskId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.started && s.task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(mut slot) = self.slots.remove(&id) {
                debug!("task {} finished: {}", id, slot.task.name());
                if let Some(reply) = slot.reply.take() {
                    let _ = reply.send(Ok(slot.task.outcome()));
                }
            }
        }
    }

    /// Cancel everything; pending callers get `Cancelled`.
    pub fn cancel_all(&mut self) {
        for (_, mut slot) in self.slots.drain() {
            slot.task.cancel();
            if let Some(reply) = slot.reply.take() {
                let _ = reply.send(Err(Error::Cancelled));
            }
        }
        self.queue.clear();
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::task::{CandidateFilter, Family};
    use crate::dht::task::lookup::LookupKind;
    use crate::types::LookupOption;

    fn lookup_task(seed_ports: &[u16]) -> Task {
        let seeds = seed_ports
            .iter()
            .map(|p| NodeInfo::new(Id::random(), format!("127.0.0.1:{}", p).parse().unwrap()))
            .collect();
        Task::Lookup(LookupTask::new(
            Id::random(),
            LookupKind::Node { want_token: false },
            LookupOption::Conservative,
            CandidateFilter {
                family: Family::V4,
                local_id: Id::random(),
                developer_mode: true,
            },
            seeds,
        ))
    }

    #[tokio::test]
    async fn drive_starts_and_reaps() {
        let mut manager = TaskManager::new();
        let (tx, rx) = oneshot::channel();
        let id = manager.submit(lookup_task(&[1000, 1001]), Some(tx));

        let mut out = Vec::new();
        manager.drive(&mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(tid, _)| *tid == id));

        for (tid, call) in out.drain(..).collect::<Vec<_>>() {
            manager.on_response(
                tid,
                &call.target,
                &Response::FindNode {
                    nodes4: Some(Vec::new()),
                    nodes6: None,
                    token: None,
                },
                &mut out,
            );
        }
        assert!(manager.is_empty());
        match rx.await.unwrap().unwrap() {
            TaskOutcome::Nodes { closest, .. } => assert_eq!(closest.len(), 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_all_fails_pending_callers() {
        let mut manager = TaskManager::new();
        let (tx, rx) = oneshot::channel();
        manager.submit(lookup_task(&[2000]), Some(tx));
        let mut out = Vec::new();
        manager.drive(&mut out);

        manager.cancel_all();
        assert!(manager.is_empty());
        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn excess_tasks_queue_until_capacity() {
        let mut manager = TaskManager::new();
        for _ in 0..MAX_ACTIVE_TASKS + 3 {
            manager.submit(lookup_task(&[3000]), None);
        }
        let mut out = Vec::new();
        manager.drive(&mut out);
        assert_eq!(manager.active_count(), MAX_ACTIVE_TASKS);
        assert_eq!(manager.queue.len(), 3);
    }
}
