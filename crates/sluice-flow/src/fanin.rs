use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sluice_core::error::{Result, SluiceError};
use sluice_core::status::ParallelMode;
use sluice_core::types::{SessionId, TraceId};
use tracing::{debug, error};

use crate::context::FlowContext;
use crate::node::{EmitterListener, FlowSubscriber, ProcessTarget, ProcessingNode};
use crate::session::FlowSession;
use crate::window::{ParallelJoin, WindowRegistry};

type RoundKey = (SessionId, TraceId);

/// Joins the outputs of several branch nodes before they reach `target`.
///
/// Every trace of a session gets its own [`ParallelJoin`]. A branch's
/// outputs are buffered under their trace, and the branch completes for a
/// trace once the branch node retires its inputs of that trace. Buffered
/// contexts count as in flight until the join hands them to `target` or
/// discards them.
pub(crate) struct FanIn<T> {
    flow_id: String,
    target: Arc<ProcessingNode<T, T>>,
    branches: Vec<String>,
    mode: ParallelMode,
    registry: Arc<WindowRegistry>,
    rounds: DashMap<RoundKey, Arc<Round<T>>>,
}

struct Round<T> {
    join: ParallelJoin<FlowContext<T>>,
    /// Contexts pushed into `join` and tracked against the session.
    buffered: Mutex<usize>,
}

impl<T> FanIn<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        flow_id: impl Into<String>,
        target: Arc<ProcessingNode<T, T>>,
        branches: Vec<String>,
        mode: ParallelMode,
        registry: Arc<WindowRegistry>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            target,
            branches,
            mode,
            registry,
            rounds: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn round_count(&self, session: &SessionId) -> usize {
        self.rounds.iter().filter(|r| &r.key().0 == session).count()
    }

    pub(crate) fn evict_session(&self, session: &SessionId) {
        self.rounds.retain(|key, _| &key.0 != session);
    }

    fn round(&self, session: &Arc<FlowSession>, trace: &TraceId) -> Result<Arc<Round<T>>> {
        let key = (session.id().clone(), trace.clone());
        if let Some(round) = self.rounds.get(&key) {
            return Ok(round.clone());
        }
        match self.rounds.entry(key) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let branches: Vec<&str> = self.branches.iter().map(String::as_str).collect();
                let join =
                    ParallelJoin::fork(&self.registry, &self.flow_id, session, &branches, self.mode)?;
                let round = Arc::new(Round {
                    join,
                    buffered: Mutex::new(0),
                });
                slot.insert(round.clone());
                Ok(round)
            }
        }
    }

    /// Buffer what `branch` emitted.
    fn push(&self, branch: &str, contexts: Vec<FlowContext<T>>) -> Result<()> {
        for ((session, trace), group) in by_trace(contexts) {
            if !session.is_running() {
                continue;
            }
            let round = self.round(&session, &trace)?;
            let mut buffered = round.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            let count = group.len();
            if round.join.push(branch, group)? {
                session.track(count);
                *buffered += count;
            } else {
                debug!(node = %self.target.id(), branch, trace = %trace, "Late branch output dropped");
            }
        }
        Ok(())
    }

    /// `branch` retired `contexts`: complete it for each of their traces and
    /// forward whatever that releases.
    fn complete(&self, branch: &str, contexts: &[FlowContext<T>]) -> Result<()> {
        let mut seen: Vec<(Arc<FlowSession>, TraceId)> = Vec::new();
        for ctx in contexts {
            let known = seen
                .iter()
                .any(|(s, t)| Arc::ptr_eq(s, ctx.session()) && t == ctx.trace_id());
            if !known && ctx.session().is_running() {
                seen.push((ctx.session().clone(), ctx.trace_id().clone()));
            }
        }

        let mut first_error = None;
        for (session, trace) in seen {
            let round = self.round(&session, &trace)?;
            let (released, held) = {
                let mut buffered = round.buffered.lock().unwrap_or_else(PoisonError::into_inner);
                match round.join.complete_branch(branch)? {
                    Some(merged) => (Some(merged), std::mem::take(&mut *buffered)),
                    None => (None, 0),
                }
            };
            let Some(merged) = released else {
                continue;
            };
            debug!(
                node = %self.target.id(),
                trace = %trace,
                count = merged.len(),
                discarded = held.saturating_sub(merged.len()),
                "Join released"
            );
            let forwarded = if merged.is_empty() {
                Ok(())
            } else {
                self.target.accept(merged)
            };
            session.settle(held);
            if let Err(e) = forwarded {
                error!(node = %self.target.id(), error = %e, "Joined batch rejected");
                if session.terminate(&e.to_string()) {
                    self.target.on_fail(&e, &session);
                }
                first_error.get_or_insert(e);
                continue;
            }
            session.try_complete();
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn by_trace<T>(contexts: Vec<FlowContext<T>>) -> Vec<((Arc<FlowSession>, TraceId), Vec<FlowContext<T>>)> {
    let mut groups: Vec<((Arc<FlowSession>, TraceId), Vec<FlowContext<T>>)> = Vec::new();
    for ctx in contexts {
        let found = groups
            .iter_mut()
            .find(|((s, t), _)| Arc::ptr_eq(s, ctx.session()) && t == ctx.trace_id());
        match found {
            Some((_, group)) => group.push(ctx),
            None => groups.push(((ctx.session().clone(), ctx.trace_id().clone()), vec![ctx])),
        }
    }
    groups
}

/// Registered on a branch node: its emissions feed the join, its retired
/// inputs complete the branch.
pub(crate) struct FanInBranch<T> {
    fan_in: Arc<FanIn<T>>,
    branch: String,
}

impl<T> FanInBranch<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn attach(fan_in: &Arc<FanIn<T>>, node: &Arc<ProcessingNode<T, T>>) {
        let branch = Arc::new(Self {
            fan_in: fan_in.clone(),
            branch: node.id().to_string(),
        });
        node.emitter().register(branch.clone());
        node.on_retire(move |contexts: &[FlowContext<T>]| {
            if let Err(e) = branch.fan_in.complete(&branch.branch, contexts) {
                error!(branch = %branch.branch, error = %e, "Branch completion failed");
            }
        });
    }
}

impl<T> EmitterListener<T> for FanInBranch<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_emit(&self, contexts: Vec<FlowContext<T>>) -> Result<()> {
        self.fan_in.push(&self.branch, contexts)
    }

    fn on_fail(&self, error: &SluiceError, session: &Arc<FlowSession>) {
        self.fan_in.target.on_fail(error, session);
    }
}
