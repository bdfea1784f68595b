//! Executor
//!
//! Drives a frozen plan to completion: readiness tracking over the
//! dependency edges, inline evaluation for compute kinds, spawned drivers
//! for suspending kinds, combinator settlement, a global concurrency cap,
//! and cooperative cancellation.
//!
//! The plan itself stays immutable; all mutable per-node state lives in a
//! parallel table keyed by `NodeId`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use blueprint_core::{NodeId, Plan, Value};

use crate::config::ExecConfig;
use crate::drivers::{self, compute, DriverContext};
use crate::events::EventTable;
use crate::observer::{ExecEvent, ExecutionObserver};
use crate::outcome::{
    ExecutionOutcome, ExecutionReport, NodeRecord, NodeState, OpError, OpErrorKind,
};

type DriverFuture = BoxFuture<'static, (NodeId, Result<Value, OpError>)>;

/// The executor. One instance can run many plans; each run gets its own
/// node table and event-source table.
pub struct Executor {
    max_parallel: Option<usize>,
    config: ExecConfig,
    cancel: CancellationToken,
    observer: Option<Arc<dyn ExecutionObserver>>,
    http: reqwest::Client,
}

impl Executor {
    pub fn new() -> Self {
        Self::from_config(ExecConfig::default())
    }

    pub fn from_config(config: ExecConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.http_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            max_parallel: config.max_parallel,
            config,
            cancel: CancellationToken::new(),
            observer: None,
            http,
        }
    }

    /// Cap the number of concurrently running nodes.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    /// Attach a progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Token that cancels the run when triggered. Clone it out before
    /// calling `run` to cancel from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the plan until every node is terminal, then report.
    pub async fn run(&self, plan: &Plan) -> ExecutionReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let events = EventTable::new(self.config.event_chunk_bytes);
        let ctx = DriverContext {
            http: self.http.clone(),
            events: Arc::clone(&events),
            cancel: self.cancel.clone(),
            config: self.config.clone(),
        };

        let mut state = RunState::new(plan, run_id.clone());
        let mut in_flight: FuturesUnordered<DriverFuture> = FuturesUnordered::new();
        let cap = self.max_parallel.unwrap_or(usize::MAX).max(1);

        tracing::info!(run_id = %run_id, nodes = plan.len(), "plan execution started");

        state.wave(&ctx, &mut in_flight, cap);
        self.flush(&mut state).await;

        while !in_flight.is_empty() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !state.cancelled => {
                    state.cancelled = true;
                    state.cancel_pending();
                }
                completed = in_flight.next() => {
                    if let Some((id, result)) = completed {
                        state.settle(id, result);
                        state.wave(&ctx, &mut in_flight, cap);
                    }
                }
            }
            self.flush(&mut state).await;
        }

        // Final propagation pass; drain anything it might still dispatch,
        // then force leftovers (only possible after a cancel) terminal.
        state.wave(&ctx, &mut in_flight, cap);
        while let Some((id, result)) = in_flight.next().await {
            state.settle(id, result);
            state.wave(&ctx, &mut in_flight, cap);
        }
        state.finalize_remaining();

        events.shutdown().await;

        let outcome = state.outcome();
        match &outcome {
            ExecutionOutcome::Completed => {
                tracing::info!(run_id = %run_id, "plan execution completed");
                state.emit(ExecEvent::new(&run_id, "run_completed"));
            }
            ExecutionOutcome::Failed { node, error, .. } => {
                tracing::error!(
                    run_id = %run_id,
                    node = %node,
                    error = %error,
                    "plan execution failed"
                );
                state.emit(
                    ExecEvent::new(&run_id, "run_failed").with_message(error.to_string()),
                );
            }
            ExecutionOutcome::Cancelled => {
                tracing::warn!(run_id = %run_id, "plan execution cancelled");
                state.emit(ExecEvent::new(&run_id, "run_cancelled"));
            }
        }
        self.flush(&mut state).await;

        ExecutionReport::new(run_id, outcome, state.slots)
    }

    async fn flush(&self, state: &mut RunState<'_>) {
        let Some(observer) = &self.observer else {
            state.events_out.clear();
            return;
        };
        for event in state.events_out.drain(..) {
            if let Err(err) = observer.observe(event).await {
                tracing::warn!("failed to report execution progress: {}", err);
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of evaluating a composition node against its listed ops.
enum Settlement {
    Wait,
    Done(Result<Value, OpError>),
}

struct RunState<'a> {
    plan: &'a Plan,
    slots: Vec<NodeRecord>,
    ready: VecDeque<NodeId>,
    cancelled: bool,
    run_id: String,
    events_out: Vec<ExecEvent>,
}

impl<'a> RunState<'a> {
    fn new(plan: &'a Plan, run_id: String) -> Self {
        Self {
            plan,
            slots: (0..plan.len()).map(|_| NodeRecord::default()).collect(),
            ready: VecDeque::new(),
            cancelled: false,
            run_id,
            events_out: Vec::new(),
        }
    }

    fn state_of(&self, id: NodeId) -> NodeState {
        self.slots[id.0 as usize].state
    }

    fn emit(&mut self, event: ExecEvent) {
        self.events_out.push(event);
    }

    /// Alternate readiness propagation and dispatch until neither makes
    /// progress. Inline kinds settle during dispatch, which can unlock
    /// further nodes in the same wave.
    fn wave(
        &mut self,
        ctx: &DriverContext,
        in_flight: &mut FuturesUnordered<DriverFuture>,
        cap: usize,
    ) {
        loop {
            let promoted = self.promote();
            let settled_inline = self.dispatch(ctx, in_flight, cap);
            if !promoted && !settled_inline {
                break;
            }
        }
    }

    /// One readiness scan: propagate dependency failures, settle ripe
    /// compositions, queue nodes whose dependencies are all satisfied.
    /// Newly ready nodes enter the queue in ascending id order.
    fn promote(&mut self) -> bool {
        let mut changed_any = false;
        loop {
            let mut changed = false;
            let mut newly_ready = Vec::new();

            for node in self.plan.nodes() {
                if self.state_of(node.id) != NodeState::Pending {
                    continue;
                }
                if self.cancelled {
                    self.settle_unrun(node.id, OpError::cancelled());
                    changed = true;
                    continue;
                }
                if node.kind.is_composition() {
                    match self.composition_settlement(node.id) {
                        Settlement::Wait => {}
                        Settlement::Done(result) => {
                            let now = Instant::now();
                            self.slots[node.id.0 as usize].started_at = Some(now);
                            self.settle(node.id, result);
                            changed = true;
                        }
                    }
                } else {
                    match self.dependency_settlement(node.id) {
                        Settlement::Wait => {}
                        Settlement::Done(Ok(_)) => {
                            self.slots[node.id.0 as usize].state = NodeState::Ready;
                            newly_ready.push(node.id);
                            changed = true;
                        }
                        Settlement::Done(Err(error)) => {
                            self.settle_unrun(node.id, error);
                            changed = true;
                        }
                    }
                }
            }

            newly_ready.sort();
            self.ready.extend(newly_ready);
            if !changed {
                break;
            }
            changed_any = true;
        }
        changed_any
    }

    /// Default readiness rule: every data and ordering dependency must have
    /// succeeded; a failed dependency propagates, a cancelled one cancels.
    fn dependency_settlement(&self, id: NodeId) -> Settlement {
        let node = self.plan.get(id).expect("node in plan");
        for dep in node.data_deps.iter().chain(node.order_deps.iter()) {
            match self.state_of(*dep) {
                NodeState::Succeeded => {}
                NodeState::Failed => {
                    let message = self.slots[dep.0 as usize]
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Settlement::Done(Err(OpError::dependency(format!(
                        "dependency {} failed: {}",
                        dep, message
                    ))));
                }
                NodeState::Cancelled => return Settlement::Done(Err(OpError::cancelled())),
                _ => return Settlement::Wait,
            }
        }
        Settlement::Done(Ok(Value::Null))
    }

    /// Combinator completion rules, evaluated against the listed ops'
    /// current states. Ordering dependencies gate the combinator the same
    /// way they gate any other node.
    fn composition_settlement(&self, id: NodeId) -> Settlement {
        use blueprint_core::NodeKind;

        let node = self.plan.get(id).expect("node in plan");
        for dep in &node.order_deps {
            match self.state_of(*dep) {
                NodeState::Succeeded => {}
                NodeState::Failed => {
                    let message = self.slots[dep.0 as usize]
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Settlement::Done(Err(OpError::dependency(format!(
                        "dependency {} failed: {}",
                        dep, message
                    ))));
                }
                NodeState::Cancelled => return Settlement::Done(Err(OpError::cancelled())),
                _ => return Settlement::Wait,
            }
        }

        let failure_of = |dep: NodeId| -> String {
            self.slots[dep.0 as usize]
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string())
        };

        match &node.kind {
            NodeKind::Gather { ops } => {
                // Fails on the first listed failure; siblings keep running
                // and their results are discarded.
                for op in ops {
                    match self.state_of(*op) {
                        NodeState::Failed => {
                            return Settlement::Done(Err(OpError::dependency(failure_of(*op))))
                        }
                        NodeState::Cancelled => {
                            return Settlement::Done(Err(OpError::cancelled()))
                        }
                        _ => {}
                    }
                }
                if ops.iter().all(|op| self.state_of(*op) == NodeState::Succeeded) {
                    let results = ops
                        .iter()
                        .map(|op| {
                            self.slots[op.0 as usize]
                                .result
                                .clone()
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    Settlement::Done(Ok(Value::List(results)))
                } else {
                    Settlement::Wait
                }
            }
            NodeKind::Race { ops } => {
                let winner = ops
                    .iter()
                    .filter(|op| self.state_of(**op) == NodeState::Succeeded)
                    .min_by_key(|op| self.slots[op.0 as usize].finished_at);
                if let Some(winner) = winner {
                    return Settlement::Done(Ok(self.slots[winner.0 as usize]
                        .result
                        .clone()
                        .unwrap_or(Value::Null)));
                }
                if ops.iter().all(|op| self.state_of(*op).is_terminal()) {
                    if ops
                        .iter()
                        .any(|op| self.state_of(*op) == NodeState::Cancelled)
                    {
                        return Settlement::Done(Err(OpError::cancelled()));
                    }
                    let last = ops
                        .iter()
                        .max_by_key(|op| self.slots[op.0 as usize].finished_at)
                        .map(|op| failure_of(*op))
                        .unwrap_or_else(|| "no operations listed".to_string());
                    return Settlement::Done(Err(OpError::dependency(format!(
                        "all {} operations failed; last: {}",
                        ops.len(),
                        last
                    ))));
                }
                Settlement::Wait
            }
            NodeKind::AtLeast { ops, count } => {
                let succeeded = ops
                    .iter()
                    .filter(|op| self.state_of(**op) == NodeState::Succeeded)
                    .count();
                if succeeded >= *count {
                    return Settlement::Done(Ok(Value::Bool(true)));
                }
                if ops.iter().all(|op| self.state_of(*op).is_terminal()) {
                    return Settlement::Done(Ok(Value::Bool(false)));
                }
                Settlement::Wait
            }
            NodeKind::AtMost { ops, count } => {
                if ops.iter().all(|op| self.state_of(*op).is_terminal()) {
                    let succeeded = ops
                        .iter()
                        .filter(|op| self.state_of(**op) == NodeState::Succeeded)
                        .count();
                    return Settlement::Done(Ok(Value::Bool(succeeded <= *count)));
                }
                Settlement::Wait
            }
            NodeKind::After { dependency, value } => {
                match self.state_of(*dependency) {
                    NodeState::Failed => {
                        return Settlement::Done(Err(OpError::dependency(failure_of(
                            *dependency,
                        ))))
                    }
                    NodeState::Cancelled => return Settlement::Done(Err(OpError::cancelled())),
                    _ => {}
                }
                match self.state_of(*value) {
                    NodeState::Succeeded => Settlement::Done(Ok(self.slots[value.0 as usize]
                        .result
                        .clone()
                        .unwrap_or(Value::Null))),
                    NodeState::Failed => {
                        Settlement::Done(Err(OpError::dependency(failure_of(*value))))
                    }
                    NodeState::Cancelled => Settlement::Done(Err(OpError::cancelled())),
                    _ => Settlement::Wait,
                }
            }
            other => Settlement::Done(Err(OpError::operation(format!(
                "kind '{}' is not a composition",
                other.name()
            )))),
        }
    }

    /// Dispatch queued ready nodes up to the concurrency cap. Inline kinds
    /// settle immediately; suspending kinds spawn a driver task. Returns
    /// whether anything settled synchronously.
    fn dispatch(
        &mut self,
        ctx: &DriverContext,
        in_flight: &mut FuturesUnordered<DriverFuture>,
        cap: usize,
    ) -> bool {
        let mut settled_inline = false;

        while let Some(&id) = self.ready.front() {
            if self.cancelled {
                self.ready.pop_front();
                self.settle_unrun(id, OpError::cancelled());
                continue;
            }
            let node = self.plan.get(id).expect("node in plan");
            let inline = node.kind.is_inline();
            if !inline && in_flight.len() >= cap {
                break;
            }
            self.ready.pop_front();

            let resolved = node.kind.map_values(&|v| {
                v.resolve(&|dep| {
                    self.slots[dep.0 as usize]
                        .result
                        .clone()
                        .unwrap_or(Value::Null)
                })
            });

            let slot = &mut self.slots[id.0 as usize];
            slot.state = NodeState::Running;
            slot.started_at = Some(Instant::now());
            tracing::debug!(
                run_id = %self.run_id,
                node = %id,
                kind = node.kind.name(),
                "node started"
            );
            let started = ExecEvent::new(&self.run_id, "node_started")
                .with_node(id, node.kind.name());
            self.emit(started);

            if inline {
                let result = compute::eval(&resolved);
                self.settle(id, result);
                settled_inline = true;
            } else {
                let task_ctx = ctx.clone();
                let task = tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = task_ctx.cancel.cancelled() => Err(OpError::cancelled()),
                        result = drivers::drive(resolved, &task_ctx) => result,
                    }
                });
                in_flight.push(Box::pin(async move {
                    match task.await {
                        Ok(result) => (id, result),
                        Err(e) => (
                            id,
                            Err(OpError::operation(format!("driver task failed: {}", e))),
                        ),
                    }
                }));
            }
        }

        settled_inline
    }

    /// Record a terminal result for a node that ran (or a composition).
    fn settle(&mut self, id: NodeId, result: Result<Value, OpError>) {
        let kind_name = self
            .plan
            .get(id)
            .map(|n| n.kind.name())
            .unwrap_or("unknown");
        let slot = &mut self.slots[id.0 as usize];
        if slot.state.is_terminal() {
            return;
        }
        slot.finished_at = Some(Instant::now());

        match result {
            Ok(value) => {
                slot.state = NodeState::Succeeded;
                slot.result = Some(value);
                tracing::debug!(run_id = %self.run_id, node = %id, kind = kind_name, "node succeeded");
                let event =
                    ExecEvent::new(&self.run_id, "node_succeeded").with_node(id, kind_name);
                self.emit(event);
            }
            Err(error) if error.kind == OpErrorKind::Cancelled => {
                slot.state = NodeState::Cancelled;
                slot.error = Some(error);
                let event =
                    ExecEvent::new(&self.run_id, "node_cancelled").with_node(id, kind_name);
                self.emit(event);
            }
            Err(error) => {
                slot.state = NodeState::Failed;
                tracing::error!(
                    run_id = %self.run_id,
                    node = %id,
                    kind = kind_name,
                    error = %error,
                    "node failed"
                );
                let event = ExecEvent::new(&self.run_id, "node_failed")
                    .with_node(id, kind_name)
                    .with_message(error.to_string());
                slot.error = Some(error);
                self.emit(event);
            }
        }
    }

    /// Terminalize a node whose driver never ran (dependency failure or
    /// cancellation). `started_at` stays empty.
    fn settle_unrun(&mut self, id: NodeId, error: OpError) {
        let kind_name = self
            .plan
            .get(id)
            .map(|n| n.kind.name())
            .unwrap_or("unknown");
        let slot = &mut self.slots[id.0 as usize];
        if slot.state.is_terminal() {
            return;
        }
        slot.finished_at = Some(Instant::now());
        let phase = if error.kind == OpErrorKind::Cancelled {
            slot.state = NodeState::Cancelled;
            "node_cancelled"
        } else {
            slot.state = NodeState::Failed;
            "node_failed"
        };
        let message = error.to_string();
        slot.error = Some(error);
        let event = ExecEvent::new(&self.run_id, phase)
            .with_node(id, kind_name)
            .with_message(message);
        self.emit(event);
    }

    /// Flip everything not yet running to cancelled; running drivers notice
    /// the token themselves.
    fn cancel_pending(&mut self) {
        self.ready.clear();
        let ids: Vec<NodeId> = self
            .plan
            .nodes()
            .iter()
            .filter(|n| {
                matches!(
                    self.state_of(n.id),
                    NodeState::Pending | NodeState::Ready
                )
            })
            .map(|n| n.id)
            .collect();
        for id in ids {
            self.settle_unrun(id, OpError::cancelled());
        }
    }

    fn finalize_remaining(&mut self) {
        let leftover: Vec<NodeId> = self
            .plan
            .nodes()
            .iter()
            .filter(|n| !self.state_of(n.id).is_terminal())
            .map(|n| n.id)
            .collect();
        for id in leftover {
            tracing::warn!(run_id = %self.run_id, node = %id, "node never reached a terminal state");
            self.settle_unrun(id, OpError::cancelled());
        }
    }

    /// Outcome is decided by the roots: all succeeded, or failed with the
    /// originating node and its dependency casualties, or cancelled.
    fn outcome(&self) -> ExecutionOutcome {
        let roots = self.plan.roots();
        if roots
            .iter()
            .all(|r| self.state_of(*r) == NodeState::Succeeded)
        {
            return ExecutionOutcome::Completed;
        }

        let any_root_failed = roots
            .iter()
            .any(|r| self.state_of(*r) == NodeState::Failed);
        if !any_root_failed {
            return ExecutionOutcome::Cancelled;
        }

        let origin = self
            .plan
            .nodes()
            .iter()
            .filter(|n| {
                matches!(
                    self.slots[n.id.0 as usize].error.as_ref().map(|e| e.kind),
                    Some(OpErrorKind::Operation) | Some(OpErrorKind::Closed)
                )
            })
            .min_by_key(|n| self.slots[n.id.0 as usize].finished_at)
            .map(|n| n.id)
            .or_else(|| {
                self.plan
                    .nodes()
                    .iter()
                    .find(|n| self.state_of(n.id) == NodeState::Failed)
                    .map(|n| n.id)
            });

        match origin {
            Some(node) => {
                let dependents: Vec<NodeId> = self
                    .plan
                    .nodes()
                    .iter()
                    .filter(|n| {
                        self.slots[n.id.0 as usize]
                            .error
                            .as_ref()
                            .map(|e| e.kind == OpErrorKind::Dependency)
                            .unwrap_or(false)
                    })
                    .map(|n| n.id)
                    .collect();
                let error = self.slots[node.0 as usize]
                    .error
                    .clone()
                    .unwrap_or_else(|| OpError::operation("unknown error"));
                ExecutionOutcome::Failed {
                    node,
                    span: self.plan.get(node).and_then(|n| n.span.clone()),
                    error,
                    dependents,
                }
            }
            None => ExecutionOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::RwLock;

    use blueprint_core::{BinOp, PlanSession, UnOp};

    fn f(seconds: f64) -> Value {
        Value::Float(seconds)
    }

    fn s(text: &str) -> Value {
        Value::String(text.to_string())
    }

    fn scratch_path(stem: &str) -> String {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("bp-{}-{}-{}", stem, std::process::id(), unique))
            .to_string_lossy()
            .to_string()
    }

    fn struct_field<'a>(value: &'a Value, name: &str) -> &'a Value {
        match value {
            Value::Struct(fields) => fields.get(name).expect("field"),
            other => panic!("expected struct, got {:?}", other),
        }
    }

    struct CollectObserver {
        phases: RwLock<Vec<String>>,
    }

    #[async_trait]
    impl ExecutionObserver for CollectObserver {
        async fn observe(&self, event: ExecEvent) -> Result<(), String> {
            self.phases.write().await.push(event.phase);
            Ok(())
        }
    }

    #[test]
    fn test_empty_plan_completes() {
        tokio_test::block_on(async {
            let plan = PlanSession::new().freeze().expect("freeze");
            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
        });
    }

    #[test]
    fn test_gather_of_sleeps_runs_in_parallel() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let ops: Vec<Value> = (0..3)
                .map(|_| session.sleep(f(0.1)).expect("sleep"))
                .collect();
            let all = session.gather(ops).expect("gather");
            session.mark_root(&all);
            let plan = session.freeze().expect("freeze");

            let started = Instant::now();
            let report = Executor::new().run(&plan).await;
            let elapsed = started.elapsed();

            assert!(report.is_completed());
            assert!(
                elapsed < Duration::from_millis(250),
                "expected parallel sleeps, took {:?}",
                elapsed
            );
            assert_eq!(
                report.result(all.as_deferred().unwrap()),
                Some(&Value::List(vec![Value::Null, Value::Null, Value::Null]))
            );
        });
    }

    #[test]
    fn test_sequence_runs_in_list_order() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let ops: Vec<Value> = (0..4)
                .map(|_| session.sleep(f(0.05)).expect("sleep"))
                .collect();
            let seq = session.sequence(ops.clone()).expect("sequence");
            session.mark_root(&seq);
            let plan = session.freeze().expect("freeze");

            let started = Instant::now();
            let report = Executor::new().run(&plan).await;
            let elapsed = started.elapsed();

            assert!(report.is_completed());
            assert!(
                elapsed >= Duration::from_millis(195),
                "sequence finished too quickly: {:?}",
                elapsed
            );

            for pair in ops.windows(2) {
                let (_, earlier_done) = report.timing(pair[0].as_deferred().unwrap()).unwrap();
                let (later_start, later_done) =
                    report.timing(pair[1].as_deferred().unwrap()).unwrap();
                assert!(later_start >= earlier_done, "sequence steps overlapped");
                assert!(later_done > earlier_done);
            }
        });
    }

    #[test]
    fn test_after_gates_a_read_behind_writes() {
        tokio_test::block_on(async {
            let path_a = scratch_path("after-a");
            let path_b = scratch_path("after-b");

            let mut session = PlanSession::new();
            let w1 = session
                .write_file(s(&path_a), s("A"))
                .expect("write_file");
            let w2 = session
                .write_file(s(&path_b), s("B"))
                .expect("write_file");
            let both = session.gather(vec![w1.clone(), w2.clone()]).expect("gather");
            let read = session.read_file(s(&path_a)).expect("read_file");
            let gated = session.after(both, read.clone()).expect("after");
            session.mark_root(&gated);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            assert_eq!(report.result(gated.as_deferred().unwrap()), Some(&s("A")));

            let (read_start, _) = report.timing(read.as_deferred().unwrap()).unwrap();
            for write in [&w1, &w2] {
                let (_, write_done) = report.timing(write.as_deferred().unwrap()).unwrap();
                assert!(read_start >= write_done, "read started before a write finished");
            }

            let _ = tokio::fs::remove_file(&path_a).await;
            let _ = tokio::fs::remove_file(&path_b).await;
        });
    }

    #[test]
    fn test_race_resolves_with_the_fastest_op() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let slow = session.sleep(f(0.3)).expect("sleep");
            let fast = session.sleep(f(0.01)).expect("sleep");
            let winner = session.race(vec![slow, fast.clone()]).expect("race");
            session.mark_root(&winner);
            let plan = session.freeze().expect("freeze");

            let started = Instant::now();
            let report = Executor::new().run(&plan).await;

            assert!(report.is_completed());
            // The race node settles as soon as the fast sleep succeeds,
            // even though the run itself waits out the slow sibling.
            let (_, race_done) = report.timing(winner.as_deferred().unwrap()).unwrap();
            assert!(
                race_done.duration_since(started) < Duration::from_millis(200),
                "race settled late"
            );
            let (_, fast_done) = report.timing(fast.as_deferred().unwrap()).unwrap();
            assert!(race_done >= fast_done);
        });
    }

    #[test]
    fn test_race_fails_only_when_every_op_failed() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let bad1 = session
                .read_file(s(&scratch_path("race-missing-1")))
                .expect("read_file");
            let bad2 = session
                .read_file(s(&scratch_path("race-missing-2")))
                .expect("read_file");
            let winner = session.race(vec![bad1, bad2]).expect("race");
            session.mark_root(&winner);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(!report.is_completed());
            let error = report.error(winner.as_deferred().unwrap()).expect("error");
            assert_eq!(error.kind, OpErrorKind::Dependency);
            assert!(error.message.contains("all 2 operations failed"));
        });
    }

    #[test]
    fn test_race_skips_failures_and_takes_a_later_success() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let bad = session
                .read_file(s(&scratch_path("race-missing")))
                .expect("read_file");
            let slow_ok = session.sleep(f(0.05)).expect("sleep");
            let winner = session.race(vec![bad, slow_ok]).expect("race");
            session.mark_root(&winner);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            // The run fails because the missing read is an effectful root,
            // but the race itself resolved with the surviving success.
            assert_eq!(
                report.state(winner.as_deferred().unwrap()),
                Some(NodeState::Succeeded)
            );
            assert_eq!(report.result(winner.as_deferred().unwrap()), Some(&Value::Null));
        });
    }

    #[test]
    fn test_gather_failure_propagates_but_siblings_finish() {
        tokio_test::block_on(async {
            let path_a = scratch_path("gather-a");
            let path_b = scratch_path("gather-b");
            let missing = scratch_path("gather-missing");

            let mut session = PlanSession::new();
            let ok1 = session.write_file(s(&path_a), s("A")).expect("write_file");
            let failing = session.read_file(s(&missing)).expect("read_file");
            let ok2 = session.write_file(s(&path_b), s("B")).expect("write_file");
            let all = session
                .gather(vec![ok1.clone(), failing.clone(), ok2.clone()])
                .expect("gather");
            let downstream = session.unary(UnOp::Len, all.clone());
            session.mark_root(&downstream);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(!report.is_completed());

            match &report.outcome {
                ExecutionOutcome::Failed {
                    node, dependents, ..
                } => {
                    assert_eq!(*node, failing.as_deferred().unwrap());
                    assert!(dependents.contains(&all.as_deferred().unwrap()));
                    assert!(dependents.contains(&downstream.as_deferred().unwrap()));
                }
                other => panic!("expected failed outcome, got {:?}", other),
            }

            // The sibling writes were not rolled back.
            assert_eq!(tokio::fs::read_to_string(&path_a).await.unwrap(), "A");
            assert_eq!(tokio::fs::read_to_string(&path_b).await.unwrap(), "B");
            // The dependent compute node never ran.
            assert!(report.timing(downstream.as_deferred().unwrap()).is_none());
            assert_eq!(
                report.error(downstream.as_deferred().unwrap()).unwrap().kind,
                OpErrorKind::Dependency
            );

            let _ = tokio::fs::remove_file(&path_a).await;
            let _ = tokio::fs::remove_file(&path_b).await;
        });
    }

    #[test]
    fn test_dependency_failure_skips_the_driver() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let content = session
                .read_file(s(&scratch_path("dep-missing")))
                .expect("read_file");
            let decoded = session.json_decode(content).expect("json_decode");
            session.mark_root(&decoded);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(!report.is_completed());
            assert_eq!(
                report.state(decoded.as_deferred().unwrap()),
                Some(NodeState::Failed)
            );
            assert_eq!(
                report.error(decoded.as_deferred().unwrap()).unwrap().kind,
                OpErrorKind::Dependency
            );
            assert!(report.timing(decoded.as_deferred().unwrap()).is_none());
        });
    }

    #[test]
    fn test_cancellation_reaches_terminal_quickly() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let long = session.sleep(f(5.0)).expect("sleep");
            let follow = session.sleep(f(5.0)).expect("sleep");
            let chained = session.after(long.clone(), follow.clone()).expect("after");
            session.mark_root(&chained);
            let plan = session.freeze().expect("freeze");

            let executor = Executor::new();
            let token = executor.cancellation_token();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            });

            let started = Instant::now();
            let report = executor.run(&plan).await;
            let elapsed = started.elapsed();

            assert!(
                elapsed < Duration::from_secs(1),
                "cancellation took too long: {:?}",
                elapsed
            );
            assert!(matches!(report.outcome, ExecutionOutcome::Cancelled));
            assert_eq!(
                report.state(long.as_deferred().unwrap()),
                Some(NodeState::Cancelled)
            );
            // The gated follow-up never started running.
            assert_eq!(
                report.state(follow.as_deferred().unwrap()),
                Some(NodeState::Cancelled)
            );
            assert!(report.timing(follow.as_deferred().unwrap()).is_none());
        });
    }

    #[test]
    fn test_concurrency_cap_serializes_dispatch() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let ops: Vec<Value> = (0..3)
                .map(|_| session.sleep(f(0.05)).expect("sleep"))
                .collect();
            let all = session.gather(ops).expect("gather");
            session.mark_root(&all);
            let plan = session.freeze().expect("freeze");

            let started = Instant::now();
            let report = Executor::new().with_max_parallel(1).run(&plan).await;
            let elapsed = started.elapsed();

            assert!(report.is_completed());
            assert!(
                elapsed >= Duration::from_millis(145),
                "cap of one should serialize sleeps, took {:?}",
                elapsed
            );
        });
    }

    #[test]
    fn test_compute_chain_resolves_inline() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let sum = session.binary(BinOp::Add, Value::Int(2), Value::Int(3));
            let product = session.binary(BinOp::Mul, sum, Value::Int(4));
            session.mark_root(&product);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            assert_eq!(
                report.result(product.as_deferred().unwrap()),
                Some(&Value::Int(20))
            );
        });
    }

    #[test]
    fn test_gather_of_nothing_is_an_empty_list() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let all = session.gather(vec![]).expect("gather");
            session.mark_root(&all);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            assert_eq!(
                report.result(all.as_deferred().unwrap()),
                Some(&Value::List(vec![]))
            );
        });
    }

    #[test]
    fn test_at_least_resolves_before_slow_siblings() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let fast = session.sleep(f(0.01)).expect("sleep");
            let slow = session.sleep(f(0.3)).expect("sleep");
            let quorum = session
                .at_least(Value::Int(1), vec![fast, slow])
                .expect("at_least");
            session.mark_root(&quorum);
            let plan = session.freeze().expect("freeze");

            let started = Instant::now();
            let report = Executor::new().run(&plan).await;

            assert!(report.is_completed());
            assert_eq!(
                report.result(quorum.as_deferred().unwrap()),
                Some(&Value::Bool(true))
            );
            let (_, done) = report.timing(quorum.as_deferred().unwrap()).unwrap();
            assert!(done.duration_since(started) < Duration::from_millis(200));
        });
    }

    #[test]
    fn test_at_least_reports_false_when_quorum_unreachable() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let only = session.sleep(f(0.01)).expect("sleep");
            let quorum = session
                .at_least(Value::Int(5), vec![only])
                .expect("at_least");
            session.mark_root(&quorum);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            assert_eq!(
                report.result(quorum.as_deferred().unwrap()),
                Some(&Value::Bool(false))
            );
        });
    }

    #[test]
    fn test_at_most_counts_successes_without_failing() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let a = session.sleep(f(0.01)).expect("sleep");
            let b = session.sleep(f(0.01)).expect("sleep");
            let cap = session.at_most(Value::Int(1), vec![a, b]).expect("at_most");
            session.mark_root(&cap);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            assert_eq!(
                report.result(cap.as_deferred().unwrap()),
                Some(&Value::Bool(false))
            );
        });
    }

    #[test]
    fn test_exec_captures_exit_code_and_streams() {
        tokio_test::block_on(async {
            let mut session = PlanSession::new();
            let run = session
                .exec(
                    Value::List(vec![
                        s("sh"),
                        s("-c"),
                        s("echo out; echo err >&2; exit 3"),
                    ]),
                    Value::Null,
                    Value::Null,
                )
                .expect("exec");
            session.mark_root(&run);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            let result = report.result(run.as_deferred().unwrap()).expect("result");
            assert_eq!(struct_field(result, "code"), &Value::Int(3));
            assert_eq!(struct_field(result, "stdout"), &s("out\n"));
            assert_eq!(struct_field(result, "stderr"), &s("err\n"));
        });
    }

    #[test]
    fn test_file_pipeline_end_to_end() {
        tokio_test::block_on(async {
            let dir = scratch_path("filedir");
            let file = format!("{}/data.json", dir);

            let mut session = PlanSession::new();
            let made = session.mkdir(s(&dir), true).expect("mkdir");
            let write = session.write_file(s(&file), s(r#"{"n": 7}"#)).expect("write");
            let write_done = session.after(made, write.clone()).expect("after");
            let content = session.read_file(s(&file)).expect("read");
            let gated_content = session.after(write_done, content).expect("after");
            let decoded = session.json_decode(gated_content).expect("decode");
            let exists = session.file_exists(s(&file)).expect("exists");
            let exists = session.after(write.clone(), exists).expect("after");
            session.mark_root(&decoded);
            session.mark_root(&exists);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            let decoded_value = report.result(decoded.as_deferred().unwrap()).unwrap();
            match decoded_value {
                Value::Map(entries) => {
                    assert_eq!(
                        entries.get(&blueprint_core::MapKey::Str("n".into())),
                        Some(&Value::Int(7))
                    );
                }
                other => panic!("expected map, got {:?}", other),
            }
            assert_eq!(
                report.result(exists.as_deferred().unwrap()),
                Some(&Value::Bool(true))
            );

            let _ = tokio::fs::remove_dir_all(&dir).await;
        });
    }

    #[test]
    fn test_http_request_returns_status_as_data() {
        tokio_test::block_on(async {
            let (addr, server) = spawn_http_server("HTTP/1.1 404 Not Found", "nope").await;

            let mut session = PlanSession::new();
            let response = session
                .http_request(
                    s("GET"),
                    s(&format!("http://{}/missing", addr)),
                    Value::Null,
                    Value::Null,
                )
                .expect("http_request");
            session.mark_root(&response);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            // Non-2xx is data, not a failure.
            assert!(report.is_completed());
            let result = report.result(response.as_deferred().unwrap()).unwrap();
            assert_eq!(struct_field(result, "status"), &Value::Int(404));
            assert_eq!(struct_field(result, "body"), &s("nope"));

            server.abort();
        });
    }

    async fn spawn_http_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let response = format!(
                    "{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (addr, server)
    }

    #[test]
    fn test_tcp_request_against_echo_listener() {
        tokio_test::block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("addr");
            let echo = tokio::spawn(async move {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let mut buf = vec![0u8; 1024];
                    if let Ok(n) = stream.read(&mut buf).await {
                        if n > 0 {
                            let _ = stream.write_all(&buf[..n]).await;
                        }
                    }
                    // Hold the connection open until the client is done.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            });

            let mut session = PlanSession::new();
            let conn = session
                .tcp_connect(s("127.0.0.1"), Value::Int(addr.port() as i64))
                .expect("tcp_connect");
            let sent = session
                .event_write(conn.clone(), s("ping"), Value::Null)
                .expect("event_write");
            let polled = session
                .event_poll(Value::List(vec![conn.clone()]), Value::Int(2000))
                .expect("event_poll");
            let reply = session.after(sent.clone(), polled.clone()).expect("after");
            session.mark_root(&reply);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());
            assert_eq!(
                report.result(sent.as_deferred().unwrap()),
                Some(&Value::Int(4))
            );
            let event = report.result(reply.as_deferred().unwrap()).expect("event");
            assert_eq!(struct_field(event, "type"), &s("data"));
            assert_eq!(
                struct_field(struct_field(event, "data"), "bytes"),
                &Value::Bytes(b"ping".to_vec())
            );

            echo.abort();
        });
    }

    #[test]
    fn test_event_poll_timeout_resolves_to_null() {
        tokio_test::block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("addr");
            let silent = tokio::spawn(async move {
                if let Ok(_conn) = listener.accept().await {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            });

            let mut session = PlanSession::new();
            let conn = session
                .tcp_connect(s("127.0.0.1"), Value::Int(addr.port() as i64))
                .expect("tcp_connect");
            let polled = session
                .event_poll(Value::List(vec![conn]), Value::Int(50))
                .expect("event_poll");
            session.mark_root(&polled);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            // A timeout is a null result, not a failure.
            assert!(report.is_completed());
            assert_eq!(report.result(polled.as_deferred().unwrap()), Some(&Value::Null));

            silent.abort();
        });
    }

    #[test]
    fn test_observer_sees_node_lifecycle() {
        tokio_test::block_on(async {
            let observer = Arc::new(CollectObserver {
                phases: RwLock::new(Vec::new()),
            });

            let mut session = PlanSession::new();
            let nap = session.sleep(f(0.01)).expect("sleep");
            session.mark_root(&nap);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new()
                .with_observer(observer.clone())
                .run(&plan)
                .await;
            assert!(report.is_completed());

            let phases = observer.phases.read().await.clone();
            assert!(phases.iter().any(|p| p == "node_started"));
            assert!(phases.iter().any(|p| p == "node_succeeded"));
            assert!(phases.iter().any(|p| p == "run_completed"));
        });
    }

    #[test]
    fn test_independent_nodes_have_no_ordering() {
        tokio_test::block_on(async {
            // Count how many sleeps overlap: with three independent 50ms
            // sleeps and no cap, at least two must be in flight together.
            let mut session = PlanSession::new();
            let ops: Vec<Value> = (0..3)
                .map(|_| session.sleep(f(0.05)).expect("sleep"))
                .collect();
            let all = session.gather(ops.clone()).expect("gather");
            session.mark_root(&all);
            let plan = session.freeze().expect("freeze");

            let report = Executor::new().run(&plan).await;
            assert!(report.is_completed());

            let overlapping = ops
                .iter()
                .flat_map(|a| ops.iter().map(move |b| (a, b)))
                .filter(|(a, b)| a.as_deferred() != b.as_deferred())
                .filter(|(a, b)| {
                    let (a_start, a_done) = report.timing(a.as_deferred().unwrap()).unwrap();
                    let (b_start, _) = report.timing(b.as_deferred().unwrap()).unwrap();
                    b_start >= a_start && b_start < a_done
                })
                .count();
            assert!(overlapping > 0, "expected at least one overlapping pair");
        });
    }

}
