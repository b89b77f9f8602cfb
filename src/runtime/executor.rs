//! The BSP execution engine.
//!
//! [`Executor::execute`] spawns a driver task and immediately returns an
//! [`EventStream`]. The driver resolves lineage and checkpoint state, then
//! runs the superstep loop — plan, execute, update — until the planner
//! comes up empty or the step budget runs out. Each step runs its tasks
//! concurrently with a join barrier; buffered channel writes are published
//! only after the barrier, so a task never observes same-step mutations.
//!
//! Terminal outcomes are always delivered synchronously on the event
//! channel: a completion event with a sanitized snapshot of final state, a
//! terminal error event, or an interrupt event after the interrupt
//! checkpoint is persisted.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::instrument;

use crate::command::Command;
use crate::events::{
    ChannelUpdateEvent, ErrorEvent, EventEmitter, EventStream, ExecutionEvent, GraphCompletion,
    InterruptEvent, StateUpdateEvent, StepEvent, StepPhase, event_channel,
};
use crate::graph::Graph;
use crate::node::NodeError;
use crate::runtime::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    PendingWrite, PutFullRequest, SaverError,
};
use crate::runtime::config::{Invocation, RunOptions};
use crate::runtime::context::ExecutionContext;
use crate::runtime::interrupt::{InterruptError, InterruptState, STATIC_AFTER, STATIC_BEFORE};
use crate::runtime::planner::{PlannedTask, peek_frontier, plan_step};
use crate::runtime::task::{TaskEnv, TaskSpec, panic_message, run_task};
use crate::state::State;
use crate::types::{KEY_COMMAND, KEY_NEXT_NODES, KEY_RESUME, KEY_RESUME_MAP, is_internal_key,
    trigger_channel};
use crate::utils::id_generator::IdGenerator;

/// Terminal failures surfaced by [`Executor::invoke`].
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// The run emitted a terminal error event.
    #[error("run failed at step {step}: {message}")]
    #[diagnostic(code(graphflow::executor::failed))]
    Failed { step: i64, message: String },

    /// The run paused on an interrupt; resume it with a command on the same
    /// lineage.
    #[error("run interrupted at step {step} in node '{node_id}'")]
    #[diagnostic(
        code(graphflow::executor::interrupted),
        help("Re-invoke with Command::resume(..) or Command::resume_map(..) on the same lineage.")
    )]
    Interrupted {
        step: i64,
        node_id: String,
        value: Value,
    },

    /// The event channel closed without a terminal event.
    #[error("run ended without a terminal event")]
    #[diagnostic(code(graphflow::executor::no_completion))]
    NoCompletion,
}

/// Runs compiled graphs.
#[derive(Clone)]
pub struct Executor {
    graph: Arc<Graph>,
    saver: Option<Arc<dyn CheckpointSaver>>,
}

impl Executor {
    #[must_use]
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            saver: None,
        }
    }

    #[must_use]
    pub fn from_arc(graph: Arc<Graph>) -> Self {
        Self { graph, saver: None }
    }

    /// Attaches a checkpoint saver; without one, runs are ephemeral.
    #[must_use]
    pub fn with_saver(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Starts a run and returns its event stream. The driver survives
    /// panics in itself and in tasks: both surface as error events.
    pub fn execute(
        &self,
        initial_state: State,
        invocation: Invocation,
        options: RunOptions,
    ) -> EventStream {
        let (emitter, stream) = event_channel(options.event_buffer);
        let graph = Arc::clone(&self.graph);
        let saver = self.saver.clone();
        let driver_emitter = emitter.clone();
        tokio::spawn(async move {
            let driver = Driver {
                graph,
                saver,
                options,
                invocation,
                emitter,
                ids: IdGenerator::new(),
            };
            let outcome = AssertUnwindSafe(driver.drive(initial_state)).catch_unwind().await;
            if let Err(payload) = outcome {
                let message = panic_message(payload);
                tracing::error!(error = %message, "executor panicked");
                driver_emitter
                    .emit_final(ExecutionEvent::Error(ErrorEvent {
                        step: -1,
                        error: format!("executor panicked: {message}"),
                    }))
                    .await;
            }
        });
        stream
    }

    /// Runs to completion and returns the final state.
    ///
    /// Interrupts surface as [`ExecutorError::Interrupted`]; resume by
    /// invoking again with a resume command on the same lineage.
    pub async fn invoke(
        &self,
        initial_state: State,
        invocation: Invocation,
        options: RunOptions,
    ) -> Result<State, ExecutorError> {
        let stream = self.execute(initial_state, invocation, options);
        let mut completion: Option<GraphCompletion> = None;
        let mut failure: Option<ErrorEvent> = None;
        let mut interrupt: Option<InterruptEvent> = None;
        while let Some(event) = stream.next().await {
            match event {
                ExecutionEvent::Completion(done) => completion = Some(done),
                ExecutionEvent::Error(error) => failure = Some(error),
                ExecutionEvent::Interrupt(paused) => interrupt = Some(paused),
                _ => {}
            }
        }
        if let Some(error) = failure {
            return Err(ExecutorError::Failed {
                step: error.step,
                message: error.error,
            });
        }
        if let Some(paused) = interrupt {
            return Err(ExecutorError::Interrupted {
                step: paused.step,
                node_id: paused.node_id,
                value: paused.value,
            });
        }
        completion
            .map(|done| State::from_values(done.state_delta))
            .ok_or(ExecutorError::NoCompletion)
    }
}

/// How a step ended, as seen by the driver loop.
enum StepOutcome {
    Ran,
    Empty,
    Failed { message: String },
    Interrupted,
    DeadlineExceeded,
}

struct Driver {
    graph: Arc<Graph>,
    saver: Option<Arc<dyn CheckpointSaver>>,
    options: RunOptions,
    invocation: Invocation,
    emitter: EventEmitter,
    ids: IdGenerator,
}

struct RunState {
    exec: Arc<ExecutionContext>,
    config: CheckpointConfig,
    resumed: bool,
    start_step: i64,
    has_resume_payload: bool,
    cleared_interrupt: Option<InterruptState>,
}

impl Driver {
    #[instrument(skip_all, fields(invocation = %self.invocation.invocation_id))]
    async fn drive(&self, mut initial_state: State) {
        let run_started = Instant::now();

        // Lineage: explicit config, else the invocation id, else generated.
        let mut config = self.options.config.clone();
        let lineage_id = config
            .lineage_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                let id = self.invocation.invocation_id.clone();
                (!id.is_empty()).then_some(id)
            })
            .unwrap_or_else(|| self.ids.generate_lineage_id());
        config.lineage_id = Some(lineage_id);

        let command: Option<Command> = initial_state
            .remove(KEY_COMMAND)
            .and_then(|value| serde_json::from_value(value).ok());

        let mut run = match self.prepare(initial_state, config, &command).await {
            Ok(run) => run,
            Err(error) => {
                self.emitter
                    .emit_final(ExecutionEvent::Error(ErrorEvent {
                        step: -1,
                        error: error.to_string(),
                    }))
                    .await;
                return;
            }
        };

        let mut total_steps: i64 = 0;
        let mut step = run.start_step;
        while step < self.options.max_steps {
            match self.run_step(&mut run, step).await {
                StepOutcome::Ran => {
                    total_steps += 1;
                    step += 1;
                }
                StepOutcome::Empty => break,
                StepOutcome::Failed { message } => {
                    self.emitter
                        .emit_final(ExecutionEvent::Error(ErrorEvent {
                            step,
                            error: message,
                        }))
                        .await;
                    return;
                }
                StepOutcome::Interrupted => return,
                StepOutcome::DeadlineExceeded => {
                    self.emitter
                        .emit_final(ExecutionEvent::Error(ErrorEvent {
                            step,
                            error: "step deadline exceeded".to_string(),
                        }))
                        .await;
                    return;
                }
            }
        }

        let final_state = run.exec.snapshot();
        self.emitter
            .emit_final(ExecutionEvent::Completion(GraphCompletion {
                state_delta: final_state.into_values(),
                total_steps,
                total_duration_ms: run_started.elapsed().as_millis() as u64,
            }))
            .await;
    }

    /// Restores from a checkpoint or initializes a fresh run, applies resume
    /// payloads, and writes the initial checkpoint for fresh runs.
    async fn prepare(
        &self,
        initial_state: State,
        config: CheckpointConfig,
        command: &Option<Command>,
    ) -> Result<RunState, SaverError> {
        let mut restored: Option<RunState> = None;
        if let Some(saver) = &self.saver {
            match saver.get_tuple(&config).await {
                Ok(Some(tuple)) => {
                    let mut state = self.graph.schema().restore(tuple.checkpoint.channel_values);
                    // Caller-supplied values win, except internal keys.
                    for (key, value) in initial_state.iter() {
                        if !is_internal_key(key) {
                            state.insert(key.clone(), value.clone());
                        }
                    }
                    let exec = Arc::new(ExecutionContext::new(state, self.emitter.clone()));
                    exec.set_versions_seen(tuple.checkpoint.versions_seen.clone());
                    for (name, version) in &tuple.checkpoint.channel_versions {
                        exec.channels().ensure(name).restore_version(*version);
                    }
                    exec.set_last_checkpoint_id(Some(tuple.checkpoint.id.clone()));
                    exec.advance_sequence_past(&tuple.pending_writes);

                    if tuple.pending_writes.is_empty() {
                        if !tuple.checkpoint.next_nodes.is_empty() {
                            exec.insert_value(KEY_NEXT_NODES, json!(tuple.checkpoint.next_nodes));
                        }
                    } else {
                        // Replay recreates the availability the original
                        // step produced, so version triggering rebuilds the
                        // frontier.
                        exec.publish_writes(&tuple.pending_writes, tuple.metadata.step);
                    }

                    restored = Some(RunState {
                        exec,
                        config: CheckpointConfig {
                            checkpoint_id: None,
                            ..config.clone()
                        },
                        resumed: true,
                        start_step: (tuple.metadata.step + 1).max(0),
                        has_resume_payload: false,
                        cleared_interrupt: tuple.checkpoint.interrupt_state.clone(),
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "checkpoint load failed; starting fresh");
                }
            }
        }

        let mut run = match restored {
            Some(run) => run,
            None => {
                let mut state = initial_state;
                self.graph.schema().initialize(&mut state);
                let exec = Arc::new(ExecutionContext::new(state, self.emitter.clone()));
                exec.seed_input_channels();
                RunState {
                    exec,
                    config,
                    resumed: false,
                    start_step: 0,
                    has_resume_payload: false,
                    cleared_interrupt: None,
                }
            }
        };

        // Resume payload from the caller's command and from configuration.
        if let Some(command) = command {
            if let Some(value) = &command.resume {
                run.exec.insert_value(KEY_RESUME, value.clone());
                run.has_resume_payload = true;
            }
            if let Some(entries) = &command.resume_map {
                self.merge_resume_map(&run, entries.iter());
                run.has_resume_payload = true;
            }
        }
        if let Some(entries) = run.config.resume_map.clone() {
            self.merge_resume_map(&run, entries.iter());
            run.has_resume_payload = true;
        }

        if !run.resumed && self.saver.is_some() {
            let checkpoint = self.build_checkpoint(
                &run,
                Vec::new(),
                vec![self.graph.entry_point().to_string()],
                Vec::new(),
                None,
            );
            // The initial checkpoint is the one save that must succeed.
            self.save_checkpoint(&run, checkpoint, CheckpointSource::Input, -1, Vec::new())
                .await?;
        }
        Ok(run)
    }

    fn merge_resume_map<'a, I>(&self, run: &RunState, entries: I)
    where
        I: Iterator<Item = (&'a String, &'a Value)>,
    {
        let mut map = match run.exec.get_value(KEY_RESUME_MAP) {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        run.exec.insert_value(KEY_RESUME_MAP, Value::Object(map));
    }

    /// One superstep: plan, execute behind a join barrier, publish, events,
    /// checkpoint.
    async fn run_step(&self, run: &mut RunState, step: i64) -> StepOutcome {
        let step_deadline = self
            .options
            .step_timeout
            .map(|timeout| Instant::now() + timeout);

        // Plan.
        let planned = plan_step(&self.graph, &run.exec, step, run.resumed);
        if planned.is_empty() {
            return StepOutcome::Empty;
        }
        let active_nodes: Vec<String> = planned.iter().map(|t| t.node_id.clone()).collect();
        self.emitter.emit(ExecutionEvent::Step(StepEvent {
            phase: StepPhase::Planning,
            step,
            task_count: planned.len(),
            active_nodes: active_nodes.clone(),
            updated_channels: Vec::new(),
        }));

        // Static interrupt points before any planned node.
        for task in &planned {
            if self.graph.interrupts_before(&task.node_id)
                && !self.clears_static(run, &task.node_id, STATIC_BEFORE)
            {
                let interrupt_state = InterruptState::static_point(&task.node_id, step, STATIC_BEFORE);
                self.persist_interrupt(run, step, &interrupt_state, &active_nodes)
                    .await;
                self.emitter
                    .emit_final(ExecutionEvent::Interrupt(InterruptEvent {
                        step,
                        node_id: task.node_id.clone(),
                        value: Value::Null,
                    }))
                    .await;
                return StepOutcome::Interrupted;
            }
        }

        // Execute.
        self.emitter.emit(ExecutionEvent::Step(StepEvent {
            phase: StepPhase::Execution,
            step,
            task_count: planned.len(),
            active_nodes: active_nodes.clone(),
            updated_channels: Vec::new(),
        }));
        match self.execute_tasks(run, step, step_deadline, planned).await {
            TaskWave::Completed => {}
            TaskWave::Failed { message } => return StepOutcome::Failed { message },
            TaskWave::Interrupted(interrupts) => {
                let first = interrupts
                    .first()
                    .cloned()
                    .unwrap_or_else(|| InterruptError::new("", Value::Null));
                let interrupted_nodes: Vec<String> = interrupts
                    .iter()
                    .filter_map(|i| i.node_id.clone())
                    .collect();
                self.persist_interrupt(run, step, &first.to_state(), &interrupted_nodes)
                    .await;
                self.emitter
                    .emit_final(ExecutionEvent::Interrupt(InterruptEvent {
                        step,
                        node_id: first.node_id.clone().unwrap_or_default(),
                        value: first.value.clone(),
                    }))
                    .await;
                return StepOutcome::Interrupted;
            }
            TaskWave::DeadlineExceeded => return StepOutcome::DeadlineExceeded,
        }

        // Update: publish the step's buffered writes, then report.
        let writes = run.exec.take_pending_writes();
        let updated_channels = run.exec.publish_writes(&writes, step);
        for name in &updated_channels {
            let channel = run.exec.channels().ensure(name);
            self.emitter
                .emit(ExecutionEvent::ChannelUpdate(ChannelUpdateEvent {
                    name: name.clone(),
                    behavior: channel.behavior(),
                    available: channel.is_available(),
                    triggered_nodes: self.graph.triggered_nodes(name).to_vec(),
                }));
        }
        self.emitter.emit(ExecutionEvent::Step(StepEvent {
            phase: StepPhase::Update,
            step,
            task_count: active_nodes.len(),
            active_nodes: active_nodes.clone(),
            updated_channels: updated_channels.clone(),
        }));
        self.emitter
            .emit(ExecutionEvent::StateUpdate(StateUpdateEvent {
                updated_keys: run.exec.take_updated_keys(),
                state_size: run.exec.state_len(),
            }));

        // Best-effort checkpoint; the published writes ride along so resume
        // can replay them.
        if self.saver.is_some() {
            let (next_nodes, next_channels) = peek_frontier(&self.graph, &run.exec);
            let checkpoint =
                self.build_checkpoint(run, updated_channels, next_nodes, next_channels, None);
            if let Err(error) = self
                .save_checkpoint(run, checkpoint, CheckpointSource::Loop, step, writes)
                .await
            {
                tracing::debug!(step, error = %error, "checkpoint save failed; continuing");
            }
        }
        run.exec.channels().clear_step_marks();

        // Static interrupt points after a node that just ran.
        for node_id in &active_nodes {
            if self.graph.interrupts_after(node_id)
                && !self.clears_static(run, node_id, STATIC_AFTER)
            {
                let interrupt_state = InterruptState::static_point(node_id, step, STATIC_AFTER);
                let (next_nodes, _) = peek_frontier(&self.graph, &run.exec);
                self.persist_interrupt(run, step, &interrupt_state, &next_nodes)
                    .await;
                self.emitter
                    .emit_final(ExecutionEvent::Interrupt(InterruptEvent {
                        step,
                        node_id: node_id.clone(),
                        value: Value::Null,
                    }))
                    .await;
                return StepOutcome::Interrupted;
            }
        }

        StepOutcome::Ran
    }

    /// Spawns one worker per task and joins them all (the BSP barrier).
    async fn execute_tasks(
        &self,
        run: &RunState,
        step: i64,
        step_deadline: Option<Instant>,
        planned: Vec<PlannedTask>,
    ) -> TaskWave {
        let env = Arc::new(TaskEnv {
            graph: Arc::clone(&self.graph),
            exec: Arc::clone(&run.exec),
            invocation: self.invocation.clone(),
            step,
            step_deadline,
            node_timeout: self.options.effective_node_timeout(),
        });

        let mut join_set: JoinSet<(String, Result<(), NodeError>)> = JoinSet::new();
        for task in planned {
            let Some(node) = self.graph.node(&task.node_id).cloned() else {
                return TaskWave::Failed {
                    message: format!("planned unknown node '{}'", task.node_id),
                };
            };
            // Snapshot before spawning: tasks of one step never observe
            // each other's merges.
            let mut input = run.exec.snapshot();
            if let Some(overlay) = task.overlay {
                self.graph.schema().apply_update(&mut input, overlay);
            }
            let spec = TaskSpec {
                node,
                task_id: self.ids.generate_task_id(),
                path: task.path,
                branch: task
                    .branch
                    .unwrap_or_else(|| self.invocation.branch.clone()),
                input,
            };
            let env = Arc::clone(&env);
            join_set.spawn(async move {
                let node_id = spec.node.id.clone();
                (node_id, run_task(&env, &spec).await)
            });
        }

        let collect = async {
            let mut results: Vec<(String, Result<(), NodeError>)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(join_error) => {
                        let message = if join_error.is_panic() {
                            panic_message(join_error.into_panic())
                        } else {
                            join_error.to_string()
                        };
                        results.push((
                            "<task>".to_string(),
                            Err(NodeError::Panic { message }),
                        ));
                    }
                }
            }
            results
        };
        let results = match step_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, collect).await {
                Ok(results) => results,
                Err(_) => return TaskWave::DeadlineExceeded,
            },
            None => collect.await,
        };

        let mut interrupts: Vec<InterruptError> = Vec::new();
        for (node_id, result) in results {
            match result {
                Ok(()) => {}
                Err(NodeError::Interrupt(interrupt)) => interrupts.push(interrupt),
                Err(error) => {
                    return TaskWave::Failed {
                        message: format!("node '{node_id}' failed: {error}"),
                    };
                }
            }
        }
        if !interrupts.is_empty() {
            return TaskWave::Interrupted(interrupts);
        }
        TaskWave::Completed
    }

    /// Whether a resume payload clears the static interrupt recorded for
    /// this node in the loaded checkpoint. Consumes the clearance.
    fn clears_static(&self, run: &mut RunState, node_id: &str, phase: &str) -> bool {
        if !run.has_resume_payload {
            return false;
        }
        let matches = run.cleared_interrupt.as_ref().is_some_and(|state| {
            state.node_id == node_id && state.path.iter().any(|p| p == phase)
        });
        if matches {
            run.cleared_interrupt = None;
        }
        matches
    }

    /// Persists an interrupt checkpoint: unpublished writes plus synthetic
    /// trigger writes, so replay re-raises the interrupted frontier.
    async fn persist_interrupt(
        &self,
        run: &RunState,
        step: i64,
        interrupt_state: &InterruptState,
        interrupted_nodes: &[String],
    ) {
        let Some(_) = &self.saver else { return };

        for node_id in interrupted_nodes {
            run.exec.record_write(
                trigger_channel(node_id),
                Value::Null,
                &interrupt_state.task_id,
            );
        }
        let writes = run.exec.pending_writes_snapshot();

        let (frontier_nodes, next_channels) = peek_frontier(&self.graph, &run.exec);
        let mut next_nodes = interrupted_nodes.to_vec();
        for node_id in frontier_nodes {
            if !next_nodes.contains(&node_id) {
                next_nodes.push(node_id);
            }
        }

        let checkpoint = self.build_checkpoint(
            run,
            Vec::new(),
            next_nodes,
            next_channels,
            Some(interrupt_state.clone()),
        );
        if let Err(error) = self
            .save_checkpoint(run, checkpoint, CheckpointSource::Interrupt, step, writes)
            .await
        {
            tracing::debug!(step, error = %error, "interrupt checkpoint save failed");
        }
    }

    fn build_checkpoint(
        &self,
        run: &RunState,
        updated_channels: Vec<String>,
        next_nodes: Vec<String>,
        next_channels: Vec<String>,
        interrupt_state: Option<InterruptState>,
    ) -> Checkpoint {
        Checkpoint {
            id: self.ids.generate_checkpoint_id(),
            parent_id: run.exec.last_checkpoint_id(),
            channel_values: run.exec.snapshot().into_values(),
            channel_versions: run.exec.channels().version_snapshot(),
            versions_seen: run.exec.versions_seen_snapshot(),
            updated_channels,
            next_nodes,
            next_channels,
            interrupt_state,
            timestamp: Utc::now(),
        }
    }

    async fn save_checkpoint(
        &self,
        run: &RunState,
        checkpoint: Checkpoint,
        source: CheckpointSource,
        step: i64,
        pending_writes: Vec<PendingWrite>,
    ) -> Result<(), SaverError> {
        let Some(saver) = &self.saver else {
            return Ok(());
        };
        let checkpoint_id = checkpoint.id.clone();
        let request = PutFullRequest {
            config: run.config.clone(),
            checkpoint,
            metadata: CheckpointMetadata { source, step },
            pending_writes,
        };
        let save = saver.put_full(request);
        match tokio::time::timeout(self.options.checkpoint_save_timeout, save).await {
            Ok(Ok(_config)) => {
                run.exec.set_last_checkpoint_id(Some(checkpoint_id));
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(SaverError::Backend {
                message: format!(
                    "checkpoint save timed out after {}ms",
                    self.options.checkpoint_save_timeout.as_millis()
                ),
            }),
        }
    }
}

/// Outcome of one step's task wave.
enum TaskWave {
    Completed,
    Failed { message: String },
    Interrupted(Vec<InterruptError>),
    DeadlineExceeded,
}
