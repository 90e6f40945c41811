use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use mbflow_executor::ExecutorRegistry;
use mbflow_observer::ObserverBus;
use mbflow_store::Repository;
use mbflow_template::Scope;
use mbflow_workflow::{
  EventType, Execution, ExecutionStatus, NodeExecution, NodeExecutionStatus, SchedulePlan,
  Workflow, analyze,
};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::emit::Emitter;
use crate::error::EngineError;
use crate::gate::{GateDecision, NodeOutcome, evaluate_gate};
use crate::options::ExecutionOptions;
use crate::task::{NodeTask, TaskResult};

/// Identity/audit hook: annotates an execution with the caller's identity.
/// The engine never interprets the token.
pub trait IdentityHook: Send + Sync {
  fn annotate_execution(&self, execution: &mut Execution, caller_token: &str);
}

struct Inner {
  repository: Arc<dyn Repository>,
  registry: ExecutorRegistry,
  bus: ObserverBus,
  config: EngineConfig,
  plans: DashMap<(String, i64), Arc<SchedulePlan>>,
  live: DashMap<String, CancellationToken>,
  identity: RwLock<Option<Arc<dyn IdentityHook>>>,
}

/// The workflow execution engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<Inner>,
}

enum RunEnd {
  Completed,
  Failed(String),
  Cancelled,
  TimedOut,
}

impl Engine {
  pub fn new(
    repository: Arc<dyn Repository>,
    registry: ExecutorRegistry,
    config: EngineConfig,
  ) -> Self {
    let bus = ObserverBus::new(config.observer_queue_size);
    Self {
      inner: Arc::new(Inner {
        repository,
        registry,
        bus,
        config,
        plans: DashMap::new(),
        live: DashMap::new(),
        identity: RwLock::new(None),
      }),
    }
  }

  /// The engine-owned observer bus. Shared across executions.
  pub fn bus(&self) -> &ObserverBus {
    &self.inner.bus
  }

  pub fn registry(&self) -> &ExecutorRegistry {
    &self.inner.registry
  }

  pub fn set_identity_hook(&self, hook: Arc<dyn IdentityHook>) {
    *self.inner.identity.write().unwrap() = Some(hook);
  }

  /// Drop cached plans for a workflow (call on workflow update).
  pub fn invalidate_plan(&self, workflow_id: &str) {
    self.inner.plans.retain(|(id, _), _| id != workflow_id);
  }

  fn plan_for(&self, workflow: &Workflow) -> Result<Arc<SchedulePlan>, EngineError> {
    let key = (workflow.id.clone(), workflow.version);
    if let Some(plan) = self.inner.plans.get(&key) {
      return Ok(plan.clone());
    }
    let plan = Arc::new(analyze(workflow)?);
    self.inner.plans.insert(key, plan.clone());
    Ok(plan)
  }

  /// Start an execution in the background. Returns once the pending record
  /// is persisted; the actual run happens on a spawned task.
  pub async fn execute(
    &self,
    workflow_id: &str,
    input: Map<String, Value>,
    options: ExecutionOptions,
  ) -> Result<String, EngineError> {
    let workflow = self.load_workflow(workflow_id).await?;
    let plan = self.plan_for(&workflow)?;

    let mut execution = Execution::new(&workflow.id, workflow.version, input);
    self.apply_options(&mut execution, &options);

    let repository = self.inner.repository.clone();
    if repository.create_execution(&execution).await.is_err() {
      repository.create_execution(&execution).await?;
    }

    for observer in &options.observers {
      self.inner.bus.register(observer.clone());
    }

    let engine = self.clone();
    let execution_id = execution.id.clone();
    tokio::spawn(async move {
      engine.run(workflow, plan, execution, options, true).await;
    });

    Ok(execution_id)
  }

  /// Run a workflow to completion inline, without persistence. The workflow
  /// does not need to exist in the repository.
  pub async fn execute_sync(
    &self,
    workflow: &Workflow,
    input: Map<String, Value>,
    options: ExecutionOptions,
  ) -> Result<Execution, EngineError> {
    let plan = Arc::new(analyze(workflow)?);
    let mut execution = Execution::new(&workflow.id, workflow.version, input);
    self.apply_options(&mut execution, &options);

    for observer in &options.observers {
      self.inner.bus.register(observer.clone());
    }

    Ok(
      self
        .run(workflow.clone(), plan, execution, options, false)
        .await,
    )
  }

  /// Request cancellation of a running execution. Idempotent; unknown or
  /// already-terminal executions are a no-op.
  pub async fn cancel(&self, execution_id: &str) -> Result<(), EngineError> {
    if let Some(token) = self.inner.live.get(execution_id) {
      let _ = self
        .inner
        .repository
        .update_execution_status(
          execution_id,
          ExecutionStatus::Running,
          ExecutionStatus::Cancelling,
          None,
        )
        .await;
      token.cancel();
    }
    Ok(())
  }

  /// Create a new execution seeded from a terminal failed one. The original
  /// is not mutated.
  pub async fn retry(&self, execution_id: &str) -> Result<String, EngineError> {
    let original = self.inner.repository.get_execution(execution_id).await?;
    if original.status != ExecutionStatus::Failed {
      return Err(EngineError::NotRetryable {
        id: execution_id.to_string(),
        status: format!("{:?}", original.status).to_lowercase(),
      });
    }

    let workflow = self.load_workflow(&original.workflow_id).await?;
    if workflow.version != original.workflow_version {
      return Err(EngineError::VersionChanged {
        workflow_id: workflow.id.clone(),
        expected: original.workflow_version,
        current: workflow.version,
      });
    }

    let options = ExecutionOptions {
      strict_mode: original.strict_mode,
      variables: original.variables.clone(),
      caller: original.triggered_by.clone(),
      ..Default::default()
    };
    self.execute(&original.workflow_id, original.input, options).await
  }

  fn apply_options(&self, execution: &mut Execution, options: &ExecutionOptions) {
    execution.strict_mode = options.strict_mode;
    execution.variables = options.variables.clone();
    if let Some(caller) = &options.caller {
      let hook = self.inner.identity.read().unwrap().clone();
      match hook {
        Some(hook) => hook.annotate_execution(execution, caller),
        None => execution.triggered_by = Some(caller.clone()),
      }
    }
  }

  async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
    match self.inner.repository.get_workflow(workflow_id).await {
      Ok(workflow) => Ok(workflow),
      Err(mbflow_store::StoreError::NotFound(message)) => {
        Err(EngineError::Store(mbflow_store::StoreError::NotFound(message)))
      }
      // One retry on backend trouble before giving up.
      Err(_) => Ok(self.inner.repository.get_workflow(workflow_id).await?),
    }
  }

  #[instrument(name = "execution_run", skip_all, fields(
    workflow_id = %workflow.id,
    execution_id = %execution.id,
  ))]
  async fn run(
    &self,
    workflow: Workflow,
    plan: Arc<SchedulePlan>,
    mut execution: Execution,
    options: ExecutionOptions,
    persist: bool,
  ) -> Execution {
    let repository: Option<Arc<dyn Repository>> = persist.then(|| self.inner.repository.clone());
    let emitter = Arc::new(Emitter::new(
      &execution.id,
      &workflow.id,
      self.inner.bus.clone(),
      repository.clone(),
    ));
    let cancel = CancellationToken::new();
    self
      .inner
      .live
      .insert(execution.id.clone(), cancel.clone());

    execution.status = ExecutionStatus::Running;
    execution.started_at = Some(chrono::Utc::now());
    if let Some(repository) = &repository {
      persist_status(
        repository,
        &execution.id,
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        None,
      )
      .await;
    }
    info!("workflow_started");
    emitter
      .emit(EventType::ExecutionStarted, |e| e.with_status("running"))
      .await;

    let parallelism = match options.max_parallelism {
      Some(0) => 1,
      Some(n) => n,
      None => self.inner.config.max_parallelism.max(1),
    };
    let semaphore = Arc::new(Semaphore::new(parallelism));
    let timeout = options.timeout.unwrap_or(self.inner.config.execution_timeout);
    let deadline = tokio::time::Instant::now() + timeout;
    let node_count = workflow.nodes.len();

    let mut scope = Scope::new(&workflow.variables, &execution.variables, &execution.input);
    let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
    let mut loop_counts: HashMap<String, u32> = HashMap::new();
    let mut timed_out = false;
    let mut end = RunEnd::Completed;

    let mut wave_index = 0usize;
    'waves: while wave_index < plan.waves.len() {
      if cancel.is_cancelled() {
        end = RunEnd::Cancelled;
        break;
      }
      if tokio::time::Instant::now() >= deadline {
        timed_out = true;
        cancel.cancel();
        end = RunEnd::TimedOut;
        break;
      }

      let wave = plan.waves[wave_index].clone();
      emitter
        .emit(EventType::WaveStarted, |e| {
          e.with_wave(wave_index, wave.len())
        })
        .await;

      // Settle each node in the wave: skip it or collect it into the ready set.
      let mut ready: Vec<(mbflow_workflow::Node, Value)> = Vec::new();
      for node_id in &wave {
        let node = workflow.node(node_id).unwrap().clone();
        let gate = match evaluate_gate(&workflow, &node, &outcomes, &scope, &execution.input) {
          Ok(gate) => gate,
          Err(e) => {
            outcomes.insert(node_id.clone(), NodeOutcome::Failed { continues: false });
            let message = e.to_string();
            emitter
              .emit(EventType::NodeFailed, |ev| {
                ev.with_node(&node.id, &node.name, &node.node_type)
                  .with_status("failed")
                  .with_error(&message)
                  .with_payload(json!({"code": e.code()}))
              })
              .await;
            end = RunEnd::Failed(message);
            break 'waves;
          }
        };

        for evaluation in &gate.evaluations {
          emitter
            .emit(EventType::ConditionEvaluated, |e| {
              e.with_node(&node.id, &node.name, &node.node_type)
                .with_payload(json!({
                  "edge_id": evaluation.edge_id,
                  "condition": evaluation.condition,
                  "result": evaluation.result,
                }))
            })
            .await;
        }

        match gate.decision {
          GateDecision::Ready { input } => ready.push((node, input)),
          GateDecision::Skip => {
            outcomes.insert(node_id.clone(), NodeOutcome::Skipped);
            if let Some(repository) = &repository {
              let mut record = NodeExecution::new(&execution.id, node_id, node.config.clone());
              record.status = NodeExecutionStatus::Skipped;
              record.completed_at = Some(chrono::Utc::now());
              if repository.append_node_execution(&record).await.is_err() {
                let _ = repository.append_node_execution(&record).await;
              }
            }
            emitter
              .emit(EventType::NodeSkipped, |e| {
                e.with_node(&node.id, &node.name, &node.node_type)
                  .with_status("skipped")
              })
              .await;
          }
        }
      }

      // Dispatch the ready set into the bounded pool.
      let mut handles = Vec::with_capacity(ready.len());
      for (node, input) in ready {
        let node_timeout = self.inner.config.node_timeout(node.timeout_ms, node_count);
        let task = NodeTask {
          node,
          input,
          scope: scope.clone(),
          strict: execution.strict_mode,
          registry: self.inner.registry.clone(),
          repository: repository.clone(),
          emitter: emitter.clone(),
          retry: self.inner.config.retry,
          node_timeout,
          cancel: cancel.clone(),
          semaphore: semaphore.clone(),
          execution_id: execution.id.clone(),
          workflow_id: workflow.id.clone(),
        };
        handles.push(tokio::spawn(task.run()));
      }
      let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

      let joined = futures::future::join_all(handles);
      tokio::pin!(joined);
      let results: Vec<Result<TaskResult, tokio::task::JoinError>> = tokio::select! {
        results = &mut joined => results,
        _ = cancel.cancelled() => {
          self.drain_wave(&mut joined, &abort_handles).await
        }
        _ = tokio::time::sleep_until(deadline) => {
          timed_out = true;
          cancel.cancel();
          self.drain_wave(&mut joined, &abort_handles).await
        }
      };

      let mut first_fatal: Option<String> = None;
      let mut saw_cancel = false;
      for result in results {
        match result {
          Ok(task_result) => {
            if let NodeOutcome::Completed(output) = &task_result.outcome {
              scope.set_node_output(&task_result.node_id, output.clone());
              emitter
                .emit(EventType::VariableSet, |e| {
                  e.with_payload(json!({"key": task_result.node_id}))
                })
                .await;
            }
            if matches!(task_result.outcome, NodeOutcome::Cancelled) {
              saw_cancel = true;
            }
            if task_result.fatal && first_fatal.is_none() {
              first_fatal = task_result.error.clone();
            }
            outcomes.insert(task_result.node_id.clone(), task_result.outcome);
          }
          Err(join_error) => {
            if join_error.is_panic() && first_fatal.is_none() {
              first_fatal = Some("node task panicked".to_string());
            }
          }
        }
      }

      emitter
        .emit(EventType::WaveCompleted, |e| {
          e.with_wave(wave_index, wave.len())
        })
        .await;

      // A cancel or timeout racing a node failure resolves in the
      // operator's favor.
      if saw_cancel || cancel.is_cancelled() {
        end = if timed_out {
          RunEnd::TimedOut
        } else {
          RunEnd::Cancelled
        };
        break;
      }
      if let Some(message) = first_fatal {
        end = RunEnd::Failed(message);
        break;
      }

      // A completed loop source re-opens the schedule at its target wave
      // until the back-edge exhausts its iteration budget.
      let mut jumped = false;
      for edge in workflow.edges.iter().filter(|e| e.loop_config.is_some()) {
        if plan.wave_of(&edge.source) != Some(wave_index) {
          continue;
        }
        if !matches!(outcomes.get(&edge.source), Some(NodeOutcome::Completed(_))) {
          continue;
        }
        let max_iterations = edge.loop_config.as_ref().unwrap().max_iterations;
        let fired = loop_counts.entry(edge.id.clone()).or_insert(0);
        if *fired < max_iterations {
          *fired += 1;
          let target_wave = plan.wave_of(&edge.target).unwrap();
          for wave in &plan.waves[target_wave..] {
            for node_id in wave {
              outcomes.remove(node_id);
            }
          }
          wave_index = target_wave;
          jumped = true;
          break;
        }
      }
      if !jumped {
        wave_index += 1;
      }
    }

    self.finish(&workflow, &mut execution, &outcomes, repository, &emitter, end)
      .await;
    self.inner.live.remove(&execution.id);
    execution
  }

  /// After a cancel or timeout, give in-flight tasks the grace period to
  /// settle, then abandon them. Abandoned tasks' writes are discarded.
  async fn drain_wave<F>(
    &self,
    joined: &mut std::pin::Pin<&mut F>,
    abort_handles: &[tokio::task::AbortHandle],
  ) -> Vec<Result<TaskResult, tokio::task::JoinError>>
  where
    F: Future<Output = Vec<Result<TaskResult, tokio::task::JoinError>>>,
  {
    match tokio::time::timeout(self.inner.config.cancel_grace, joined).await {
      Ok(results) => results,
      Err(_) => {
        warn!("in-flight tasks exceeded cancel grace; abandoning");
        for handle in abort_handles {
          handle.abort();
        }
        Vec::new()
      }
    }
  }

  async fn finish(
    &self,
    workflow: &Workflow,
    execution: &mut Execution,
    outcomes: &HashMap<String, NodeOutcome>,
    repository: Option<Arc<dyn Repository>>,
    emitter: &Emitter,
    end: RunEnd,
  ) {
    execution.completed_at = Some(chrono::Utc::now());
    match end {
      RunEnd::Completed => {
        let output = compute_output(workflow, outcomes);
        execution.output = output.clone();
        execution.status = ExecutionStatus::Completed;
        if let Some(repository) = &repository {
          if repository
            .update_execution_output(&execution.id, &output)
            .await
            .is_err()
          {
            let _ = repository.update_execution_output(&execution.id, &output).await;
          }
          persist_status(
            repository,
            &execution.id,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            None,
          )
          .await;
        }
        info!("workflow_completed");
        emitter
          .emit(EventType::ExecutionCompleted, |e| {
            e.with_status("completed").with_output(Value::Object(output.clone()))
          })
          .await;
      }
      RunEnd::Failed(message) => {
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(message.clone());
        if let Some(repository) = &repository {
          persist_status(
            repository,
            &execution.id,
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            Some(&message),
          )
          .await;
        }
        error!(error = %message, "workflow_failed");
        emitter
          .emit(EventType::ExecutionFailed, |e| {
            e.with_status("failed").with_error(&message)
          })
          .await;
      }
      RunEnd::Cancelled => {
        execution.status = ExecutionStatus::Cancelled;
        if let Some(repository) = &repository {
          // Cancel() normally moved the record to cancelling already; fall
          // back to the running transition if it lost that race.
          if !persist_status(
            repository,
            &execution.id,
            ExecutionStatus::Cancelling,
            ExecutionStatus::Cancelled,
            None,
          )
          .await
          {
            persist_status(
              repository,
              &execution.id,
              ExecutionStatus::Running,
              ExecutionStatus::Cancelled,
              None,
            )
            .await;
          }
        }
        info!("workflow_cancelled");
        emitter
          .emit(EventType::StateChanged, |e| {
            e.with_payload(json!({"from": "cancelling", "to": "cancelled"}))
          })
          .await;
        emitter
          .emit(EventType::ExecutionCancelled, |e| e.with_status("cancelled"))
          .await;
      }
      RunEnd::TimedOut => {
        let message = "execution timed out".to_string();
        execution.status = ExecutionStatus::Timeout;
        execution.error = Some(message.clone());
        if let Some(repository) = &repository {
          persist_status(
            repository,
            &execution.id,
            ExecutionStatus::Running,
            ExecutionStatus::Timeout,
            Some(&message),
          )
          .await;
        }
        error!("workflow_timed_out");
        emitter
          .emit(EventType::ExecutionFailed, |e| {
            e.with_status("timeout")
              .with_error(&message)
              .with_payload(json!({"code": "timeout"}))
          })
          .await;
      }
    }
  }
}

/// The execution output: terminal-node outputs keyed by node id, unwrapped
/// when a single terminal node produced an object.
fn compute_output(
  workflow: &Workflow,
  outcomes: &HashMap<String, NodeOutcome>,
) -> Map<String, Value> {
  let mut terminal_outputs: Vec<(&str, &Value)> = Vec::new();
  for node in &workflow.nodes {
    if workflow.outgoing(&node.id).next().is_some() {
      continue;
    }
    if let Some(NodeOutcome::Completed(output)) = outcomes.get(&node.id) {
      terminal_outputs.push((&node.id, output));
    }
  }

  if let [(_, Value::Object(single))] = terminal_outputs.as_slice() {
    return (*single).clone();
  }

  let mut output = Map::new();
  for (node_id, value) in terminal_outputs {
    output.insert(node_id.to_string(), value.clone());
  }
  output
}

async fn persist_status(
  repository: &Arc<dyn Repository>,
  execution_id: &str,
  expected: ExecutionStatus,
  status: ExecutionStatus,
  error: Option<&str>,
) -> bool {
  match repository
    .update_execution_status(execution_id, expected, status, error)
    .await
  {
    Ok(applied) => applied,
    Err(_) => repository
      .update_execution_status(execution_id, expected, status, error)
      .await
      .unwrap_or(false),
  }
}
