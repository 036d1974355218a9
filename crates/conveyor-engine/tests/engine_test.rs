//! End-to-end engine tests against the in-memory stores.
//!
//! Each test wires the real scheduler, node execution service and queue
//! worker pool together, exactly as a production process would, with
//! storage swapped for the in-memory backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use conveyor_core::definition::{
    Edge, JoinPolicy, LoopExecutorConfig, LoopSourceSpec, NodeRetrySpec, NodeSpec, OnChildFailure,
    WorkflowDefinition, WorkflowGraph,
};
use conveyor_core::executor::{ExecutionContext, ExecutionOutcome, Executor};
use conveyor_core::registry::ExecutorRegistry;
use conveyor_core::status::{InstanceStatus, LockType, LoopPhase};
use conveyor_core::{EngineConfig, RetryPolicy};
use conveyor_storage::models::{CreateQueueJob, Pagination};
use conveyor_storage::{
    DefinitionStore, ExecutionLogStore, InMemoryStores, InstanceStore, LockStore, NodeStore,
    QueueStore, Stores,
};

use conveyor_engine::queue::PollerConfig;
use conveyor_engine::recovery::{RecoveryConfig, RecoveryService};
use conveyor_engine::scheduler::wait_for_terminal;
use conveyor_engine::{
    QueueWorkerPool, StartOptions, WorkerConfig, WorkflowAdapter, WorkflowScheduler,
};

const QUEUE: &str = "workflow";

// ============================================
// Test executors
// ============================================

struct Echo;

#[async_trait]
impl Executor for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        ExecutionOutcome::ok(ctx.input_data)
    }
}

struct Upper;

#[async_trait]
impl Executor for Upper {
    fn name(&self) -> &str {
        "upper"
    }

    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        let text = ctx
            .input_data
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_uppercase();
        ExecutionOutcome::ok(json!({ "text": text }))
    }
}

/// Loop data source: returns `config.items` verbatim.
struct ListItems;

#[async_trait]
impl Executor for ListItems {
    fn name(&self) -> &str {
        "list_items"
    }

    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        let items = ctx.config.get("items").cloned().unwrap_or(json!([]));
        ExecutionOutcome::ok(items)
    }
}

/// Fails until the configured number of calls, then succeeds.
struct Flaky {
    fail_times: i32,
    calls: AtomicI32,
}

#[async_trait]
impl Executor for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: ExecutionContext) -> ExecutionOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.fail_times {
            ExecutionOutcome::ok(json!({ "call": call }))
        } else {
            ExecutionOutcome::err(format!("induced failure {}", call))
        }
    }
}

/// Echo whose second and later calls park while `blocked` is set. Calls
/// observe the flag once at entry, so unblocking only affects later
/// invocations. A parked call stays parked, like a job on a dead worker.
struct Gate {
    blocked: Arc<AtomicBool>,
    calls: Arc<AtomicI32>,
}

#[async_trait]
impl Executor for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn execute(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call >= 2 && self.blocked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        ExecutionOutcome::ok(ctx.input_data)
    }
}

// ============================================
// Harness
// ============================================

struct Harness {
    stores: Stores,
    backing: InMemoryStores,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
}

impl Harness {
    fn new(extra: Vec<Arc<dyn Executor>>) -> Self {
        let backing = InMemoryStores::new();
        let stores = backing.clone().into_stores();

        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        registry.register(Arc::new(Upper)).unwrap();
        registry.register(Arc::new(ListItems)).unwrap();
        for executor in extra {
            registry.register(executor).unwrap();
        }

        let config = EngineConfig::default().with_poll_interval(Duration::from_millis(10));

        Self {
            stores,
            backing,
            registry: Arc::new(registry),
            config,
        }
    }

    fn adapter(&self) -> WorkflowAdapter {
        WorkflowAdapter::new(
            self.stores.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
            QUEUE,
        )
    }

    fn worker(&self) -> QueueWorkerPool {
        let config = WorkerConfig::from_engine(&self.config, QUEUE)
            .with_shutdown_timeout(Duration::from_millis(500))
            .with_poller(
                PollerConfig::default()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            );
        QueueWorkerPool::new(
            Arc::new(self.backing.queue()),
            Arc::clone(&self.registry),
            config,
            RetryPolicy::fixed(Duration::from_millis(1), 3),
        )
    }
}

fn simple(executor: &str, input: Option<serde_json::Value>) -> NodeSpec {
    NodeSpec::Simple {
        executor: executor.to_string(),
        input_data: input,
        retry: None,
    }
}

fn graph(
    start: &str,
    nodes: Vec<(&str, NodeSpec)>,
    edges: Vec<(&str, &str)>,
) -> WorkflowGraph {
    WorkflowGraph {
        start_node_id: start.to_string(),
        nodes: nodes
            .into_iter()
            .map(|(id, spec)| (id.to_string(), spec))
            .collect::<BTreeMap<_, _>>(),
        edges: edges
            .into_iter()
            .map(|(from, to)| Edge {
                from: from.to_string(),
                to: to.to_string(),
            })
            .collect(),
    }
}

// ============================================
// S1: simple sequential workflow
// ============================================

#[tokio::test]
async fn s1_sequential_workflow_completes() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();
    let worker = harness.worker();
    worker.start().unwrap();

    let definition = WorkflowDefinition::new(
        "seq",
        1,
        graph(
            "a",
            vec![
                ("a", simple("echo", Some(json!({"text": "hi"})))),
                ("b", simple("upper", None)),
            ],
            vec![("a", "b")],
        ),
    );

    let instance = adapter.start_workflow(definition, None).await.unwrap();
    let status = adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(status, InstanceStatus::Completed);

    let a = harness
        .stores
        .nodes
        .find_by_workflow_and_node_id(instance.id, "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.status, "completed");
    assert_eq!(a.result, Some(json!({"text": "hi"})));

    let b = harness
        .stores
        .nodes
        .find_by_workflow_and_node_id(instance.id, "b")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.status, "completed");
    assert_eq!(b.result, Some(json!({"text": "HI"})));

    // Both node jobs landed in the success table.
    let stats = harness.stores.queue.queue_stats(QUEUE).await.unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.waiting + stats.executing + stats.failed, 0);

    // The instance result carries the sink node's output.
    let row = harness.stores.instances.get(instance.id).await.unwrap().unwrap();
    assert_eq!(row.result, Some(json!({"b": {"text": "HI"}})));
}

// ============================================
// S2: parallel join
// ============================================

#[tokio::test]
async fn s2_parallel_join_aggregates_by_child_index() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();
    let worker = harness.worker();
    worker.start().unwrap();

    let definition = WorkflowDefinition::new(
        "par",
        1,
        graph(
            "p",
            vec![(
                "p",
                NodeSpec::Parallel {
                    branches: vec![
                        simple("echo", Some(json!({"v": 1}))),
                        simple("echo", Some(json!({"v": 2}))),
                        simple("echo", Some(json!({"v": 3}))),
                    ],
                    join_policy: JoinPolicy::All,
                },
            )],
            vec![],
        ),
    );

    let instance = adapter.start_workflow(definition, None).await.unwrap();
    let status = adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(status, InstanceStatus::Completed);

    let parent = harness
        .stores
        .nodes
        .find_by_workflow_and_node_id(instance.id, "p")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.status, "completed");
    assert_eq!(
        parent.result,
        Some(json!([{"v": 1}, {"v": 2}, {"v": 3}]))
    );

    let children = harness.stores.nodes.find_child_nodes(parent.id).await.unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.status == "completed"));
}

// ============================================
// S3: loop with empty data
// ============================================

#[tokio::test]
async fn s3_empty_loop_completes_without_children() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();

    let definition = WorkflowDefinition::new(
        "empty-loop",
        1,
        graph(
            "l",
            vec![(
                "l",
                NodeSpec::Loop {
                    source: LoopSourceSpec {
                        executor: "list_items".to_string(),
                        config: json!({"items": []}),
                    },
                    child: Box::new(simple("echo", None)),
                    executor_config: LoopExecutorConfig::default(),
                    on_child_failure: OnChildFailure::Continue,
                },
            )],
            vec![],
        ),
    );

    // No worker needed: an empty fan-out never enqueues a job.
    let instance = adapter.start_workflow(definition, None).await.unwrap();
    let status = adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed);

    let parent = harness
        .stores
        .nodes
        .find_by_workflow_and_node_id(instance.id, "l")
        .await
        .unwrap()
        .unwrap();
    let progress = parent.parsed_loop_progress().unwrap();
    assert_eq!(progress.status, LoopPhase::Completed);
    assert_eq!(progress.total_count, 0);
    assert!(harness
        .stores
        .nodes
        .find_child_nodes(parent.id)
        .await
        .unwrap()
        .is_empty());
}

// ============================================
// S4: loop with 3 items, crash mid-execution, resume
// ============================================

#[tokio::test]
async fn s4_loop_survives_crash_and_resumes() {
    // Blocked from the start: call 1 (child-0) passes, call 2 (child-1)
    // parks, simulating a worker that dies mid-job.
    let blocked = Arc::new(AtomicBool::new(true));
    let calls = Arc::new(AtomicI32::new(0));
    let harness = Harness::new(vec![Arc::new(Gate {
        blocked: Arc::clone(&blocked),
        calls: Arc::clone(&calls),
    })]);

    // Short TTLs so the crashed owner's locks expire quickly.
    let mut config = harness.config.clone();
    config.lock_ttl = Duration::from_millis(200);
    let scheduler = WorkflowScheduler::new(
        harness.stores.clone(),
        Arc::clone(&harness.registry),
        config.clone(),
        QUEUE,
    );

    let definition = WorkflowDefinition::new(
        "crashy-loop",
        1,
        graph(
            "l",
            vec![(
                "l",
                NodeSpec::Loop {
                    source: LoopSourceSpec {
                        executor: "list_items".to_string(),
                        config: json!({"items": [{"name": "a"}, {"name": "b"}, {"name": "c"}]}),
                    },
                    child: Box::new(simple("gate", None)),
                    executor_config: LoopExecutorConfig::default(),
                    on_child_failure: OnChildFailure::Continue,
                },
            )],
            vec![],
        ),
    );

    let def_row = harness
        .stores
        .definitions
        .create(conveyor_storage::models::CreateWorkflowDefinition {
            name: definition.name.clone(),
            version: 1,
            graph: serde_json::to_value(&definition.graph).unwrap(),
            activate: true,
        })
        .await
        .unwrap();

    let instance = scheduler
        .start_workflow(&def_row, StartOptions::default())
        .await
        .unwrap();

    let worker1 = harness.worker();
    worker1.start().unwrap();
    let drive = {
        let scheduler = scheduler.clone();
        let id = instance.id;
        tokio::spawn(async move { scheduler.run_workflow(id).await })
    };

    // Child-0 completes; child-1 starts and parks inside the gate.
    let parent = wait_for(Duration::from_secs(10), || async {
        harness
            .stores
            .nodes
            .find_by_workflow_and_node_id(instance.id, "l")
            .await
            .unwrap()
    })
    .await;

    wait_until(Duration::from_secs(10), || async {
        let children = harness.stores.nodes.find_child_nodes(parent.id).await.unwrap();
        children.first().is_some_and(|c| c.status == "completed")
            && children.get(1).is_some_and(|c| c.status == "running")
    })
    .await;

    // Crash: the drive dies, the worker stops claiming; nothing renews.
    drive.abort();
    let _ = worker1.shutdown().await;

    // Owner locks expire.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let interrupted = harness
        .stores
        .instances
        .find_interrupted_instances()
        .await
        .unwrap();
    assert!(interrupted.iter().any(|w| w.id == instance.id));

    let progress = harness
        .stores
        .nodes
        .get(parent.id)
        .await
        .unwrap()
        .unwrap()
        .parsed_loop_progress()
        .unwrap();
    assert_eq!(progress.status, LoopPhase::Executing);
    assert_eq!(progress.completed_count, 1);

    // New process: unblock, reset orphans, resume, fresh worker.
    blocked.store(false, Ordering::SeqCst);
    let calls_before_resume = calls.load(Ordering::SeqCst);

    let resume_scheduler = WorkflowScheduler::new(
        harness.stores.clone(),
        Arc::clone(&harness.registry),
        config.clone(),
        QUEUE,
    );
    let recovery = Arc::new(RecoveryService::new(
        harness.stores.clone(),
        resume_scheduler,
        RecoveryConfig {
            interval: Duration::from_secs(60),
            orphan_threshold: Duration::ZERO,
            resume_workflows: true,
        },
    ));
    recovery.run_once().await.unwrap();

    let worker2 = harness.worker();
    worker2.start().unwrap();

    let status = wait_for_terminal(&harness.stores, instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker2.shutdown().await.unwrap();

    assert_eq!(status, InstanceStatus::Completed);
    let progress = harness
        .stores
        .nodes
        .get(parent.id)
        .await
        .unwrap()
        .unwrap()
        .parsed_loop_progress()
        .unwrap();
    assert_eq!(progress.status, LoopPhase::Completed);
    assert_eq!(progress.completed_count, 3);
    assert_eq!(progress.failed_count, 0);

    // At-least-once: child-1 ran again after the crash, and child-2 ran.
    assert!(calls.load(Ordering::SeqCst) >= calls_before_resume + 2);
}

// ============================================
// S5: executor fails, node retries, then succeeds
// ============================================

#[tokio::test]
async fn s5_node_retry_exhausts_then_succeeds() {
    let harness = Harness::new(vec![Arc::new(Flaky {
        fail_times: 2,
        calls: AtomicI32::new(0),
    })]);
    let adapter = harness.adapter();
    let worker = harness.worker();
    worker.start().unwrap();

    let definition = WorkflowDefinition::new(
        "retryer",
        1,
        graph(
            "n",
            vec![(
                "n",
                NodeSpec::Simple {
                    executor: "flaky".to_string(),
                    input_data: None,
                    retry: Some(NodeRetrySpec {
                        max_retries: 2,
                        backoff_ms: 1,
                    }),
                },
            )],
            vec![],
        ),
    );

    let instance = adapter.start_workflow(definition, None).await.unwrap();
    let status = adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker.shutdown().await.unwrap();

    assert_eq!(status, InstanceStatus::Completed);

    let node = harness
        .stores
        .nodes
        .find_by_workflow_and_node_id(instance.id, "n")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, "completed");
    assert_eq!(node.retry_count, 2);
    assert_eq!(node.result, Some(json!({"call": 3})));

    // One job record carried all three attempts; a single success row.
    let stats = harness.stores.queue.queue_stats(QUEUE).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    let success = harness
        .stores
        .queue
        .get_success(node.job_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(success.attempts, 3);
}

// ============================================
// S6: lock expiry recovery
// ============================================

#[tokio::test]
async fn s6_expired_lock_is_acquirable() {
    let harness = Harness::new(vec![]);
    let locks = &harness.stores.locks;

    assert!(locks
        .acquire(
            "workflow:42",
            "worker-a",
            Duration::from_millis(100),
            LockType::Workflow,
            None,
        )
        .await
        .unwrap());
    assert!(!locks
        .acquire(
            "workflow:42",
            "worker-b",
            Duration::from_secs(10),
            LockType::Workflow,
            None,
        )
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(locks
        .acquire(
            "workflow:42",
            "worker-b",
            Duration::from_secs(10),
            LockType::Workflow,
            None,
        )
        .await
        .unwrap());
}

// ============================================
// Properties
// ============================================

/// Mutual exclusion: many concurrent claimants, exactly one winner.
#[tokio::test]
async fn property_lock_mutual_exclusion() {
    let harness = Harness::new(vec![]);
    let mut claims = vec![];

    for i in 0..20 {
        let locks = Arc::clone(&harness.stores.locks);
        claims.push(tokio::spawn(async move {
            locks
                .acquire(
                    "contested",
                    &format!("owner-{}", i),
                    Duration::from_secs(30),
                    LockType::Resource,
                    None,
                )
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

/// Terminal instance statuses never change again.
#[tokio::test]
async fn property_terminal_status_is_monotonic() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();
    let worker = harness.worker();
    worker.start().unwrap();

    let definition = WorkflowDefinition::new(
        "once",
        1,
        graph("a", vec![("a", simple("echo", Some(json!({"k": 1}))))], vec![]),
    );
    let instance = adapter.start_workflow(definition, None).await.unwrap();
    adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker.shutdown().await.unwrap();

    assert!(adapter.stop_workflow(instance.id, "too late").await.is_err());
    assert!(adapter.cancel_workflow(instance.id, "too late").await.is_err());
    assert_eq!(
        adapter.get_workflow_status(instance.id).await.unwrap(),
        InstanceStatus::Completed
    );
}

/// Definition JSON survives a store round-trip byte-identically.
#[tokio::test]
async fn property_definition_round_trip() {
    let harness = Harness::new(vec![]);

    let definition = WorkflowDefinition::new(
        "roundtrip",
        3,
        graph(
            "a",
            vec![
                ("a", simple("echo", Some(json!({"x": [1, 2, 3]})))),
                ("b", simple("upper", None)),
            ],
            vec![("a", "b")],
        ),
    );
    let graph_json = serde_json::to_value(&definition.graph).unwrap();
    let serialized = serde_json::to_string(&graph_json).unwrap();

    let row = harness
        .stores
        .definitions
        .create(conveyor_storage::models::CreateWorkflowDefinition {
            name: definition.name.clone(),
            version: definition.version,
            graph: graph_json,
            activate: true,
        })
        .await
        .unwrap();

    let loaded = harness
        .stores
        .definitions
        .get_by_id(row.id)
        .await
        .unwrap()
        .unwrap();
    let reparsed: WorkflowGraph = serde_json::from_value(loaded.graph.clone()).unwrap();
    assert_eq!(reparsed, definition.graph);
    assert_eq!(
        serde_json::to_string(&serde_json::to_value(&reparsed).unwrap()).unwrap(),
        serialized
    );
}

// ============================================
// Control-surface behaviour
// ============================================

#[tokio::test]
async fn stop_then_resume_completes_workflow() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();

    // Stop before any worker exists: the single node job stays queued.
    let definition = WorkflowDefinition::new(
        "stoppable",
        1,
        graph("a", vec![("a", simple("echo", Some(json!({"k": 1}))))], vec![]),
    );
    let instance = adapter.start_workflow(definition, None).await.unwrap();

    wait_until(Duration::from_secs(5), || async {
        adapter.get_workflow_status(instance.id).await.unwrap() == InstanceStatus::Running
    })
    .await;

    adapter.stop_workflow(instance.id, "maintenance").await.unwrap();
    wait_until(Duration::from_secs(5), || async {
        adapter.get_workflow_status(instance.id).await.unwrap() == InstanceStatus::Interrupted
    })
    .await;

    // Resume with a worker running: the instance completes.
    let worker = harness.worker();
    worker.start().unwrap();
    adapter.resume_workflow(instance.id).await.unwrap();

    let status = adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker.shutdown().await.unwrap();
    assert_eq!(status, InstanceStatus::Completed);
}

#[tokio::test]
async fn cancelled_workflow_cancels_pending_nodes() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();

    // No worker: the node job never executes.
    let definition = WorkflowDefinition::new(
        "cancellable",
        1,
        graph("a", vec![("a", simple("echo", None))], vec![]),
    );
    let instance = adapter.start_workflow(definition, None).await.unwrap();

    wait_until(Duration::from_secs(5), || async {
        harness
            .stores
            .nodes
            .find_by_workflow_and_node_id(instance.id, "a")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    adapter.cancel_workflow(instance.id, "operator").await.unwrap();

    let status = adapter
        .wait_for_completion(instance.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Cancelled);

    let node = harness
        .stores
        .nodes
        .find_by_workflow_and_node_id(instance.id, "a")
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(node.status.as_str(), "cancelled" | "pending" | "running"));

    // Terminal: resume is rejected.
    assert!(adapter.resume_workflow(instance.id).await.is_err());
}

#[tokio::test]
async fn adapter_queue_surface_round_trip() {
    let harness = Harness::new(vec![Arc::new(Flaky {
        fail_times: i32::MAX,
        calls: AtomicI32::new(0),
    })]);
    let adapter = harness.adapter();
    let worker = harness.worker();
    worker.start().unwrap();

    let job = adapter
        .submit(
            CreateQueueJob::new("ignored", "doomed", "flaky", json!({}))
                .with_max_attempts(1)
                .with_group("tenant-9"),
        )
        .await
        .unwrap();
    assert_eq!(job.queue_name, QUEUE);

    // The job fails permanently, stays in the active table.
    wait_until(Duration::from_secs(5), || async {
        harness
            .stores
            .queue
            .get_job(job.id)
            .await
            .unwrap()
            .is_some_and(|j| j.status == "failed")
    })
    .await;

    // markAsFailed → retryFailedJob behaves like a fresh submission.
    assert!(adapter.retry_failed_job(job.id).await.unwrap());
    wait_until(Duration::from_secs(5), || async {
        harness
            .stores
            .queue
            .get_job(job.id)
            .await
            .unwrap()
            .is_some_and(|j| j.status == "failed")
    })
    .await;

    worker.shutdown().await.unwrap();

    // Unknown executors are rejected at the surface.
    let unknown = adapter
        .submit(CreateQueueJob::new("q", "nope", "missing", json!({})))
        .await;
    assert!(unknown.is_err());
}

#[tokio::test]
async fn execution_log_records_instance_events() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();
    let worker = harness.worker();
    worker.start().unwrap();

    let definition = WorkflowDefinition::new(
        "logged",
        1,
        graph("a", vec![("a", simple("echo", Some(json!({"k": 1}))))], vec![]),
    );
    let instance = adapter.start_workflow(definition, None).await.unwrap();
    adapter
        .wait_for_completion(instance.id, Duration::from_secs(10))
        .await
        .unwrap();
    worker.shutdown().await.unwrap();

    // Log writes are async best-effort; give them a beat.
    wait_until(Duration::from_secs(5), || async {
        !harness
            .stores
            .execution_logs
            .find_by_workflow_instance_id(instance.id, Pagination::default())
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    let logs = harness
        .stores
        .execution_logs
        .find_by_workflow_instance_id(instance.id, Pagination::default())
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l.phase == "scheduler"));
}

#[tokio::test]
async fn schedule_tick_starts_workflow_and_settles_execution() {
    use conveyor_engine::schedule::{ScheduleConfig, ScheduleService};
    use conveyor_storage::ScheduleStore;

    let harness = Harness::new(vec![]);
    let worker = harness.worker();
    worker.start().unwrap();

    let def_row = harness
        .stores
        .definitions
        .create(conveyor_storage::models::CreateWorkflowDefinition {
            name: "nightly".to_string(),
            version: 1,
            graph: serde_json::to_value(graph(
                "a",
                vec![("a", simple("echo", Some(json!({"k": 1}))))],
                vec![],
            ))
            .unwrap(),
            activate: true,
        })
        .await
        .unwrap();

    let scheduler = WorkflowScheduler::new(
        harness.stores.clone(),
        Arc::clone(&harness.registry),
        harness.config.clone(),
        QUEUE,
    );
    let service = ScheduleService::new(harness.stores.clone(), scheduler, harness.config.clone());

    let schedule = service
        .create_schedule(def_row.id, ScheduleConfig::default())
        .await
        .unwrap();
    assert!(schedule.next_run_at > chrono::Utc::now());

    // Force the schedule due and fire one tick.
    harness
        .stores
        .schedules
        .update(
            schedule.id,
            conveyor_storage::models::UpdateSchedule {
                next_run_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(service.tick().await.unwrap(), 1);

    // The execution row settles as success once the workflow completes.
    wait_until(Duration::from_secs(10), || async {
        let executions = harness
            .stores
            .schedules
            .list_executions(schedule.id, Pagination::default())
            .await
            .unwrap();
        executions
            .first()
            .is_some_and(|e| e.status == "success" && e.workflow_instance_id.is_some())
    })
    .await;
    worker.shutdown().await.unwrap();

    // The clock advanced; an immediate re-tick fires nothing.
    let row = harness.stores.schedules.get(schedule.id).await.unwrap().unwrap();
    assert!(row.next_run_at > chrono::Utc::now());
    assert!(row.last_run_at.is_some());
    assert_eq!(service.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn health_check_reports_interrupted_instances() {
    let harness = Harness::new(vec![]);
    let adapter = harness.adapter();

    let report = adapter.health_check().await;
    assert!(report.is_healthy());
    assert_eq!(report.interrupted_instances, 0);
}

// ============================================
// Helpers
// ============================================

async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for<F, Fut, T>(timeout: Duration, mut fetch: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = fetch().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "value not available within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
