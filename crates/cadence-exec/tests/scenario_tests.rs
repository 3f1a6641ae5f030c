//! End-to-end scenarios over the in-memory store: full pipelines from
//! ingestion through dispatch, completion, and restart.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use cadence_core::{BuildId, DistroId, HostId, ProjectId, TaskId, VersionId};
use cadence_exec::archive::Archiver;
use cadence_exec::events::InMemoryOutbox;
use cadence_exec::lifecycle::LifecycleController;
use cadence_exec::planner::{IdentityDistroResolver, QueryPlanner};
use cadence_exec::prelude::*;
use cadence_exec::services::{CoreServices, FixedClock};
use cadence_exec::store::memory::InMemoryTaskStore;
use cadence_exec::task::{AbortInfo, DISABLED_PRIORITY, MAX_ALLOC_ATTEMPTS};

struct Harness {
    store: Arc<InMemoryTaskStore>,
    outbox: Arc<InMemoryOutbox>,
    clock: Arc<FixedClock>,
    controller: LifecycleController,
    planner: QueryPlanner,
    archiver: Archiver,
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryTaskStore::new());
    let outbox = Arc::new(InMemoryOutbox::new());
    let clock = Arc::new(FixedClock::new(t0()));
    let services = CoreServices::new(outbox.clone()).with_clock(clock.clone());
    Harness {
        store: store.clone(),
        outbox,
        clock,
        controller: LifecycleController::new(store.clone(), services.clone()),
        planner: QueryPlanner::new(
            store.clone(),
            services.clone(),
            Arc::new(IdentityDistroResolver),
        ),
        archiver: Archiver::new(store, services),
    }
}

fn host_task(id: &str) -> Task {
    let mut t = Task::new(
        TaskId::new(id),
        VersionId::new("v1"),
        BuildId::new("b1"),
        ProjectId::new("proj"),
        "ubuntu2204",
        id.to_owned(),
    );
    t.activated = true;
    t.activated_time = Some(t0());
    t.distro = Some(DistroId::new("d1"));
    t.secret = format!("secret-{id}");
    t
}

fn depends_on(task: &mut Task, upstream: &str) {
    task.depends_on
        .push(Dependency::on_success(TaskId::new(upstream)));
}

async fn run_to_success(h: &Harness, id: &str) {
    let task_id = TaskId::new(id);
    let task = h.store.get(&task_id).await.unwrap().unwrap();
    h.controller
        .mark_as_host_dispatched(
            &task,
            &HostId::new("h1"),
            &DistroId::new("d1"),
            "agent-1",
            h.clock.now(),
        )
        .await
        .unwrap();
    let task = h.store.get(&task_id).await.unwrap().unwrap();
    h.controller
        .mark_start(&task, h.clock.now())
        .await
        .unwrap();
    let task = h.store.get(&task_id).await.unwrap().unwrap();
    h.controller
        .mark_end(&task, h.clock.now(), Some(EndDetail::success()))
        .await
        .unwrap();
}

fn schedulable_ids(tasks: &[Task]) -> Vec<&str> {
    tasks.iter().map(|t| t.id.as_str()).collect()
}

#[tokio::test]
async fn linear_pipeline_unlocks_tasks_in_order() {
    let h = harness();
    let a = host_task("a");
    let mut b = host_task("b");
    depends_on(&mut b, "a");
    let mut c = host_task("c");
    depends_on(&mut c, "b");
    h.store.insert_many(vec![a, b, c]).await.unwrap();

    // Only the root is schedulable at first.
    let found = h
        .planner
        .find_host_schedulable(&DistroId::new("d1"))
        .await
        .unwrap();
    assert_eq!(schedulable_ids(&found), vec!["a"]);

    run_to_success(&h, "a").await;

    let b_record = h.store.get(&TaskId::new("b")).await.unwrap().unwrap();
    assert!(b_record.depends_on[0].finished);
    assert!(!b_record.depends_on[0].unattainable);

    let found = h
        .planner
        .find_host_schedulable(&DistroId::new("d1"))
        .await
        .unwrap();
    assert_eq!(schedulable_ids(&found), vec!["b"]);

    run_to_success(&h, "b").await;
    let found = h
        .planner
        .find_host_schedulable(&DistroId::new("d1"))
        .await
        .unwrap();
    assert_eq!(schedulable_ids(&found), vec!["c"]);

    run_to_success(&h, "c").await;
    let found = h
        .planner
        .find_host_schedulable(&DistroId::new("d1"))
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn failure_propagates_by_edge_requirement() {
    let h = harness();
    let mut a = host_task("a");
    a.status = TaskStatus::Started;
    a.start_time = Some(t0());
    let mut b = host_task("b");
    depends_on(&mut b, "a");
    let mut c = host_task("c");
    c.depends_on.push(Dependency::with_requirement(
        TaskId::new("a"),
        DependencyRequirement::Any,
    ));
    h.store.insert_many(vec![a.clone(), b, c]).await.unwrap();

    h.controller
        .mark_end(&a, h.clock.now(), Some(EndDetail::failure()))
        .await
        .unwrap();

    // The "succeeded" edge is now unattainable and blocks its owner.
    let b = h.store.get(&TaskId::new("b")).await.unwrap().unwrap();
    assert!(b.depends_on[0].unattainable);
    assert!(b.unattainable_dependency);
    assert!(b.is_blocked());

    // The "any" edge is satisfied by the failure.
    let c = h.store.get(&TaskId::new("c")).await.unwrap().unwrap();
    assert!(!c.depends_on[0].unattainable);
    assert!(!c.is_blocked());

    let found = h
        .planner
        .find_host_schedulable(&DistroId::new("d1"))
        .await
        .unwrap();
    assert_eq!(schedulable_ids(&found), vec!["c"]);
}

#[tokio::test]
async fn container_allocation_attempts_are_bounded() {
    let h = harness();
    let mut t = host_task("ct");
    t.execution_platform = ExecutionPlatform::Container;
    t.distro = None;
    h.store.insert_many(vec![t]).await.unwrap();

    // Three allocate/deallocate cycles.
    for _ in 0..3 {
        let live = h.store.get(&TaskId::new("ct")).await.unwrap().unwrap();
        h.controller.mark_as_container_allocated(&live).await.unwrap();
        let live = h.store.get(&TaskId::new("ct")).await.unwrap().unwrap();
        h.controller
            .mark_as_container_deallocated(&live)
            .await
            .unwrap();
    }
    let live = h.store.get(&TaskId::new("ct")).await.unwrap().unwrap();
    assert_eq!(live.container_allocation_attempts, 3);
    assert!(!live.container_allocated);

    // Two more cycles exhaust the budget.
    for _ in 0..2 {
        let live = h.store.get(&TaskId::new("ct")).await.unwrap().unwrap();
        h.controller.mark_as_container_allocated(&live).await.unwrap();
        let live = h.store.get(&TaskId::new("ct")).await.unwrap().unwrap();
        h.controller
            .mark_as_container_deallocated(&live)
            .await
            .unwrap();
    }
    let live = h.store.get(&TaskId::new("ct")).await.unwrap().unwrap();
    assert_eq!(live.container_allocation_attempts, MAX_ALLOC_ATTEMPTS);
    assert!(!live.container_allocated);
    assert!(!live.should_allocate_container());

    // The planner no longer surfaces it, and a direct attempt is rejected.
    let found = h.planner.find_container_schedulable().await.unwrap();
    assert!(found.is_empty());
    let err = h
        .controller
        .mark_as_container_allocated(&live)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvariantBreach { .. }));
}

#[tokio::test]
async fn display_task_archive_in_reset_failed_only_mode() {
    let h = harness();
    let mut display = host_task("d");
    display.display_only = true;
    display.execution_tasks = vec![TaskId::new("e1"), TaskId::new("e2")];
    display.status = TaskStatus::Failed;
    let mut e1 = host_task("e1");
    e1.status = TaskStatus::Succeeded;
    e1.display_task_link = cadence_exec::task::DisplayTaskLink::Id(TaskId::new("d"));
    let mut e2 = host_task("e2");
    e2.status = TaskStatus::Failed;
    e2.display_task_link = cadence_exec::task::DisplayTaskLink::Id(TaskId::new("d"));
    h.store.insert_many(vec![display, e1, e2]).await.unwrap();

    h.archiver
        .set_reset_failed_when_finished(&TaskId::new("d"))
        .await
        .unwrap();
    let display = h.store.get(&TaskId::new("d")).await.unwrap().unwrap();
    assert!(display.is_restart_failed_only());

    h.archiver.archive(&display).await.unwrap();

    let display = h.store.get(&TaskId::new("d")).await.unwrap().unwrap();
    let e1 = h.store.get(&TaskId::new("e1")).await.unwrap().unwrap();
    let e2 = h.store.get(&TaskId::new("e2")).await.unwrap().unwrap();

    assert_eq!(display.execution, 1);
    assert_eq!(e2.execution, 1);
    assert_eq!(e1.execution, 0);
    assert_eq!(e1.latest_parent_execution, 1);
    assert_eq!(e2.latest_parent_execution, 1);
}

#[tokio::test]
async fn activation_cascade_follows_topological_order() {
    let h = harness();
    let mut a = host_task("a");
    a.activated = false;
    a.activated_time = None;
    let mut b = host_task("b");
    b.activated = false;
    b.deactivated_for_dependency = true;
    depends_on(&mut b, "a");
    let mut c = host_task("c");
    c.activated = false;
    c.deactivated_for_dependency = true;
    depends_on(&mut c, "b");
    h.store.insert_many(vec![a.clone(), b, c]).await.unwrap();

    h.controller.activate_tasks(&[a], "user", true).await.unwrap();

    for id in ["a", "b", "c"] {
        let task = h.store.get(&TaskId::new(id)).await.unwrap().unwrap();
        assert!(task.activated, "task '{id}' should be activated");
        assert!(!task.deactivated_for_dependency);
    }

    // Cascade events come out upstream-first.
    let cascade_order: Vec<String> = h
        .outbox
        .events()
        .iter()
        .filter(|e| e.kind == TaskEventKind::Activated)
        .map(|e| e.task_id.to_string())
        .collect();
    assert_eq!(cascade_order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn stale_underwater_tasks_are_unscheduled_once() {
    let h = harness();
    let mut stale = host_task("stale");
    stale.activated_time = Some(t0() - chrono::Duration::days(8));
    stale.priority = 10;
    h.store.insert_many(vec![stale]).await.unwrap();

    let count = h
        .planner
        .unschedule_stale_underwater_host_tasks(Some(&DistroId::new("d1")))
        .await
        .unwrap();
    assert_eq!(count, 1);

    let stale = h.store.get(&TaskId::new("stale")).await.unwrap().unwrap();
    assert!(!stale.activated);
    assert_eq!(stale.priority, DISABLED_PRIORITY);

    let count = h
        .planner
        .unschedule_stale_underwater_host_tasks(Some(&DistroId::new("d1")))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn abort_then_end_then_restart_full_cycle() {
    let h = harness();
    let t = host_task("t");
    h.store.insert_many(vec![t.clone()]).await.unwrap();

    h.controller
        .mark_as_host_dispatched(
            &t,
            &HostId::new("h1"),
            &DistroId::new("d1"),
            "agent-1",
            h.clock.now(),
        )
        .await
        .unwrap();
    let dispatched = h.store.get(&TaskId::new("t")).await.unwrap().unwrap();
    h.controller
        .mark_start(&dispatched, h.clock.now())
        .await
        .unwrap();

    let running = h.store.get(&TaskId::new("t")).await.unwrap().unwrap();
    h.controller
        .set_aborted(&running, AbortInfo::by_user("admin"))
        .await
        .unwrap();

    // The agent cooperates: it reports end after seeing the abort.
    let aborted = h.store.get(&TaskId::new("t")).await.unwrap().unwrap();
    assert!(aborted.aborted);
    assert_eq!(aborted.display_status(), DisplayStatus::Aborted);
    h.controller
        .mark_end(&aborted, h.clock.now(), Some(EndDetail::failure()))
        .await
        .unwrap();

    let finished = h.store.get(&TaskId::new("t")).await.unwrap().unwrap();
    h.archiver.archive(&finished).await.unwrap();
    h.archiver.reset(&TaskId::new("t")).await.unwrap();

    let fresh = h.store.get(&TaskId::new("t")).await.unwrap().unwrap();
    assert_eq!(fresh.execution, 1);
    assert_eq!(fresh.status, TaskStatus::Undispatched);
    assert!(!fresh.aborted);
    assert!(fresh.activated);
    assert!(fresh.host_id.is_none());

    // The archived copy preserves execution 0.
    let old = h
        .store
        .get_old(&TaskId::new("t_0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.execution, 0);
    assert!(old.archived);
}
