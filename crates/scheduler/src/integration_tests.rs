//! Integration tests for the full job pipeline.
//!
//! Tests: JobManager → UnitOfWork → JobStore → hints → AsyncJobExecutor
//!
//! Verifies:
//! - Competing executors run every job exactly once
//! - Recurring timers fire, reschedule and stop on their own
//! - Exclusive jobs of one process instance never overlap
//! - Expired leases are taken over by another worker
//! - Exhausted jobs are left for operators with their failure attached

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};

    use jobforge_core::{DeploymentId, JobId, ManualClock, ProcessDefinitionId, ProcessInstanceId};
    use jobforge_events::{BusEventDispatcher, EventBus, InMemoryEventBus, JobEvent, JobEventKind, Subscription};

    use crate::config::{ExecutorMode, JobExecutorConfig, RetryPolicy};
    use crate::execution::Execution;
    use crate::executor::AsyncJobExecutor;
    use crate::handler::{HandlerError, HandlerRegistry, JobContext};
    use crate::jobs::recurrence::Recurrence;
    use crate::jobs::types::{Job, TRIGGER_TIMER, TimerSpec};
    use crate::manager::JobManager;
    use crate::notify::{ExecutorHint, Notifier};
    use crate::process::{InMemoryProcessDefinitionRepository, ProcessDefinition};
    use crate::store::{InMemoryJobStore, JobQuery, JobStore, Page};
    use crate::unit_of_work::UnitOfWork;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 6, 0, 0).unwrap()
    }

    type Runs = Arc<Mutex<HashMap<JobId, usize>>>;

    struct Cluster {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryJobStore>,
        definitions: Arc<InMemoryProcessDefinitionRepository>,
        hint_bus: Arc<InMemoryEventBus<ExecutorHint>>,
        events: Subscription<JobEvent>,
        event_bus: Arc<InMemoryEventBus<JobEvent>>,
        runs: Runs,
    }

    impl Cluster {
        fn new() -> Self {
            jobforge_observability::init();
            let event_bus = Arc::new(InMemoryEventBus::<JobEvent>::new());
            Self {
                clock: Arc::new(ManualClock::new(start())),
                store: InMemoryJobStore::arc(),
                definitions: Arc::new(InMemoryProcessDefinitionRepository::new()),
                hint_bus: Arc::new(InMemoryEventBus::new()),
                events: event_bus.subscribe(),
                event_bus,
                runs: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn handlers(&self) -> HandlerRegistry {
            let record = {
                let runs = self.runs.clone();
                move |job: &Job, _: Option<&str>, _: Option<&Execution>, _: &mut JobContext<'_>| -> Result<(), HandlerError> {
                    *runs.lock().unwrap().entry(job.id).or_default() += 1;
                    Ok(())
                }
            };
            HandlerRegistry::new()
                .with("notify", record.clone())
                .with(TRIGGER_TIMER, record)
                .with(
                    "flaky",
                    |_: &Job, _: Option<&str>, _: Option<&Execution>, _: &mut JobContext<'_>| -> Result<(), HandlerError> {
                        Err(HandlerError::new("remote refused").with_details("connection reset by peer"))
                    },
                )
        }

        /// A manager for one node of the cluster.
        fn node(&self, name: &str, mode: ExecutorMode) -> Arc<JobManager> {
            let config = JobExecutorConfig::default()
                .with_name(name)
                .with_mode(mode)
                .with_lock_time(StdDuration::from_secs(60))
                .with_poll_interval(StdDuration::from_millis(5))
                .with_max_jobs_per_acquisition(4)
                .with_retry_policy(RetryPolicy::fixed(StdDuration::from_secs(30)));
            Arc::new(
                JobManager::new(self.store.clone(), self.clock.clone())
                    .with_config(config)
                    .with_handlers(self.handlers())
                    .with_definitions(self.definitions.clone())
                    .with_events(Arc::new(BusEventDispatcher::new(self.event_bus.clone())))
                    .with_notifier(Notifier::new(self.hint_bus.clone())),
            )
        }

        fn executor(&self, manager: &Arc<JobManager>) -> AsyncJobExecutor {
            AsyncJobExecutor::new(manager.clone()).with_hints(self.hint_bus.subscribe())
        }

        fn send(&self, manager: &JobManager, job: Job) -> Job {
            let mut uow = UnitOfWork::new();
            let job = manager.send(&mut uow, job).unwrap();
            uow.commit(self.store.as_ref()).unwrap();
            job
        }

        fn runs_of(&self, id: JobId) -> usize {
            self.runs.lock().unwrap().get(&id).copied().unwrap_or(0)
        }

        fn total_runs(&self) -> usize {
            self.runs.lock().unwrap().values().sum()
        }
    }

    #[test]
    fn competing_executors_run_each_job_exactly_once() {
        let cluster = Cluster::new();
        let node_a = cluster.node("node-a", ExecutorMode::Polling);
        let node_b = cluster.node("node-b", ExecutorMode::Polling);

        let jobs: Vec<Job> = (0..40)
            .map(|_| cluster.send(&node_a, Job::message("notify")))
            .collect();

        let a = cluster.executor(&node_a).spawn().unwrap();
        let b = cluster.executor(&node_b).spawn().unwrap();
        for _ in 0..400 {
            if cluster.total_runs() == jobs.len() && cluster.store.is_empty() {
                break;
            }
            std::thread::sleep(StdDuration::from_millis(5));
        }
        a.shutdown();
        b.shutdown();

        assert!(cluster.store.is_empty());
        for job in &jobs {
            assert_eq!(cluster.runs_of(job.id), 1, "job {} ran more than once", job.id);
        }
    }

    #[test]
    fn reactive_send_is_picked_up_by_hint_before_its_due_date() {
        let cluster = Cluster::new();
        let node = cluster.node("node-a", ExecutorMode::Reactive);
        let executor = cluster.executor(&node);

        let job = cluster.send(&node, Job::message("notify"));
        assert!(job.due_date.unwrap() > start());

        assert_eq!(executor.tick().unwrap(), 1);
        assert_eq!(cluster.runs_of(job.id), 1);
        assert!(cluster.store.is_empty());
    }

    #[test]
    fn recurring_timer_fires_until_its_repeats_run_out() {
        let cluster = Cluster::new();
        let definition = ProcessDefinitionId::new("reminders:1");
        cluster
            .definitions
            .deploy(
                ProcessDefinition::new(definition.clone(), "reminders", DeploymentId::new("dep-7"))
                    .with_timer_cycle("nudge", "R3/PT15M"),
            )
            .unwrap();
        let node = cluster.node("node-a", ExecutorMode::Polling);
        let executor = cluster.executor(&node);

        let recurrence: Recurrence = "R3/PT15M".parse().unwrap();
        let mut uow = UnitOfWork::new();
        node.schedule(
            &mut uow,
            Job::timer(TRIGGER_TIMER, TimerSpec::recurring(recurrence))
                .of_definition(definition, "reminders")
                .with_configuration("nudge")
                .due_at(start()),
        )
        .unwrap();
        uow.commit(cluster.store.as_ref()).unwrap();

        let mut firings = 0;
        for _ in 0..5 {
            firings += executor.tick().unwrap();
            cluster.clock.advance(Duration::minutes(15));
        }

        assert_eq!(firings, 3);
        assert_eq!(cluster.total_runs(), 3);
        assert!(cluster.store.is_empty());

        let fired = cluster
            .events
            .drain()
            .into_iter()
            .filter(|e| e.kind == JobEventKind::TimerFired)
            .count();
        assert_eq!(fired, 3);
    }

    #[test]
    fn exclusive_jobs_of_one_instance_never_overlap() {
        let cluster = Cluster::new();
        let node = cluster.node("node-a", ExecutorMode::Polling);
        let instance = ProcessInstanceId::new("order-42");

        let first = cluster.send(&node, Job::message("notify").in_process_instance(instance.clone()));
        let second = cluster.send(&node, Job::message("notify").in_process_instance(instance.clone()));
        let loose = cluster.send(&node, Job::message("notify"));

        let claimed = node.acquire_due_jobs(10).unwrap();
        let claimed_ids: Vec<JobId> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(claimed.len(), 2);
        assert!(claimed_ids.contains(&loose.id));
        assert_eq!(
            claimed_ids.iter().filter(|id| **id == first.id || **id == second.id).count(),
            1
        );
        assert!(node.find_exclusive_jobs_to_execute(&instance).unwrap().is_empty());

        let executor = cluster.executor(&node);
        for job in &claimed {
            executor.execute_job(job).unwrap();
        }

        let rest = node.acquire_due_jobs(10).unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].id == first.id || rest[0].id == second.id);
    }

    #[test]
    fn expired_lease_is_taken_over_by_another_node() {
        let cluster = Cluster::new();
        let node_a = cluster.node("node-a", ExecutorMode::Polling);
        let node_b = cluster.node("node-b", ExecutorMode::Polling);
        let job = cluster.send(&node_a, Job::message("notify"));

        // node-a claims and then disappears.
        let stranded = node_a.acquire_due_jobs(1).unwrap();
        assert_eq!(stranded.len(), 1);
        assert!(node_b.acquire_due_jobs(1).unwrap().is_empty());
        assert_eq!(node_a.find_jobs_by_lock_owner("node-a", Page::all()).unwrap().len(), 1);

        cluster.clock.advance(Duration::seconds(61));
        let executor_b = cluster.executor(&node_b);
        assert_eq!(executor_b.tick().unwrap(), 1);
        assert_eq!(cluster.runs_of(job.id), 1);

        // node-a wakes up and tries to finish with its stale copy.
        let executor_a = cluster.executor(&node_a);
        assert!(executor_a.execute_job(&stranded[0]).is_err());
        assert_eq!(cluster.runs_of(job.id), 2);
        assert!(cluster.store.is_empty());
    }

    #[test]
    fn exhausted_job_is_left_for_operators() {
        let cluster = Cluster::new();
        let node = cluster.node("node-a", ExecutorMode::Polling);
        let executor = cluster.executor(&node);
        let job = cluster.send(&node, Job::message("flaky").with_retries(2));

        assert_eq!(executor.tick().unwrap(), 1);
        cluster.clock.advance(Duration::seconds(30));
        assert_eq!(executor.tick().unwrap(), 1);
        cluster.clock.advance(Duration::hours(1));
        assert_eq!(executor.tick().unwrap(), 0);

        let failed = node.find_failed_jobs(Page::all()).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, job.id);
        assert_eq!(
            node.count_jobs_by_query(&JobQuery::new().with_exception().no_retries_left())
                .unwrap(),
            1
        );

        let payload = node.exception_payload(job.id).unwrap().unwrap();
        assert_eq!(payload.details, "connection reset by peer");

        let kinds: Vec<JobEventKind> = cluster.events.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == JobEventKind::JobExecutionFailure).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == JobEventKind::JobRetriesDecremented).count(), 2);
        assert!(!kinds.contains(&JobEventKind::JobExecutionSuccess));

        let stats = executor.stats();
        assert_eq!(stats.jobs_failed, 2);
        assert_eq!(stats.jobs_exhausted, 1);
    }

    #[test]
    fn store_survives_a_failed_batch_untouched() {
        let cluster = Cluster::new();
        let node = cluster.node("node-a", ExecutorMode::Inactive);
        let kept = cluster.send(&node, Job::message("notify"));

        let mut uow = UnitOfWork::new();
        node.send(&mut uow, Job::message("notify")).unwrap();
        uow.delete(kept.id, kept.revision + 5);
        assert!(uow.commit(cluster.store.as_ref()).is_err());

        let remaining = cluster.store.find_by_query(&JobQuery::new(), Page::all()).unwrap();
        assert_eq!(remaining, vec![kept]);
    }
}
