pub mod job;
pub mod tag;

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    panic::AssertUnwindSafe,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::{future::LocalBoxFuture, task::noop_waker, FutureExt};
use rustc_hash::FxHashMap;

use crate::{
    error::{DomainError, ErrorKind, SignalKind, TagSignal, Unwind},
    interpreter::Value,
};

use self::{
    job::{Job, JobId, JobState, Suspension},
    tag::{TagId, Tags},
};

/// How a job's future ended.
#[derive(Debug)]
pub enum JobOutcome {
    Done,
    Failed(DomainError),
}

/// Single-threaded cooperative scheduler. Each job is a boxed local future that only
/// returns `Pending` from a `Suspend` point.
pub struct Scheduler {
    jobs: RefCell<FxHashMap<JobId, Rc<Job>>>,
    futures: RefCell<FxHashMap<JobId, LocalBoxFuture<'static, JobOutcome>>>,
    run_queue: RefCell<VecDeque<JobId>>,
    sleeping: RefCell<Vec<JobId>>,
    frozen: RefCell<Vec<JobId>>,
    current: Cell<Option<JobId>>,
    next_id: Cell<u64>,
    cycles: Cell<u64>,
    now: Cell<Duration>,
    started: Instant,
    real_time: bool,
    cycle_time: Duration,
    tags: RefCell<Tags>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.borrow().len())
            .field("run_queue", &self.run_queue.borrow())
            .field("cycles", &self.cycles.get())
            .field("now", &self.now.get())
            .finish()
    }
}

impl Scheduler {
    /// In real time the clock follows the wall clock. Otherwise it is virtual: a
    /// cycle that leaves jobs runnable costs `cycle_time`, and idle periods are
    /// skipped.
    pub fn new(real_time: bool, cycle_time: Duration) -> Self {
        Scheduler {
            jobs: RefCell::new(FxHashMap::default()),
            futures: RefCell::new(FxHashMap::default()),
            run_queue: RefCell::new(VecDeque::new()),
            sleeping: RefCell::new(Vec::new()),
            frozen: RefCell::new(Vec::new()),
            current: Cell::new(None),
            next_id: Cell::new(1),
            cycles: Cell::new(0),
            now: Cell::new(Duration::ZERO),
            started: Instant::now(),
            real_time,
            cycle_time,
            tags: RefCell::new(Tags::new()),
        }
    }

    pub fn tags(&self) -> &RefCell<Tags> {
        &self.tags
    }

    /// Scheduler clock, starting at zero.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }

    pub fn job(&self, id: JobId) -> Option<Rc<Job>> {
        self.jobs.borrow().get(&id).cloned()
    }

    pub fn current(&self) -> Option<Rc<Job>> {
        self.current.get().and_then(|id| self.job(id))
    }

    pub fn live_jobs(&self) -> usize {
        self.jobs.borrow().len()
    }

    /// Registers a job. A `parent` links the two: the child dies with the parent and
    /// reports its errors to it.
    pub fn create_job(&self, name: &str, parent: Option<JobId>, tags: Vec<TagId>) -> Rc<Job> {
        let id = JobId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let job = Rc::new(Job::new(id, name.to_string(), parent, tags));
        if let Some(parent) = parent.and_then(|p| self.job(p)) {
            parent.add_child(id);
        }
        self.jobs.borrow_mut().insert(id, job.clone());
        tracing::debug!(%id, name, ?parent, "created job");
        job
    }

    /// Hands the job its code and makes it runnable from the next cycle on.
    pub fn start(&self, job: &Rc<Job>, future: LocalBoxFuture<'static, JobOutcome>) {
        let id = job.id;
        let future = AssertUnwindSafe(future).catch_unwind().map(move |result| {
            result.unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                tracing::error!(%id, %message, "job panicked");
                JobOutcome::Failed(DomainError::new(ErrorKind::Unexpected(message)))
            })
        });
        self.futures.borrow_mut().insert(id, future.boxed_local());
        job.set_state(JobState::Runnable);
        self.run_queue.borrow_mut().push_back(id);
    }

    pub fn is_frozen(&self, job: &Job) -> bool {
        let tags = self.tags.borrow();
        job.tags().into_iter().any(|tag| tags.is_frozen(tag))
    }

    /// Makes a blocked job runnable again. Waking a job that is not blocked does nothing.
    pub fn wake(&self, id: JobId) {
        let Some(job) = self.job(id) else {
            return;
        };
        if job.state() != JobState::Blocked {
            return;
        }
        self.sleeping.borrow_mut().retain(|s| *s != id);
        self.frozen.borrow_mut().retain(|s| *s != id);
        if let Some(target) = job.take_joining().and_then(|t| self.job(t)) {
            target.remove_waiter(id);
        }
        job.set_deadline(None);
        job.set_state(JobState::Runnable);
        self.run_queue.borrow_mut().push_back(id);
        tracing::trace!(%id, "woke job");
    }

    /// Kills a job at its next suspension point.
    pub fn terminate(&self, id: JobId) {
        if let Some(job) = self.job(id) {
            job.post_pending(Unwind::Terminate);
            self.wake(id);
        }
    }

    /// Stops or blocks `tag` in every live job holding it (or one of its descendants).
    /// The signal for the currently running job is returned instead of posted, so the
    /// caller can raise it right away.
    pub fn signal_tag(&self, tag: TagId, kind: SignalKind, payload: Value) -> Option<Unwind> {
        let mut jobs: Vec<Rc<Job>> = self.jobs.borrow().values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        let current = self.current.get();
        let mut own = None;
        for job in jobs {
            if job.is_terminated() {
                continue;
            }
            let depth = {
                let tags = self.tags.borrow();
                job.tags()
                    .iter()
                    .position(|held| tags.descends_from(*held, tag))
            };
            let Some(depth) = depth else {
                continue;
            };
            let signal = if depth < job.inherited() {
                Unwind::Terminate
            } else {
                Unwind::Tag(TagSignal {
                    kind,
                    tag,
                    depth,
                    payload: payload.clone(),
                })
            };
            tracing::debug!(id = %job.id, %tag, ?kind, depth, "signalling job");
            if Some(job.id) == current {
                own = Some(signal);
            } else {
                job.post_pending(signal);
                self.wake(job.id);
            }
        }
        own
    }

    /// Runs one round: every job runnable when the round starts is polled once,
    /// in FIFO order.
    pub fn cycle(&self) {
        self.refresh();
        let batch: Vec<JobId> = self.run_queue.borrow_mut().drain(..).collect();
        tracing::trace!(cycle = self.cycles.get(), jobs = batch.len(), "cycle");
        for id in batch {
            let Some(job) = self.job(id) else {
                continue;
            };
            if job.state() != JobState::Runnable {
                continue;
            }
            if !job.has_pending() && self.is_frozen(&job) {
                job.set_state(JobState::Blocked);
                self.frozen.borrow_mut().push(id);
                continue;
            }
            self.poll_job(&job);
        }
        self.tick();
        self.refresh();
        self.wake_sleepers();
        self.cycles.set(self.cycles.get() + 1);
    }

    /// Runs cycles until nothing can make progress, jumping the clock over idle
    /// periods. Returns the number of cycles run.
    pub fn run(&self, max_cycles: Option<u64>) -> u64 {
        let mut ran = 0;
        loop {
            if max_cycles.is_some_and(|max| ran >= max) {
                break;
            }
            self.refresh();
            if self.run_queue.borrow().is_empty() {
                let Some(deadline) = self.next_deadline() else {
                    break;
                };
                self.advance_to(deadline);
                self.wake_sleepers();
            }
            self.cycle();
            ran += 1;
        }
        ran
    }

    /// Runs a job until it terminates or the scheduler goes idle.
    pub fn run_until_terminated(&self, job: &Job, max_cycles: Option<u64>) {
        let mut ran = 0;
        while !job.is_terminated() && !max_cycles.is_some_and(|max| ran >= max) {
            if self.run(Some(1)) == 0 {
                break;
            }
            ran += 1;
        }
    }

    /// Drops every remaining job without running it.
    pub fn shutdown(&self) {
        let futures: Vec<_> = self.futures.borrow_mut().drain().collect();
        drop(futures);
        for job in self.jobs.borrow_mut().drain().map(|(_, job)| job) {
            job.set_state(JobState::Terminated);
        }
        self.run_queue.borrow_mut().clear();
        self.sleeping.borrow_mut().clear();
        self.frozen.borrow_mut().clear();
    }

    fn poll_job(&self, job: &Rc<Job>) {
        let Some(mut future) = self.futures.borrow_mut().remove(&job.id) else {
            return;
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        job.set_state(JobState::Running);
        self.current.set(Some(job.id));
        let poll = future.as_mut().poll(&mut cx);
        self.current.set(None);

        match poll {
            Poll::Ready(outcome) => self.finish(job, outcome),
            Poll::Pending => {
                self.futures.borrow_mut().insert(job.id, future);
                self.suspend(job);
            }
        }
    }

    fn suspend(&self, job: &Rc<Job>) {
        match job.take_suspension().unwrap_or(Suspension::Yield) {
            Suspension::Yield => {
                job.set_state(JobState::Runnable);
                self.run_queue.borrow_mut().push_back(job.id);
            }
            Suspension::Sleep(deadline) => {
                job.set_state(JobState::Blocked);
                job.set_deadline(Some(deadline));
                self.sleeping.borrow_mut().push(job.id);
            }
            Suspension::Join(target) => match self.job(target) {
                Some(target) if !target.is_terminated() => {
                    job.set_state(JobState::Blocked);
                    job.set_joining(Some(target.id));
                    target.add_waiter(job.id);
                }
                _ => {
                    job.set_state(JobState::Runnable);
                    self.run_queue.borrow_mut().push_back(job.id);
                }
            },
        }
    }

    fn finish(&self, job: &Rc<Job>, outcome: JobOutcome) {
        job.set_state(JobState::Terminated);
        self.jobs.borrow_mut().remove(&job.id);
        tracing::debug!(id = %job.id, name = %job.name, ?outcome, "job terminated");

        for waiter in job.take_waiters() {
            self.wake(waiter);
        }
        if let Some(parent) = job.parent.and_then(|p| self.job(p)) {
            parent.remove_child(job.id);
        }
        for child in job.take_children() {
            self.terminate(child);
        }
        if let JobOutcome::Failed(error) = outcome {
            if let Some(parent) = job.parent.and_then(|p| self.job(p)) {
                parent.post_pending(Unwind::Error(error));
                self.wake(parent.id);
            }
        }
    }

    /// Moves thawed jobs back to the run queue and shifts the deadline of sleepers
    /// by the time they spent frozen.
    fn refresh(&self) {
        let now = self.now();
        let frozen: Vec<JobId> = self.frozen.borrow().clone();
        for id in frozen {
            let Some(job) = self.job(id) else {
                continue;
            };
            if job.has_pending() || !self.is_frozen(&job) {
                self.wake(id);
            }
        }

        let sleeping: Vec<JobId> = self.sleeping.borrow().clone();
        for id in sleeping {
            let Some(job) = self.job(id) else {
                continue;
            };
            if self.is_frozen(&job) {
                if job.frozen_since().is_none() {
                    job.set_frozen_since(Some(now));
                }
            } else if let Some(since) = job.frozen_since() {
                job.set_frozen_since(None);
                if let Some(deadline) = job.deadline() {
                    job.set_deadline(Some(deadline + (now - since)));
                }
            }
        }
    }

    fn wake_sleepers(&self) {
        let now = self.now();
        let due: Vec<JobId> = self
            .sleeping
            .borrow()
            .iter()
            .copied()
            .filter(|id| {
                self.job(*id).is_some_and(|job| {
                    job.frozen_since().is_none()
                        && job.deadline().is_some_and(|deadline| deadline <= now)
                })
            })
            .collect();
        for id in due {
            self.wake(id);
        }
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.sleeping
            .borrow()
            .iter()
            .filter_map(|id| self.job(*id))
            .filter(|job| job.frozen_since().is_none())
            .filter_map(|job| job.deadline())
            .min()
    }

    /// Accounts for the time the cycle that just ran took.
    fn tick(&self) {
        if self.real_time {
            self.now.set(self.now().max(self.started.elapsed()));
        } else if !self.run_queue.borrow().is_empty() {
            self.now.set(self.now() + self.cycle_time);
        }
    }

    fn advance_to(&self, deadline: Duration) {
        if self.real_time {
            let elapsed = self.started.elapsed();
            if deadline > elapsed {
                std::thread::sleep(deadline - elapsed);
            }
            self.now.set(self.now().max(self.started.elapsed()).max(deadline));
            return;
        }
        if deadline <= self.now() {
            return;
        }
        tracing::trace!(?deadline, "advancing clock");
        self.now.set(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::{job::Suspend, *};

    const CYCLE: Duration = Duration::from_millis(1);

    fn log_job(
        job: &Rc<Job>,
        log: &Rc<RefCell<Vec<String>>>,
        steps: usize,
    ) -> LocalBoxFuture<'static, JobOutcome> {
        let job = job.clone();
        let log = log.clone();
        async move {
            for step in 0..steps {
                log.borrow_mut().push(format!("{}:{}", job.name, step));
                Suspend::new(&job, Suspension::Yield).await;
                if job.take_pending().is_some() {
                    return JobOutcome::Done;
                }
            }
            JobOutcome::Done
        }
        .boxed_local()
    }

    #[test]
    fn test_jobs_interleave_in_fifo_order() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let job = scheduler.create_job(name, None, Vec::new());
            scheduler.start(&job, log_job(&job, &log, 2));
        }
        scheduler.run(None);
        assert_eq!(*log.borrow(), vec!["a:0", "b:0", "a:1", "b:1"]);
        assert_eq!(scheduler.live_jobs(), 0);
    }

    #[test]
    fn test_sleep_jumps_virtual_clock() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let job = scheduler.create_job("sleeper", None, Vec::new());
        let handle = job.clone();
        scheduler.start(
            &job,
            async move {
                Suspend::new(&handle, Suspension::Sleep(Duration::from_secs(5))).await;
                JobOutcome::Done
            }
            .boxed_local(),
        );
        scheduler.run(None);
        assert_eq!(scheduler.now(), Duration::from_secs(5));
        assert!(job.is_terminated());
    }

    fn sleeper(
        job: &Rc<Job>,
        deadline: Duration,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> LocalBoxFuture<'static, JobOutcome> {
        let job = job.clone();
        let log = log.clone();
        async move {
            Suspend::new(&job, Suspension::Sleep(deadline)).await;
            log.borrow_mut().push("woke".to_string());
            JobOutcome::Done
        }
        .boxed_local()
    }

    #[test]
    fn test_busy_cycles_advance_virtual_clock() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let log = Rc::new(RefCell::new(Vec::new()));
        let busy = scheduler.create_job("busy", None, Vec::new());
        scheduler.start(&busy, log_job(&busy, &log, 5000));
        let waiting = scheduler.create_job("sleeper", None, Vec::new());
        scheduler.start(&waiting, sleeper(&waiting, Duration::from_secs(1), &log));

        scheduler.run(None);
        let woke = log.borrow().iter().position(|entry| entry == "woke");
        assert!(woke.is_some_and(|index| (990..1010).contains(&index)), "{woke:?}");
    }

    #[test]
    fn test_real_time_clock_moves_while_jobs_are_busy() {
        let scheduler = Rc::new(Scheduler::new(true, CYCLE));
        let log = Rc::new(RefCell::new(Vec::new()));
        let waiting = scheduler.create_job("sleeper", None, Vec::new());
        scheduler.start(&waiting, sleeper(&waiting, Duration::from_millis(10), &log));

        let busy = scheduler.create_job("busy", None, Vec::new());
        let handle = busy.clone();
        let seen = log.clone();
        scheduler.start(
            &busy,
            async move {
                while seen.borrow().is_empty() {
                    Suspend::new(&handle, Suspension::Yield).await;
                }
                JobOutcome::Done
            }
            .boxed_local(),
        );

        scheduler.run(None);
        assert!(scheduler.now() >= Duration::from_millis(10));
        assert_eq!(scheduler.live_jobs(), 0);
    }

    #[test]
    fn test_finished_child_is_forgotten_by_parent() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let log = Rc::new(RefCell::new(Vec::new()));
        let parent = scheduler.create_job("parent", None, Vec::new());
        let child = scheduler.create_job("child", Some(parent.id), Vec::new());
        scheduler.start(&child, log_job(&child, &log, 1));

        scheduler.run(None);
        assert!(child.is_terminated());
        assert!(parent.take_children().is_empty());
    }

    #[test]
    fn test_interrupted_join_leaves_no_waiter() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let log = Rc::new(RefCell::new(Vec::new()));
        let target = scheduler.create_job("target", None, Vec::new());
        scheduler.start(&target, sleeper(&target, Duration::from_secs(10), &log));
        let joiner = scheduler.create_job("joiner", None, Vec::new());
        let handle = joiner.clone();
        let target_id = target.id;
        scheduler.start(
            &joiner,
            async move {
                Suspend::new(&handle, Suspension::Join(target_id)).await;
                JobOutcome::Done
            }
            .boxed_local(),
        );

        scheduler.cycle();
        assert_eq!(joiner.state(), JobState::Blocked);
        scheduler.terminate(joiner.id);
        assert!(target.take_waiters().is_empty());
    }

    #[test]
    fn test_frozen_job_is_skipped_until_thawed() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let tag = scheduler.tags().borrow_mut().create("t", None);
        let log = Rc::new(RefCell::new(Vec::new()));
        let job = scheduler.create_job("f", None, vec![tag]);
        scheduler.start(&job, log_job(&job, &log, 3));

        scheduler.cycle();
        scheduler.tags().borrow_mut().freeze(tag);
        scheduler.run(Some(5));
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(job.state(), JobState::Blocked);

        scheduler.tags().borrow_mut().unfreeze(tag);
        scheduler.run(None);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn test_signal_on_inherited_tag_terminates() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let tag = scheduler.tags().borrow_mut().create("t", None);
        let job = scheduler.create_job("child", None, vec![tag]);
        assert!(scheduler
            .signal_tag(tag, SignalKind::Stop, Value::Void)
            .is_none());
        assert!(matches!(job.take_pending(), Some(Unwind::Terminate)));
    }

    fn bad_name() -> bool {
        true
    }

    #[test]
    fn test_panic_fails_only_that_job() {
        let scheduler = Rc::new(Scheduler::new(false, CYCLE));
        let log = Rc::new(RefCell::new(Vec::new()));
        let bad = scheduler.create_job("bad", None, Vec::new());
        scheduler.start(
            &bad,
            async move {
                if bad_name() {
                    panic!("boom");
                }
                JobOutcome::Done
            }
            .boxed_local(),
        );
        let good = scheduler.create_job("good", None, Vec::new());
        scheduler.start(&good, log_job(&good, &log, 2));
        scheduler.run(None);
        assert!(bad.is_terminated());
        assert_eq!(log.borrow().len(), 2);
    }
}
