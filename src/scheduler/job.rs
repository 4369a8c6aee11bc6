use std::{
    cell::{Cell, RefCell},
    fmt::Display,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use crate::error::Unwind;

use super::tag::TagId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(super) u64);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Runnable,
    Running,
    Blocked,
    Terminated,
}

/// Why a job handed control back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    Yield,
    Sleep(Duration),
    Join(JobId),
}

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub parent: Option<JobId>,
    state: Cell<JobState>,
    suspension: Cell<Option<Suspension>>,
    tags: RefCell<Vec<TagId>>,
    inherited: usize,
    pending: RefCell<Option<Unwind>>,
    non_interruptible: Cell<bool>,
    children: RefCell<Vec<JobId>>,
    waiters: RefCell<Vec<JobId>>,
    joining: Cell<Option<JobId>>,
    deadline: Cell<Option<Duration>>,
    frozen_since: Cell<Option<Duration>>,
}

impl Job {
    pub(super) fn new(id: JobId, name: String, parent: Option<JobId>, tags: Vec<TagId>) -> Self {
        Job {
            id,
            name,
            parent,
            state: Cell::new(JobState::Runnable),
            suspension: Cell::new(None),
            inherited: tags.len(),
            tags: RefCell::new(tags),
            pending: RefCell::new(None),
            non_interruptible: Cell::new(false),
            children: RefCell::new(Vec::new()),
            waiters: RefCell::new(Vec::new()),
            joining: Cell::new(None),
            deadline: Cell::new(None),
            frozen_since: Cell::new(None),
        }
    }

    pub fn state(&self) -> JobState {
        self.state.get()
    }

    pub(super) fn set_state(&self, state: JobState) {
        self.state.set(state);
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == JobState::Terminated
    }

    pub(super) fn take_suspension(&self) -> Option<Suspension> {
        self.suspension.take()
    }

    /// Snapshot of the tag stack, innermost last.
    pub fn tags(&self) -> Vec<TagId> {
        self.tags.borrow().clone()
    }

    /// Number of tags received from the spawning job.
    pub fn inherited(&self) -> usize {
        self.inherited
    }

    /// Pushes `tag` and returns its depth in the stack.
    pub fn push_tag(&self, tag: TagId) -> usize {
        let mut tags = self.tags.borrow_mut();
        tags.push(tag);
        tags.len() - 1
    }

    /// Removes the innermost occurrence of `tag`. A pending tag signal aimed at
    /// a level that no longer exists is dropped with it.
    pub fn pop_tag(&self, tag: TagId) {
        let len = {
            let mut tags = self.tags.borrow_mut();
            if let Some(index) = tags.iter().rposition(|t| *t == tag) {
                tags.remove(index);
            }
            tags.len()
        };
        let mut pending = self.pending.borrow_mut();
        if matches!(&*pending, Some(Unwind::Tag(signal)) if signal.depth >= len) {
            *pending = None;
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }

    pub fn take_pending(&self) -> Option<Unwind> {
        self.pending.borrow_mut().take()
    }

    /// Records a signal to raise at the next suspension point. Termination always
    /// wins, and between two tag signals the outermost one is kept.
    pub fn post_pending(&self, signal: Unwind) {
        let mut pending = self.pending.borrow_mut();
        let replace = match (&*pending, &signal) {
            (None, _) => true,
            (Some(Unwind::Terminate), _) => false,
            (_, Unwind::Terminate) => true,
            (Some(Unwind::Tag(current)), Unwind::Tag(new)) => new.depth < current.depth,
            (Some(Unwind::Tag(_)), _) => false,
            (Some(_), Unwind::Tag(_)) => true,
            (Some(_), _) => false,
        };
        if replace {
            *pending = Some(signal);
        }
    }

    pub fn non_interruptible(&self) -> bool {
        self.non_interruptible.get()
    }

    pub fn set_non_interruptible(&self, value: bool) {
        self.non_interruptible.set(value);
    }

    pub(super) fn add_child(&self, child: JobId) {
        self.children.borrow_mut().push(child);
    }

    pub(super) fn remove_child(&self, child: JobId) {
        self.children.borrow_mut().retain(|c| *c != child);
    }

    pub(super) fn take_children(&self) -> Vec<JobId> {
        self.children.take()
    }

    pub(super) fn add_waiter(&self, waiter: JobId) {
        self.waiters.borrow_mut().push(waiter);
    }

    pub(super) fn remove_waiter(&self, waiter: JobId) {
        self.waiters.borrow_mut().retain(|w| *w != waiter);
    }

    pub(super) fn take_waiters(&self) -> Vec<JobId> {
        self.waiters.take()
    }

    /// The job this one is blocked joining, if any.
    pub(super) fn set_joining(&self, target: Option<JobId>) {
        self.joining.set(target);
    }

    pub(super) fn take_joining(&self) -> Option<JobId> {
        self.joining.take()
    }

    pub(super) fn deadline(&self) -> Option<Duration> {
        self.deadline.get()
    }

    pub(super) fn set_deadline(&self, deadline: Option<Duration>) {
        self.deadline.set(deadline);
    }

    pub(super) fn frozen_since(&self) -> Option<Duration> {
        self.frozen_since.get()
    }

    pub(super) fn set_frozen_since(&self, since: Option<Duration>) {
        self.frozen_since.set(since);
    }
}

/// Hands control back to the scheduler once, recording why on the job.
pub struct Suspend {
    job: Rc<Job>,
    suspension: Option<Suspension>,
}

impl Suspend {
    pub fn new(job: &Rc<Job>, suspension: Suspension) -> Self {
        Suspend {
            job: job.clone(),
            suspension: Some(suspension),
        }
    }
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        match self.suspension.take() {
            Some(suspension) => {
                self.job.suspension.set(Some(suspension));
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}
