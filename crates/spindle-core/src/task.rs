//! Schedulable work: the four task kinds and the list that owns them.
//!
//! Tasks only ever run on the reactor thread; cross-thread submission goes
//! through [`Handle::schedule`](crate::reactor::Handle::schedule), which
//! wraps the closure in a one-off task. `TaskList::run_due` fires against a
//! swapped-out snapshot, so task bodies are free to add or remove siblings
//! (including themselves) without corrupting the iteration.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::reactor::Reactor;

/// Identifier returned by task constructors, used for explicit removal of
/// persistent and periodic tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// How a task fires and when it leaves the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Fires on the next pass, then removes itself.
    OneOff,
    /// Fires every pass until explicitly removed.
    Persistent,
    /// Fires when due, then reschedules itself one interval out.
    Periodic,
    /// Fires once when due, then removes itself.
    Delayed,
}

pub(crate) type TaskBody = Box<dyn FnMut(&mut Reactor) + 'static>;

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) body: TaskBody,
    pub(crate) due_at: Option<Instant>,
    pub(crate) interval: Option<Duration>,
}

impl Task {
    pub(crate) fn one_off(id: TaskId, body: TaskBody) -> Self {
        Self {
            id,
            kind: TaskKind::OneOff,
            body,
            due_at: None,
            interval: None,
        }
    }

    pub(crate) fn persistent(id: TaskId, body: TaskBody) -> Self {
        Self {
            id,
            kind: TaskKind::Persistent,
            body,
            due_at: None,
            interval: None,
        }
    }

    pub(crate) fn periodic(id: TaskId, interval: Duration, now: Instant, body: TaskBody) -> Self {
        Self {
            id,
            kind: TaskKind::Periodic,
            body,
            due_at: Some(now + interval),
            interval: Some(interval),
        }
    }

    pub(crate) fn delayed(id: TaskId, delay: Duration, now: Instant, body: TaskBody) -> Self {
        Self {
            id,
            kind: TaskKind::Delayed,
            body,
            due_at: Some(now + delay),
            interval: None,
        }
    }

    /// Whether this task should fire on a pass happening at `now`.
    pub(crate) fn due(&self, now: Instant) -> bool {
        match self.due_at {
            Some(due_at) => now >= due_at,
            None => true,
        }
    }

    /// Post-fire bookkeeping. Returns false when the task is done and must
    /// leave the list.
    pub(crate) fn keep_after_fire(&mut self, now: Instant) -> bool {
        match self.kind {
            TaskKind::OneOff | TaskKind::Delayed => false,
            TaskKind::Persistent => true,
            TaskKind::Periodic => {
                // Best-effort accuracy: schedule relative to the actual fire
                // time, not the nominal one, so a slow tick doesn't cause a
                // burst of catch-up fires.
                let interval = self.interval.unwrap_or_default();
                self.due_at = Some(now + interval);
                true
            }
        }
    }
}

/// Ordered task list with snapshot-safe firing.
#[derive(Default)]
pub(crate) struct TaskList {
    entries: Vec<Task>,
    /// Removals requested while the live entries are swapped out for firing.
    removed: HashSet<u64>,
}

impl TaskList {
    pub(crate) fn push(&mut self, task: Task) {
        self.entries.push(task);
    }

    /// Mark a task for removal. Effective immediately for queued tasks, and
    /// at merge time for a snapshot currently firing.
    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|t| t.id != id);
        if self.entries.len() != before {
            return true;
        }
        self.removed.insert(id.0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.removed.clear();
    }

    /// Earliest deadline among timed tasks, used to cap the poll timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|t| t.due_at).min()
    }

    /// Take the current entries, leaving the list ready to collect tasks
    /// added while the snapshot fires.
    pub(crate) fn take_entries(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.entries)
    }

    /// Merge a fired snapshot back in front of tasks added meanwhile,
    /// honoring removals requested during the firing pass.
    pub(crate) fn absorb_front(&mut self, mut survivors: Vec<Task>) {
        survivors.retain(|t| !self.removed.contains(&t.id.0));
        self.entries.retain(|t| !self.removed.contains(&t.id.0));
        self.removed.clear();
        survivors.append(&mut self.entries);
        self.entries = survivors;
    }

    pub(crate) fn is_removed(&self, id: TaskId) -> bool {
        self.removed.contains(&id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TaskBody {
        Box::new(|_| {})
    }

    #[test]
    fn due_times_by_kind() {
        let now = Instant::now();
        let one_off = Task::one_off(TaskId(1), noop());
        assert!(one_off.due(now));

        let delayed = Task::delayed(TaskId(2), Duration::from_millis(50), now, noop());
        assert!(!delayed.due(now));
        assert!(delayed.due(now + Duration::from_millis(50)));

        let periodic = Task::periodic(TaskId(3), Duration::from_millis(20), now, noop());
        assert!(!periodic.due(now));
        assert!(periodic.due(now + Duration::from_millis(25)));
    }

    #[test]
    fn periodic_reschedules_and_survives() {
        let now = Instant::now();
        let mut task = Task::periodic(TaskId(1), Duration::from_millis(10), now, noop());
        let fire_at = now + Duration::from_millis(12);
        assert!(task.keep_after_fire(fire_at));
        assert_eq!(task.due_at, Some(fire_at + Duration::from_millis(10)));
    }

    #[test]
    fn one_shot_kinds_leave_after_firing() {
        let now = Instant::now();
        let mut one_off = Task::one_off(TaskId(1), noop());
        assert!(!one_off.keep_after_fire(now));

        let mut delayed = Task::delayed(TaskId(2), Duration::from_millis(1), now, noop());
        assert!(!delayed.keep_after_fire(now));

        let mut persistent = Task::persistent(TaskId(3), noop());
        assert!(persistent.keep_after_fire(now));
    }

    #[test]
    fn removal_during_snapshot_is_honored_at_merge() {
        let mut list = TaskList::default();
        list.push(Task::persistent(TaskId(1), noop()));
        list.push(Task::persistent(TaskId(2), noop()));

        let snapshot = list.take_entries();
        assert!(list.is_empty());

        // A body removes task 2 and adds task 3 while the snapshot fires.
        list.remove(TaskId(2));
        list.push(Task::persistent(TaskId(3), noop()));
        assert!(list.is_removed(TaskId(2)));

        list.absorb_front(snapshot);
        let ids: Vec<u64> = list.entries.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
