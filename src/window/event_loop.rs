//! Cooperative scheduling for one window: a clock, the timer queue, the
//! microtask queue, and the async task counter `when_complete` waits on.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::js_engine::JSError;

pub(crate) type Callback = Box<dyn FnOnce() -> Result<(), JSError> + Send>;
pub(crate) type RepeatingCallback = Arc<dyn Fn() -> Result<(), JSError> + Send + Sync>;
pub(crate) type FrameCallback = Box<dyn FnOnce(f64) -> Result<(), JSError> + Send>;

/// Where a window reads time from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Time only moves through `advance_time` or when the loop jumps to the
    /// next timer.
    #[default]
    Virtual,
    System,
}

pub(crate) enum Clock {
    Virtual(AtomicU64),
    System(Instant),
}

impl Clock {
    pub(crate) fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Virtual => Clock::Virtual(AtomicU64::new(0)),
            ClockMode::System => Clock::System(Instant::now()),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        match self {
            Clock::Virtual(now) => now.load(Ordering::Acquire),
            Clock::System(origin) => origin.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn is_virtual(&self) -> bool {
        matches!(self, Clock::Virtual(_))
    }

    /// Moves a virtual clock forward to `ms`. Never moves it back.
    pub(crate) fn advance_to(&self, ms: u64) {
        if let Clock::Virtual(now) = self {
            now.fetch_max(ms, Ordering::AcqRel);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u32);

/// Kinds of work tracked by the async task counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Timer,
    Interval,
    AnimationFrame,
    Fetch,
    ResourceLoad,
    Script,
    Navigation,
}

impl TaskKind {
    /// Work that waits on the resource loader rather than the clock.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            TaskKind::Fetch | TaskKind::ResourceLoad | TaskKind::Script | TaskKind::Navigation
        )
    }

    /// Work that holds back the document's `load` event.
    pub fn blocks_load(self) -> bool {
        matches!(self, TaskKind::ResourceLoad | TaskKind::Script | TaskKind::Navigation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// The async task counter. Every operation that can be awaited registers
/// here on start and is removed on settle, whatever the outcome.
pub(crate) struct AsyncTaskTracker {
    next: AtomicU64,
    running: Mutex<HashMap<TaskId, TaskKind>>,
    generation: watch::Sender<u64>,
}

impl fmt::Debug for AsyncTaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskTracker")
            .field("running", &self.count())
            .finish()
    }
}

impl AsyncTaskTracker {
    pub(crate) fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            next: AtomicU64::new(1),
            running: Mutex::new(HashMap::new()),
            generation,
        }
    }

    pub(crate) fn start(&self, kind: TaskKind) -> TaskId {
        let id = TaskId(self.next.fetch_add(1, Ordering::Relaxed));
        self.running.lock().insert(id, kind);
        self.generation.send_modify(|g| *g += 1);
        trace!(task = id.0, ?kind, "task started");
        id
    }

    /// Removes a task; `false` if it had already settled.
    pub(crate) fn end(&self, id: TaskId) -> bool {
        let removed = self.running.lock().remove(&id).is_some();
        if removed {
            self.generation.send_modify(|g| *g += 1);
            trace!(task = id.0, "task settled");
        }
        removed
    }

    pub(crate) fn count(&self) -> usize {
        self.running.lock().len()
    }

    pub(crate) fn count_where(&self, predicate: impl Fn(TaskKind) -> bool) -> usize {
        self.running.lock().values().filter(|kind| predicate(**kind)).count()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

/// Ends its task when dropped, so early returns and cancellation still settle.
pub(crate) struct TaskGuard {
    tracker: Arc<AsyncTaskTracker>,
    id: TaskId,
}

impl TaskGuard {
    pub(crate) fn new(tracker: &Arc<AsyncTaskTracker>, kind: TaskKind) -> Self {
        Self {
            id: tracker.start(kind),
            tracker: tracker.clone(),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.end(self.id);
    }
}

enum TimerCallback {
    Once(Callback),
    Repeat(RepeatingCallback),
    Frame(FrameCallback),
}

struct Timer {
    task: TaskId,
    period: Option<u64>,
    iterations: u32,
    seq: u64,
    callback: TimerCallback,
}

/// Heap entry. Equal deadlines fire in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    at: u64,
    seq: u64,
    id: TimerId,
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // min-heap
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A timer whose deadline passed, ready to run outside the queue lock.
pub(crate) enum DueTimer {
    Once(Callback),
    Repeat(RepeatingCallback),
    Frame(FrameCallback),
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Deadline>,
    timers: HashMap<TimerId, Timer>,
    next_id: u32,
    next_seq: u64,
}

pub(crate) enum LoopMessage {
    Completed { task: TaskId, run: Callback },
}

pub(crate) struct EventLoop {
    pub(crate) clock: Clock,
    pub(crate) tasks: Arc<AsyncTaskTracker>,
    timers: Mutex<TimerQueue>,
    microtasks: Mutex<VecDeque<Callback>>,
    sender: mpsc::UnboundedSender<LoopMessage>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopMessage>>,
    loads: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    max_interval_iterations: Option<u32>,
}

impl EventLoop {
    pub(crate) fn new(mode: ClockMode, max_interval_iterations: Option<u32>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            clock: Clock::new(mode),
            tasks: Arc::new(AsyncTaskTracker::new()),
            timers: Mutex::new(TimerQueue::default()),
            microtasks: Mutex::new(VecDeque::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            loads: Mutex::new(HashMap::new()),
            max_interval_iterations,
        }
    }

    fn schedule(&self, kind: TaskKind, delay: u64, period: Option<u64>, callback: TimerCallback) -> TimerId {
        let task = self.tasks.start(kind);
        let now = self.clock.now_ms();
        let mut queue = self.timers.lock();
        queue.next_id += 1;
        queue.next_seq += 1;
        let id = TimerId(queue.next_id);
        let seq = queue.next_seq;
        queue.heap.push(Deadline {
            at: now.saturating_add(delay),
            seq,
            id,
        });
        queue.timers.insert(
            id,
            Timer {
                task,
                period,
                iterations: 0,
                seq,
                callback,
            },
        );
        id
    }

    pub(crate) fn set_timeout(&self, callback: Callback, delay: u64) -> TimerId {
        self.schedule(TaskKind::Timer, delay, None, TimerCallback::Once(callback))
    }

    pub(crate) fn set_interval(&self, callback: RepeatingCallback, period: u64) -> TimerId {
        // a zero period would never let the clock move
        let period = period.max(1);
        self.schedule(TaskKind::Interval, period, Some(period), TimerCallback::Repeat(callback))
    }

    pub(crate) fn request_animation_frame(&self, callback: FrameCallback, frame_ms: u64) -> TimerId {
        self.schedule(TaskKind::AnimationFrame, frame_ms, None, TimerCallback::Frame(callback))
    }

    /// Cancels a timer of any kind; `false` if it no longer exists.
    pub(crate) fn clear_timer(&self, id: TimerId) -> bool {
        let removed = self.timers.lock().timers.remove(&id);
        match removed {
            Some(timer) => {
                self.tasks.end(timer.task);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_all_timers(&self) -> usize {
        let timers: Vec<Timer> = {
            let mut queue = self.timers.lock();
            queue.heap.clear();
            queue.timers.drain().map(|(_, timer)| timer).collect()
        };
        for timer in &timers {
            self.tasks.end(timer.task);
        }
        timers.len()
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.lock().timers.len()
    }

    /// Deadline of the next live timer, discarding stale heap entries.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        let mut queue = self.timers.lock();
        loop {
            let top = *queue.heap.peek()?;
            match queue.timers.get(&top.id) {
                Some(timer) if timer.seq == top.seq => return Some(top.at),
                _ => {
                    queue.heap.pop();
                }
            }
        }
    }

    /// Takes the next timer due at or before `now`. Intervals are
    /// rescheduled before their callback runs.
    pub(crate) fn pop_due(&self, now: u64) -> Option<DueTimer> {
        let mut finished = None;
        let due = {
            let mut queue = self.timers.lock();
            loop {
                let top = *queue.heap.peek()?;
                let live = matches!(queue.timers.get(&top.id), Some(timer) if timer.seq == top.seq);
                if !live {
                    queue.heap.pop();
                    continue;
                }
                if top.at > now {
                    return None;
                }
                queue.heap.pop();
                let period = queue.timers.get(&top.id).and_then(|timer| timer.period);
                match period {
                    Some(period) => {
                        queue.next_seq += 1;
                        let seq = queue.next_seq;
                        let limit = self.max_interval_iterations;
                        let timer = queue.timers.get_mut(&top.id)?;
                        timer.iterations += 1;
                        timer.seq = seq;
                        let callback = match &timer.callback {
                            TimerCallback::Repeat(callback) => callback.clone(),
                            _ => continue,
                        };
                        if limit.is_some_and(|limit| timer.iterations >= limit) {
                            finished = queue.timers.remove(&top.id).map(|timer| timer.task);
                        } else {
                            queue.heap.push(Deadline {
                                at: top.at.saturating_add(period),
                                seq,
                                id: top.id,
                            });
                        }
                        break DueTimer::Repeat(callback);
                    }
                    None => {
                        let timer = queue.timers.remove(&top.id)?;
                        finished = Some(timer.task);
                        match timer.callback {
                            TimerCallback::Once(callback) => break DueTimer::Once(callback),
                            TimerCallback::Frame(callback) => break DueTimer::Frame(callback),
                            TimerCallback::Repeat(callback) => break DueTimer::Repeat(callback),
                        }
                    }
                }
            }
        };
        if let Some(task) = finished {
            // settles after the callback had its chance to start new work
            let tracker = self.tasks.clone();
            return Some(match due {
                DueTimer::Once(callback) => DueTimer::Once(Box::new(move || {
                    let result = callback();
                    tracker.end(task);
                    result
                })),
                DueTimer::Frame(callback) => DueTimer::Frame(Box::new(move |now| {
                    let result = callback(now);
                    tracker.end(task);
                    result
                })),
                DueTimer::Repeat(callback) => DueTimer::Once(Box::new(move || {
                    let result = callback();
                    tracker.end(task);
                    result
                })),
            });
        }
        Some(due)
    }

    pub(crate) fn queue_microtask(&self, callback: Callback) {
        self.microtasks.lock().push_back(callback);
    }

    pub(crate) fn pop_microtask(&self) -> Option<Callback> {
        self.microtasks.lock().pop_front()
    }

    pub(crate) fn has_microtasks(&self) -> bool {
        !self.microtasks.lock().is_empty()
    }

    pub(crate) fn clear_microtasks(&self) {
        self.microtasks.lock().clear();
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<LoopMessage> {
        self.sender.clone()
    }

    /// Takes a message if one is ready, without waiting.
    pub(crate) fn try_recv(&self) -> Option<LoopMessage> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    pub(crate) async fn recv(&self) -> Option<LoopMessage> {
        self.receiver.lock().await.recv().await
    }

    pub(crate) fn track_load(&self, task: TaskId, handle: JoinHandle<()>) {
        let mut loads = self.loads.lock();
        loads.retain(|_, handle| !handle.is_finished());
        loads.insert(task, handle);
    }

    pub(crate) fn forget_load(&self, task: TaskId) {
        self.loads.lock().remove(&task);
    }

    /// Aborts every in-flight load and settles their tasks.
    pub(crate) fn abort_loads(&self) -> usize {
        let loads: Vec<(TaskId, JoinHandle<()>)> = self.loads.lock().drain().collect();
        for (task, handle) in &loads {
            handle.abort();
            self.tasks.end(*task);
        }
        // completions already posted must not run either
        while let Some(LoopMessage::Completed { task, .. }) = self.try_recv() {
            self.tasks.end(task);
        }
        loads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|| Ok(()))
    }

    #[test]
    fn equal_deadlines_fire_in_scheduling_order() {
        let event_loop = EventLoop::new(ClockMode::Virtual, None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = order.clone();
            event_loop.set_timeout(
                Box::new(move || {
                    order.lock().push(label);
                    Ok(())
                }),
                10,
            );
        }
        event_loop.clock.advance_to(10);
        while let Some(DueTimer::Once(callback)) = event_loop.pop_due(10) {
            callback().unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(event_loop.tasks.count(), 0);
    }

    #[test]
    fn cleared_timers_settle_their_task() {
        let event_loop = EventLoop::new(ClockMode::Virtual, None);
        let id = event_loop.set_timeout(noop(), 5);
        assert_eq!(event_loop.tasks.count(), 1);
        assert!(event_loop.clear_timer(id));
        assert!(!event_loop.clear_timer(id));
        assert_eq!(event_loop.tasks.count(), 0);
        assert_eq!(event_loop.next_deadline(), None);
    }

    #[test]
    fn intervals_stop_after_the_iteration_limit() {
        let event_loop = EventLoop::new(ClockMode::Virtual, Some(2));
        event_loop.set_interval(Arc::new(|| Ok(())), 10);
        assert_eq!(event_loop.next_deadline(), Some(10));
        assert!(event_loop.pop_due(10).is_some());
        assert_eq!(event_loop.next_deadline(), Some(20));
        match event_loop.pop_due(20) {
            Some(DueTimer::Once(last)) => last().unwrap(),
            _ => panic!("expected the final interval run"),
        }
        assert_eq!(event_loop.next_deadline(), None);
        assert_eq!(event_loop.tasks.count(), 0);
    }

    #[test]
    fn network_kinds_are_distinguished() {
        let tracker = AsyncTaskTracker::new();
        let fetch = tracker.start(TaskKind::Fetch);
        tracker.start(TaskKind::Timer);
        assert_eq!(tracker.count_where(TaskKind::is_network), 1);
        assert!(tracker.end(fetch));
        assert!(!tracker.end(fetch));
        assert_eq!(tracker.count(), 1);
    }
}
