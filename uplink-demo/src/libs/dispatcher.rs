//! Single-threaded cooperative event dispatcher:
//! - Timer tasks registered with [`Dispatcher::schedule_after`] run no earlier than their delay.
//! - Events posted through an [`EventPoster`] run in arrival order.
//! - One task runs to completion before the next one starts.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use log::debug;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{self, Instant},
};

/// Handle of a scheduled task.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Receives tasks from [`Dispatcher::run_forever`].
pub trait Handler<T> {
    /// Executes one task. The handler may schedule or cancel tasks and stop the dispatcher.
    fn handle(&mut self, task: T, dispatcher: &mut Dispatcher<T>);
}

pub struct Dispatcher<T> {
    /// Pending tasks ordered by (due time, registration sequence).
    queue: BTreeMap<(Instant, u64), T>,
    /// Due time of every pending task, keyed by its sequence.
    deadlines: HashMap<u64, Instant>,
    next_seq: u64,
    events_tx: UnboundedSender<T>,
    events_rx: UnboundedReceiver<T>,
    stopped: bool,
}

/// Cloneable sender for posting events into a [`Dispatcher`] from other tasks.
pub struct EventPoster<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for EventPoster<T> {
    fn clone(&self) -> Self {
        EventPoster {
            tx: self.tx.clone(),
        }
    }
}

impl<T> EventPoster<T> {
    /// Posts an event. Returns `false` if the dispatcher has been dropped.
    pub fn post<E: Into<T>>(&self, event: E) -> bool {
        self.tx.send(event.into()).is_ok()
    }
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Dispatcher {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_seq: 0,
            events_tx,
            events_rx,
            stopped: false,
        }
    }

    /// Registers `task` to run after `delay` has elapsed.
    pub fn schedule_after(&mut self, delay: Duration, task: T) -> TaskId {
        self.push(Instant::now() + delay, task)
    }

    /// Removes a pending task. Returns `false` if the task already ran or was cancelled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.deadlines.remove(&id.0) {
            None => false,
            Some(due) => self.queue.remove(&(due, id.0)).is_some(),
        }
    }

    /// Returns an event poster bound to this dispatcher.
    pub fn poster(&self) -> EventPoster<T> {
        EventPoster {
            tx: self.events_tx.clone(),
        }
    }

    /// Makes [`Dispatcher::run_forever`] return after the current task completes.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of pending timer tasks. Posted events not yet received are not counted.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.deadlines.contains_key(&id.0)
    }

    /// Remaining time until the task is due, or `None` if it is not pending.
    pub fn due_in(&self, id: TaskId) -> Option<Duration> {
        self.deadlines
            .get(&id.0)
            .map(|due| due.saturating_duration_since(Instant::now()))
    }

    /// Executes due tasks until [`Dispatcher::stop`] is called from a handler.
    pub async fn run_forever<H: Handler<T>>(&mut self, handler: &mut H) {
        const FN_NAME: &'static str = "Dispatcher::run_forever";

        self.stopped = false;
        while !self.stopped {
            let task = self.next_task().await;
            // Let other tasks on the same runtime progress between zero-delay chains.
            tokio::task::yield_now().await;
            handler.handle(task, self);
        }
        debug!("[{}] dispatch stopped", FN_NAME);
    }

    fn push(&mut self, due: Instant, task: T) -> TaskId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((due, seq), task);
        self.deadlines.insert(seq, due);
        TaskId(seq)
    }

    /// Waits for the next due task, moving posted events into the queue as they arrive.
    async fn next_task(&mut self) -> T {
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.push(Instant::now(), event);
            }

            let first = self.queue.first_key_value().map(|(key, _)| *key);
            let next_due = match first {
                None => None,
                Some((due, seq)) => {
                    if due <= Instant::now() {
                        self.deadlines.remove(&seq);
                        if let Some(task) = self.queue.remove(&(due, seq)) {
                            return task;
                        }
                        continue;
                    }
                    Some(due)
                }
            };

            // The dispatcher keeps its own sender alive, so `recv()` never yields `None`.
            let posted = match next_due {
                None => self.events_rx.recv().await,
                Some(due) => tokio::select! {
                    _ = time::sleep_until(due) => None,
                    event = self.events_rx.recv() => event,
                },
            };
            if let Some(event) = posted {
                self.push(Instant::now(), event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    struct Recorder {
        runs: Vec<(u32, Duration)>,
        start: Instant,
        stop_after: usize,
    }

    impl Handler<u32> for Recorder {
        fn handle(&mut self, task: u32, dispatcher: &mut Dispatcher<u32>) {
            self.runs.push((task, Instant::now() - self.start));
            if task == 100 {
                dispatcher.schedule_after(Duration::from_millis(5), 101);
            }
            if self.runs.len() >= self.stop_after {
                dispatcher.stop();
            }
        }
    }

    fn recorder(stop_after: usize) -> Recorder {
        Recorder {
            runs: vec![],
            start: Instant::now(),
            stop_after,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_in_due_order_and_not_early() {
        let mut dispatcher = Dispatcher::new();
        let mut handler = recorder(3);
        dispatcher.schedule_after(Duration::from_millis(30), 3);
        dispatcher.schedule_after(Duration::from_millis(10), 1);
        dispatcher.schedule_after(Duration::from_millis(20), 2);

        dispatcher.run_forever(&mut handler).await;

        assert_eq!(handler.runs.len(), 3);
        for (i, (task, elapsed)) in handler.runs.iter().enumerate() {
            assert_eq!(*task, i as u32 + 1);
            assert!(*elapsed >= Duration::from_millis(10 * (i as u64 + 1)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn equal_due_times_keep_registration_order() {
        let mut dispatcher = Dispatcher::new();
        let mut handler = recorder(3);
        dispatcher.schedule_after(Duration::ZERO, 7);
        dispatcher.schedule_after(Duration::ZERO, 8);
        dispatcher.schedule_after(Duration::ZERO, 9);

        dispatcher.run_forever(&mut handler).await;

        let order: Vec<u32> = handler.runs.iter().map(|r| r.0).collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_runs() {
        let mut dispatcher = Dispatcher::new();
        let mut handler = recorder(1);
        let id = dispatcher.schedule_after(Duration::from_millis(10), 1);
        dispatcher.schedule_after(Duration::from_millis(20), 2);
        assert!(dispatcher.is_pending(id));
        assert!(dispatcher.cancel(id));
        assert!(!dispatcher.cancel(id));
        assert_eq!(dispatcher.pending(), 1);

        dispatcher.run_forever(&mut handler).await;

        assert_eq!(handler.runs[0].0, 2);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_can_schedule_follow_up_and_stop() {
        let mut dispatcher = Dispatcher::new();
        let mut handler = recorder(2);
        dispatcher.schedule_after(Duration::ZERO, 100);
        dispatcher.schedule_after(Duration::from_secs(60), 200);

        dispatcher.run_forever(&mut handler).await;

        let order: Vec<u32> = handler.runs.iter().map(|r| r.0).collect();
        assert_eq!(order, vec![100, 101]);
        assert!(dispatcher.is_stopped());
        assert_eq!(dispatcher.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn posted_events_run_in_arrival_order() {
        let mut dispatcher = Dispatcher::new();
        let mut handler = recorder(3);
        let poster = dispatcher.poster();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(5)).await;
            poster.post(1u32);
            poster.post(2u32);
        });
        dispatcher.schedule_after(Duration::from_millis(50), 3);

        dispatcher.run_forever(&mut handler).await;

        let order: Vec<u32> = handler.runs.iter().map(|r| r.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(handler.runs[0].1 >= Duration::from_millis(5));
    }

    struct Rearm {
        runs: usize,
        worker_ran: Arc<AtomicBool>,
    }

    impl Handler<u32> for Rearm {
        fn handle(&mut self, _task: u32, dispatcher: &mut Dispatcher<u32>) {
            self.runs += 1;
            if self.worker_ran.load(Ordering::SeqCst) || self.runs >= 1000 {
                dispatcher.stop();
                return;
            }
            dispatcher.schedule_after(Duration::ZERO, 0);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_delay_chain_lets_spawned_tasks_run() {
        let mut dispatcher = Dispatcher::new();
        let worker_ran = Arc::new(AtomicBool::new(false));
        let flag = worker_ran.clone();
        tokio::spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });
        let mut handler = Rearm {
            runs: 0,
            worker_ran: worker_ran.clone(),
        };
        dispatcher.schedule_after(Duration::ZERO, 0);

        dispatcher.run_forever(&mut handler).await;

        assert!(worker_ran.load(Ordering::SeqCst));
        assert!(handler.runs < 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn due_in_reports_remaining_delay() {
        let mut dispatcher = Dispatcher::<u32>::new();
        let id = dispatcher.schedule_after(Duration::from_millis(3000), 1);
        assert_eq!(dispatcher.due_in(id), Some(Duration::from_millis(3000)));
        time::advance(Duration::from_millis(1000)).await;
        assert_eq!(dispatcher.due_in(id), Some(Duration::from_millis(2000)));
        dispatcher.cancel(id);
        assert_eq!(dispatcher.due_in(id), None);
    }
}
