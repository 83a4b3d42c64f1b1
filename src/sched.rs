//! Cooperative work queue for deferred byte processing.
//!
//! Both protocol engines defer everything that touches their state to units of
//! work executed by a single driver task, so engine state is only ever mutated
//! from one context at a time. A unit is one-shot: scheduling it while it is
//! already queued is a no-op, and its handler may re-arm it to continue a
//! longer job (draining a pipe, pumping a transmit ring).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

type Handler = Box<dyn FnMut() + Send>;

enum Op {
    Register(u64, Handler),
    Schedule(u64, Option<Duration>),
    Cancel(u64),
    CancelSync(u64, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a registered unit of work.
///
/// Cloneable; all clones refer to the same unit. Dropping the handles does not
/// unregister the unit; cancel it first if it must not run again.
#[derive(Clone)]
pub struct Work {
    id: u64,
    tx: mpsc::UnboundedSender<Op>,
}

impl Work {
    /// Queue the unit for immediate execution. No-op if already queued.
    pub fn schedule_now(&self) {
        let _ = self.tx.send(Op::Schedule(self.id, None));
    }

    /// Queue the unit to run after `delay`. No-op if already queued.
    pub fn schedule_after(&self, delay: Duration) {
        let _ = self.tx.send(Op::Schedule(self.id, Some(delay)));
    }

    /// Unqueue the unit if it is pending. The unit stays registered and can be
    /// scheduled again.
    pub fn cancel(&self) {
        let _ = self.tx.send(Op::Cancel(self.id));
    }

    /// Unqueue the unit and wait for the driver to acknowledge, so that no
    /// execution of this unit is in flight once this returns.
    pub async fn cancel_sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Op::CancelSync(self.id, done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Entry {
    handler: Handler,
    due: Option<Instant>,
}

/// Driver for a set of one-shot work units, executed strictly one at a time.
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Op>,
    next_id: Mutex<u64>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawn the driver task on the ambient tokio runtime.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(Self::drive(rx));

        Arc::new(Self {
            tx,
            next_id: Mutex::new(0),
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Register a handler and return the handle used to schedule it.
    pub fn register<F>(&self, handler: F) -> Work
    where
        F: FnMut() + Send + 'static,
    {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };

        let _ = self.tx.send(Op::Register(id, Box::new(handler)));

        Work {
            id,
            tx: self.tx.clone(),
        }
    }

    /// Stop the driver. Pending units are discarded without running.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();

        if self.tx.send(Op::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }
    }

    async fn drive(mut rx: mpsc::UnboundedReceiver<Op>) {
        let mut entries: HashMap<u64, Entry> = HashMap::new();

        loop {
            let next_due = entries.values().filter_map(|entry| entry.due).min();

            let op = match next_due {
                Some(deadline) => {
                    tokio::select! {
                        op = rx.recv() => op,
                        _ = tokio::time::sleep_until(deadline) => {
                            Self::run_due(&mut entries);
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };

            match op {
                Some(Op::Register(id, handler)) => {
                    entries.insert(id, Entry { handler, due: None });
                }
                Some(Op::Schedule(id, delay)) => {
                    if let Some(entry) = entries.get_mut(&id) {
                        // One-shot semantics: an already-queued unit keeps its
                        // original deadline.
                        if entry.due.is_none() {
                            let delay = delay.unwrap_or(Duration::ZERO);
                            entry.due = Some(Instant::now() + delay);
                        }
                    }
                }
                Some(Op::Cancel(id)) => {
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.due = None;
                    }
                }
                Some(Op::CancelSync(id, done)) => {
                    // Handlers run inline in this loop, so receiving this
                    // command means no execution of the unit is in flight.
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.due = None;
                    }
                    let _ = done.send(());
                }
                Some(Op::Shutdown(done)) => {
                    debug!("work queue shutting down, {} units registered", entries.len());
                    let _ = done.send(());
                    return;
                }
                None => return,
            }
        }
    }

    fn run_due(entries: &mut HashMap<u64, Entry>) {
        let now = Instant::now();

        let due_ids: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| entry.due.is_some_and(|due| due <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in due_ids {
            // Disarm before running so the handler can re-schedule itself.
            if let Some(entry) = entries.get_mut(&id) {
                entry.due = None;
            }

            // The entry map cannot be borrowed across the handler call since
            // the handler may register or schedule other units through the
            // channel; take the handler out and put it back.
            if let Some(mut entry) = entries.remove(&id) {
                (entry.handler)();
                entries.insert(id, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_schedule_now_runs_once() {
        let queue = WorkQueue::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        let work = queue.register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        work.schedule_now();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);

        work.schedule_now();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_waits_for_deadline() {
        let queue = WorkQueue::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        let work = queue.register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        work.schedule_after(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent_while_queued() {
        let queue = WorkQueue::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        let work = queue.register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        work.schedule_after(Duration::from_secs(2));
        work.schedule_after(Duration::from_secs(2));
        work.schedule_now();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sync_unqueues() {
        let queue = WorkQueue::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        let work = queue.register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        work.schedule_after(Duration::from_secs(1));
        work.cancel_sync().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_can_rearm_itself() {
        let queue = WorkQueue::new();
        let hits = Arc::new(AtomicU32::new(0));

        let counted = hits.clone();
        let rearm: Arc<Mutex<Option<Work>>> = Arc::new(Mutex::new(None));
        let rearm_in_handler = rearm.clone();

        let work = queue.register(move || {
            let count = counted.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 3 {
                if let Some(work) = rearm_in_handler.lock().unwrap().as_ref() {
                    work.schedule_now();
                }
            }
        });

        *rearm.lock().unwrap() = Some(work.clone());

        work.schedule_now();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);

        queue.shutdown().await;
    }
}
