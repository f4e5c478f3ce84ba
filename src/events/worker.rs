//! Worker-thread bridge.
//!
//! Turns blocking work (shader compilation, file loading) into asynchronous
//! completion messages. Work items execute sequentially on a single worker
//! thread; results appear on the bus in submission order. The worker joins on
//! drop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use fxhash::FxHashSet;
use parking_lot::Mutex;

use super::bus::panic_message;
use super::{EventMessage, MessageBus, SenderId};

/// Result messages published by the bridge. `from_failure` builds the
/// message variant carrying the error when the work function fails or
/// panics.
pub trait WorkerResultMessage: EventMessage + Sized + 'static {
    fn from_failure(work_id: u64, sender: SenderId, error: String) -> Self;
    fn work_id(&self) -> u64;
}

struct WorkItem<R> {
    work_id: u64,
    sender: SenderId,
    work: Box<dyn FnOnce() -> Result<R, String> + Send>,
}

/// Bridge between a background worker thread and the main thread via the
/// message bus.
pub struct WorkerBridge<R: WorkerResultMessage> {
    tx: Option<Sender<WorkItem<R>>>,
    worker: Option<JoinHandle<()>>,
    next_work_id: AtomicU64,
    cancelled: Arc<Mutex<FxHashSet<u64>>>,
}

impl<R: WorkerResultMessage> WorkerBridge<R> {
    pub fn new(bus: Arc<MessageBus>) -> WorkerBridge<R> {
        let (tx, rx) = unbounded::<WorkItem<R>>();
        let cancelled = Arc::new(Mutex::new(FxHashSet::default()));
        let cancelled_worker = Arc::clone(&cancelled);

        let worker = std::thread::Builder::new()
            .name("worker-bridge".into())
            .spawn(move || {
                // Iteration ends when the sender side disconnects on drop.
                for item in rx.iter() {
                    if cancelled_worker.lock().remove(&item.work_id) {
                        continue;
                    }

                    let WorkItem {
                        work_id,
                        sender,
                        work,
                    } = item;
                    let outcome = catch_unwind(AssertUnwindSafe(work));
                    let message = match outcome {
                        Ok(Ok(result)) => result,
                        Ok(Err(error)) => R::from_failure(work_id, sender, error),
                        Err(payload) => R::from_failure(
                            work_id,
                            sender,
                            format!("worker panicked: {}", panic_message(&payload)),
                        ),
                    };
                    bus.publish(message);
                }
            })
            .expect("failed to spawn worker thread");

        WorkerBridge {
            tx: Some(tx),
            worker: Some(worker),
            next_work_id: AtomicU64::new(1),
            cancelled,
        }
    }

    /// Submit work to the worker thread. Non-blocking; returns a work id for
    /// tracking and cancellation.
    pub fn submit_work(
        &self,
        sender: SenderId,
        work: impl FnOnce() -> Result<R, String> + Send + 'static,
    ) -> u64 {
        let work_id = self.next_work_id.fetch_add(1, Ordering::Relaxed);
        let item = WorkItem {
            work_id,
            sender,
            work: Box::new(work),
        };
        if let Some(tx) = &self.tx {
            // Send only fails when the worker is gone, which only happens
            // during teardown.
            let _ = tx.send(item);
        }
        work_id
    }

    /// Cooperative cancellation, observed by the worker between items only.
    pub fn cancel(&self, work_id: u64) {
        self.cancelled.lock().insert(work_id);
    }

    pub fn queued_count(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }
}

impl<R: WorkerResultMessage> Drop for WorkerBridge<R> {
    fn drop(&mut self) {
        // Disconnect the channel so the worker's iterator ends, then join.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{core_types, EventCategory, MessageType};
    use std::sync::atomic::AtomicUsize;

    struct TestResult {
        sender: SenderId,
        work_id: u64,
        value: u32,
        success: bool,
        error: String,
    }

    impl EventMessage for TestResult {
        fn message_type(&self) -> MessageType {
            core_types::WORKER_RESULT
        }
        fn categories(&self) -> EventCategory {
            EventCategory::APPLICATION_STATE
        }
        fn sender(&self) -> SenderId {
            self.sender
        }
    }

    impl WorkerResultMessage for TestResult {
        fn from_failure(work_id: u64, sender: SenderId, error: String) -> Self {
            TestResult {
                sender,
                work_id,
                value: 0,
                success: false,
                error,
            }
        }
        fn work_id(&self) -> u64 {
            self.work_id
        }
    }

    fn drain_until(bus: &MessageBus, count: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            bus.process_messages();
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("worker results never arrived");
    }

    #[test]
    fn results_arrive_in_submission_order() {
        let bus = Arc::new(MessageBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let count2 = Arc::clone(&count);
        bus.subscribe(core_types::WORKER_RESULT, move |msg| {
            let result = msg.downcast_ref::<TestResult>().unwrap();
            seen2.lock().push(result.value);
            count2.fetch_add(1, Ordering::SeqCst);
            true
        });

        let bridge: WorkerBridge<TestResult> = WorkerBridge::new(Arc::clone(&bus));
        for value in 1..=4u32 {
            let id = bridge.submit_work(7, move || {
                Ok(TestResult {
                    sender: 7,
                    work_id: 0,
                    value,
                    success: true,
                    error: String::new(),
                })
            });
            assert!(id > 0);
        }

        drain_until(&bus, &count, 4);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn panicking_work_publishes_failure() {
        let bus = Arc::new(MessageBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let count2 = Arc::clone(&count);
        let failures2 = Arc::clone(&failures);
        bus.subscribe(core_types::WORKER_RESULT, move |msg| {
            let result = msg.downcast_ref::<TestResult>().unwrap();
            if !result.success {
                failures2.lock().push(result.error.clone());
            }
            count2.fetch_add(1, Ordering::SeqCst);
            true
        });

        let bridge: WorkerBridge<TestResult> = WorkerBridge::new(Arc::clone(&bus));
        bridge.submit_work(1, || -> Result<TestResult, String> { panic!("exploded") });
        bridge.submit_work(1, || Err(String::from("soft failure")));

        drain_until(&bus, &count, 2);
        let failures = failures.lock();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("exploded"));
        assert_eq!(failures[1], "soft failure");
    }

    #[test]
    fn shutdown_on_drop_joins_worker() {
        let bus = Arc::new(MessageBus::new());
        let bridge: WorkerBridge<TestResult> = WorkerBridge::new(Arc::clone(&bus));
        bridge.submit_work(1, || {
            Ok(TestResult {
                sender: 1,
                work_id: 0,
                value: 1,
                success: true,
                error: String::new(),
            })
        });
        drop(bridge);
        // Queue drained before join; the result may or may not have been
        // published depending on timing, but the drop must not hang.
    }
}
