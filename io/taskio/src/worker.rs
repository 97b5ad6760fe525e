use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, trace};

use crate::config::Config;
use crate::task::{Task, TaskCore};

pub(crate) enum WorkItem {
    Run(Arc<TaskCore>),
    Shutdown,
}

pub(crate) struct PoolShared {
    ready_tx: Sender<WorkItem>,
}

impl PoolShared {
    pub(crate) fn enqueue(&self, core: Arc<TaskCore>) {
        // Fails only after shutdown; queued work is dropped then.
        if self.ready_tx.send(WorkItem::Run(core)).is_err() {
            trace!("event enqueued after dispatcher shutdown, dropped");
        }
    }
}

/// A fixed pool of worker threads executing task event queues.
pub struct Dispatcher {
    shared: Arc<PoolShared>,
    handles: Vec<thread::JoinHandle<()>>,
    workers: usize,
}

impl Dispatcher {
    /// Spawn the worker pool.
    pub fn new(config: Config) -> Self {
        let workers = if config.workers == 0 {
            num_cpus()
        } else {
            config.workers
        };
        let quantum = config.quantum.max(1);

        let (tx, rx) = unbounded::<WorkItem>();
        let shared = Arc::new(PoolShared {
            ready_tx: tx.clone(),
        });

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("taskio-worker-{id}"))
                .spawn(move || worker_loop(rx, tx, quantum))
                .expect("spawn worker thread");
            handles.push(handle);
        }

        debug!(workers, quantum, "dispatcher started");
        Dispatcher {
            shared,
            handles,
            workers,
        }
    }

    /// Create a new task executed by this pool.
    pub fn task(&self) -> Task {
        Task::new(self.shared.clone())
    }

    /// Stop all workers and join them. Tasks already on the ready queue keep
    /// draining until each worker sees the shutdown item.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for _ in 0..self.workers {
            let _ = self.shared.ready_tx.send(WorkItem::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn worker_loop(rx: Receiver<WorkItem>, tx: Sender<WorkItem>, quantum: usize) {
    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Run(core) => {
                if core.run(quantum) {
                    // Quantum exhausted with work left; rotate to the back.
                    let _ = tx.send(WorkItem::Run(core));
                }
            }
            WorkItem::Shutdown => break,
        }
    }
}

/// Number of online CPUs.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Direction, Event, Notify};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_fifo_order_single_task() {
        let dispatcher = Dispatcher::new(Config {
            workers: 4,
            quantum: 2,
        });
        let task = dispatcher.task();
        let (tx, rx) = unbounded();

        for i in 0..100u32 {
            let tx = tx.clone();
            task.send(Event::call(move || {
                tx.send(i).unwrap();
            }));
        }

        let got: Vec<u32> = rx.iter().take(100).collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        dispatcher.shutdown();
    }

    #[test]
    fn test_serial_execution_per_task() {
        let dispatcher = Dispatcher::new(Config {
            workers: 4,
            quantum: 1,
        });
        let task = dispatcher.task();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();

        for _ in 0..50 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            let tx = tx.clone();
            task.send(Event::call(move || {
                let n = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }

        for _ in 0..50 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn test_tasks_run_concurrently() {
        let dispatcher = Dispatcher::new(Config {
            workers: 2,
            quantum: 32,
        });
        let task_a = dispatcher.task();
        let task_b = dispatcher.task();
        let (tx_a, rx_a) = unbounded::<()>();
        let (tx_b, rx_b) = unbounded::<()>();

        // Task A blocks until task B has run; deadlocks unless the two tasks
        // are served by different workers.
        task_a.send(Event::call(move || {
            rx_b.recv_timeout(Duration::from_secs(10)).unwrap();
            tx_a.send(()).unwrap();
        }));
        task_b.send(Event::call(move || {
            tx_b.send(()).unwrap();
        }));

        rx_a.recv_timeout(Duration::from_secs(10)).unwrap();
        dispatcher.shutdown();
    }

    struct Recorder {
        seen: Mutex<Vec<Direction>>,
        tx: Sender<()>,
    }

    impl Notify for Recorder {
        fn ready(self: Arc<Self>, dir: Direction) {
            self.seen.lock().push(dir);
            self.tx.send(()).unwrap();
        }
    }

    #[test]
    fn test_ready_notification() {
        let dispatcher = Dispatcher::new(Config {
            workers: 1,
            quantum: 32,
        });
        let task = dispatcher.task();
        let (tx, rx) = unbounded();
        let target = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            tx,
        });

        task.send(Event::ready(target.clone(), Direction::Read));
        task.send(Event::ready(target.clone(), Direction::Write));

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(*target.seen.lock(), vec![Direction::Read, Direction::Write]);
        dispatcher.shutdown();
    }

    #[test]
    fn test_task_equality_is_identity() {
        let dispatcher = Dispatcher::new(Config {
            workers: 1,
            quantum: 32,
        });
        let a = dispatcher.task();
        let b = dispatcher.task();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let dispatcher = Dispatcher::new(Config {
            workers: 3,
            quantum: 32,
        });
        let task = dispatcher.task();
        let (tx, rx) = unbounded();
        for _ in 0..10 {
            let tx = tx.clone();
            task.send(Event::call(move || {
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        dispatcher.shutdown();
    }
}
