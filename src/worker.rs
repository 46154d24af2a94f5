//! Generic bounded worker pool: a fixed set of threads drains a shared
//! queue through a `handle(item) -> Handled | Retry | Defer(duration)`
//! closure. Used twice: once for RPC dispatch (`eventloop`'s request
//! queue) and once for the timed-event pool draining `event::EventQueue`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// What a single `handle` call decided to do with an item. `Retry` and
/// `Defer` hand the item back since `handle` takes it by value.
pub enum Outcome<T> {
    Handled,
    Retry(T),
    Defer(T, Duration),
}

struct Shared<T> {
    queue: Mutex<VecDeque<(T, Duration)>>,
    condvar: Condvar,
    shutdown: Mutex<bool>,
}

/// A fixed-size pool of threads pulling items from a bounded FIFO queue
/// (deferred items are re-enqueued after their requested delay elapses).
/// Shutdown joins every worker thread.
pub struct WorkerPool<T> {
    shared: Arc<Shared<T>>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `count` threads, each looping on `handle` until `shutdown`
    /// is called. `handle` must not block indefinitely — a `Defer`
    /// outcome is the mechanism for "come back later".
    pub fn spawn<F>(count: usize, handle: F) -> Self
    where
        F: Fn(T) -> Outcome<T> + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: Mutex::new(false),
        });
        let handle = Arc::new(handle);
        let threads = (0..count.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || worker_loop(shared, handle))
            })
            .collect();
        Self { shared, threads }
    }

    pub fn submit(&self, item: T) {
        self.shared.queue.lock().unwrap().push_back((item, Duration::ZERO));
        self.shared.condvar.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Signals every worker to exit once its current item finishes, then
    /// joins all threads.
    pub fn shutdown(mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.condvar.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>, handle: Arc<dyn Fn(T) -> Outcome<T> + Send + Sync>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if *shared.shutdown.lock().unwrap() {
                    return;
                }
                if let Some(pos) = queue.iter().position(|(_, ready_in)| *ready_in == Duration::ZERO) {
                    break queue.remove(pos).unwrap().0;
                }
                let wait = queue.iter().map(|(_, ready_in)| *ready_in).min();
                queue = match wait {
                    Some(wait) => shared.condvar.wait_timeout(queue, wait).unwrap().0,
                    None => shared.condvar.wait(queue).unwrap(),
                };
                tick_deferred(&mut queue, Duration::from_millis(20));
            }
        };
        match handle(item) {
            Outcome::Handled => {}
            Outcome::Retry(item) => {
                let mut queue = shared.queue.lock().unwrap();
                queue.push_back((item, Duration::ZERO));
                shared.condvar.notify_one();
            }
            Outcome::Defer(item, delay) => {
                let mut queue = shared.queue.lock().unwrap();
                queue.push_back((item, delay));
                shared.condvar.notify_one();
            }
        }
    }
}

/// Ages every deferred item's remaining delay down by `elapsed`, clamping
/// at zero so it becomes immediately eligible.
fn tick_deferred<T>(queue: &mut VecDeque<(T, Duration)>, elapsed: Duration) {
    for (_, ready_in) in queue.iter_mut() {
        *ready_in = ready_in.saturating_sub(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn processes_submitted_items() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let pool: WorkerPool<u32> = WorkerPool::spawn(2, move |_item: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Handled
        });
        for i in 0..10 {
            pool.submit(i);
        }
        std::thread::sleep(Duration::from_millis(100));
        pool.shutdown();
        assert_eq!(processed.load(Ordering::SeqCst), 10);
    }
}
