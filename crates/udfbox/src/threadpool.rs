//! Fixed-size closure scheduler.
//!
//! Two instances back the service: one runs response watchers (each job
//! blocks for up to one invocation's lifetime, so the pool size bounds
//! in-flight invocations) and one delivers caller callbacks, which must
//! never run under an internal lock.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub(crate) struct ThreadPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> Self {
        assert!(size > 0, "thread pool needs at least one thread");
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..size)
            .map(|i| {
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(&rx))
                    .expect("spawn pool thread")
            })
            .collect();
        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    /// Queue a job. Jobs submitted after shutdown are dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let tx = self.tx.lock().expect("pool sender lock");
        match tx.as_ref() {
            Some(tx) if tx.send(Box::new(job)).is_ok() => {}
            _ => tracing::warn!("thread pool is shut down, dropping job"),
        }
    }

    /// Drain queued jobs and join every thread. Idempotent.
    pub fn shutdown(&self) {
        drop(self.tx.lock().expect("pool sender lock").take());
        let handles: Vec<_> = self.handles.lock().expect("pool handle lock").drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("thread pool worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new("test", 4);
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = ThreadPool::new("test", 1);
        pool.execute(|| std::thread::sleep(Duration::from_millis(10)));
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn jobs_after_shutdown_are_dropped() {
        let pool = ThreadPool::new("test", 1);
        pool.shutdown();
        pool.execute(|| panic!("must not run"));
    }
}
