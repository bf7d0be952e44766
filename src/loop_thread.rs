//! Dedicated IO threads (spec §4.5): each [`LoopThread`] owns exactly one
//! [`EventLoop`] constructed on the thread it spawns, and [`LoopThreadPool`]
//! round-robins accepted connections across a fixed pool of them.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::event_loop::{EventLoop, EventLoopHandle};

/// A callback run once per spawned loop thread, immediately after its
/// `EventLoop` is constructed and before the loop starts running.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoopHandle) + Send + Sync>;

/// Owns one OS thread running exactly one `EventLoop`. The loop is
/// constructed on the spawned thread (not the caller's), and its handle is
/// published back via a channel rendezvous.
pub struct LoopThread {
    handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawns the thread, blocks until the new loop announces itself, and
    /// returns a handle to it. `init` runs on the new thread before it
    /// starts looping, mirroring muduo's `EventLoopThread` callback.
    pub fn start(init: Option<ThreadInitCallback>) -> LoopThread {
        let (tx, rx) = mpsc::channel();

        let join = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            let handle = event_loop.handle();
            if let Some(init) = init {
                init(&handle);
            }
            tx.send(handle)
                .expect("LoopThread caller dropped its receiver before the loop started");
            event_loop.run();
        });

        let handle = rx
            .recv()
            .expect("loop thread exited before publishing its EventLoop handle");

        LoopThread {
            handle,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A fixed pool of sub-reactor threads that a `TcpServer` hands accepted
/// connections to in round-robin order (spec §4.5, §4.9).
pub struct LoopThreadPool {
    base_loop: EventLoopHandle,
    threads: Vec<LoopThread>,
    next: std::sync::atomic::AtomicUsize,
}

impl LoopThreadPool {
    pub fn new(base_loop: EventLoopHandle) -> LoopThreadPool {
        LoopThreadPool {
            base_loop,
            threads: Vec::new(),
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Spawns `num_threads` sub-loops, each running `init` (if given) right
    /// after construction. `num_threads == 0` means the base loop itself
    /// handles every connection (spec §4.9 default, no sub-reactors) — in
    /// that case `init`, if given, runs once against the base loop instead.
    pub fn start(&mut self, num_threads: usize, init: Option<ThreadInitCallback>) {
        assert!(self.threads.is_empty(), "LoopThreadPool::start called twice");
        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
            return;
        }
        for _ in 0..num_threads {
            self.threads.push(LoopThread::start(init.clone()));
        }
    }

    /// The next loop to hand a new connection to: round-robins across the
    /// pool, or returns the base loop if the pool has no sub-threads.
    pub fn get_next_loop(&self) -> EventLoopHandle {
        if self.threads.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst) % self.threads.len();
        self.threads[i].handle()
    }

    pub fn get_all_loops(&self) -> Vec<EventLoopHandle> {
        if self.threads.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.threads.iter().map(LoopThread::handle).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_drop_joins_cleanly() {
        let thread = LoopThread::start(None);
        assert!(!thread.handle().is_in_loop_thread());
    }

    #[test]
    fn pool_round_robins_across_threads() {
        let base = EventLoop::new();
        let mut pool = LoopThreadPool::new(base.handle());
        pool.start(3, None);
        let handles = pool.get_all_loops();
        assert_eq!(handles.len(), 3);

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();
        let fourth = pool.get_next_loop();
        assert!(!first.same_loop(&second));
        assert!(!second.same_loop(&third));
        // Four picks over a 3-thread pool: the 4th must wrap back to the 1st.
        assert!(fourth.same_loop(&first));
    }

    #[test]
    fn empty_pool_returns_base_loop() {
        let base = EventLoop::new();
        let pool = LoopThreadPool::new(base.handle());
        let picked = pool.get_next_loop();
        assert!(picked.is_in_loop_thread());
    }

    #[test]
    fn zero_threads_runs_init_against_base_loop() {
        let base = EventLoop::new();
        let mut pool = LoopThreadPool::new(base.handle());
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let base_handle = base.handle();
        let init: ThreadInitCallback = Arc::new(move |handle: &EventLoopHandle| {
            assert!(handle.same_loop(&base_handle));
            ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        pool.start(0, Some(init));
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
