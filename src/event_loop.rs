//! The event loop: owns a notifier, dispatches ready channels, runs pending
//! tasks, and supports cross-thread wakeup (spec §4.4).

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crate::channel::{Channel, Membership};
use crate::current_thread;
use crate::interest::Interest;
use crate::notifier::Notifier;

/// The fixed poll timeout: bounds how long `quit()` from another thread can
/// take to be observed, without needing a dedicated wakeup for the common
/// case (spec §4.4, §5).
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    owner_thread: ThreadId,
    notifier: Notifier,
    running: AtomicBool,
    quit: AtomicBool,
    pending: Mutex<VecDeque<Task>>,
    calling_pending: AtomicBool,
    waker_fd: OwnedFd,
    waker_channel: Mutex<Option<Arc<Mutex<Channel>>>>,
}

/// A cloneable, `Send + Sync` handle to an [`EventLoop`]. Channels, the
/// acceptor, the connector, and TCP connections all hold one of these so
/// they can post work back onto the loop's thread from anywhere.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

/// Owns the notifier and drives the reactor loop on the thread that calls
/// [`EventLoop::run`]. Spec §3 invariant: exactly one `EventLoop` per OS
/// thread, constructed and destroyed on that same thread.
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Constructs a loop bound to the calling thread. Fatal per spec §7 if
    /// the notifier or the wake descriptor cannot be created.
    pub fn new() -> EventLoop {
        let notifier = Notifier::new().unwrap_or_else(|e| {
            log_fatal(&format!("failed to create readiness notifier: {e}"));
            unreachable!()
        });
        let waker_fd = create_eventfd().unwrap_or_else(|e| {
            log_fatal(&format!("failed to create wakeup eventfd: {e}"));
            unreachable!()
        });

        let shared = Arc::new(Shared {
            owner_thread: current_thread::id(),
            notifier,
            running: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            calling_pending: AtomicBool::new(false),
            waker_fd,
            waker_channel: Mutex::new(None),
        });

        let handle = EventLoopHandle {
            shared: Arc::clone(&shared),
        };
        let waker_raw = shared.waker_fd.as_raw_fd();
        let channel = Channel::new_shared(handle, waker_raw);
        {
            let mut guard = channel.lock().unwrap();
            guard.set_read_callback(move |_ts| {
                drain_waker(waker_raw);
            });
        }
        channel.lock().unwrap().enable_reading();
        *shared.waker_channel.lock().unwrap() = Some(channel);

        log_debug(&format!("EventLoop created on thread {:?}", shared.owner_thread));
        EventLoop { shared }
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        current_thread::is(self.shared.owner_thread)
    }

    /// Runs until [`EventLoopHandle::quit`] is observed. Each iteration:
    /// clear the active-channel scratch list, poll with a 10s timeout,
    /// dispatch ready channels in notifier order, then drain pending tasks.
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run called from a thread other than its owner"
        );
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.quit.store(false, Ordering::SeqCst);
        log_info("EventLoop start looping");

        while !self.shared.quit.load(Ordering::SeqCst) {
            match self.shared.notifier.poll(Some(POLL_TIMEOUT)) {
                Ok((timestamp, ready)) => {
                    for channel in ready {
                        channel.lock().unwrap().handle_event(timestamp);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => log_error(&format!("notifier poll error: {e}")),
            }
            self.do_pending_functors();
        }

        self.shared.running.store(false, Ordering::SeqCst);
        log_info("EventLoop stop looping");
    }

    fn do_pending_functors(&self) {
        self.shared.calling_pending.store(true, Ordering::SeqCst);
        let tasks: VecDeque<Task> = {
            let mut guard = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::SeqCst);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(channel) = self.shared.waker_channel.lock().unwrap().take() {
            channel.lock().unwrap().disable_all();
            channel.lock().unwrap().remove();
        }
    }
}

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        current_thread::is(self.shared.owner_thread)
    }

    /// Whether `self` and `other` refer to the same underlying loop.
    pub fn same_loop(&self, other: &EventLoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// "Execute on the loop's thread, possibly now, possibly after a
    /// wakeup." Runs `f` synchronously if called from the loop's own
    /// thread; otherwise defers via `queue_in_loop`.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always defers: pushes `f` onto the pending queue, then wakes the
    /// loop unless we're already on its thread and it isn't mid-drain (spec
    /// §4.4, §9 open question — this resolves it as specified: the
    /// same-thread/non-draining case skips the wakeup to avoid a wasted
    /// self-write, while a task enqueuing more tasks during its own drain
    /// still triggers a wakeup so the next iteration's poll doesn't stall).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push_back(Box::new(f));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        let ret = unsafe {
            libc::write(
                self.shared.waker_fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                8,
            )
        };
        if ret != 8 {
            log_error(&format!("EventLoop::wakeup wrote {ret} bytes instead of 8"));
        }
    }

    /// Sets the quit flag; wakes the loop if called from another thread so
    /// it observes the flag promptly rather than waiting for the 10s poll
    /// timeout.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub(crate) fn update_channel(
        &self,
        fd: RawFd,
        interest: Interest,
        membership: &mut Membership,
        channel: &Arc<Mutex<Channel>>,
    ) {
        debug_assert!(self.is_in_loop_thread(), "channel touched off its owning thread");
        if let Err(e) = self.shared.notifier.update_channel(fd, interest, membership, channel) {
            log_error(&format!("notifier update_channel(fd={fd}) failed: {e}"));
        }
    }

    pub(crate) fn remove_channel(&self, fd: RawFd, membership: &mut Membership) {
        debug_assert!(self.is_in_loop_thread(), "channel touched off its owning thread");
        if let Err(e) = self.shared.notifier.remove_channel(fd, membership) {
            log_error(&format!("notifier remove_channel(fd={fd}) failed: {e}"));
        }
    }
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn drain_waker(fd: RawFd) {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
    if n != 8 {
        log_error("EventLoop wakeup channel read a short count while draining");
    }
}

#[cfg(feature = "log")]
fn log_debug(msg: &str) {
    log::debug!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_debug(_msg: &str) {}

#[cfg(feature = "log")]
fn log_info(msg: &str) {
    log::info!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_info(_msg: &str) {}

#[cfg(feature = "log")]
fn log_error(msg: &str) {
    log::error!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_error(_msg: &str) {}

#[cfg(feature = "log")]
fn log_fatal(msg: &str) {
    log::error!("{msg}");
    panic!("{msg}");
}
#[cfg(not(feature = "log"))]
fn log_fatal(msg: &str) {
    panic!("{msg}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn run_in_loop_same_thread_executes_synchronously() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        // Same-thread run_in_loop must not require the loop to be running.
        handle.run_in_loop(move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queue_in_loop_from_other_thread_wakes_and_runs() {
        let (handle_tx, handle_rx) = mpsc::channel();
        let runner = std::thread::spawn(move || {
            let event_loop = EventLoop::new();
            handle_tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        let handle = handle_rx.recv().unwrap();
        let (tx, rx) = mpsc::channel();

        let worker_handle = handle.clone();
        std::thread::spawn(move || {
            worker_handle.queue_in_loop(move || {
                tx.send(()).unwrap();
            });
        });

        rx.recv_timeout(Duration::from_secs(2))
            .expect("queued task should run once the loop drains pending tasks");
        handle.quit();
        runner.join().unwrap();
    }
}
