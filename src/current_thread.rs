//! Cheap current-thread identity, used to assert the "touched only from the
//! owning loop's thread" invariant (spec §3, §5) without paying for a
//! `std::thread::current().id()` comparison that allocates on some
//! platforms.

use std::cell::Cell;
use std::thread::ThreadId;

thread_local! {
    static CACHED_ID: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Returns (and caches) the calling thread's id.
pub fn id() -> ThreadId {
    CACHED_ID.with(|cell| {
        if let Some(id) = cell.get() {
            id
        } else {
            let id = std::thread::current().id();
            cell.set(Some(id));
            id
        }
    })
}

/// Returns whether the calling thread is `owner`.
pub fn is(owner: ThreadId) -> bool {
    id() == owner
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_thread_matches() {
        let here = id();
        assert!(is(here));
    }

    #[test]
    fn other_thread_does_not_match() {
        let here = id();
        let other = std::thread::spawn(id).join().unwrap();
        assert_ne!(here, other);
    }
}
