use crate::error::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

/// Spawn a named thread. A panic escaping the closure is caught and
/// logged so that joining the thread never fails.
#[inline]
pub fn spawn_named<S, F>(name: S, f: F) -> Result<JoinHandle<()>>
where
    String: From<S>,
    F: FnOnce() + Send + 'static,
{
    let thread_name = String::from(name);
    let handle = thread::Builder::new().name(thread_name).spawn(|| {
        let thd = thread::current();
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            log::error!(
                "thread[{:?}:{}] panic",
                thd.id(),
                thd.name().unwrap_or("unknown")
            );
            return;
        }
        log::debug!(
            "thread[{:?}:{}] exit",
            thd.id(),
            thd.name().unwrap_or("unknown")
        );
    })?;
    Ok(handle)
}
