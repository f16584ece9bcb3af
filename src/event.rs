/*!
Completion signals.

An [`Event`] is returned for every command enqueued on a device. It becomes
complete exactly once, with either success or an [`ExecutionError`]. Commands name
the events they depend on, so ordering is expressed without blocking the thread
that enqueues them.
*/

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// The kind of command an [`Event`] tracks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum Command {
    /// Host to device copy.
    Write,
    /// Kernel launch.
    Launch,
    /// Device to host copy.
    Read,
}

/// A command failed on the device.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{command} failed: {cause:#}")]
pub struct ExecutionError {
    command: Command,
    cause: Arc<anyhow::Error>,
}

impl ExecutionError {
    /// Creates an error for `command`.
    pub fn new(command: Command, cause: anyhow::Error) -> Self {
        Self {
            command,
            cause: Arc::new(cause),
        }
    }
    /// The command that failed.
    pub fn command(&self) -> Command {
        self.command
    }
}

struct EventInner {
    command: Command,
    result: OnceCell<Result<(), ExecutionError>>,
    lock: Mutex<()>,
    cond: Condvar,
}

/** A completion signal.

Events can be cloned, which is equivalent to [`Arc::clone()`].

Device engines create pending events with [`Event::new()`] and complete them with
[`.signal()`](Event::signal). */
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// A pending event for `command`.
    pub fn new(command: Command) -> Self {
        Self {
            inner: Arc::new(EventInner {
                command,
                result: OnceCell::new(),
                lock: Mutex::default(),
                cond: Condvar::new(),
            }),
        }
    }
    /// An event that is already complete.
    ///
    /// Used for commands with nothing to do, ie zero length copies.
    pub fn complete(command: Command) -> Self {
        let event = Self::new(command);
        event.signal(Ok(()));
        event
    }
    /// The command this event tracks.
    pub fn command(&self) -> Command {
        self.inner.command
    }
    /** Completes the event.

    Only the first call has an effect. Returns false if the event was already
    complete. */
    pub fn signal(&self, result: anyhow::Result<()>) -> bool {
        let command = self.inner.command;
        let result = result.map_err(|e| ExecutionError::new(command, e));
        self.fulfill(result)
    }
    /// Completes the event with the failure of another event.
    pub fn fail(&self, error: ExecutionError) -> bool {
        self.fulfill(Err(error))
    }
    fn fulfill(&self, result: Result<(), ExecutionError>) -> bool {
        let _guard = self.inner.lock.lock();
        let set = self.inner.result.set(result).is_ok();
        if set {
            self.inner.cond.notify_all();
        }
        set
    }
    /// Whether the event has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.result.get().is_some()
    }
    /// Blocks until the event completes.
    pub fn wait(&self) -> Result<(), ExecutionError> {
        if let Some(result) = self.inner.result.get() {
            return result.clone();
        }
        let mut guard = self.inner.lock.lock();
        loop {
            if let Some(result) = self.inner.result.get() {
                return result.clone();
            }
            self.inner.cond.wait(&mut guard);
        }
    }
    /// Blocks until every event in `events` completes, returning the first error.
    pub fn wait_all<'a>(events: impl IntoIterator<Item = &'a Event>) -> Result<(), ExecutionError> {
        let mut output = Ok(());
        for event in events {
            if let Err(e) = event.wait() {
                if output.is_ok() {
                    output = Err(e);
                }
            }
        }
        output
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("command", &self.inner.command)
            .field("status", &self.inner.result.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn event_wait_across_threads() {
        let event = Event::new(Command::Launch);
        assert!(!event.is_complete());
        let signal = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.signal(Ok(()));
        });
        event.wait().unwrap();
        assert!(event.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn event_signal_once() {
        let event = Event::new(Command::Write);
        assert!(event.signal(Err(anyhow::format_err!("lost"))));
        assert!(!event.signal(Ok(())));
        let err = event.wait().unwrap_err();
        assert_eq!(err.command(), Command::Write);
        assert!(err.to_string().contains("lost"));
    }

    #[test]
    fn event_wait_all_reports_first_error() {
        let a = Event::complete(Command::Write);
        let b = Event::new(Command::Write);
        b.signal(Err(anyhow::format_err!("b")));
        let c = Event::new(Command::Launch);
        c.signal(Err(anyhow::format_err!("c")));
        let err = Event::wait_all([&a, &b, &c]).unwrap_err();
        assert!(err.to_string().contains('b'));
    }
}
