//! Serialized execution contexts.
//!
//! The cache runs its work on two contexts: one owning the catalog and one owning blob I/O.
//! Each context admits a single operation at a time. Work may hop from the catalog context into
//! the file context but never the other way round, so the acquisition order is always
//! catalog → file and two caches sharing a thread pool cannot deadlock each other.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace_span;

/// A named execution context that runs closures strictly one after another.
pub struct SerialContext<T> {
    label: &'static str,
    state: Mutex<T>,
}

impl<T> SerialContext<T> {
    pub fn new(label: &'static str, state: T) -> Self {
        Self { label, state: Mutex::new(state) }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Run `task` with exclusive access to the context state, blocking until it is admitted.
    pub fn run<R>(&self, task: impl FnOnce(&mut T) -> R) -> R {
        let _span = trace_span!("serial_context", context = self.label).entered();
        let mut state = self.state.lock();
        task(&mut state)
    }

    pub fn into_inner(self) -> T {
        self.state.into_inner()
    }
}

impl<T> fmt::Debug for SerialContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialContext")
            .field("label", &self.label)
            .field("busy", &self.state.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tasks_never_interleave() {
        let context = Arc::new(SerialContext::new("test", Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let context = Arc::clone(&context);
                thread::spawn(move || {
                    for _ in 0..100 {
                        context.run(|log: &mut Vec<(u32, bool)>| {
                            log.push((worker, true));
                            log.push((worker, false));
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let log = Arc::try_unwrap(context).unwrap().into_inner();
        assert_eq!(log.len(), 8 * 100 * 2);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert!(pair[0].1 && !pair[1].1);
        }
    }
}
