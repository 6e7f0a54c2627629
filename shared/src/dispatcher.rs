//! Subject-keyed multicast dispatch.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::error;

use crate::message::InboundMessage;
use crate::wire::Subject;

/// A registered subject handler. Runs on a pipeline worker thread; emits
/// replies by pushing onto the outbound queue it captured at registration.
pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Maps each subject to an ordered handler list. Registration appends,
/// removal deletes by identity, dispatch invokes a snapshot of the current
/// list so the lock is never held across handler execution.
#[derive(Default)]
pub struct SubjectDispatcher {
    handlers: Mutex<HashMap<Subject, Vec<Handler>>>,
}

impl SubjectDispatcher {
    pub fn new() -> Self {
        SubjectDispatcher::default()
    }

    pub fn register(&self, subject: Subject, handler: Handler) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.entry(subject).or_default().push(handler);
    }

    /// Removes one handler by identity. Returns false when the handler was
    /// not registered for that subject.
    pub fn remove(&self, subject: Subject, handler: &Handler) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        let Some(list) = handlers.get_mut(&subject) else {
            return false;
        };
        let before = list.len();
        list.retain(|registered| !Arc::ptr_eq(registered, handler));
        before != list.len()
    }

    /// Invokes every handler registered for the message's subject, in
    /// registration order. No handlers is a no-op. A panicking handler is
    /// contained and logged; the remaining handlers still run.
    pub fn dispatch(&self, message: &InboundMessage) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&message.subject) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(
                    "handler for {:?} panicked on message from connection {}",
                    message.subject, message.connection_id
                );
            }
        }
    }

    pub fn handler_count(&self, subject: Subject) -> usize {
        let handlers = self.handlers.lock().unwrap();
        handlers.get(&subject).map(Vec::len).unwrap_or(0)
    }
}
