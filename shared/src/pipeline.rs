//! Producer/consumer core shared by the client and server endpoints.
//!
//! The driving thread feeds decoded envelopes in via `push_inbound`; a small
//! pool of worker threads blocks on the inbound channel and runs the subject
//! dispatch. Handlers push replies onto the outbound channel, which the
//! driving thread drains again on its next tick. Closing the inbound channel
//! is the shutdown signal: each worker drains whatever is still queued and
//! exits exactly once.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use thiserror::Error;

use crate::dispatcher::{Handler, SubjectDispatcher};
use crate::message::{InboundMessage, OutboundMessage};
use crate::transport::TransportError;
use crate::wire::Subject;

/// Default number of dispatch workers. More than one worker forfeits
/// same-connection ordering, so this stays at 1 unless every handler for the
/// deployment is known to be commutative.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Endpoint start-up failures. Transport host creation is the one fatal
/// error in the system; worker spawning can only fail on OS exhaustion.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to spawn pipeline worker: {0}")]
    WorkerSpawn(io::Error),
}

/// Cloneable handle handlers use to emit replies and broadcasts from worker
/// threads.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: Sender<OutboundMessage>,
}

impl OutboundQueue {
    pub fn push(&self, message: OutboundMessage) {
        // The receiving side lives as long as the pipeline; a failed send
        // can only mean shutdown is in progress.
        if self.tx.send(message).is_err() {
            debug!("outbound message dropped during shutdown");
        }
    }
}

pub struct MessagePipeline {
    dispatcher: Arc<SubjectDispatcher>,
    inbound_tx: Mutex<Option<Sender<InboundMessage>>>,
    inbound_rx: Receiver<InboundMessage>,
    outbound_tx: Sender<OutboundMessage>,
    outbound_rx: Receiver<OutboundMessage>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MessagePipeline {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        MessagePipeline {
            dispatcher: Arc::new(SubjectDispatcher::new()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx,
            outbound_tx,
            outbound_rx,
            workers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn register_handler(&self, subject: Subject, handler: Handler) {
        self.dispatcher.register(subject, handler);
    }

    pub fn remove_handler(&self, subject: Subject, handler: &Handler) -> bool {
        self.dispatcher.remove(subject, handler)
    }

    /// Spawns the dispatch workers. `name` prefixes the thread names.
    pub fn start(&self, worker_count: usize, name: &str) -> Result<(), EndpointError> {
        let mut workers = self.workers.lock().unwrap();
        for index in 0..worker_count.max(1) {
            let rx = self.inbound_rx.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || {
                    while let Ok(message) = rx.recv() {
                        dispatcher.dispatch(&message);
                    }
                    debug!("pipeline worker exiting after queue close");
                })
                .map_err(EndpointError::WorkerSpawn)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Enqueues an envelope for the workers. Messages arriving after `stop`
    /// are dropped.
    pub fn push_inbound(&self, message: InboundMessage) {
        let guard = self.inbound_tx.lock().unwrap();
        match &*guard {
            Some(tx) => {
                // Send cannot fail while we hold the sender.
                let _ = tx.send(message);
            }
            None => warn!(
                "inbound {:?} from connection {} dropped after shutdown",
                message.subject, message.connection_id
            ),
        }
    }

    pub fn outbound(&self) -> OutboundQueue {
        OutboundQueue {
            tx: self.outbound_tx.clone(),
        }
    }

    /// Non-blocking pop for the driving thread's send pass.
    pub fn try_pop_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.try_recv().ok()
    }

    /// Closes the inbound channel and joins every worker. Each worker drains
    /// the messages still queued before exiting. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inbound_tx.lock().unwrap().take();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("pipeline worker terminated with a panic");
            }
        }
    }
}

impl Default for MessagePipeline {
    fn default() -> Self {
        MessagePipeline::new()
    }
}
