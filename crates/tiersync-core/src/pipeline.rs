//! Wiring of listener, processor, bus subscription and local handler.
//!
//! Start order: bus subscription, processor, listener. A process must be
//! subscribed before any of its own changes can be published, and the
//! processor must be draining before the listener fills the queue.
//!
//! Stop order: listener, processor, bus.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusError, BusStats, InvalidationBus};
use crate::event_log::{EventLog, note};
use crate::handler::LocalInvalidationHandler;
use crate::keys::KeySpace;
use crate::listener::{ChangeStreamListener, ListenerError, ListenerStats};
use crate::processor::{ChangeEventProcessor, ProcessorCounters, ProcessorStats};
use crate::record::ChangeRecord;
use crate::tiers::TierManager;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A pipeline runs once; build a new one to start again.
    #[error("invalidation pipeline was already started")]
    AlreadyStarted,

    #[error("listener's event queue was already taken")]
    QueueTaken,

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Counters of every pipeline stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub listener: ListenerStats,
    pub processor: ProcessorStats,
    pub bus: BusStats,
}

enum State {
    Idle(mpsc::Receiver<ChangeRecord>),
    Running {
        cancel: CancellationToken,
        processor: JoinHandle<()>,
        counters: Arc<ProcessorCounters>,
    },
    Stopped {
        counters: Option<Arc<ProcessorCounters>>,
    },
}

/// The invalidation path of one process, started and stopped as a unit.
pub struct InvalidationPipeline<V> {
    listener: ChangeStreamListener,
    bus: Arc<dyn InvalidationBus>,
    keys: Arc<KeySpace>,
    tiers: Arc<TierManager<V>>,
    log: Option<EventLog>,
    state: Mutex<State>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<V: Clone + Send + Sync + 'static> InvalidationPipeline<V> {
    /// Takes the listener's event queue; fails if it was already handed out.
    pub fn new(
        listener: ChangeStreamListener,
        bus: Arc<dyn InvalidationBus>,
        keys: KeySpace,
        tiers: Arc<TierManager<V>>,
    ) -> Result<Self, PipelineError> {
        let events = listener.events().ok_or(PipelineError::QueueTaken)?;
        Ok(Self {
            listener,
            bus,
            keys: Arc::new(keys),
            tiers,
            log: None,
            state: Mutex::new(State::Idle(events)),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn listener(&self) -> &ChangeStreamListener {
        &self.listener
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running { .. })
    }

    /// Subscribe the local handler, start the processor, attach the stream.
    ///
    /// On failure every stage already started is stopped again and the
    /// pipeline cannot be restarted.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let _guard = self.lifecycle.lock().await;

        let events = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped { counters: None }) {
                State::Idle(events) => events,
                other => {
                    *state = other;
                    return Err(PipelineError::AlreadyStarted);
                }
            }
        };

        let mut handler = LocalInvalidationHandler::new(Arc::clone(&self.tiers));
        if let Some(log) = &self.log {
            handler = handler.with_event_log(log.clone());
        }
        if let Err(e) = self.bus.subscribe(Arc::new(handler)).await {
            note(&self.log, format!("Failed to subscribe to invalidation bus: {e}"));
            return Err(e.into());
        }
        note(&self.log, "Invalidation bus consumer started");

        let mut processor = ChangeEventProcessor::new(
            events,
            Arc::clone(self.tiers.shared()),
            Arc::clone(&self.bus),
            Arc::clone(&self.keys),
        );
        if let Some(log) = &self.log {
            processor = processor.with_event_log(log.clone());
        }
        let counters = processor.counters();
        let cancel = CancellationToken::new();
        let task = processor.spawn(cancel.clone());

        if let Err(e) = self.listener.start().await {
            note(&self.log, format!("Failed to start change stream listener: {e}"));
            cancel.cancel();
            if let Err(join) = task.await {
                warn!(error = %join, "Processor task ended abnormally");
            }
            self.bus.stop().await;
            *self.state.lock() = State::Stopped {
                counters: Some(counters),
            };
            return Err(e.into());
        }
        note(&self.log, "Change stream listener started");

        *self.state.lock() = State::Running {
            cancel,
            processor: task,
            counters,
        };
        info!("Invalidation pipeline started");
        Ok(())
    }

    /// Stop listener, processor and bus, in that order. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;

        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped { counters: None }) {
                State::Running {
                    cancel,
                    processor,
                    counters,
                } => {
                    *state = State::Stopped {
                        counters: Some(Arc::clone(&counters)),
                    };
                    Some((cancel, processor))
                }
                other => {
                    *state = other;
                    None
                }
            }
        };
        let Some((cancel, processor)) = running else {
            return;
        };

        self.listener.stop().await;
        cancel.cancel();
        if let Err(e) = processor.await {
            warn!(error = %e, "Processor task ended abnormally");
        }
        self.bus.stop().await;

        note(&self.log, "Invalidation pipeline stopped");
        info!("Invalidation pipeline stopped");
    }

    pub fn stats(&self) -> PipelineStats {
        let processor = match &*self.state.lock() {
            State::Running { counters, .. } => counters.snapshot(),
            State::Stopped {
                counters: Some(counters),
            } => counters.snapshot(),
            _ => ProcessorStats::default(),
        };
        PipelineStats {
            listener: self.listener.stats(),
            processor,
            bus: self.bus.stats(),
        }
    }
}
