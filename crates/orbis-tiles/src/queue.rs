//! Asynchronous tile production.
//!
//! [`Producer::request_tile`] reserves a tile and pushes a [`ProductionTask`]
//! onto a [`ProductionQueue`]. The thread owning the graphics resources
//! drains the queue with [`ProductionQueue::run_pending`], a bounded amount
//! of work per frame. Requesters hold a [`PendingTile`] and poll it.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use orbis_common::{SlotId, TileError, TileId, TileKey, TileResult};

use crate::cache::{Production, TileHandle};
use crate::producer::Producer;

/// One queued production.
pub(crate) struct ProductionTask {
    producer: Arc<Producer>,
    id: TileId,
    slot: SlotId,
    production: Arc<Production>,
}

impl ProductionTask {
    pub(crate) fn new(producer: Arc<Producer>, id: TileId, slot: SlotId, production: Arc<Production>) -> Self {
        Self {
            producer,
            id,
            slot,
            production,
        }
    }

    /// Runs the task unless it was claimed or cancelled meanwhile.
    fn run(self) -> bool {
        if !self.production.try_claim() {
            debug!("Skipping production of {} for '{}'", self.id, self.producer.name());
            return false;
        }
        // Failures reach the waiters through the production record
        let _ = self.producer.run_claimed(self.id, self.slot, &self.production);
        true
    }
}

/// FIFO of productions waiting for the producing thread.
pub struct ProductionQueue {
    sender: Sender<ProductionTask>,
    receiver: Receiver<ProductionTask>,
}

impl ProductionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub(crate) fn push(&self, task: ProductionTask) {
        if let Err(e) = self.sender.send(task) {
            // Both channel ends live in `self`, so this is unreachable in practice
            warn!("Production queue closed, dropping task for {}", e.0.id);
        }
    }

    /// Number of queued tasks, including ones that will be skipped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Runs up to `budget` productions on the calling thread.
    ///
    /// Tasks already claimed by a synchronous caller or cancelled are
    /// dropped without counting against the budget. Returns the number of
    /// productions run.
    pub fn run_pending(&self, budget: usize) -> usize {
        let mut executed = 0;
        while executed < budget {
            match self.receiver.try_recv() {
                Ok(task) => {
                    if task.run() {
                        executed += 1;
                    }
                },
                Err(_) => break,
            }
        }
        if executed > 0 {
            debug!("Ran {} queued productions, {} left", executed, self.len());
        }
        executed
    }

    /// Runs every queued production.
    pub fn run_all(&self) -> usize {
        self.run_pending(usize::MAX)
    }
}

impl Default for ProductionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProductionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductionQueue")
            .field("queued", &self.len())
            .finish()
    }
}

enum PendingState {
    Ready(TileHandle),
    InFlight {
        producer: Arc<Producer>,
        slot: SlotId,
        production: Arc<Production>,
    },
}

/// A tile requested asynchronously.
///
/// Holds a reference on the reserved tile until resolved. Dropping an
/// unresolved request cancels it.
pub struct PendingTile {
    key: TileKey,
    state: Option<PendingState>,
}

impl PendingTile {
    pub(crate) fn ready(handle: TileHandle) -> Self {
        Self {
            key: handle.key(),
            state: Some(PendingState::Ready(handle)),
        }
    }

    pub(crate) fn in_flight(producer: Arc<Producer>, id: TileId, slot: SlotId, production: Arc<Production>) -> Self {
        Self {
            key: producer.key(id),
            state: Some(PendingState::InFlight {
                producer,
                slot,
                production,
            }),
        }
    }

    /// Requested tile.
    #[must_use]
    pub const fn id(&self) -> TileId {
        self.key.tile
    }

    /// Returns true once `poll` has handed out the outcome.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.state.is_none()
    }

    /// Returns true if `poll` would return the outcome.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match &self.state {
            Some(PendingState::Ready(_)) => true,
            Some(PendingState::InFlight { production, .. }) => production.poll().is_some(),
            None => false,
        }
    }

    /// Returns the outcome once the production is over, `None` before.
    ///
    /// The outcome is handed out once; later polls return `None`.
    pub fn poll(&mut self) -> Option<TileResult<TileHandle>> {
        let key = self.key;
        match self.state.take()? {
            PendingState::Ready(handle) => Some(Ok(handle)),
            PendingState::InFlight {
                producer,
                slot,
                production,
            } => match production.poll() {
                None => {
                    self.state = Some(PendingState::InFlight {
                        producer,
                        slot,
                        production,
                    });
                    None
                },
                Some(result) => Some(result.map(|()| producer.cache().handle(key, slot))),
            },
        }
    }

    /// Blocks until the tile is produced.
    ///
    /// A production still sitting in the queue is run on this thread.
    pub fn wait(mut self) -> TileResult<TileHandle> {
        match self.state.take() {
            Some(PendingState::Ready(handle)) => Ok(handle),
            Some(PendingState::InFlight {
                producer,
                slot,
                production,
            }) => {
                if production.try_claim() {
                    producer.run_claimed(self.key.tile, slot, &production)?;
                } else {
                    production.wait()?;
                }
                Ok(producer.cache().handle(self.key, slot))
            },
            None => Err(TileError::Cancelled { key: self.key }),
        }
    }

    /// Gives up the request.
    ///
    /// If nobody else wants the tile and its production has not started, the
    /// production is dropped and the reserved slot returns to the pool.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(PendingState::InFlight {
            producer, production, ..
        }) = self.state.take()
        {
            debug!("Cancelling request for {}", self.key);
            producer.cache().cancel_pending(self.key, &production);
        }
    }
}

impl Drop for PendingTile {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PendingTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTile")
            .field("key", &self.key)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
