//! Process-wide map of live rooms, keyed by room code. Passed around as an
//! `Arc` so tests can stand up isolated fixtures; the map lock is never
//! held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::RoomConfig;
use crate::model::SessionStatus;
use crate::store::{SessionStore, StoreError};

use super::actor::{RoomActor, RoomCommand};

const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("room not found")]
    RoomNotFound,
    #[error("room closed")]
    RoomClosed,
    #[error(transparent)]
    Store(StoreError),
}

/// Cheap handle used by the WS adapter to feed a room's mailbox.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_code: String,
    epoch: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Delivers a command to the room actor; `false` means the room has
    /// retired and the caller should drop the connection.
    pub async fn send(&self, command: RoomCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }
}

pub struct Registry {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    store: Arc<dyn SessionStore>,
    room_config: RoomConfig,
    epoch_counter: AtomicU64,
}

impl Registry {
    pub fn new(store: Arc<dyn SessionStore>, room_config: RoomConfig) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            room_config,
            epoch_counter: AtomicU64::new(1),
        })
    }

    pub fn room_config(&self) -> &RoomConfig {
        &self.room_config
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Returns the live room for `room_code`, materialising it from storage
    /// on first connect. Exactly one of two racing acquirers instantiates;
    /// the other observes the winner.
    pub async fn acquire(self: &Arc<Self>, room_code: &str) -> Result<RoomHandle, AcquireError> {
        if let Some(handle) = self.rooms.lock().get(room_code) {
            return Ok(handle.clone());
        }

        let snapshot = self
            .store
            .load_session(room_code)
            .await
            .map_err(|err| match err {
                StoreError::RoomNotFound => AcquireError::RoomNotFound,
                other => AcquireError::Store(other),
            })?;

        if snapshot.session.status == SessionStatus::Finished {
            return Err(AcquireError::RoomClosed);
        }

        let epoch = self.epoch_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = RoomHandle {
            room_code: room_code.to_string(),
            epoch,
            tx: tx.clone(),
        };

        {
            let mut rooms = self.rooms.lock();
            if let Some(existing) = rooms.get(room_code) {
                // Lost the instantiation race; the freshly built mailbox is
                // dropped and the winner's handle returned.
                return Ok(existing.clone());
            }
            rooms.insert(room_code.to_string(), handle.clone());
        }

        let actor = RoomActor::new(
            snapshot,
            Arc::clone(&self.store),
            self.room_config.clone(),
            tx,
            Arc::downgrade(self),
            epoch,
        );
        tokio::spawn(actor.run(rx));

        tracing::info!(room = %room_code, "room materialised");
        Ok(handle)
    }

    /// Called by a retiring actor. The epoch guards against removing a
    /// newer room that reused the same code.
    pub(crate) fn retire(&self, room_code: &str, epoch: u64) {
        let mut rooms = self.rooms.lock();
        if let Some(handle) = rooms.get(room_code) {
            if handle.epoch == epoch {
                rooms.remove(room_code);
                tracing::info!(room = %room_code, "room retired");
            }
        }
    }
}

pub type RegistryRef = Weak<Registry>;
