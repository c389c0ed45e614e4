//! Per-task event channels.
//!
//! Each task owns one ordered log. Subscribers replay it from the start and
//! then follow live appends; a batch never mixes tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{EventKind, TaskEvent, TaskId};

struct Channel {
    history: Mutex<Vec<TaskEvent>>,
    /// Number of events published so far.
    len_tx: watch::Sender<usize>,
}

impl Channel {
    fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            history: Mutex::new(Vec::new()),
            len_tx,
        }
    }
}

#[derive(Default)]
pub struct EventHub {
    channels: Mutex<HashMap<TaskId, Arc<Channel>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, task_id: TaskId) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(channels.entry(task_id).or_insert_with(|| Arc::new(Channel::new())))
    }

    /// Appends an event and wakes subscribers. Returns the stored event.
    pub fn publish(&self, task_id: TaskId, kind: EventKind, at: DateTime<Utc>) -> TaskEvent {
        let channel = self.channel(task_id);
        let mut history = channel.history.lock().unwrap_or_else(PoisonError::into_inner);
        let event = TaskEvent {
            task_id,
            seq: history.len() as u64,
            at,
            kind,
        };
        history.push(event.clone());
        channel.len_tx.send_replace(history.len());
        event
    }

    /// Snapshot of everything published for the task so far.
    pub fn history(&self, task_id: TaskId) -> Vec<TaskEvent> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        match channels.get(&task_id) {
            Some(channel) => channel
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            None => Vec::new(),
        }
    }

    /// Subscribes from sequence 0. `None` when nothing was ever published
    /// for the task or its channel was dropped on archival.
    pub fn subscribe(&self, task_id: TaskId) -> Option<EventSubscription> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = Arc::clone(channels.get(&task_id)?);
        drop(channels);
        let rx = channel.len_tx.subscribe();
        Some(EventSubscription {
            channel,
            rx,
            cursor: 0,
            finished: false,
        })
    }

    /// Drops the channel of an archived task.
    pub fn remove(&self, task_id: TaskId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.remove(&task_id);
    }
}

/// Cursor over one task's channel.
pub struct EventSubscription {
    channel: Arc<Channel>,
    rx: watch::Receiver<usize>,
    cursor: usize,
    finished: bool,
}

impl EventSubscription {
    /// Events not yet seen, without waiting.
    pub fn try_batch(&mut self) -> Vec<TaskEvent> {
        if self.finished {
            return Vec::new();
        }
        let history = self
            .channel
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let batch: Vec<TaskEvent> = history[self.cursor.min(history.len())..].to_vec();
        drop(history);
        self.cursor += batch.len();
        if batch.iter().any(TaskEvent::is_terminal) {
            self.finished = true;
        }
        batch
    }

    /// Waits for at least one unseen event. `None` once a terminal status has
    /// been delivered.
    pub async fn next_batch(&mut self) -> Option<Vec<TaskEvent>> {
        loop {
            if self.finished {
                return None;
            }
            let batch = self.try_batch();
            if !batch.is_empty() {
                return Some(batch);
            }
            if self.rx.changed().await.is_err() {
                let rest = self.try_batch();
                self.finished = true;
                return if rest.is_empty() { None } else { Some(rest) };
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
