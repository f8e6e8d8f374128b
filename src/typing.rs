use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::registry::ConnectionId;

struct TypingEntry {
    username: String,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Every arm bumps a generation counter; a timer only expires the entry it was
/// armed for, so a late wake-up after re-arming or clearing is ignored.
#[derive(Default)]
pub struct TypingTracker {
    entries: HashMap<ConnectionId, TypingEntry>,
    next_generation: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&mut self, id: ConnectionId, username: String, schedule: F)
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = schedule(generation);

        if let Some(previous) = self.entries.insert(
            id,
            TypingEntry {
                username,
                generation,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    pub fn clear(&mut self, id: ConnectionId) -> Option<String> {
        self.entries.remove(&id).map(|entry| {
            entry.timer.abort();
            entry.username
        })
    }

    pub fn expire(&mut self, id: ConnectionId, generation: u64) -> Option<String> {
        match self.entries.get(&id) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(&id).map(|entry| entry.username)
            }
            _ => None,
        }
    }

    pub fn is_typing(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn typing_usernames(&self) -> Vec<String> {
        let mut usernames: Vec<String> = self
            .entries
            .values()
            .map(|entry| entry.username.clone())
            .collect();
        usernames.sort();
        usernames
    }

    pub fn clear_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }
}
