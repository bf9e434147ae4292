use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;

use crate::queue::{QueueClient, QueueError, QueueResult};

#[derive(Default)]
struct MockState {
    lists: HashMap<String, VecDeque<String>>,
    reserve_failures: usize,
    ack_failures: usize,
    push_failures: usize,
    recover_failures: usize,
}

/// An in-memory `QueueClient` for tests. Transport failures can be scripted per operation.
#[derive(Clone, Default)]
pub struct MockQueue {
    state: Arc<Mutex<MockState>>,
}

fn unreachable_backend(command: &str) -> QueueError {
    QueueError::command(
        command,
        redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")),
    )
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the next `count` calls to `reserve` fail as if the backend were down.
    pub fn fail_reserve(&self, count: usize) -> Self {
        self.lock_state().reserve_failures = count;
        self.clone()
    }

    /// Make the next `count` calls to `ack` fail as if the backend were down.
    pub fn fail_ack(&self, count: usize) -> Self {
        self.lock_state().ack_failures = count;
        self.clone()
    }

    /// Make the next `count` calls to `push` fail as if the backend were down.
    pub fn fail_push(&self, count: usize) -> Self {
        self.lock_state().push_failures = count;
        self.clone()
    }

    /// Make the next `count` calls to `recover` fail as if the backend were down.
    pub fn fail_recover(&self, count: usize) -> Self {
        self.lock_state().recover_failures = count;
        self.clone()
    }

    /// A snapshot of the items currently in `list`, head first.
    pub fn items(&self, list: &str) -> Vec<String> {
        self.lock_state()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, list: &str) -> usize {
        self.lock_state().lists.get(list).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, list: &str) -> bool {
        self.len(list) == 0
    }
}

#[async_trait]
impl QueueClient for MockQueue {
    async fn push(&self, queue: &str, item: String) -> QueueResult<()> {
        let mut state = self.lock_state();
        if state.push_failures > 0 {
            state.push_failures -= 1;
            return Err(unreachable_backend("RPUSH"));
        }

        state
            .lists
            .entry(queue.to_owned())
            .or_default()
            .push_back(item);
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        processing: &str,
        timeout: time::Duration,
    ) -> QueueResult<Option<String>> {
        {
            let mut state = self.lock_state();
            if state.reserve_failures > 0 {
                state.reserve_failures -= 1;
                return Err(unreachable_backend("BLMOVE"));
            }

            if let Some(item) = state.lists.get_mut(queue).and_then(VecDeque::pop_front) {
                state
                    .lists
                    .entry(processing.to_owned())
                    .or_default()
                    .push_back(item.clone());
                return Ok(Some(item));
            }
        }

        // Nothing to hand out: behave like a blocking pop that ran out of time.
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn ack(&self, processing: &str, item: &str) -> QueueResult<()> {
        let mut state = self.lock_state();
        if state.ack_failures > 0 {
            state.ack_failures -= 1;
            return Err(unreachable_backend("LREM"));
        }

        if let Some(items) = state.lists.get_mut(processing) {
            if let Some(position) = items.iter().position(|i| i == item) {
                items.remove(position);
            }
        }
        Ok(())
    }

    async fn recover(&self, processing: &str, queue: &str) -> QueueResult<usize> {
        let mut state = self.lock_state();
        if state.recover_failures > 0 {
            state.recover_failures -= 1;
            return Err(unreachable_backend("LMOVE"));
        }

        let stranded = state.lists.remove(processing).unwrap_or_default();
        let moved = stranded.len();

        let target = state.lists.entry(queue.to_owned()).or_default();
        for item in stranded.into_iter().rev() {
            target.push_front(item);
        }

        Ok(moved)
    }
}
