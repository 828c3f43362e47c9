const DEFAULT_LIMIT: usize = 100;

/// Undo/redo stacks of full snapshots.
///
/// `record` is called with the state *before* a mutation. Recording clears
/// the redo stack, so the two stacks never describe diverging futures.
#[derive(Debug, Clone)]
pub struct History<T> {
    past: Vec<T>,
    future: Vec<T>,
    limit: usize,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }
}

impl<T> History<T> {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            past: Vec::new(),
            future: Vec::new(),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, snapshot: T) {
        self.past.push(snapshot);
        if self.past.len() > self.limit {
            let overflow = self.past.len() - self.limit;
            self.past.drain(..overflow);
        }
        self.future.clear();
    }

    /// Swaps `current` with the newest undo snapshot. Returns `false` and
    /// leaves `current` untouched when there is nothing to undo.
    pub fn undo(&mut self, current: &mut T) -> bool {
        let Some(previous) = self.past.pop() else {
            return false;
        };
        let now = std::mem::replace(current, previous);
        self.future.push(now);
        true
    }

    pub fn redo(&mut self, current: &mut T) -> bool {
        let Some(next) = self.future.pop() else {
            return false;
        };
        let now = std::mem::replace(current, next);
        self.past.push(now);
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.past.len()
    }

}
