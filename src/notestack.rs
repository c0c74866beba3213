// src/notestack.rs

/// A note parked in the stack while its voice was stolen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackedNote {
    pub note: u8,
    pub velocity: u8,
}

/// Bounded per-channel buffer of notes evicted by voice stealing.
///
/// Oldest-first: entries are replayed in the order they were parked.
/// The stack never overflows; pushing onto a full stack drops the
/// oldest entry instead.
#[derive(Debug, Clone)]
pub struct NoteStack {
    entries: Vec<StackedNote>,
    capacity: usize,
}

impl NoteStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Park a note. Drops the oldest entry when full.
    pub fn push(&mut self, note: u8, velocity: u8) {
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(StackedNote { note, velocity });
    }

    /// Replay the oldest parked note.
    pub fn pop_oldest(&mut self) -> Option<StackedNote> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Remove a specific pending note. Returns true if one was found.
    pub fn remove(&mut self, note: u8) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.note == note) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, note: u8) -> bool {
        self.entries.iter().any(|e| e.note == note)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_is_fifo() {
        let mut stack = NoteStack::new(4);
        stack.push(60, 100);
        stack.push(64, 90);
        assert_eq!(stack.pop_oldest().unwrap().note, 60);
        assert_eq!(stack.pop_oldest().unwrap().note, 64);
        assert!(stack.pop_oldest().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut stack = NoteStack::new(2);
        stack.push(60, 100);
        stack.push(61, 100);
        stack.push(62, 100);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop_oldest().unwrap().note, 61);
        assert_eq!(stack.pop_oldest().unwrap().note, 62);
    }

    #[test]
    fn test_remove_specific_note() {
        let mut stack = NoteStack::new(4);
        stack.push(60, 100);
        stack.push(64, 100);
        assert!(stack.remove(60));
        assert!(!stack.remove(60));
        assert_eq!(stack.pop_oldest().unwrap().note, 64);
    }
}
