//! Job outcomes and the task's restart stack.

/// Result of one job invocation; steers the task scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Work done for this round; move on to the next job.
    Ok,
    /// Not enough input yet; restart from the first job.
    Continue,
    /// This job has nothing more to do and is removed.
    Done,
    /// Output was produced but input remains; run downstream jobs, then
    /// come back to this one.
    Truncate,
    /// Unrecoverable failure; the task drops all jobs.
    Fail,
}

impl JobStatus {
    /// Short name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Ok => "OK",
            JobStatus::Continue => "CONTINUE",
            JobStatus::Done => "DONE",
            JobStatus::Truncate => "TRUNCATE",
            JobStatus::Fail => "FAIL",
        }
    }
}

/// How often a registered job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTimes {
    /// Removed after its first successful run.
    Once,
    /// Runs every round until it reports [`JobStatus::Done`].
    Infinite,
}

/// Stack of job ids the task returns to when it reaches the end of its list.
///
/// The bottom entry is sticky: popping the last element returns it without
/// removing it, so the task always has a place to restart from.
#[derive(Debug, Default, Clone)]
pub struct JobStack {
    ids: Vec<u64>,
}

impl JobStack {
    /// Pushes `id` on top.
    pub fn push(&mut self, id: u64) {
        self.ids.push(id);
    }

    /// Pops the top id, leaving the bottom entry in place.
    pub fn pop(&mut self) -> Option<u64> {
        match self.ids.len() {
            0 => None,
            1 => self.ids.first().copied(),
            _ => self.ids.pop(),
        }
    }

    /// Removes the topmost occurrence of `id`.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.ids.iter().rposition(|&x| x == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Empties the stack.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Whether the stack holds nothing.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_entry_is_sticky() {
        let mut stack = JobStack::default();
        stack.push(1);
        stack.push(2);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn remove_drops_topmost_match() {
        let mut stack = JobStack::default();
        stack.push(7);
        stack.push(8);
        stack.push(7);
        assert!(stack.remove(7));
        assert_eq!(stack.pop(), Some(8));
        assert!(!stack.remove(42));
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn status_names() {
        assert_eq!(JobStatus::Truncate.as_str(), "TRUNCATE");
        assert_eq!(JobStatus::Ok.as_str(), "OK");
    }
}
