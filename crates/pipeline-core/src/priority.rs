//! Request priority levels.

/// Priority of a pipeline request.
///
/// Totally ordered: `Low < Medium < High`. Used by the priority fetch queue
/// to pick a lane and by the multiplexer to aggregate the priorities of all
/// consumers attached to one underlying computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Speculative work, e.g. prefetches of images that are off-screen.
    Low,
    /// Images that are likely to become visible soon.
    Medium,
    /// Images that are visible right now.
    High,
}

impl Priority {
    /// Returns the higher of the two priorities.
    pub fn higher_of(a: Priority, b: Priority) -> Priority {
        a.max(b)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::High => write!(f, "HIGH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_totally_ordered() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
    }

    #[test]
    fn higher_of_picks_max() {
        assert_eq!(
            Priority::higher_of(Priority::Low, Priority::High),
            Priority::High
        );
        assert_eq!(
            Priority::higher_of(Priority::Medium, Priority::Medium),
            Priority::Medium
        );
    }
}
