use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of wall-clock time. Every time-dependent predicate in the crate takes
/// `now` as an argument; this trait is where request paths obtain it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Time-ordered identifier for task rows, so `id` order follows creation order.
pub fn new_task_id() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_sort_by_creation() {
        let first = new_task_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_task_id();
        assert!(first.to_string() < second.to_string());
    }

    #[test]
    fn test_fixed_clock_is_stable() {
        let instant = Utc::now();
        let clock = FixedClock(instant);
        assert_eq!(clock.now(), clock.now());
    }
}
