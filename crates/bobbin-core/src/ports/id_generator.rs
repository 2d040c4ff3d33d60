//! IdGenerator port - ID 生成の抽象化
//!
//! canvas を freeze するときに全ての task / group id をここで払い出します。

use std::sync::Mutex;
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::ids::{GroupId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_group_id(&self) -> GroupId;
}

/// ULIDs stamped with the injected clock.
///
/// Ids handed out within the same millisecond still sort in issue order, so
/// the frozen ids of one canvas follow its definition order.
pub struct UlidGenerator<C> {
    clock: C,
    monotonic: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            monotonic: Mutex::new(Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let now = self.clock.now();
        let issued = self
            .monotonic
            .lock()
            .ok()
            .and_then(|mut generator| generator.generate_from_datetime(SystemTime::from(now)).ok());
        // random part exhausted within one millisecond, or a poisoned lock
        issued.unwrap_or_else(|| Ulid::from_parts(now.timestamp_millis() as u64, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_group_id(&self) -> GroupId {
        GroupId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ids_within_one_instant_sort_in_issue_order() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(at));

        let issued: Vec<TaskId> = (0..50).map(|_| ids.generate_task_id()).collect();

        let mut sorted = issued.clone();
        sorted.sort();
        assert_eq!(issued, sorted);
        assert!(
            issued
                .iter()
                .all(|id| id.as_ulid().timestamp_ms() == at.timestamp_millis() as u64)
        );
    }

    #[test]
    fn task_and_group_ids_come_from_one_sequence() {
        let ids = UlidGenerator::new(SystemClock);

        let task = ids.generate_task_id();
        let group = ids.generate_group_id();

        assert!(task.as_ulid() < group.as_ulid());
        assert!(group.to_string().starts_with("group-"));
    }
}
