//! Envelope - the wire message for one task invocation.
//!
//! Wire shape (JSON):
//! `{id, task, args, kwargs, retries, eta, expires, group_id?, group_index?,
//!   chord_size?, priority?, parent_id?, link?, link_error?}`
//!
//! `eta` and `expires` are always present (possibly `null`); the other
//! optional fields are omitted when unset.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::canvas::Canvas;
use super::ids::{GroupId, TaskId};
use super::signature::{Kwargs, Signature};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: TaskId,
    pub task: String,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Kwargs,

    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,

    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,

    /// Position inside the group, in definition order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_index: Option<usize>,

    /// Set only for chord header members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chord_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<Canvas>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_error: Vec<Canvas>,
}

impl Envelope {
    /// Materialize a (bound) signature. `countdown` is resolved against `now`.
    pub fn from_signature(sig: Signature, id: TaskId, now: DateTime<Utc>) -> Self {
        let eta = sig.options.eta.or_else(|| {
            sig.options
                .countdown_ms
                .map(|ms| eta_after(now, Duration::from_millis(ms)))
        });
        Self {
            id,
            task: sig.task,
            args: sig.args,
            kwargs: sig.kwargs,
            retries: 0,
            eta,
            expires: sig.options.expires,
            group_id: None,
            group_index: None,
            chord_size: None,
            priority: sig.options.priority,
            parent_id: None,
            link: sig.options.link,
            link_error: sig.options.link_error,
        }
    }

    pub fn in_group(mut self, group_id: GroupId, index: usize, chord_size: Option<usize>) -> Self {
        self.group_id = Some(group_id);
        self.group_index = Some(index);
        self.chord_size = chord_size;
        self
    }

    pub fn with_parent(mut self, parent: Option<TaskId>) -> Self {
        self.parent_id = parent;
        self
    }

    /// Copy for redelivery: same id, `retries + 1`, new eta.
    pub fn retry_copy(&self, eta: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.retries += 1;
        next.eta = Some(eta);
        next
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Remaining wait before the envelope may run, if any.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        let eta = self.eta?;
        (eta - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn is_chord_member(&self) -> bool {
        self.group_id.is_some() && self.chord_size.is_some()
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn eta_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn countdown_becomes_eta() {
        let sig = Signature::new("add")
            .args([1, 2])
            .countdown(Duration::from_secs(30));
        let env = Envelope::from_signature(sig, TaskId::generate(), now());

        assert_eq!(env.eta, Some(now() + chrono::Duration::seconds(30)));
        assert_eq!(env.delay_from(now()), Some(Duration::from_secs(30)));
        assert_eq!(env.retries, 0);
    }

    #[test]
    fn huge_countdown_saturates() {
        let sig = Signature::new("x").countdown(Duration::from_secs(u64::MAX));
        let env = Envelope::from_signature(sig, TaskId::generate(), now());

        assert_eq!(env.eta, Some(DateTime::<Utc>::MAX_UTC));
        assert!(env.delay_from(now()).is_some_and(|d| d > Duration::from_secs(86_400)));
        assert_eq!(
            eta_after(DateTime::<Utc>::MAX_UTC, Duration::from_millis(1)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn retry_copy_keeps_id_and_bumps_retries() {
        let env = Envelope::from_signature(Signature::new("x"), TaskId::generate(), now());
        let eta = now() + chrono::Duration::seconds(2);
        let next = env.retry_copy(eta);

        assert_eq!(next.id, env.id);
        assert_eq!(next.retries, 1);
        assert_eq!(next.eta, Some(eta));
    }

    #[test]
    fn expiry_and_past_eta() {
        let mut env = Envelope::from_signature(Signature::new("x"), TaskId::generate(), now());
        assert!(!env.is_expired(now()));
        env.expires = Some(now() - chrono::Duration::seconds(1));
        assert!(env.is_expired(now()));

        env.eta = Some(now() - chrono::Duration::seconds(5));
        assert_eq!(env.delay_from(now()), None);
    }

    #[test]
    fn null_eta_is_serialized() {
        let env = Envelope::from_signature(Signature::new("x"), TaskId::generate(), now());
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["eta"], json!(null));
        assert!(v.get("group_id").is_none());
        assert!(v.get("link").is_none());
    }
}
