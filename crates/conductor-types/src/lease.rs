//! Leader lease row for distributed operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Singleton lease row backing leader election.
///
/// Invariant: at any wall-clock instant, at most one holder has
/// `expires_at > now` (assuming a linearizable lease store and clock skew
/// below the TTL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub holder_instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaderLease {
    /// Whether the lease has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds the lease.
    Acquired(LeaderLease),
    /// Another live holder owns the lease.
    HeldByOther { holder_instance_id: String },
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Renewal succeeded; the TTL was extended.
    Renewed,
    /// The caller no longer holds the lease (row replaced or expired).
    Lost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = LeaderLease {
            holder_instance_id: "node-a".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(10),
        };
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + Duration::seconds(10)));
        assert!(lease.is_expired(now + Duration::seconds(11)));
    }
}
