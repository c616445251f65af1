use chrono::{DateTime, Duration, Utc};

use crate::utils::get_elapsed_time;

/// Tracks hold-time expiry and keepalive pacing for one connection.
///
/// The session polls this on a short tick: `is_expired` when nothing has
/// been received for the full hold time, `keepalive_due` when the hold time
/// remaining (counted from the last send) has dropped below two keepalive
/// intervals. Rebuilt whenever the peer negotiates a smaller hold time.
#[derive(Debug)]
pub struct HoldTimer {
    pub(crate) hold_time: u16,
    pub(crate) interval: u16,
    pub(crate) last_sent: DateTime<Utc>,
    pub(crate) last_received: DateTime<Utc>,
}

impl HoldTimer {
    pub fn new(hold_time: u16) -> HoldTimer {
        HoldTimer {
            hold_time,
            interval: hold_time / 3,
            last_received: Utc::now(),
            last_sent: Utc::now(),
        }
    }

    pub fn keepalive_due(&self) -> bool {
        self.get_hold_time().num_seconds() < (2 * i64::from(self.interval))
    }

    pub fn is_expired(&self) -> bool {
        get_elapsed_time(self.last_received) >= Duration::seconds(self.hold_time.into())
    }

    /// Bump the last received to now
    pub fn received(&mut self) {
        self.last_received = Utc::now();
    }

    /// Bump the last sent to now
    pub fn sent(&mut self) {
        self.last_sent = Utc::now();
    }

    // Remaining hold time, counting down from hold_time to 0
    fn get_hold_time(&self) -> Duration {
        let hold_time = Duration::seconds(self.hold_time.into());
        if get_elapsed_time(self.last_sent) > hold_time {
            Duration::seconds(0)
        } else {
            hold_time - get_elapsed_time(self.last_sent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_pacing() {
        let mut ht = HoldTimer::new(30);
        assert_eq!(ht.interval, 10);
        assert!(!ht.is_expired());

        // Nothing due until a third of the hold time has elapsed
        ht.last_sent = ht.last_sent - Duration::seconds(5);
        assert!(!ht.keepalive_due());

        ht.last_sent = ht.last_sent - Duration::seconds(6);
        assert!(ht.keepalive_due());

        ht.sent();
        assert!(!ht.keepalive_due());
    }

    #[test]
    fn test_expiry() {
        let mut ht = HoldTimer::new(30);
        ht.last_received = ht.last_received - Duration::seconds(30);
        assert!(ht.is_expired());

        ht.received();
        assert!(!ht.is_expired());
    }
}
