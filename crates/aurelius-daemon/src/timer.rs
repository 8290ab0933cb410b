use crate::error::Notify;
use std::time::{
    Duration,
    Instant,
};

/// Watchdog over one side of a session. It is created with a time budget and the notification to raise when that budget passes without
/// the peer showing life, and it paces our own keepalives at a third of the budget during the established phase. A budget of zero
/// disables both directions of the watchdog, as RFC 4271 requires for a negotiated hold time of zero.
#[derive(Debug)]
pub struct SessionTimer {
    holdtime: Duration,
    last_read: Instant,
    last_sent: Instant,
    code: u8,
    subcode: u8,
    diagnostic: &'static str,
}

impl SessionTimer {
    pub fn new(now: Instant, holdtime: Duration, code: u8, subcode: u8, diagnostic: &'static str) -> Self {
        Self {
            holdtime,
            last_read: now,
            last_sent: now,
            code,
            subcode,
            diagnostic,
        }
    }

    /// Feed one observation into the watchdog. `alive` is whether a complete message (of any type) arrived since the last tick; silence
    /// beyond the budget raises the configured notification.
    pub fn tick(&mut self, alive: bool, now: Instant) -> Result<(), Notify> {
        if self.holdtime.is_zero() {
            return Ok(());
        }
        if alive {
            self.last_read = now;
            return Ok(());
        }
        if now.duration_since(self.last_read) > self.holdtime {
            return Err(Notify::new(self.code, self.subcode, self.diagnostic));
        }
        Ok(())
    }

    /// Whether it is time to refresh the peer's hold timer with a keepalive of our own. Answering `true` counts as having sent one.
    pub fn keepalive_due(&mut self, now: Instant) -> bool {
        if self.holdtime.is_zero() {
            return false;
        }
        if now.duration_since(self.last_sent) >= self.holdtime / 3 {
            self.last_sent = now;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::SessionTimer;
    use std::time::{
        Duration,
        Instant,
    };

    #[test]
    fn test_expiry_on_silence() {
        let start = Instant::now();
        let mut timer = SessionTimer::new(start, Duration::from_secs(90), 4, 0, "hold timer expired");

        assert!(timer.tick(false, start + Duration::from_secs(89)).is_ok());
        let expired = timer.tick(false, start + Duration::from_secs(91)).unwrap_err();
        assert_eq!((expired.code, expired.subcode), (4, 0));
    }

    #[test]
    fn test_messages_refresh_the_budget() {
        let start = Instant::now();
        let mut timer = SessionTimer::new(start, Duration::from_secs(90), 4, 0, "hold timer expired");

        assert!(timer.tick(true, start + Duration::from_secs(89)).is_ok());
        assert!(timer.tick(false, start + Duration::from_secs(178)).is_ok());
        assert!(timer.tick(false, start + Duration::from_secs(180)).is_err());
    }

    #[test]
    fn test_keepalive_cadence() {
        let start = Instant::now();
        let mut timer = SessionTimer::new(start, Duration::from_secs(90), 4, 0, "hold timer expired");

        assert!(!timer.keepalive_due(start + Duration::from_secs(29)));
        assert!(timer.keepalive_due(start + Duration::from_secs(30)));
        // answering true armed the next period
        assert!(!timer.keepalive_due(start + Duration::from_secs(31)));
        assert!(timer.keepalive_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_holdtime_disables_the_watchdog() {
        let start = Instant::now();
        let mut timer = SessionTimer::new(start, Duration::ZERO, 4, 0, "hold timer expired");

        assert!(timer.tick(false, start + Duration::from_secs(3600)).is_ok());
        assert!(!timer.keepalive_due(start + Duration::from_secs(3600)));
    }
}
