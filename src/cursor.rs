//! `Stream-Cursor` generation.
//!
//! Cursors bucket time into fixed intervals so that cacheable live reads
//! from many clients collapse onto the same URL within an interval,
//! without ever letting a client's cursor run backwards. When a client
//! presents a cursor at or ahead of the current interval, the response
//! cursor jumps past it with random jitter to break cache loops.

use chrono::{DateTime, Utc};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Interval duration in seconds.
    pub interval_seconds: u64,
    /// Epoch the intervals are counted from.
    pub epoch: DateTime<Utc>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            interval_seconds: 20,
            epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }
}

impl CursorOptions {
    /// Number of whole intervals elapsed since the epoch.
    pub fn current_interval(&self) -> u64 {
        let elapsed = Utc::now()
            .signed_duration_since(self.epoch)
            .num_seconds()
            .max(0) as u64;
        elapsed / self.interval_seconds.max(1)
    }

    /// Compute the cursor to return, guaranteed `>= client_cursor`.
    pub fn response_cursor(&self, client_cursor: Option<u64>) -> u64 {
        let current = self.current_interval();
        match client_cursor {
            // The client is at or past the current interval; advance past
            // it with jitter so repeated requests vary.
            Some(cursor) if cursor >= current => {
                let jitter_seconds = rand::thread_rng().gen_range(1..=3600u64);
                let jitter = (jitter_seconds / self.interval_seconds.max(1)).max(1);
                cursor + jitter
            }
            Some(cursor) => current.max(cursor),
            None => current,
        }
    }
}

/// Parse a client-provided cursor value.
pub fn parse_cursor(cursor: &str) -> Option<u64> {
    cursor.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_counts_elapsed_time() {
        let options = CursorOptions {
            interval_seconds: 20,
            epoch: Utc::now() - chrono::Duration::seconds(100),
        };
        let interval = options.current_interval();
        assert!((4..=6).contains(&interval));
    }

    #[test]
    fn response_without_client_cursor_is_current_interval() {
        let options = CursorOptions {
            interval_seconds: 20,
            epoch: Utc::now() - chrono::Duration::seconds(1000),
        };
        let cursor = options.response_cursor(None);
        assert_eq!(cursor, options.current_interval());
    }

    #[test]
    fn stale_client_cursor_catches_up_without_regressing() {
        let options = CursorOptions {
            interval_seconds: 20,
            epoch: Utc::now() - chrono::Duration::seconds(1000),
        };
        let current = options.current_interval();
        assert_eq!(options.response_cursor(Some(current - 10)), current);
    }

    #[test]
    fn ahead_client_cursor_always_advances() {
        let options = CursorOptions::default();
        let ahead = options.current_interval() + 100;
        assert!(options.response_cursor(Some(ahead)) > ahead);
    }

    #[test]
    fn parse_accepts_only_integers() {
        assert_eq!(parse_cursor("12345"), Some(12345));
        assert_eq!(parse_cursor("nope"), None);
        assert_eq!(parse_cursor(""), None);
    }
}
