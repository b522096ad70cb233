use std::time::Duration;

use crate::error::SessionError;

/// Lifecycle of the gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Connected,
    Disconnecting,
}

/// Session data owned by the driver task, its only writer.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionData {
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub heartbeat_interval: Option<Duration>,
    /// The last disconnect allows resuming.
    pub resumable: bool,
}

impl SessionData {
    /// Session id and sequence to resume from, when resuming is allowed.
    pub fn resume_point(&self) -> Option<(String, u64)> {
        if !self.resumable {
            return None;
        }
        Some((self.session_id.clone()?, self.last_sequence?))
    }

    /// Record `seq` if it moves the sequence forward. Returns whether it did.
    pub fn observe_sequence(&mut self, seq: u64) -> bool {
        if self.last_sequence.map_or(true, |last| seq > last) {
            self.last_sequence = Some(seq);
            true
        } else {
            false
        }
    }

    pub fn clear_session(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
        self.resumable = false;
    }
}

/// Copy of the driver's data readable from any handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct Published {
    pub session_id: Option<String>,
    pub last_sequence: Option<u64>,
    pub latency: Option<Duration>,
    pub last_error: Option<SessionError>,
}

impl Published {
    pub fn clear_session(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_only_moves_forward() {
        let mut data = SessionData::default();
        assert!(data.observe_sequence(3));
        assert!(data.observe_sequence(5));
        assert!(!data.observe_sequence(4));
        assert!(!data.observe_sequence(5));
        assert_eq!(data.last_sequence, Some(5));
    }

    #[test]
    fn resume_point_requires_id_sequence_and_flag() {
        let mut data = SessionData { session_id: Some("abc".into()), ..Default::default() };
        data.resumable = true;
        assert_eq!(data.resume_point(), None);

        data.observe_sequence(9);
        assert_eq!(data.resume_point(), Some(("abc".to_owned(), 9)));

        data.resumable = false;
        assert_eq!(data.resume_point(), None);
    }

    #[test]
    fn clear_session_forgets_resume_data() {
        let mut data = SessionData {
            session_id: Some("abc".into()),
            last_sequence: Some(4),
            resumable: true,
            heartbeat_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        data.clear_session();
        assert_eq!(data.resume_point(), None);
        assert_eq!(data.session_id, None);
        assert_eq!(data.last_sequence, None);
    }
}
