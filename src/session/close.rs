//! Classification of gateway close codes.

/// What a close means for the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Reconnect and resume the existing session.
    Resumable,
    /// Reconnect with a brand-new session.
    Fresh,
    /// Stop; retrying cannot succeed without caller action.
    Fatal,
}

/// Close code the client uses when it drops a connection it wants to resume.
pub const RESUMABLE_CLOSE: u16 = 4000;
/// Close code the client uses on logout.
pub const NORMAL_CLOSE: u16 = 1000;

pub fn classify(code: Option<u16>) -> CloseClass {
    match code {
        Some(4004 | 4010 | 4011 | 4012 | 4013 | 4014) => CloseClass::Fatal,
        Some(1000 | 4006 | 4007 | 4009) => CloseClass::Fresh,
        _ => CloseClass::Resumable,
    }
}

pub fn describe(code: Option<u16>) -> &'static str {
    match code {
        None => "connection dropped",
        Some(1000) => "normal closure",
        Some(1001) => "going away",
        Some(1006) => "abnormal closure",
        Some(4000) => "unknown error",
        Some(4001) => "unknown opcode",
        Some(4002) => "decode error",
        Some(4003) => "not authenticated",
        Some(4004) => "authentication failed",
        Some(4005) => "already authenticated",
        Some(4006) => "session no longer valid",
        Some(4007) => "invalid sequence",
        Some(4008) => "rate limited",
        Some(4009) => "session timed out",
        Some(4010) => "invalid shard",
        Some(4011) => "sharding required",
        Some(4012) => "invalid api version",
        Some(4013) => "invalid intents",
        Some(4014) => "disallowed intents",
        Some(_) => "unrecognized close code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_and_shard_errors_are_fatal() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            assert_eq!(classify(Some(code)), CloseClass::Fatal, "{}", code);
        }
    }

    #[test]
    fn invalidated_sessions_start_fresh() {
        for code in [1000, 4006, 4007, 4009] {
            assert_eq!(classify(Some(code)), CloseClass::Fresh, "{}", code);
        }
    }

    #[test]
    fn everything_else_resumes() {
        for code in [1001, 1006, 1011, 1012, 4000, 4001, 4002, 4003, 4005, 4008] {
            assert_eq!(classify(Some(code)), CloseClass::Resumable, "{}", code);
        }
        assert_eq!(classify(None), CloseClass::Resumable);
        assert_eq!(classify(Some(RESUMABLE_CLOSE)), CloseClass::Resumable);
    }

    #[test]
    fn descriptions() {
        assert_eq!(describe(Some(4004)), "authentication failed");
        assert_eq!(describe(Some(4999)), "unrecognized close code");
        assert_eq!(describe(None), "connection dropped");
    }
}
