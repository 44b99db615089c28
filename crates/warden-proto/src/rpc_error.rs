// Serializable error wrapper. Native error values do not cross the agent
// boundary; the agent flattens them into (message, is_error, code) and the
// client rebuilds a typed error from `code`.

pub const ALREADY_RUNNING: &str = "already_running";
pub const NOT_RUNNING: &str = "not_running";
pub const NOT_STARTED: &str = "not_started";
pub const SPAWN_FAILED: &str = "spawn_failed";
pub const INTERNAL: &str = "internal";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub is_error: bool,
    #[prost(string, tag = "3")]
    pub code: ::prost::alloc::string::String,
}

impl RpcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: clamp_message(message.into(), MAX_MESSAGE_BYTES),
            is_error: true,
            code: code.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL, message)
    }

    /// Collapse an optional wire error into a result. A present wrapper with
    /// `is_error == false` is a success.
    pub fn check(err: Option<RpcError>) -> Result<(), RpcError> {
        match err {
            Some(e) if e.is_error => Err(e),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.code.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{} ({})", self.message, self.code)
        }
    }
}

impl std::error::Error for RpcError {}

const TRUNCATED: &str = "…(truncated)";

/// Cut `message` to at most `max` bytes on a char boundary, marking the cut.
fn clamp_message(mut message: String, max: usize) -> String {
    if message.len() <= max {
        return message;
    }
    let budget = max.saturating_sub(TRUNCATED.len());
    let cut = message
        .char_indices()
        .map(|(at, _)| at)
        .take_while(|&at| at <= budget)
        .last()
        .unwrap_or(0);
    message.truncate(cut);
    message.push_str(TRUNCATED);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_truncates_long_messages() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let e = RpcError::new(INTERNAL, long);
        assert!(e.message.len() <= MAX_MESSAGE_BYTES);
        assert!(e.message.ends_with("…(truncated)"));
        assert!(e.is_error);
    }

    #[test]
    fn clamp_never_splits_a_char() {
        assert_eq!(clamp_message("short".into(), 16), "short");
        // "…(truncated)" is 14 bytes, leaving 2 for the text; "é" is 2 bytes
        // starting at offset 1.
        assert_eq!(clamp_message("héllo wörld, héllo again".into(), 16), "h…(truncated)");
        assert_eq!(clamp_message("éé".repeat(20), 18), "éé…(truncated)");
    }

    #[test]
    fn check_treats_unset_flag_as_success() {
        assert!(RpcError::check(None).is_ok());
        let ok = RpcError {
            message: String::new(),
            is_error: false,
            code: String::new(),
        };
        assert!(RpcError::check(Some(ok)).is_ok());

        let err = RpcError::check(Some(RpcError::new(ALREADY_RUNNING, "busy"))).unwrap_err();
        assert_eq!(err.code, ALREADY_RUNNING);
        assert_eq!(err.to_string(), "busy (already_running)");
    }
}
