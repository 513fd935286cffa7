use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid params: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("command {command} timed out")]
    Timeout { command: String },

    #[error("connection lost")]
    ConnectionLost,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("link closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl LinkError {
    /// Map an error string reported by the opposite party. Executors encode
    /// typed failures with the `not found:` / `invalid params:` prefixes;
    /// everything else is an opaque remote failure.
    pub(crate) fn from_remote(message: String) -> Self {
        if let Some(rest) = message.strip_prefix("not found: ") {
            LinkError::NotFound(rest.to_string())
        } else if let Some(rest) = message.strip_prefix("invalid params: ") {
            LinkError::Validation(rest.to_string())
        } else {
            LinkError::Remote(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_prefixes_map_to_typed_errors() {
        let err = LinkError::from_remote("not found: node 9:12".to_string());
        assert!(matches!(err, LinkError::NotFound(ref what) if what == "node 9:12"));

        let err = LinkError::from_remote("invalid params: width is required".to_string());
        assert!(matches!(err, LinkError::Validation(ref what) if what == "width is required"));

        let err = LinkError::from_remote("boom".to_string());
        assert!(matches!(err, LinkError::Remote(ref msg) if msg == "boom"));
    }
}
