use thiserror::Error;

/// Default maximum message content length (characters).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2000;

/// Maximum display name length.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 32;

/// Malformed or semantically invalid inbound events. Always logged and
/// dropped; the connection stays open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("channel is required")]
    MissingChannel,
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message too long (max {0} characters)")]
    MessageTooLong(usize),
    #[error("not in any channel")]
    NotInChannel,
    #[error("invalid display name: {0}")]
    InvalidName(String),
}

/// Validate a channel name. Any non-empty string names a channel; names are
/// case-sensitive and taken verbatim.
pub fn validate_channel_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::MissingChannel);
    }
    Ok(())
}

/// Validate message content: non-empty and at most `max_len` characters.
pub fn validate_message(content: &str, max_len: usize) -> Result<(), ProtocolError> {
    if content.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if content.chars().count() > max_len {
        return Err(ProtocolError::MessageTooLong(max_len));
    }
    Ok(())
}

/// Validate a display name taken from the upgrade request.
/// Allowed: alphanumeric plus `_`, `-`, `.` and inner spaces.
pub fn validate_display_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.trim() != name {
        return Err(ProtocolError::InvalidName(
            "must be non-empty without surrounding whitespace".into(),
        ));
    }
    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ProtocolError::InvalidName(format!(
            "too long (max {MAX_DISPLAY_NAME_LENGTH} characters)"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '))
    {
        return Err(ProtocolError::InvalidName("contains invalid characters".into()));
    }
    Ok(())
}
