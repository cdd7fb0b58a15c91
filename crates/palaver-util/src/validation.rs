use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("invalid characters")]
    InvalidCharacters,
    #[error("invalid format")]
    InvalidFormat,
}

/// Phone numbers are the account handle: optional leading `+`, then digits.
pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    let len = digits.len();
    if len < 5 {
        return Err(ValidationError::TooShort { min: 5, got: len });
    }
    if len > 20 {
        return Err(ValidationError::TooLong { max: 20, got: len });
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

pub fn validate_username(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 40 {
        return Err(ValidationError::TooLong { max: 40, got: len });
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Message bodies are capped at 64 KiB of UTF-8.
pub fn validate_message_content(content: &str) -> Result<(), ValidationError> {
    let len = content.len();
    if len < 1 {
        return Err(ValidationError::TooShort { min: 1, got: len });
    }
    if len > 65536 {
        return Err(ValidationError::TooLong { max: 65536, got: len });
    }
    Ok(())
}
