use lettre::Address;

use crate::{error::IntakeError, models::notification::NotificationRequest};

const MAX_REQUEST_ID_LEN: usize = 128;
const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 0..=10;

pub fn validate_request(request: &NotificationRequest) -> Result<(), IntakeError> {
    if request.request_id.trim().is_empty() {
        return Err(IntakeError::Validation("request_id cannot be empty".into()));
    }

    if request.request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(IntakeError::Validation(format!(
            "request_id too long (maximum {} characters)",
            MAX_REQUEST_ID_LEN
        )));
    }

    if request.user_id.trim().is_empty() {
        return Err(IntakeError::Validation("user_id cannot be empty".into()));
    }

    if request.template_code.trim().is_empty() {
        return Err(IntakeError::Validation("template_code cannot be empty".into()));
    }

    if !PRIORITY_RANGE.contains(&request.priority) {
        return Err(IntakeError::Validation(format!(
            "priority must be between {} and {}",
            PRIORITY_RANGE.start(),
            PRIORITY_RANGE.end()
        )));
    }

    Ok(())
}

pub fn validate_fcm_token(token: &str) -> Result<(), IntakeError> {
    if token.is_empty() {
        return Err(IntakeError::Validation("Device token cannot be empty".into()));
    }

    if token.len() < 20 {
        return Err(IntakeError::Validation(
            "Device token too short (minimum 20 characters)".into(),
        ));
    }

    if token.len() > 200 {
        return Err(IntakeError::Validation(
            "Device token too long (maximum 200 characters)".into(),
        ));
    }

    let valid_chars = token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.');

    if !valid_chars {
        return Err(IntakeError::Validation(
            "Device token contains invalid characters".into(),
        ));
    }

    Ok(())
}

pub fn validate_email_address(address: &str) -> Result<(), IntakeError> {
    address
        .parse::<Address>()
        .map(|_| ())
        .map_err(|e| IntakeError::Validation(format!("Invalid email address: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::models::notification::Channel;

    fn request() -> NotificationRequest {
        NotificationRequest {
            request_id: "r1".into(),
            user_id: "u1".into(),
            channel: Channel::Email,
            template_code: "welcome".into(),
            variables: HashMap::new(),
            priority: 1,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate_request(&request()).is_ok());
    }

    #[test]
    fn rejects_blank_identifiers() {
        let mut blank_request = request();
        blank_request.request_id = "  ".into();
        assert!(validate_request(&blank_request).is_err());

        let mut blank_template = request();
        blank_template.template_code = String::new();
        assert!(validate_request(&blank_template).is_err());
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let mut req = request();
        req.priority = 11;
        assert!(matches!(validate_request(&req), Err(IntakeError::Validation(_))));
    }

    #[test]
    fn fcm_token_rules() {
        assert!(validate_fcm_token("dGVzdF90b2tlbl9mb3JfZmNtOmFiYw").is_ok());
        assert!(validate_fcm_token("short").is_err());
        assert!(validate_fcm_token("invalid token with spaces!!").is_err());
    }

    #[test]
    fn email_address_rules() {
        assert!(validate_email_address("ada@example.com").is_ok());
        assert!(validate_email_address("not-an-email").is_err());
    }
}
