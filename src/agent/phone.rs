use crate::protocol::RelayError;

/// Reduce a contact identifier to digits. A bare 10-digit national number
/// gets `country_prefix` prepended.
pub fn normalize(raw: &str, country_prefix: &str) -> Result<String, RelayError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(RelayError::InvalidRequest(format!(
            "contact `{raw}` contains no digits"
        )));
    }
    if digits.len() == 10 {
        return Ok(format!("{country_prefix}{digits}"));
    }
    Ok(digits)
}
