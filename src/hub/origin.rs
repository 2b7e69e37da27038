/// Allow-list of caller origins, checked before any routing.
///
/// Entries are exact origins (`app://switchboard`), `*` for any caller, or
/// `scheme://host:*` for any port on a host.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    /// A call without an origin is never allowed.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin.map(|o| o.trim().trim_end_matches('/')) else {
            return false;
        };
        if origin.is_empty() {
            return false;
        }
        self.allowed.iter().any(|entry| Self::matches(entry, origin))
    }

    fn matches(entry: &str, origin: &str) -> bool {
        if entry == "*" || entry == origin {
            return true;
        }
        match entry.strip_suffix(":*") {
            Some(prefix) => origin
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit())),
            None => false,
        }
    }
}
