//! Time-related utilities

/// Current wall-clock time as an RFC 3339 string, for status files and logs.
pub fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_now_is_utc() {
        let now = rfc3339_now();
        assert!(now.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
