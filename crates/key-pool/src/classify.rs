//! Upstream response classification
//!
//! Only a rejected credential is worth retrying with another key. Rate
//! limits, server errors and validation errors are the caller's answer and
//! are passed through untouched.

/// What the dispatch loop should do with an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// 2xx: return to the caller and account usage.
    Success,
    /// 401: retire the credential and try the next one.
    CredentialRejected,
    /// Any other status: return to the caller verbatim, no retry.
    BusinessError,
}

/// Classify an upstream response by HTTP status.
pub fn classify_status(status: u16) -> UpstreamOutcome {
    match status {
        200..=299 => UpstreamOutcome::Success,
        401 => UpstreamOutcome::CredentialRejected,
        _ => UpstreamOutcome::BusinessError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_2xx_success() {
        assert_eq!(classify_status(200), UpstreamOutcome::Success);
        assert_eq!(classify_status(204), UpstreamOutcome::Success);
    }

    #[test]
    fn classify_401_credential_rejected() {
        assert_eq!(classify_status(401), UpstreamOutcome::CredentialRejected);
    }

    #[test]
    fn classify_403_is_not_a_credential_failure() {
        assert_eq!(classify_status(403), UpstreamOutcome::BusinessError);
    }

    #[test]
    fn classify_429_passes_through() {
        assert_eq!(classify_status(429), UpstreamOutcome::BusinessError);
    }

    #[test]
    fn classify_5xx_passes_through() {
        for status in [500, 502, 503, 504] {
            assert_eq!(classify_status(status), UpstreamOutcome::BusinessError);
        }
    }

    #[test]
    fn classify_400_passes_through() {
        assert_eq!(classify_status(400), UpstreamOutcome::BusinessError);
    }
}
