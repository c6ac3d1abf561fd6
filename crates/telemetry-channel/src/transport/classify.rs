// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use crate::error::TransportError;

/// Retryable vs. fatal classification of transport failures.
///
/// By default 5xx, 408 and 429 are retryable along with network errors and
/// timeouts. A custom status set replaces the status rule entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorClassifier {
    retryable_statuses: Option<HashSet<u16>>,
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(retryable_statuses: Option<HashSet<u16>>) -> Self {
        Self { retryable_statuses }
    }

    #[must_use]
    pub fn is_retryable(&self, error: &TransportError) -> bool {
        match error {
            TransportError::Http { status, .. } => match &self.retryable_statuses {
                Some(statuses) => statuses.contains(status),
                None => *status >= 500 || *status == 408 || *status == 429,
            },
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::InvalidRequest(_) | TransportError::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> TransportError {
        TransportError::Http {
            status,
            retry_after: None,
        }
    }

    #[test]
    fn test_default_classification() {
        let classifier = ErrorClassifier::default();
        for status in [500, 502, 503, 599, 408, 429] {
            assert!(classifier.is_retryable(&http(status)), "{status}");
        }
        for status in [400, 401, 403, 404, 413] {
            assert!(!classifier.is_retryable(&http(status)), "{status}");
        }
        assert!(classifier.is_retryable(&TransportError::Timeout));
        assert!(classifier.is_retryable(&TransportError::Network("reset".to_string())));
        assert!(!classifier.is_retryable(&TransportError::InvalidRequest("bad".to_string())));
    }

    #[test]
    fn test_custom_statuses_replace_default_rule() {
        let classifier = ErrorClassifier::new(Some([503, 401].into_iter().collect()));
        assert!(classifier.is_retryable(&http(503)));
        assert!(classifier.is_retryable(&http(401)));
        assert!(!classifier.is_retryable(&http(500)));
        assert!(!classifier.is_retryable(&http(429)));
        // Network errors stay retryable.
        assert!(classifier.is_retryable(&TransportError::Timeout));
    }
}
