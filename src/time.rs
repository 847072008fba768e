//! Valid-time intervals for bitemporal document versions.
//!
//! The store is bitemporal:
//! - **Valid Time**: when a fact is true in the modeled world (set by the origin)
//! - **Transaction Time**: when the store learned it (set on submit)
//!
//! A document version is valid over a half-open interval that ends where the
//! next version for the same key begins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A range of valid time (half-open interval: [from, to)).
///
/// # Examples
///
/// ```
/// use scangraph::TimeRange;
/// use chrono::Utc;
///
/// let start = Utc::now();
/// let mut range = TimeRange::starting_at(start);
/// assert!(range.to.is_none());
/// range.close_at(start + chrono::Duration::hours(1)).unwrap();
/// assert!(range.to.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start of the range (inclusive).
    pub from: DateTime<Utc>,

    /// End of the range (exclusive). None means open-ended.
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Creates an open-ended time range starting at the given time.
    #[must_use]
    pub const fn starting_at(from: DateTime<Utc>) -> Self {
        Self { from, to: None }
    }

    /// Closes the range at `at`. A close time equal to the start yields an
    /// empty interval, which happens when a later transaction corrects a
    /// version at the same valid time.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MalformedPayload` if the close time is before the start.
    pub fn close_at(&mut self, at: DateTime<Utc>) -> Result<(), ValidationError> {
        if at < self.from {
            return Err(ValidationError::MalformedPayload {
                reason: format!("cannot close range starting {} at {at}", self.from),
            });
        }
        self.to = Some(at);
        Ok(())
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to {
            Some(to) => write!(f, "[{} → {})", self.from, to),
            None => write!(f, "[{} → ∞)", self.from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_close_at_same_instant_is_empty() {
        let now = Utc::now();
        let mut range = TimeRange::starting_at(now);
        range.close_at(now).unwrap();
        assert_eq!(range.to, Some(range.from));
    }

    #[test]
    fn test_close_at_before_start_fails() {
        let now = Utc::now();
        let mut range = TimeRange::starting_at(now);
        assert!(range.close_at(now - Duration::seconds(1)).is_err());
    }

    #[test]
    fn test_display() {
        let range = TimeRange::starting_at(Utc::now());
        assert!(format!("{range}").contains('∞'));
    }
}
