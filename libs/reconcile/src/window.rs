//! Maintenance window evaluation.
//!
//! A window is an hour-of-day start plus a duration in hours. Automatic
//! upgrades are only allowed while the local hour is inside the window.
//!
//! An unconfigured window (missing start, zero duration) or a missing clock
//! reading is treated as "always allowed".
//!
//! For `duration >= 24` the end hour is `start + 24` and is not reduced into
//! 0..=23. That puts hours before `start` outside the window, so
//! `in_window(Some(5), Some(24), Some(0))` is `false`. This matches the
//! historical behavior and is kept on purpose.

use std::fmt;

use chrono::Timelike;

use crate::ReconcileError;

/// Shortest duration accepted from an operator update.
pub const MIN_WINDOW_HOURS: u32 = 3;

/// Longest duration accepted from an operator update.
pub const MAX_WINDOW_HOURS: u32 = 24;

/// A configured maintenance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    /// Start hour, 0..=23.
    pub start: u32,

    /// Duration in hours.
    pub duration: u32,
}

impl MaintenanceWindow {
    /// Window written when none has ever been configured.
    pub const DEFAULT: Self = Self {
        start: 23,
        duration: 6,
    };

    /// Evaluate this window against a point in time.
    pub fn evaluate_at<T: Timelike>(&self, now: &T) -> WindowDecision {
        evaluate(Some(self.start), Some(self.duration), Some(now.hour()))
    }
}

impl Default for MaintenanceWindow {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "start={}h duration={}h", self.start, self.duration)
    }
}

/// The outcome of a window check, with the values that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub start: Option<u32>,
    pub duration: Option<u32>,
    /// Computed end hour, absent when the check failed open.
    pub end: Option<u32>,
    pub hour: Option<u32>,
    pub allowed: bool,
}

impl WindowDecision {
    /// True when no restriction was configured and the check failed open.
    pub fn is_unrestricted(&self) -> bool {
        self.end.is_none()
    }
}

/// Evaluate a window, returning the full decision record.
pub fn evaluate(start: Option<u32>, duration: Option<u32>, hour: Option<u32>) -> WindowDecision {
    let open = WindowDecision {
        start,
        duration,
        end: None,
        hour,
        allowed: true,
    };

    let (Some(start), Some(duration), Some(hour)) = (start, duration, hour) else {
        return open;
    };
    if duration == 0 {
        return open;
    }

    // Saturating so an out-of-range start from storage cannot overflow.
    let end = if duration >= 24 {
        start.saturating_add(24)
    } else {
        start.saturating_add(duration) % 24
    };

    let allowed = if start < end {
        start <= hour && hour <= end
    } else {
        // Wraps past midnight.
        !(end < hour && hour < start)
    };

    WindowDecision {
        start: Some(start),
        duration: Some(duration),
        end: Some(end),
        hour: Some(hour),
        allowed,
    }
}

/// Is `hour` inside the window described by `start` and `duration`.
pub fn in_window(start: Option<u32>, duration: Option<u32>, hour: Option<u32>) -> bool {
    evaluate(start, duration, hour).allowed
}

/// Validate an operator-supplied window before it is persisted.
pub fn validate_window(start: u32, duration: u32) -> Result<MaintenanceWindow, ReconcileError> {
    if start > 23 {
        return Err(ReconcileError::InvalidWindow(format!(
            "start hour {start} should be within 0..=23"
        )));
    }
    if duration <= MIN_WINDOW_HOURS {
        return Err(ReconcileError::InvalidWindow(format!(
            "window should be greater than {MIN_WINDOW_HOURS} hours, got {duration}"
        )));
    }
    if duration > MAX_WINDOW_HOURS {
        return Err(ReconcileError::InvalidWindow(format!(
            "window should be at most {MAX_WINDOW_HOURS} hours, got {duration}"
        )));
    }

    Ok(MaintenanceWindow { start, duration })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use rstest::rstest;

    #[rstest]
    #[case(23, 6, 23, true)]
    #[case(23, 6, 4, true)]
    #[case(23, 6, 10, false)]
    #[case(22, 3, 23, true)]
    #[case(22, 3, 10, false)]
    #[case(1, 8, 1, true)]
    #[case(1, 8, 9, true)]
    #[case(1, 8, 0, false)]
    #[case(1, 8, 10, false)]
    #[case(20, 6, 2, true)]
    #[case(20, 6, 3, false)]
    #[case(20, 6, 19, false)]
    fn test_window_bounds(
        #[case] start: u32,
        #[case] duration: u32,
        #[case] hour: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(in_window(Some(start), Some(duration), Some(hour)), expected);
    }

    #[test]
    fn test_unconfigured_window_fails_open() {
        assert!(in_window(None, None, Some(12)));
        assert!(in_window(None, Some(6), Some(12)));
        assert!(in_window(Some(10), Some(0), Some(3)));
        assert!(in_window(Some(10), None, Some(3)));
        assert!(in_window(Some(0), Some(24), None));

        assert!(evaluate(Some(10), Some(0), Some(3)).is_unrestricted());
    }

    #[test]
    fn test_full_day_window_keeps_literal_end() {
        let decision = evaluate(Some(5), Some(24), Some(0));
        assert_eq!(decision.end, Some(29));
        assert!(!decision.allowed);

        assert!(in_window(Some(5), Some(24), Some(5)));
        assert!(in_window(Some(5), Some(24), Some(23)));

        for hour in 0..24 {
            assert!(in_window(Some(0), Some(24), Some(hour)));
        }
    }

    #[test]
    fn test_out_of_range_start_does_not_overflow() {
        let decision = evaluate(Some(u32::MAX - 1), Some(24), Some(3));
        assert_eq!(decision.end, Some(u32::MAX));
        assert!(!decision.allowed);

        // Only has to evaluate, the verdict for garbage input is unspecified.
        let _ = in_window(Some(u32::MAX), Some(6), Some(3));
        let _ = in_window(Some(7), Some(u32::MAX), Some(3));
    }

    #[test]
    fn test_evaluate_at_uses_hour() {
        let window = MaintenanceWindow::DEFAULT;
        let late = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();

        assert!(window.evaluate_at(&late).allowed);
        assert!(!window.evaluate_at(&noon).allowed);
        assert_eq!(window.evaluate_at(&noon).end, Some(5));
    }

    #[test]
    fn test_validate_window() {
        assert_eq!(
            validate_window(2, 4).unwrap(),
            MaintenanceWindow {
                start: 2,
                duration: 4
            }
        );
        assert!(validate_window(0, 24).is_ok());

        assert!(validate_window(24, 6).is_err());
        assert!(validate_window(1, 3).is_err());
        assert!(validate_window(1, 0).is_err());
        assert!(validate_window(1, 25).is_err());
    }
}
