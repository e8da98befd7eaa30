//! Formatting utilities for log and status messages

use std::time::Duration;

/// Format a freeze-hold or stage duration
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use vmsnap_common::format_elapsed;
/// assert_eq!(format_elapsed(Duration::from_millis(850)), "850ms");
/// assert_eq!(format_elapsed(Duration::from_millis(12_400)), "12.40s");
/// assert_eq!(format_elapsed(Duration::from_secs(65)), "1m 5s");
/// ```
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        let secs = elapsed.as_secs();
        let mins = secs / 60;
        let rem = secs % 60;
        if rem == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {rem}s")
        }
    }
}

/// Render `(target, error)` pairs as `target: error; target: error`
///
/// # Examples
/// ```
/// use vmsnap_common::format_error_list;
/// let errors = vec![("/".to_string(), "EBUSY".to_string())];
/// assert_eq!(format_error_list(&errors), "/: EBUSY");
/// assert_eq!(format_error_list(&[]), "none");
/// ```
pub fn format_error_list(errors: &[(String, String)]) -> String {
    if errors.is_empty() {
        return "none".to_string();
    }
    errors
        .iter()
        .map(|(target, error)| format!("{target}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
