//! Sentinel message text shared by the challenger and the staleness checker

use std::fmt::Write;
use std::time::Duration;

/// Prefix put in front of every tracked condition message when challenging
pub const CHALLENGE_PREFIX: &str =
    "Checking for stale status, the active operator will reset this message: ";

/// Reason written on every tracked condition when staleness is declared
pub const STALE_REASON: &str = "OperatorFailedStalenessCheck";

/// Leading text of every staleness message
pub const STALE_MESSAGE_PREFIX: &str = "Operator has not fixed status in at least ";

/// Message asking the owner to reassert `original`
pub fn challenge_message(original: &str) -> String {
    format!("{CHALLENGE_PREFIX}{original}")
}

/// The owner's message with the challenge prefix removed
pub fn strip_challenge(message: &str) -> &str {
    message.strip_prefix(CHALLENGE_PREFIX).unwrap_or(message)
}

pub fn is_challenge_message(message: &str) -> bool {
    message.starts_with(CHALLENGE_PREFIX)
}

pub fn is_stale_message(message: &str) -> bool {
    message.starts_with(STALE_MESSAGE_PREFIX)
}

/// Explanation written when the owner failed to answer within `grace`
pub fn stale_message(grace: Duration, last_reason: &str, last_message: &str) -> String {
    format!(
        "{STALE_MESSAGE_PREFIX}{}.  Last reason was \"{last_reason}\", last status was: {last_message}",
        format_go_duration(grace)
    )
}

/// Format a duration the way Go's `time.Duration.String` does
/// (`1m0s`, `1h0m0s`, `1.5s`, `250ms`).
pub fn format_go_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000));
    }

    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = u128::from(total_secs % 60) * 1_000_000_000 + u128::from(duration.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{}s", decimal(secs, 1_000_000_000));
    out
}

/// `value / scale` with trailing fractional zeros trimmed
fn decimal(value: u128, scale: u128) -> String {
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let width = scale.to_string().len() - 1;
    let digits = format!("{frac:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
