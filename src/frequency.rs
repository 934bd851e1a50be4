//! Canonical frequency parsing and the half-open interval convention.
//!
//! Providers express their native sampling interval as a short string
//! (`"10min"`, `"1h"`, `"15min"`). This mirrors `pandas.tseries.frequencies.to_offset`
//! closely enough for the unit suffixes the two providers in this crate use
//! (`min`, `h`, `d`) without depending on a pandas-equivalent crate.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::MeteoError;

/// Which endpoints of a provider's canonical grid are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inclusive {
    Left,
    Right,
    Both,
}

impl Default for Inclusive {
    fn default() -> Self {
        // Provider adapters consistently use closed grids; see spec.md §9.
        Inclusive::Both
    }
}

/// Parse a frequency string like `"10min"`, `"1h"`, `"15min"`, `"1d"` into a
/// [`chrono::Duration`]. Returns [`MeteoError::BadFrequency`] on anything
/// unparsable, which callers convert into the Gap Finder's error fallback.
pub fn parse_freq(freq: &str) -> Result<Duration, MeteoError> {
    let freq = freq.trim();
    let split_at = freq
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| MeteoError::BadFrequency(freq.to_string()))?;

    let (num_part, unit_part) = freq.split_at(split_at);
    let num: i64 = if num_part.is_empty() {
        1
    } else {
        num_part
            .parse()
            .map_err(|_| MeteoError::BadFrequency(freq.to_string()))?
    };

    let unit = unit_part.trim().to_ascii_lowercase();
    let duration = match unit.as_str() {
        "s" | "sec" | "second" | "seconds" => Duration::seconds(num),
        "min" | "minute" | "minutes" | "t" => Duration::minutes(num),
        "h" | "hr" | "hour" | "hours" => Duration::hours(num),
        "d" | "day" | "days" => Duration::days(num),
        "w" | "week" | "weeks" => Duration::weeks(num),
        _ => return Err(MeteoError::BadFrequency(freq.to_string())),
    };

    if duration <= Duration::zero() {
        return Err(MeteoError::BadFrequency(freq.to_string()));
    }

    Ok(duration)
}
