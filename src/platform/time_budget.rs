//! The `--time` budget for a fuzzing session.
//!
//! A budget is one or more `<number><unit>` terms, e.g. `90s`, `1h30m` or
//! `1.5m`. Units are `ms`, `s`, `m` and `h`.

use std::str::FromStr;
use std::time::Duration;

use crate::{RestFuzzError, RestFuzzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget(pub Duration);

impl FromStr for TimeBudget {
    type Err = RestFuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_time_budget(s).map(Self)
    }
}

fn unit_millis(unit: &str) -> Option<f64> {
    match unit {
        "ms" => Some(1.0),
        "s" => Some(1_000.0),
        "m" => Some(60_000.0),
        "h" => Some(3_600_000.0),
        _ => None,
    }
}

fn bad_budget(input: &str, why: &str) -> RestFuzzError {
    RestFuzzError::InvalidArgument(format!("invalid --time {input:?}: {why}"))
}

pub fn parse_time_budget(input: &str) -> RestFuzzResult<Duration> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(bad_budget(input, "empty"));
    }

    let mut millis = 0f64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_end);
        if num.is_empty() {
            return Err(bad_budget(input, "expected a number before each unit"));
        }
        let value: f64 = num
            .parse()
            .map_err(|_| bad_budget(input, &format!("{num:?} is not a number")))?;

        let unit_end = tail.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        if unit.is_empty() {
            return Err(bad_budget(input, "missing unit (ms, s, m or h)"));
        }
        let scale = unit_millis(unit).ok_or_else(|| bad_budget(input, &format!("unknown unit {unit:?}")))?;
        millis += value * scale;
        rest = tail;
    }

    if !millis.is_finite() || millis < 1.0 {
        return Err(bad_budget(input, "budget must be at least 1ms"));
    }
    Ok(Duration::from_millis(millis.round() as u64))
}
