//! Period-over-period trend and linear forecast.

use crate::result_mapper::round2;
use crate::views::ViewCostData;

/// The previous window ends one second before `after` and spans the same
/// duration as `[after, before]`.
pub const WINDOW_GAP_MS: i64 = 1_000;

pub fn previous_window(after: i64, before: i64) -> (i64, i64) {
    let duration = before - after;
    (after - duration - WINDOW_GAP_MS, after - WINDOW_GAP_MS)
}

/// `(current - previous) / previous * 100`, rounded to cents; `None` when the
/// previous cost is unknown or zero.
pub fn trend_percentage(current: f64, previous: Option<f64>) -> Option<f64> {
    let previous = previous?;
    if previous == 0.0 {
        return None;
    }
    Some(round2((current - previous) / previous * 100.0))
}

/// Linear extrapolation of `current` over `[after, before]`. Elapsed time
/// ends at the earliest of the last observed start time, `now` and `before`.
pub fn forecast(current: &ViewCostData, after: i64, before: i64, now: i64) -> f64 {
    let total = before - after;
    let observed_end = current.max_start_time.unwrap_or(now);
    let end = observed_end.min(now).min(before);
    let elapsed = end - after;
    if elapsed <= 0 || total <= 0 || elapsed >= total {
        return current.cost;
    }
    current.cost * (total as f64 / elapsed as f64)
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `$1,234.56`-style display of a cost.
pub fn format_cost(value: f64) -> String {
    let rounded = round2(value);
    let negative = rounded < 0.0;
    let cents = (rounded.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}${grouped}.{:02}", if negative { "-" } else { "" }, cents % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn previous_window_is_contiguous_and_same_length() {
        let (prev_after, prev_before) = previous_window(10 * DAY, 17 * DAY);
        assert_eq!(prev_before, 10 * DAY - 1_000);
        assert_eq!(prev_before - prev_after, 7 * DAY);
    }

    #[test]
    fn trend_of_doubling_is_one_hundred_percent() {
        assert_eq!(trend_percentage(700.0, Some(350.0)), Some(100.0));
        assert_eq!(trend_percentage(350.0, Some(350.0)), Some(0.0));
        assert_eq!(trend_percentage(10.0, Some(0.0)), None);
        assert_eq!(trend_percentage(10.0, None), None);
    }

    #[test]
    fn forecast_extrapolates_half_week() {
        let t = 100 * DAY;
        let current = ViewCostData {
            cost: 700.0,
            min_start_time: Some(t),
            max_start_time: Some(t + 3 * DAY + DAY / 2),
        };
        assert_eq!(forecast(&current, t, t + 7 * DAY, t + 5 * DAY), 1400.0);
    }

    #[test]
    fn forecast_edges_return_current() {
        let current = ViewCostData {
            cost: 42.5,
            min_start_time: None,
            max_start_time: Some(7 * DAY),
        };
        // Full window elapsed
        assert_eq!(forecast(&current, 0, 7 * DAY, 30 * DAY), 42.5);
        // Nothing elapsed yet
        let early = ViewCostData {
            max_start_time: Some(0),
            ..current
        };
        assert_eq!(forecast(&early, 0, 7 * DAY, 30 * DAY), 42.5);
    }

    #[test]
    fn open_window_uses_now() {
        let current = ViewCostData {
            cost: 100.0,
            min_start_time: None,
            max_start_time: None,
        };
        assert_eq!(forecast(&current, 0, 10 * DAY, 5 * DAY), 200.0);
    }

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(700.0), "$700.00");
        assert_eq!(format_cost(1234567.891), "$1,234,567.89");
        assert_eq!(format_cost(-5.5), "-$5.50");
    }
}
