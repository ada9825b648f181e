//! Value formats and time strings.
//!
//! Cells in configuration tables, scan-variable columns in the logfile and the
//! per-axis labels in file names all go through a [`ValueFormat`]. Formats are
//! written the way they appear in the settings files: `%.3f`, `%.2e`, `%g`,
//! `%d`, `%s`, `time.3` and `onoff`.

use crate::error::{AppResult, DaqError};
use crate::hardware::MotorValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Time units accepted by the parser, largest first.
pub const TIME_UNITS: [(&str, f64); 9] = [
    ("h", 3600.0),
    ("min", 60.0),
    ("s", 1.0),
    ("ms", 1e-3),
    ("us", 1e-6),
    ("µs", 1e-6),
    ("ns", 1e-9),
    ("ps", 1e-12),
    ("fs", 1e-15),
];

/// Units used when printing, largest first.
const PRINT_UNITS: [(&str, f64); 5] = [("ms", 1e-3), ("us", 1e-6), ("ns", 1e-9), ("ps", 1e-12), ("fs", 1e-15)];

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)\s*(fs|ps|ns|us|µs|ms|s|min|h)?$")
            .unwrap_or_else(|_| unreachable!("time pattern is a valid regex"))
    })
}

/// Multiplier of a time unit suffix.
pub fn unit_factor(unit: &str) -> Option<f64> {
    TIME_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, factor)| *factor)
}

/// Parse a time string such as `-10us`, `1.5 ms`, `0` or `2e-9` into seconds.
pub fn seconds(text: &str) -> AppResult<f64> {
    let trimmed = text.trim();
    let captures = time_regex()
        .captures(trimmed)
        .ok_or_else(|| DaqError::expression(text, "not a time value"))?;
    let mantissa: f64 = captures[1]
        .parse()
        .map_err(|_| DaqError::expression(text, "bad number"))?;
    let factor = captures
        .get(2)
        .and_then(|unit| unit_factor(unit.as_str()))
        .unwrap_or(1.0);
    Ok(mantissa * factor)
}

/// Format seconds with the largest unit that keeps the mantissa at or above one,
/// `precision` decimal places, trailing zeros removed.
///
/// `time_string(-1e-5, 3) == "-10us"`, `time_string(1.5e-10, 3) == "150ps"`.
pub fn time_string(t: f64, precision: usize) -> String {
    if t.is_nan() {
        return String::new();
    }
    if t == 0.0 {
        return "0".to_string();
    }
    if t.is_infinite() {
        return if t > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let magnitude = t.abs();
    let (unit, factor) = if magnitude >= 1.0 - 0.5 * 10f64.powi(-(precision as i32)) {
        ("s", 1.0)
    } else {
        let mut chosen = PRINT_UNITS[PRINT_UNITS.len() - 1];
        for (i, (name, factor)) in PRINT_UNITS.iter().enumerate() {
            let mantissa = round_to(magnitude / factor, precision);
            if mantissa >= 1.0 {
                // Rounding up to 1000 means the next larger unit reads better.
                chosen = if mantissa >= 1000.0 && i > 0 {
                    PRINT_UNITS[i - 1]
                } else if mantissa >= 1000.0 {
                    ("s", 1.0)
                } else {
                    (*name, *factor)
                };
                break;
            }
        }
        chosen
    };
    let text = format!("{:.*}", precision, t / factor);
    format!("{}{}", trim_zeros(&text), unit)
}

fn round_to(x: f64, decimals: usize) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (x * scale).round() / scale
}

fn trim_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// How a value is rendered as text and parsed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueFormat {
    /// `%.Nf`
    Fixed(usize),
    /// `%.Ne`
    Exponential(usize),
    /// `%g`
    General,
    /// `%d`
    Integer,
    /// `%s` (string-valued motors)
    Text,
    /// `time.N`
    Time(usize),
    /// `onoff` (flags printed as `on` / `off`)
    OnOff,
}

impl Default for ValueFormat {
    fn default() -> Self {
        ValueFormat::General
    }
}

impl FromStr for ValueFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let precision = |digits: &str| {
            digits
                .parse::<usize>()
                .map_err(|_| DaqError::Configuration(format!("bad format precision in '{s}'")))
        };
        match s {
            "%s" => return Ok(ValueFormat::Text),
            "%g" | "" => return Ok(ValueFormat::General),
            "%d" | "%i" => return Ok(ValueFormat::Integer),
            "%f" => return Ok(ValueFormat::Fixed(6)),
            "onoff" => return Ok(ValueFormat::OnOff),
            "time" => return Ok(ValueFormat::Time(3)),
            _ => {}
        }
        if let Some(digits) = s.strip_prefix("time.") {
            return Ok(ValueFormat::Time(precision(digits)?));
        }
        if let Some(body) = s.strip_prefix("%.") {
            if let Some(digits) = body.strip_suffix('f') {
                return Ok(ValueFormat::Fixed(precision(digits)?));
            }
            if let Some(digits) = body.strip_suffix('e') {
                return Ok(ValueFormat::Exponential(precision(digits)?));
            }
            if body.ends_with('g') {
                return Ok(ValueFormat::General);
            }
        }
        Err(DaqError::Configuration(format!("unknown value format '{s}'")))
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFormat::Fixed(p) => write!(f, "%.{p}f"),
            ValueFormat::Exponential(p) => write!(f, "%.{p}e"),
            ValueFormat::General => write!(f, "%g"),
            ValueFormat::Integer => write!(f, "%d"),
            ValueFormat::Text => write!(f, "%s"),
            ValueFormat::Time(p) => write!(f, "time.{p}"),
            ValueFormat::OnOff => write!(f, "onoff"),
        }
    }
}

impl ValueFormat {
    /// Whether values in this format are strings rather than numbers.
    pub fn is_text(&self) -> bool {
        matches!(self, ValueFormat::Text)
    }

    /// Render a number.
    pub fn format_number(&self, value: f64) -> String {
        if value.is_nan() && !matches!(self, ValueFormat::Time(_)) {
            return "nan".to_string();
        }
        match self {
            ValueFormat::Fixed(p) => format!("{value:.p$}"),
            ValueFormat::Exponential(p) => format!("{value:.p$e}"),
            ValueFormat::General => general(value),
            ValueFormat::Integer => format!("{}", value.round() as i64),
            ValueFormat::Text => general(value),
            ValueFormat::Time(p) => time_string(value, *p),
            ValueFormat::OnOff => {
                if value != 0.0 {
                    "on".to_string()
                } else {
                    "off".to_string()
                }
            }
        }
    }

    /// Render a motor value.
    pub fn format_value(&self, value: &MotorValue) -> String {
        match value {
            MotorValue::Number(x) => self.format_number(*x),
            MotorValue::Text(s) => s.clone(),
        }
    }

    /// Parse a cell into a value of this format.
    pub fn parse_value(&self, text: &str) -> AppResult<MotorValue> {
        let text = text.trim();
        match self {
            ValueFormat::Text => Ok(MotorValue::Text(text.to_string())),
            ValueFormat::Time(_) => Ok(MotorValue::Number(seconds(text)?)),
            ValueFormat::OnOff => match text.to_ascii_lowercase().as_str() {
                "on" | "1" | "true" => Ok(MotorValue::Number(1.0)),
                "off" | "0" | "false" => Ok(MotorValue::Number(0.0)),
                _ => Err(DaqError::expression(text, "expected on or off")),
            },
            _ => text
                .parse::<f64>()
                .map(MotorValue::Number)
                .map_err(|_| DaqError::expression(text, "not a number")),
        }
    }
}

fn general(value: f64) -> String {
    let text = format!("{value}");
    if text.len() > 12 {
        let exp = format!("{value:.6e}");
        match exp.split_once('e') {
            Some((mantissa, exponent)) => format!("{}e{}", trim_zeros(mantissa), exponent),
            None => exp,
        }
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds() {
        assert_eq!(seconds("0").unwrap(), 0.0);
        assert!((seconds("-10us").unwrap() + 1e-5).abs() < 1e-18);
        assert!((seconds("1.5 ms").unwrap() - 1.5e-3).abs() < 1e-15);
        assert!((seconds("100ps").unwrap() - 1e-10).abs() < 1e-22);
        assert!((seconds("2e-9").unwrap() - 2e-9).abs() < 1e-22);
        assert_eq!(seconds("2min").unwrap(), 120.0);
        assert!(seconds("ten us").is_err());
        assert!(seconds("1 parsec").is_err());
    }

    #[test]
    fn test_time_string() {
        assert_eq!(time_string(0.0, 3), "0");
        assert_eq!(time_string(-1e-5, 3), "-10us");
        assert_eq!(time_string(1e-4, 3), "100us");
        assert_eq!(time_string(1.5e-10, 3), "150ps");
        assert_eq!(time_string(1.2345e-6, 3), "1.234us");
        assert_eq!(time_string(2.5, 3), "2.5s");
        assert_eq!(time_string(0.9999999e-6, 3), "1us");
    }

    #[test]
    fn test_time_round_trip() {
        for text in ["-10us", "1.234us", "562ps", "3.16ms", "75ns", "1s", "999.9ns"] {
            let t = seconds(text).unwrap();
            let again = seconds(&time_string(t, 3)).unwrap();
            assert!(((again - t) / t).abs() < 1e-3, "{text} -> {again}");
        }
    }

    #[test]
    fn test_value_formats() {
        let f: ValueFormat = "%.3f".parse().unwrap();
        assert_eq!(f.format_number(20.0), "20.000");
        let e: ValueFormat = "%.2e".parse().unwrap();
        assert_eq!(e.format_number(0.00015), "1.50e-4");
        let t: ValueFormat = "time.3".parse().unwrap();
        assert_eq!(t, ValueFormat::Time(3));
        assert_eq!(t.parse_value("1us").unwrap(), MotorValue::Number(1e-6));
        let s: ValueFormat = "%s".parse().unwrap();
        assert_eq!(
            s.parse_value(" PP mode ").unwrap(),
            MotorValue::Text("PP mode".into())
        );
        assert_eq!(ValueFormat::OnOff.format_number(1.0), "on");
        assert!("%q".parse::<ValueFormat>().is_err());
        assert_eq!("%.4f".parse::<ValueFormat>().unwrap().to_string(), "%.4f");
    }
}
