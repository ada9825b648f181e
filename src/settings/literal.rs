//! Literal values stored in settings files.
//!
//! Values are written in the familiar literal notation used by the beamline
//! settings files: `None`, `True`/`False`, integers, floats (`nan`, `inf`),
//! single- or double-quoted strings, and `[...]` lists / `(...)` tuples.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A parsed settings value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Float literal (including `nan`, `inf`, `-inf`)
    Float(f64),
    /// Quoted string
    Str(String),
    /// List or tuple
    List(Vec<SettingValue>),
}

impl SettingValue {
    /// Parse a literal.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut parser = LiteralParser {
            chars: text.trim().chars().collect(),
            pos: 0,
            text,
        };
        let value = parser.value()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(value)
    }

    /// Numeric view, if the value is a number or bool.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(i) => Some(*i as f64),
            SettingValue::Float(f) => Some(*f),
            SettingValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Integer view.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Bool(b) => Some(i64::from(*b)),
            SettingValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Boolean view (Python truthiness for numbers).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::Str(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Str(v)
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::None => write!(f, "None"),
            SettingValue::Bool(true) => write!(f, "True"),
            SettingValue::Bool(false) => write!(f, "False"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Float(x) if x.is_nan() => write!(f, "nan"),
            SettingValue::Float(x) if x.is_infinite() => {
                write!(f, "{}", if *x > 0.0 { "inf" } else { "-inf" })
            }
            SettingValue::Float(x) if x.fract() == 0.0 && x.abs() < 1e16 => write!(f, "{x:.1}"),
            SettingValue::Float(x) => write!(f, "{x}"),
            SettingValue::Str(s) => {
                write!(f, "'")?;
                for c in s.chars() {
                    match c {
                        '\\' => write!(f, "\\\\")?,
                        '\'' => write!(f, "\\'")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "'")
            }
            SettingValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

struct LiteralParser<'a> {
    chars: Vec<char>,
    pos: usize,
    text: &'a str,
}

impl LiteralParser<'_> {
    fn error(&self, reason: &str) -> DaqError {
        DaqError::Settings(format!("{reason} at {} in {:?}", self.pos, self.text))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> AppResult<SettingValue> {
        self.skip_ws();
        match self.peek() {
            Some('\'') | Some('"') => self.string(),
            Some('[') => self.sequence(']'),
            Some('(') => self.sequence(')'),
            Some(_) => self.atom(),
            None => Err(self.error("unexpected end")),
        }
    }

    fn string(&mut self) -> AppResult<SettingValue> {
        let quote = self.chars[self.pos];
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(SettingValue::Str(out));
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn sequence(&mut self, close: char) -> AppResult<SettingValue> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(SettingValue::List(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {}
                _ => return Err(self.error("expected ',' or closing bracket")),
            }
        }
    }

    fn atom(&mut self) -> AppResult<SettingValue> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_whitespace() && !matches!(c, ',' | ']' | ')'))
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "None" => Ok(SettingValue::None),
            "True" => Ok(SettingValue::Bool(true)),
            "False" => Ok(SettingValue::Bool(false)),
            "nan" | "NaN" => Ok(SettingValue::Float(f64::NAN)),
            "inf" => Ok(SettingValue::Float(f64::INFINITY)),
            "-inf" => Ok(SettingValue::Float(f64::NEG_INFINITY)),
            _ => {
                if let Ok(i) = word.parse::<i64>() {
                    Ok(SettingValue::Int(i))
                } else if let Ok(x) = word.parse::<f64>() {
                    Ok(SettingValue::Float(x))
                } else {
                    Err(self.error(&format!("unrecognised literal {word:?}")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(SettingValue::parse("None").unwrap(), SettingValue::None);
        assert_eq!(SettingValue::parse("True").unwrap(), SettingValue::Bool(true));
        assert_eq!(SettingValue::parse(" 42 ").unwrap(), SettingValue::Int(42));
        assert_eq!(SettingValue::parse("-1.5e-3").unwrap(), SettingValue::Float(-1.5e-3));
        assert!(SettingValue::parse("nan").unwrap().as_f64().unwrap().is_nan());
    }

    #[test]
    fn test_parse_strings_and_lists() {
        assert_eq!(
            SettingValue::parse(r#"'Delay,Laser_on,Repeat=16'"#).unwrap(),
            SettingValue::Str("Delay,Laser_on,Repeat=16".into())
        );
        assert_eq!(
            SettingValue::parse(r#""it\'s""#).unwrap(),
            SettingValue::Str("it's".into())
        );
        assert_eq!(
            SettingValue::parse("[1, 'a', (2.5, None)]").unwrap(),
            SettingValue::List(vec![
                SettingValue::Int(1),
                SettingValue::Str("a".into()),
                SettingValue::List(vec![SettingValue::Float(2.5), SettingValue::None]),
            ])
        );
    }

    #[test]
    fn test_repr_reparses() {
        let values = [
            SettingValue::Str("tab\there 'quoted'".into()),
            SettingValue::Float(20.0),
            SettingValue::Float(1e-9),
            SettingValue::List(vec![SettingValue::Bool(false), SettingValue::Int(-3)]),
        ];
        for v in values {
            assert_eq!(SettingValue::parse(&v.to_string()).unwrap(), v);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(SettingValue::parse("'open").is_err());
        assert!(SettingValue::parse("[1, 2").is_err());
        assert!(SettingValue::parse("self.value").is_err());
    }
}
