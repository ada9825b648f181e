//! Scan-values grammar.
//!
//! A values string lists the points of one axis:
//!
//! ```text
//! 20.0, 25.0, 30.0            explicit list
//! [0, 1]                      brackets are optional
//! 20:30:5                     inclusive range start:stop[:step]
//! -10us, -1us, 0, 1us, 100us  time units (fs ps ns us µs ms s min h)
//! 2*10us, 10**-6, (1+2)/4     arithmetic
//! linspace(0, 1, 5)           5 evenly spaced points
//! logspace(-9, -6, 4)         4 log-spaced points, 10**a .. 10**b
//! off, on                     flags (0, 1)
//! ```
//!
//! Nothing in the string is executed; the grammar only evaluates numbers.

use crate::error::{AppResult, DaqError};
use crate::format::unit_factor;

/// Upper bound on the number of points one values string may produce.
pub const MAX_POINTS: usize = 100_000;

/// Expand a values string into its points.
pub fn expand_scan_points(text: &str) -> AppResult<Vec<f64>> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        text,
    };
    let values = parser.list()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(values)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
}

fn tokenize(text: &str) -> AppResult<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // exponent: e, E followed by a digit or a signed digit
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let signed = matches!(chars.get(i + 1), Some('+') | Some('-'));
                let digit_at = if signed { i + 2 } else { i + 1 };
                if chars.get(digit_at).is_some_and(|d| d.is_ascii_digit()) {
                    i = digit_at;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let mut value: f64 = literal
                .parse()
                .map_err(|_| DaqError::expression(text, format!("bad number '{literal}'")))?;

            // optional unit, possibly after spaces
            let mut j = i;
            while j < chars.len() && chars[j] == ' ' {
                j += 1;
            }
            let unit_start = j;
            while j < chars.len() && (chars[j].is_alphabetic()) {
                j += 1;
            }
            let unit: String = chars[unit_start..j].iter().collect();
            if !unit.is_empty() {
                match unit_factor(&unit) {
                    Some(factor) => {
                        value *= factor;
                        i = j;
                    }
                    None if unit_start == i => {
                        return Err(DaqError::expression(text, format!("unknown unit '{unit}'")));
                    }
                    None => {}
                }
            }
            tokens.push(Token::Number(value));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let op = match c {
            '*' if chars.get(i + 1) == Some(&'*') => "**",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            ',' => ",",
            ':' => ":",
            other => {
                return Err(DaqError::expression(text, format!("unexpected character '{other}'")))
            }
        };
        i += op.len();
        tokens.push(Token::Op(op));
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    text: &'a str,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> DaqError {
        DaqError::expression(self.text, reason)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn expect_op(&mut self, op: &str) -> AppResult<()> {
        if self.peek_op(op) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    /// item (',' item)*, with an optional trailing comma
    fn list(&mut self) -> AppResult<Vec<f64>> {
        let mut values = Vec::new();
        while self.peek().is_some() && !self.peek_op("]") {
            values.extend(self.item()?);
            if values.len() > MAX_POINTS {
                return Err(self.error(format!("more than {MAX_POINTS} points")));
            }
            if self.peek_op(",") {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(values)
    }

    fn item(&mut self) -> AppResult<Vec<f64>> {
        if self.peek_op("[") {
            self.pos += 1;
            let values = self.list()?;
            self.expect_op("]")?;
            return Ok(values);
        }
        if let Some(Token::Ident(name)) = self.peek() {
            let name = name.clone();
            if matches!(name.as_str(), "linspace" | "logspace" | "arange" | "range") {
                self.pos += 1;
                return self.generator(&name);
            }
        }
        let start = self.expr()?;
        if !self.peek_op(":") {
            return Ok(vec![start]);
        }
        self.pos += 1;
        let stop = self.expr()?;
        let step = if self.peek_op(":") {
            self.pos += 1;
            Some(self.expr()?)
        } else {
            None
        };
        self.range(start, stop, step)
    }

    fn generator(&mut self, name: &str) -> AppResult<Vec<f64>> {
        self.expect_op("(")?;
        let mut args = vec![self.expr()?];
        while self.peek_op(",") {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect_op(")")?;
        match (name, args.as_slice()) {
            ("linspace", [a, b, n]) => Ok(spaced(*a, *b, self.count(*n)?)),
            ("logspace", [a, b, n]) => Ok(spaced(*a, *b, self.count(*n)?)
                .into_iter()
                .map(|x| 10f64.powf(x))
                .collect()),
            ("arange" | "range", [stop]) => self.half_open(0.0, *stop, 1.0),
            ("arange" | "range", [start, stop]) => self.half_open(*start, *stop, 1.0),
            ("arange" | "range", [start, stop, step]) => self.half_open(*start, *stop, *step),
            _ => Err(self.error(format!("wrong number of arguments to {name}"))),
        }
    }

    fn count(&self, n: f64) -> AppResult<usize> {
        if n.fract() != 0.0 || n < 1.0 || n > MAX_POINTS as f64 {
            return Err(self.error(format!("point count {n} must be an integer in 1..={MAX_POINTS}")));
        }
        Ok(n as usize)
    }

    fn steps(&self, start: f64, stop: f64, step: f64, inclusive: bool) -> AppResult<usize> {
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(self.error("range bounds must be finite"));
        }
        if step == 0.0 {
            return Err(self.error("range step is zero"));
        }
        let span = (stop - start) / step;
        if span < -1e-9 {
            return Err(self.error("range step points away from stop"));
        }
        let n = if inclusive {
            (span + 1e-9).floor() as usize + 1
        } else {
            (span - 1e-9).ceil().max(0.0) as usize
        };
        if n > MAX_POINTS {
            return Err(self.error(format!("more than {MAX_POINTS} points")));
        }
        Ok(n)
    }

    fn range(&self, start: f64, stop: f64, step: Option<f64>) -> AppResult<Vec<f64>> {
        let step = step.unwrap_or(if stop >= start { 1.0 } else { -1.0 });
        let n = self.steps(start, stop, step, true)?;
        Ok((0..n).map(|k| clean(start + k as f64 * step, step)).collect())
    }

    fn half_open(&self, start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
        let n = self.steps(start, stop, step, false)?;
        Ok((0..n).map(|k| clean(start + k as f64 * step, step)).collect())
    }

    /// term (('+' | '-') term)*
    fn expr(&mut self) -> AppResult<f64> {
        let mut value = self.term()?;
        loop {
            if self.peek_op("+") {
                self.pos += 1;
                value += self.term()?;
            } else if self.peek_op("-") {
                self.pos += 1;
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    /// factor (('*' | '/') factor)*
    fn term(&mut self) -> AppResult<f64> {
        let mut value = self.factor()?;
        loop {
            if self.peek_op("*") {
                self.pos += 1;
                value *= self.factor()?;
            } else if self.peek_op("/") {
                self.pos += 1;
                let divisor = self.factor()?;
                if divisor == 0.0 {
                    return Err(self.error("division by zero"));
                }
                value /= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    /// ('-' | '+') factor | atom ('**' factor)?
    fn factor(&mut self) -> AppResult<f64> {
        if self.peek_op("-") {
            self.pos += 1;
            return Ok(-self.factor()?);
        }
        if self.peek_op("+") {
            self.pos += 1;
            return self.factor();
        }
        let base = self.atom()?;
        if self.peek_op("**") {
            self.pos += 1;
            let exponent = self.factor()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> AppResult<f64> {
        match self.peek().cloned() {
            Some(Token::Number(x)) => {
                self.pos += 1;
                Ok(x)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                match name.as_str() {
                    "on" | "On" | "True" | "true" => Ok(1.0),
                    "off" | "Off" | "False" | "false" => Ok(0.0),
                    "pi" => Ok(std::f64::consts::PI),
                    "nan" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    other => Err(self.error(format!("unknown name '{other}'"))),
                }
            }
            Some(Token::Op("(")) => {
                self.pos += 1;
                let value = self.expr()?;
                self.expect_op(")")?;
                Ok(value)
            }
            Some(Token::Op(op)) => Err(self.error(format!("unexpected '{op}'"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

fn spaced(a: f64, b: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![a];
    }
    (0..n)
        .map(|k| a + (b - a) * k as f64 / (n - 1) as f64)
        .collect()
}

/// Remove floating-point noise below a millionth of the step.
fn clean(x: f64, step: f64) -> f64 {
    let quantum = step.abs() * 1e-6;
    if x.abs() < quantum {
        0.0
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-12 * y.abs().max(1e-12))
    }

    #[test]
    fn test_lists() {
        assert_eq!(expand_scan_points("20.0, 25.0, 30.0").unwrap(), vec![20.0, 25.0, 30.0]);
        assert_eq!(expand_scan_points("[0,1]").unwrap(), vec![0.0, 1.0]);
        assert_eq!(expand_scan_points("off, on").unwrap(), vec![0.0, 1.0]);
        assert_eq!(expand_scan_points("").unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_time_units() {
        let values = expand_scan_points("-10us,-1us,0,1us,100us").unwrap();
        assert!(close(&values, &[-1e-5, -1e-6, 0.0, 1e-6, 1e-4]));
        assert!(close(&expand_scan_points("2*10 ns").unwrap(), &[2e-8]));
    }

    #[test]
    fn test_ranges() {
        assert_eq!(expand_scan_points("20:30:5").unwrap(), vec![20.0, 25.0, 30.0]);
        assert_eq!(expand_scan_points("3:1").unwrap(), vec![3.0, 2.0, 1.0]);
        assert_eq!(expand_scan_points("0:1:0.25").unwrap().len(), 5);
        assert!(close(
            &expand_scan_points("-1us:1us:1us").unwrap(),
            &[-1e-6, 0.0, 1e-6]
        ));
        assert!(expand_scan_points("0:10:0").is_err());
        assert!(expand_scan_points("0:10:-1").is_err());
        assert!(expand_scan_points("0:1e9:1").is_err());
    }

    #[test]
    fn test_arithmetic_and_generators() {
        assert_eq!(expand_scan_points("(1+2)/4, 2**3, -2**2").unwrap(), vec![0.75, 8.0, -4.0]);
        assert_eq!(expand_scan_points("linspace(0, 1, 3)").unwrap(), vec![0.0, 0.5, 1.0]);
        assert!(close(
            &expand_scan_points("logspace(-9,-7,3)").unwrap(),
            &[1e-9, 1e-8, 1e-7]
        ));
        assert_eq!(expand_scan_points("range(3)").unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_rejects_code() {
        assert!(expand_scan_points("__import__('os')").is_err());
        assert!(expand_scan_points("1 parsec").is_err());
        assert!(expand_scan_points("1/0").is_err());
        assert!(expand_scan_points("1,,2").is_err());
    }
}
