//! Scan expansion.
//!
//! `collection_order` lists the scanned quantities, e.g.
//! `Delay,Laser_on,Temperature,Repeat=16`. Each item is an axis name,
//! optionally with inline values (`Laser_on=[0,1]`, `Repeat=4`).
//!
//! Axes that do not hold acquisition keep their listed order and become the
//! inner loops; waiting axes follow as the outer loops. Axis 0 is innermost:
//!
//! ```text
//! divider[j] = |A0| * ... * |A(j-1)|
//! value(i, j) = A(j).values[(i / divider[j]) mod |A(j)|]
//! N = |A0| * ... * |A(k-1)|
//! ```

use super::axis::{AxisKind, ScanAxis};
use super::driver::ScanDriver;
use super::expression::expand_scan_points;
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One item of `collection_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub kind: AxisKind,
    /// Inline values after `=`
    pub value: Option<String>,
}

/// Split `collection_order` into items.
///
/// Commas inside brackets or parentheses belong to the inline values.
pub fn parse_collection_order(text: &str) -> AppResult<Vec<OrderItem>> {
    let mut items = Vec::new();
    let mut depth = 0_i32;
    let mut current = String::new();
    let mut parts = Vec::new();
    for c in text.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err(DaqError::expression(text, "unbalanced brackets"));
        }
        if c == ',' && depth == 0 {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if depth != 0 {
        return Err(DaqError::expression(text, "unbalanced brackets"));
    }
    parts.push(current);

    for part in parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let (name, value) = match part.split_once('=') {
            Some((name, value)) => (name, Some(value.trim().to_string())),
            None => (part, None),
        };
        items.push(OrderItem {
            kind: name.parse()?,
            value,
        });
    }
    Ok(items)
}

/// Builds [`ScanExpansion`]s from `collection_order` and the configured drivers.
#[derive(Debug, Default, Clone)]
pub struct ScanExpander {
    drivers: BTreeMap<AxisKind, Arc<ScanDriver>>,
}

impl ScanExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the driver of an axis kind (replaces a previous one).
    pub fn insert(&mut self, driver: Arc<ScanDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn driver(&self, kind: AxisKind) -> Option<&Arc<ScanDriver>> {
        self.drivers.get(&kind)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Arc<ScanDriver>> {
        self.drivers.values()
    }

    /// Expand `order`.
    ///
    /// With `override_repeat`, every Repeat axis gets that count; when the
    /// order has no Repeat axis, one is added as the outermost non-waiting axis.
    pub fn expand(&self, order: &str, override_repeat: Option<usize>) -> AppResult<ScanExpansion> {
        let items = parse_collection_order(order)?;
        let mut axes = Vec::with_capacity(items.len() + 1);
        for item in &items {
            if item.kind != AxisKind::Repeat && axes.iter().any(|a: &ScanAxis| a.kind == item.kind) {
                return Err(DaqError::Configuration(format!(
                    "axis {} listed twice in '{order}'",
                    item.kind
                )));
            }
            axes.push(self.axis(item, override_repeat)?);
        }
        if let Some(count) = override_repeat {
            if !axes.iter().any(|a| a.kind == AxisKind::Repeat) {
                axes.push(repeat_axis(count)?);
            }
        }

        let (mut ordered, waiting): (Vec<ScanAxis>, Vec<ScanAxis>) =
            axes.into_iter().partition(|a| !a.wait);
        ordered.extend(waiting);

        let mut n: usize = 1;
        for axis in &mut ordered {
            axis.divider = n;
            if let Some(driver) = &axis.driver {
                driver.set_scan_values(axis.values.clone());
                driver.set_divider(n);
            }
            n = n.checked_mul(axis.len()).ok_or_else(|| {
                DaqError::Configuration(format!("scan '{order}' has too many points"))
            })?;
        }
        debug!(order, n, axes = ordered.len(), "scan expanded");
        Ok(ScanExpansion { axes: ordered, n })
    }

    fn axis(&self, item: &OrderItem, override_repeat: Option<usize>) -> AppResult<ScanAxis> {
        if item.kind == AxisKind::Repeat {
            let count = match (override_repeat, &item.value) {
                (Some(count), _) => count,
                (None, Some(text)) => text.trim().parse::<usize>().map_err(|_| {
                    DaqError::expression(text.as_str(), "repeat count must be a whole number")
                })?,
                (None, None) => {
                    return Err(DaqError::Configuration("Repeat needs a count".into()));
                }
            };
            return repeat_axis(count);
        }

        let driver = self.drivers.get(&item.kind).cloned();
        let values = match (&item.value, &driver) {
            (Some(text), _) => expand_scan_points(text)?,
            (None, Some(driver)) => driver.values(),
            (None, None) => {
                return Err(DaqError::Configuration(format!(
                    "no values configured for scan axis {}",
                    item.kind
                )))
            }
        };
        if values.is_empty() {
            return Err(DaqError::Configuration(format!(
                "scan axis {} has no values",
                item.kind
            )));
        }
        let (wait, file_format, log_format) = match &driver {
            Some(d) => (d.wait(), d.file_format()?, d.log_format()?),
            None => (
                item.kind.default_wait() && !item.kind.is_sequence_axis(),
                item.kind.default_file_format(),
                item.kind.default_log_format(),
            ),
        };
        Ok(ScanAxis {
            kind: item.kind,
            values,
            divider: 1,
            wait,
            file_format,
            log_format,
            driver,
        })
    }
}

fn repeat_axis(count: usize) -> AppResult<ScanAxis> {
    if count == 0 {
        return Err(DaqError::Configuration("Repeat count must be positive".into()));
    }
    let kind = AxisKind::Repeat;
    Ok(ScanAxis {
        kind,
        values: (0..count).map(|k| k as f64).collect(),
        divider: 1,
        wait: false,
        file_format: kind.default_file_format(),
        log_format: kind.default_log_format(),
        driver: None,
    })
}

/// Expanded scan: ordered axes and point count.
#[derive(Debug, Clone)]
pub struct ScanExpansion {
    axes: Vec<ScanAxis>,
    n: usize,
}

impl ScanExpansion {
    /// Total number of scan points.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Axes, innermost first.
    pub fn axes(&self) -> &[ScanAxis] {
        &self.axes
    }

    pub fn axis(&self, kind: AxisKind) -> Option<&ScanAxis> {
        self.axes.iter().find(|a| a.kind == kind)
    }

    pub fn axis_index(&self, kind: AxisKind) -> Option<usize> {
        self.axes.iter().position(|a| a.kind == kind)
    }

    /// Value of axis `j` at point `i`.
    pub fn value(&self, i: usize, j: usize) -> f64 {
        self.axes.get(j).map_or(f64::NAN, |a| a.value_at(i))
    }

    pub fn values_at(&self, i: usize) -> Vec<f64> {
        self.axes.iter().map(|a| a.value_at(i)).collect()
    }

    pub fn value_of(&self, kind: AxisKind, i: usize) -> Option<f64> {
        self.axis(kind).map(|a| a.value_at(i))
    }

    /// Per-axis labels of point `i` joined by `_`, as used in file names.
    pub fn file_label(&self, i: usize) -> String {
        self.axes
            .iter()
            .map(|a| a.file_label(a.index_at(i)))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Logfile cells of the scan variables at point `i`.
    pub fn log_values(&self, i: usize) -> Vec<String> {
        self.axes
            .iter()
            .map(|a| a.log_label(a.index_at(i)))
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.axes.iter().map(|a| a.name().to_string()).collect()
    }

    /// Scan points after which the sequence pattern repeats: the product of
    /// the lengths of all axes up to the outermost sequence axis.
    pub fn sequence_period(&self) -> usize {
        match self.axes.iter().rposition(|a| a.kind.is_sequence_axis()) {
            Some(j) => self.axes[j].divider * self.axes[j].len(),
            None => 1,
        }
    }

    /// Index of the innermost waiting axis.
    pub fn first_wait_axis(&self) -> Option<usize> {
        self.axes.iter().position(|a| a.wait)
    }

    /// Points in one pass (a range the sequencer runs without stopping).
    pub fn pass_length(&self) -> usize {
        match self.first_wait_axis() {
            Some(j) => self.axes[j].divider,
            None => self.n,
        }
    }

    /// Number of passes.
    pub fn pass_count(&self) -> usize {
        self.n / self.pass_length().max(1)
    }

    /// Last point of the pass containing `current`, capped at `n_collect - 1`.
    pub fn range_last(&self, current: usize, n_collect: usize) -> usize {
        let length = self.pass_length().max(1);
        let pass_end = (current / length + 1) * length - 1;
        pass_end.min(n_collect.saturating_sub(1))
    }

    /// Points per value of the named axis.
    pub fn period_of(&self, name: &str) -> AppResult<usize> {
        let kind: AxisKind = name.parse()?;
        self.axis(kind).map(|a| a.divider).ok_or_else(|| {
            DaqError::Configuration(format!("{kind} is not part of this scan"))
        })
    }

    /// Points to collect: `n`, or the end of the current block of
    /// `finish_variable` when a series is being finished.
    pub fn n_collect(&self, current: usize, finish_variable: Option<&str>) -> AppResult<usize> {
        let Some(name) = finish_variable else {
            return Ok(self.n);
        };
        let period = self.period_of(name)?.max(1);
        Ok((current.div_ceil(period) * period).min(self.n))
    }

    /// Tab-separated table of all points with their values.
    pub fn table(&self) -> String {
        let mut out = String::from("#\t");
        out.push_str(&self.column_names().join("\t"));
        out.push('\n');
        for i in 0..self.n {
            out.push_str(&(i + 1).to_string());
            for cell in self.log_values(i) {
                out.push('\t');
                out.push_str(&cell);
            }
            out.push('\n');
        }
        out
    }
}
