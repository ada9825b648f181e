//! Motor resolution and row application.
//!
//! Column paths are parsed once when a table is inserted: `component.attribute`
//! names a motor in the [`MotorRegistry`], `table:<name>` links another
//! configuration table whose row label is the cell value. Links form a
//! dependency graph; cycles and chains deeper than [`MAX_NESTING`] are
//! refused at insert time.

use super::table::ConfigTable;
use crate::error::{AppResult, DaqError};
use crate::hardware::{DummyMotor, Motor, MotorValue};
use crate::observable::DependencyGraph;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deepest allowed chain of linked tables.
pub const MAX_NESTING: usize = 8;

const TABLE_PREFIX: &str = "table:";

/// `component.attribute` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MotorPath {
    /// Object name, e.g. `sample`
    pub component: String,
    /// Property of the object, e.g. `temperature`
    pub attribute: String,
}

impl fmt::Display for MotorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.attribute)
    }
}

/// What a table column drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Motor(MotorPath),
    Table(String),
}

impl FromStr for ColumnTarget {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix(TABLE_PREFIX) {
            if name.is_empty() {
                return Err(DaqError::Configuration(format!("'{s}': missing table name")));
            }
            return Ok(ColumnTarget::Table(name.to_string()));
        }
        match s.rsplit_once('.') {
            Some((component, attribute))
                if !component.is_empty()
                    && !attribute.is_empty()
                    && !s.contains(char::is_whitespace) =>
            {
                Ok(ColumnTarget::Motor(MotorPath {
                    component: component.to_string(),
                    attribute: attribute.to_string(),
                }))
            }
            _ => Err(DaqError::Configuration(format!(
                "'{s}' is neither component.attribute nor table:<name>"
            ))),
        }
    }
}

/// Motors by path.
#[derive(Default)]
pub struct MotorRegistry {
    motors: RwLock<BTreeMap<String, Arc<dyn Motor>>>,
}

impl MotorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `motor` reachable under `path`, replacing any earlier one.
    pub fn register(&self, path: impl Into<String>, motor: Arc<dyn Motor>) {
        self.motors.write().insert(path.into(), motor);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.motors.read().contains_key(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.motors.read().keys().cloned().collect()
    }

    /// Motor behind `path`, or a dummy that logs its writes.
    pub fn resolve(&self, path: &str) -> Arc<dyn Motor> {
        if let Some(motor) = self.motors.read().get(path) {
            return Arc::clone(motor);
        }
        warn!(path, "no motor registered, using dummy");
        Arc::new(DummyMotor::new(path))
    }

    /// Strict variant for configuration loading.
    pub fn require(&self, path: &str) -> AppResult<Arc<dyn Motor>> {
        self.motors
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| DaqError::Configuration(format!("no motor '{path}'")))
    }
}

impl fmt::Debug for MotorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotorRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}

/// All configuration tables of a controller.
#[derive(Debug)]
pub struct TableSet {
    tables: BTreeMap<String, ConfigTable>,
    targets: BTreeMap<String, Vec<ColumnTarget>>,
    links: DependencyGraph<String>,
    motors: Arc<MotorRegistry>,
}

impl TableSet {
    /// Empty set resolving columns through `motors`.
    pub fn new(motors: Arc<MotorRegistry>) -> Self {
        Self {
            tables: BTreeMap::new(),
            targets: BTreeMap::new(),
            links: DependencyGraph::new(),
            motors,
        }
    }

    pub fn motors(&self) -> &Arc<MotorRegistry> {
        &self.motors
    }

    /// Add or replace a table.
    pub fn insert(&mut self, table: ConfigTable) -> AppResult<()> {
        let name = table.name().to_string();
        let targets = table
            .columns()
            .iter()
            .map(|c| c.path.parse::<ColumnTarget>())
            .collect::<AppResult<Vec<_>>>()?;

        let mut links = DependencyGraph::new();
        let others = self.targets.iter().filter(|(other, _)| **other != name);
        for (owner, owned) in others.chain(std::iter::once((&name, &targets))) {
            for target in owned {
                if let ColumnTarget::Table(linked) = target {
                    links.add_dependency(linked.clone(), owner.clone())?;
                }
            }
        }
        let deepest = links
            .topological_order()
            .iter()
            .map(|node| links.depth(node) + 1)
            .max()
            .unwrap_or(1);
        if deepest > MAX_NESTING {
            return Err(DaqError::Configuration(format!(
                "table '{name}' nests {deepest} tables deep (limit {MAX_NESTING})"
            )));
        }

        self.links = links;
        self.targets.insert(name.clone(), targets);
        self.tables.insert(name, table);
        Ok(())
    }

    /// Table by name.
    pub fn get(&self, name: &str) -> Option<&ConfigTable> {
        self.tables.get(name)
    }

    /// Mutable access for row editing. Column changes go through [`TableSet::insert`].
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ConfigTable> {
        self.tables.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn table(&self, name: &str) -> AppResult<(&ConfigTable, &[ColumnTarget])> {
        match (self.tables.get(name), self.targets.get(name)) {
            (Some(table), Some(targets)) => Ok((table, targets.as_slice())),
            _ => Err(DaqError::Table(format!("no table '{name}'"))),
        }
    }

    fn row_index(&self, table: &ConfigTable, label: &str) -> AppResult<usize> {
        table
            .row_index(label)
            .ok_or_else(|| DaqError::Table(format!("{}: no row '{label}'", table.name())))
    }

    /// Send every motor of a row to its cell value.
    ///
    /// All setters run concurrently; linked tables are applied recursively.
    /// Every setter is attempted; the first failure is returned.
    pub async fn apply(&self, table: &str, row: &str) -> AppResult<()> {
        info!(table, row, "applying configuration");
        self.apply_nested(table.to_string(), row.to_string(), 1).await
    }

    fn apply_nested(&self, name: String, label: String, depth: usize) -> BoxFuture<'_, AppResult<()>> {
        async move {
            if depth > MAX_NESTING {
                return Err(DaqError::Configuration(format!("table '{name}' nested too deep")));
            }
            let (table, targets) = self.table(&name)?;
            let r = self.row_index(table, &label)?;
            let mut pending: Vec<BoxFuture<'_, AppResult<()>>> = Vec::new();
            for (j, target) in targets.iter().enumerate() {
                let Some(value) = table.value(r, j)? else {
                    continue;
                };
                match target {
                    ColumnTarget::Motor(path) => {
                        let motor = self.motors.resolve(&path.to_string());
                        pending.push(
                            async move {
                                debug!(motor = %motor.name(), %value, "set");
                                motor.set_command_value(value).await.map_err(DaqError::transport)
                            }
                            .boxed(),
                        );
                    }
                    ColumnTarget::Table(linked) => {
                        pending.push(self.apply_nested(linked.clone(), value.to_string(), depth + 1));
                    }
                }
            }
            join_all(pending).await.into_iter().collect::<AppResult<Vec<()>>>()?;
            Ok(())
        }
        .boxed()
    }

    /// Whether every motor of a row is within its column tolerance.
    pub async fn in_position(&self, table: &str, row: &str) -> AppResult<bool> {
        self.in_position_nested(table.to_string(), row.to_string(), 1).await
    }

    fn in_position_nested(&self, name: String, label: String, depth: usize) -> BoxFuture<'_, AppResult<bool>> {
        async move {
            if depth > MAX_NESTING {
                return Err(DaqError::Configuration(format!("table '{name}' nested too deep")));
            }
            let (table, targets) = self.table(&name)?;
            let r = self.row_index(table, &label)?;
            for (j, target) in targets.iter().enumerate() {
                let Some(nominal) = table.value(r, j)? else {
                    continue;
                };
                let reached = match target {
                    ColumnTarget::Motor(path) => {
                        let motor = self.motors.resolve(&path.to_string());
                        match motor.value().await {
                            Ok(current) => current.matches(&nominal, table.columns()[j].tolerance),
                            Err(e) => {
                                debug!(motor = %path, "readback failed: {e}");
                                false
                            }
                        }
                    }
                    ColumnTarget::Table(linked) => {
                        self.in_position_nested(linked.clone(), nominal.to_string(), depth + 1)
                            .await?
                    }
                };
                if !reached {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        .boxed()
    }

    /// Label of the first row the hardware currently matches.
    pub async fn current_row(&self, table: &str) -> AppResult<Option<String>> {
        let labels = self.table(table)?.0.labels();
        for label in labels {
            if self.in_position(table, &label).await? {
                return Ok(Some(label));
            }
        }
        Ok(None)
    }

    /// Values a row would set, keyed by motor path, with linked tables expanded.
    pub fn resolved_values(&self, table: &str, row: &str) -> AppResult<BTreeMap<String, MotorValue>> {
        let mut values = BTreeMap::new();
        self.collect_values(table, row, 1, &mut values)?;
        Ok(values)
    }

    fn collect_values(
        &self,
        name: &str,
        label: &str,
        depth: usize,
        values: &mut BTreeMap<String, MotorValue>,
    ) -> AppResult<()> {
        if depth > MAX_NESTING {
            return Err(DaqError::Configuration(format!("table '{name}' nested too deep")));
        }
        let (table, targets) = self.table(name)?;
        let r = self.row_index(table, label)?;
        for (j, target) in targets.iter().enumerate() {
            let Some(value) = table.value(r, j)? else {
                continue;
            };
            match target {
                ColumnTarget::Motor(path) => {
                    values.insert(path.to_string(), value);
                }
                ColumnTarget::Table(linked) => {
                    self.collect_values(linked, &value.to_string(), depth + 1, values)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ValueFormat;
    use crate::hardware::SimulatedMotor;
    use crate::tables::TableColumn;
    use std::time::Duration;

    fn motors() -> (Arc<MotorRegistry>, Arc<SimulatedMotor>, Arc<SimulatedMotor>) {
        let registry = Arc::new(MotorRegistry::new());
        let temperature = Arc::new(SimulatedMotor::new("temperature", 20.0));
        let attenuator = Arc::new(SimulatedMotor::new("attenuator", "full"));
        registry.register("sample.temperature", temperature.clone());
        registry.register("beam.attenuator", attenuator.clone());
        (registry, temperature, attenuator)
    }

    fn attenuation() -> ConfigTable {
        let mut t = ConfigTable::new(
            "attenuation",
            vec![TableColumn::new("beam.attenuator", ValueFormat::Text, 0.0)],
        );
        t.add_row("full", vec!["full".into()]).unwrap();
        t.add_row("half", vec!["half".into()]).unwrap();
        t
    }

    fn methods() -> ConfigTable {
        let mut t = ConfigTable::new(
            "methods",
            vec![
                TableColumn::new("sample.temperature", ValueFormat::Fixed(1), 0.1),
                TableColumn::new("table:attenuation", ValueFormat::Text, 0.0),
            ],
        );
        t.add_row("cold", vec!["20.0".into(), "full".into()]).unwrap();
        t.add_row("warm", vec!["25.0".into(), "half".into()]).unwrap();
        t
    }

    #[test]
    fn test_column_target_parsing() {
        assert_eq!(
            "sample.temperature".parse::<ColumnTarget>().unwrap(),
            ColumnTarget::Motor(MotorPath {
                component: "sample".into(),
                attribute: "temperature".into()
            })
        );
        assert_eq!(
            "table:attenuation".parse::<ColumnTarget>().unwrap(),
            ColumnTarget::Table("attenuation".into())
        );
        assert!("temperature".parse::<ColumnTarget>().is_err());
        assert!("table:".parse::<ColumnTarget>().is_err());
    }

    #[tokio::test]
    async fn test_apply_nested_row() {
        let (registry, temperature, attenuator) = motors();
        let mut set = TableSet::new(registry);
        set.insert(attenuation()).unwrap();
        set.insert(methods()).unwrap();

        set.apply("methods", "warm").await.unwrap();
        assert_eq!(temperature.current(), MotorValue::Number(25.0));
        assert_eq!(attenuator.current(), MotorValue::from("half"));
        assert!(set.in_position("methods", "warm").await.unwrap());
        assert!(!set.in_position("methods", "cold").await.unwrap());
        assert_eq!(set.current_row("methods").await.unwrap(), Some("warm".into()));
        assert_eq!(set.current_row("attenuation").await.unwrap(), Some("half".into()));

        let values = set.resolved_values("methods", "cold").unwrap();
        assert_eq!(values["beam.attenuator"], MotorValue::from("full"));
        assert_eq!(values["sample.temperature"], MotorValue::Number(20.0));
    }

    #[tokio::test]
    async fn test_in_position_waits_for_slow_motor() {
        let registry = Arc::new(MotorRegistry::new());
        let slow = Arc::new(SimulatedMotor::new("slow", 0.0).with_settle(Duration::from_millis(50)));
        registry.register("stage.x", slow);
        let mut table = ConfigTable::new("stage", vec![TableColumn::new("stage.x", ValueFormat::Fixed(2), 0.01)]);
        table.add_row("out", vec!["5.00".into()]).unwrap();
        let mut set = TableSet::new(registry);
        set.insert(table).unwrap();

        set.apply("stage", "out").await.unwrap();
        assert!(!set.in_position("stage", "out").await.unwrap());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(set.in_position("stage", "out").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_motor_uses_dummy() {
        let mut set = TableSet::new(Arc::new(MotorRegistry::new()));
        let mut table = ConfigTable::new("t", vec![TableColumn::new("ghost.x", ValueFormat::General, 0.0)]);
        table.add_row("a", vec!["1".into()]).unwrap();
        set.insert(table).unwrap();
        set.apply("t", "a").await.unwrap();
        assert!(set.apply("t", "missing").await.is_err());
    }

    #[test]
    fn test_rejects_link_cycle() {
        let mut set = TableSet::new(Arc::new(MotorRegistry::new()));
        let a = ConfigTable::new("a", vec![TableColumn::new("table:b", ValueFormat::Text, 0.0)]);
        let b = ConfigTable::new("b", vec![TableColumn::new("table:a", ValueFormat::Text, 0.0)]);
        set.insert(a).unwrap();
        assert!(matches!(set.insert(b), Err(DaqError::DependencyCycle(_))));
        assert!(set.get("b").is_none());
    }

    #[test]
    fn test_rejects_deep_nesting() {
        let mut set = TableSet::new(Arc::new(MotorRegistry::new()));
        for k in 1..MAX_NESTING {
            let link = format!("table:t{}", k - 1);
            set.insert(ConfigTable::new(format!("t{k}"), vec![TableColumn::new(link, ValueFormat::Text, 0.0)]))
                .unwrap();
        }
        let too_deep = ConfigTable::new(
            format!("t{MAX_NESTING}"),
            vec![TableColumn::new(format!("table:t{}", MAX_NESTING - 1), ValueFormat::Text, 0.0)],
        );
        assert!(matches!(set.insert(too_deep), Err(DaqError::Configuration(_))));
    }
}
