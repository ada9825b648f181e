//! End-to-end collection against the FPGA simulator.
//!
//! Each test builds a simulated beamline in a temporary directory, collects a
//! dataset and checks the logfile and the files on disk.

use beamline_daq::acquisition::{CollectionOutcome, EraseOutcome, XRAY_IMAGES};
use beamline_daq::beamline::Beamline;
use beamline_daq::config::ControllerConfig;
use beamline_daq::format::ValueFormat;
use beamline_daq::hardware::MotorValue;
use beamline_daq::observable::Delivery;
use beamline_daq::tables::{ConfigTable, TableColumn, TableSet};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &Path, order: &str) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.acquisition.poll_interval = Duration::from_millis(10);
    config.acquisition.settle_timeout = Duration::from_secs(5);
    config.acquisition.defaults.directory = dir.to_path_buf();
    config.acquisition.defaults.basename = "scan".into();
    config.acquisition.defaults.collection_order = order.into();
    config.diagnostics.channels = vec!["ring_current".into()];
    config.diagnostics.interval = Duration::from_millis(5);
    config
}

struct Log {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Log {
    fn read(path: &Path) -> Self {
        let text = std::fs::read_to_string(path).unwrap_or_default();
        let columns = text
            .lines()
            .find(|l| l.starts_with("#date time"))
            .map(|l| l[1..].split('\t').map(str::to_string).collect())
            .unwrap_or_default();
        let rows = text
            .lines()
            .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
            .map(|l| l.split('\t').map(str::to_string).collect())
            .collect();
        Self { columns, rows }
    }

    fn column(&self, name: &str) -> Vec<String> {
        let j = self
            .columns
            .iter()
            .position(|c| c == name)
            .unwrap_or_else(|| panic!("no column {name} in {:?}", self.columns));
        self.rows.iter().map(|r| r[j].clone()).collect()
    }

    fn files(&self) -> Vec<String> {
        self.column("file")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_axis_laser_on_scan() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Laser_on=[0,1]")).unwrap();

    let outcome = beamline.controller.collect_dataset().await.unwrap();
    assert_eq!(outcome, CollectionOutcome::Completed { collected: 2 });

    let log = Log::read(&dir.path().join("scan.log"));
    assert_eq!(log.files(), vec!["scan_0001_off.mccd", "scan_0002_on.mccd"]);
    assert_eq!(log.column("Laser_on"), vec!["0", "1"]);
    assert!(log.columns.contains(&"ring_current".to_string()));
    assert!(dir.path().join("scan.conf").exists());
    assert_eq!(
        beamline.controller.status_message().get(),
        "Collection completed"
    );
    assert!(!beamline.controller.collecting().get());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_temperature_and_repeat() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Temperature,Repeat=4")).unwrap();

    let scan = beamline.controller.expansion().unwrap();
    assert_eq!(scan.n(), 12);
    assert_eq!(scan.column_names(), vec!["Repeat", "Temperature"]);

    let outcome = beamline.controller.collect_dataset().await.unwrap();
    assert_eq!(outcome, CollectionOutcome::Completed { collected: 12 });

    let log = Log::read(&dir.path().join("scan.log"));
    let temperatures: Vec<f64> = log
        .column("Temperature")
        .iter()
        .map(|t| t.parse().unwrap())
        .collect();
    assert_eq!(
        temperatures,
        vec![20.0, 20.0, 20.0, 20.0, 25.0, 25.0, 25.0, 25.0, 30.0, 30.0, 30.0, 30.0]
    );
    assert_eq!(log.column("Repeat")[..5], ["1", "2", "3", "4", "1"]);

    let unique: BTreeSet<String> = log.files().into_iter().collect();
    assert_eq!(unique.len(), 12);

    let status = beamline.controller.dataset_status().unwrap();
    assert!(status.complete());
    assert_eq!(status.collection_first_i(), 12);

    // The temperature motor visited every value and was restored afterwards.
    let motor = beamline.motor("temperature.value").unwrap();
    let commands: Vec<f64> = motor.commands().iter().filter_map(|v| v.as_f64()).collect();
    assert!(commands.contains(&25.0));
    assert!(commands.contains(&30.0));
    assert_eq!(motor.current().as_f64(), Some(20.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_keeps_collected_lines() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Temperature,Repeat=4")).unwrap();
    let controller = &beamline.controller;
    controller.collect_dataset().await.unwrap();

    // Drop the second half, as if the run had been interrupted at point 6.
    let scan = controller.expansion().unwrap();
    let layout = controller.layout();
    let logfile = controller.logfile(&scan);
    let second_half: BTreeSet<String> = (6..12).map(|i| layout.point_basename(&scan, i)).collect();
    assert_eq!(logfile.remove_basenames(&second_half).unwrap(), 6);
    let before = std::fs::read_to_string(logfile.path()).unwrap();
    assert_eq!(controller.collection_first_i().unwrap(), 6);

    let outcome = controller.collect_dataset().await.unwrap();
    assert_eq!(outcome, CollectionOutcome::Completed { collected: 6 });

    let after = std::fs::read_to_string(logfile.path()).unwrap();
    assert!(after.starts_with(&before));
    let log = Log::read(logfile.path());
    assert_eq!(log.rows.len(), 12);
    assert_eq!(log.files()[6], layout.xray_image_filename(&scan, 6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_already_complete_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Laser_on=[0,1],Repeat=2")).unwrap();
    beamline.controller.collect_dataset().await.unwrap();
    let executed = beamline.fpga.executed_sequences();

    let outcome = beamline.controller.collect_dataset().await.unwrap();
    assert_eq!(outcome, CollectionOutcome::AlreadyComplete);
    assert_eq!(beamline.fpga.executed_sequences(), executed);
    assert_eq!(
        beamline.controller.status_message().get(),
        "Collection completed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_erase_and_recollect() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Temperature,Repeat=4")).unwrap();
    let controller = &beamline.controller;
    controller.collect_dataset().await.unwrap();
    let first = Log::read(&dir.path().join("scan.log"));

    let outcome = controller.erase_dataset().await.unwrap();
    assert!(matches!(outcome, EraseOutcome::Erased { lines: 12, .. }));
    assert!(!dir.path().join("scan.log").exists());
    assert!(!dir.path().join("scan.conf").exists());
    let images: Vec<_> = std::fs::read_dir(dir.path().join(XRAY_IMAGES))
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(images.is_empty());
    assert_eq!(controller.collection_first_i().unwrap(), 0);

    controller.collect_dataset().await.unwrap();
    let second = Log::read(&dir.path().join("scan.log"));
    assert_eq!(second.rows.len(), first.rows.len());
    assert_eq!(second.files(), first.files());
    assert_eq!(second.column("Temperature"), first.column("Temperature"));
    assert_eq!(second.column("Repeat"), first.column("Repeat"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_axis_pass_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Delay,Temperature")).unwrap();
    let controller = &beamline.controller;
    assert_eq!(controller.collection_pass_count().unwrap(), 3);

    let ranges = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&ranges);
    controller
        .collection_range()
        .add_handler(Delivery::Inline, move |event| seen.lock().push(event.value));

    let outcome = controller.collect_dataset().await.unwrap();
    assert_eq!(outcome, CollectionOutcome::Completed { collected: 9 });
    assert_eq!(*ranges.lock(), vec![(0, 2), (3, 5), (6, 8)]);

    let log = Log::read(&dir.path().join("scan.log"));
    assert_eq!(log.column("Delay")[..3], ["-10us", "0", "10us"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finish_series_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "Temperature,Repeat=4");
    config.acquisition.defaults.finish_series_variable = "Temperature".into();
    let beamline = Beamline::simulated(config).unwrap();
    let controller = &beamline.controller;

    let finish = controller.finish_series().clone();
    controller.current().add_handler(Delivery::Inline, move |event| {
        if event.value == 5 {
            finish.set(true);
        }
    });

    let outcome = controller.collect_dataset().await.unwrap();
    assert_eq!(
        outcome,
        CollectionOutcome::SeriesFinished {
            collected: 8,
            n_collect: 8
        }
    );
    assert!(!controller.finish_series().get());

    let log = Log::read(&dir.path().join("scan.log"));
    assert_eq!(log.rows.len(), 8);
    assert_eq!(controller.collection_first_i().unwrap(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_after_current_pass() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Temperature,Repeat=4")).unwrap();
    let controller = Arc::clone(&beamline.controller);

    let cancel = Arc::clone(&controller);
    controller.current().add_handler(Delivery::Inline, move |event| {
        if event.value == 3 {
            cancel.cancel();
        }
    });

    let outcome = controller.collect_dataset().await.unwrap();
    let CollectionOutcome::Cancelled { collected } = outcome else {
        panic!("expected cancellation, got {outcome:?}");
    };
    assert!((3..=4).contains(&collected), "collected {collected}");
    assert_eq!(controller.status_message().get(), "Cancelled");
    assert!(!controller.collecting().get());

    let log = Log::read(&dir.path().join("scan.log"));
    assert_eq!(log.rows.len(), collected);
    assert!(dir.path().join("scan.conf").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_failure_suspends_without_deleting() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "Laser_on=[0,1],Repeat=2");
    config.timing.retry.max_attempts = 2;
    config.timing.retry.initial_backoff = Duration::from_millis(1);
    let beamline = Beamline::simulated(config).unwrap();
    beamline.controller.collect_dataset().await.unwrap();

    // New delays need new packets, and every upload now fails.
    let uploaded = beamline.fpga.uploaded_packets();
    beamline.fpga.fail_next_uploads(10);
    beamline
        .controller
        .update_settings(|s| s.collection_order = "Delay=[1us,2us],Laser_on=[0,1]".into());

    let result = beamline.controller.collect_dataset().await;
    assert!(result.is_err());
    assert!(beamline
        .controller
        .status_message()
        .get()
        .starts_with("Suspended"));
    assert_eq!(beamline.fpga.uploaded_packets(), uploaded);
    assert!(!beamline.controller.collecting().get());
    let log = Log::read(&dir.path().join("scan.log"));
    assert_eq!(log.rows.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_timing_outage_mid_pass_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), "Temperature,Repeat=4");
    config.timing.retry.max_attempts = 5;
    config.timing.retry.initial_backoff = Duration::from_millis(20);
    let beamline = Beamline::simulated(config).unwrap();
    let controller = &beamline.controller;

    let fpga = Arc::clone(&beamline.fpga);
    controller.current().add_handler(Delivery::Inline, move |event| {
        if event.value == 2 {
            fpga.set_connected(false);
            let fpga = Arc::clone(&fpga);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(40));
                fpga.set_connected(true);
            });
        }
    });

    let outcome = controller.collect_dataset().await.unwrap();
    assert_eq!(outcome, CollectionOutcome::Completed { collected: 12 });
    let log = Log::read(&dir.path().join("scan.log"));
    assert_eq!(log.rows.len(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inline_values_apply_to_one_expansion() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Temperature")).unwrap();
    let controller = &beamline.controller;
    assert_eq!(controller.expansion().unwrap().n(), 3);

    controller.update_settings(|s| s.collection_order = "Temperature=[1,2]".into());
    assert_eq!(controller.expansion().unwrap().n(), 2);

    controller.update_settings(|s| s.collection_order = "Temperature".into());
    let scan = controller.expansion().unwrap();
    assert_eq!(scan.n(), 3);
    let temperatures: Vec<f64> = (0..3).map(|i| scan.value(i, 0)).collect();
    assert_eq!(temperatures, vec![20.0, 25.0, 30.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_table_rows_survive_reload_and_apply() {
    let dir = tempfile::tempdir().unwrap();
    let beamline = Beamline::simulated(config(dir.path(), "Laser_on=[0,1]")).unwrap();
    let path = dir.path().join("sample.txt");

    let mut table = ConfigTable::new(
        "sample",
        vec![TableColumn::new("temperature.value", ValueFormat::Fixed(1), 0.1)],
    );
    table.set_path(path.clone()).unwrap();
    table.add_row("cold", vec!["20.0".into()]).unwrap();
    table.add_row("warm", vec!["25.0".into()]).unwrap();
    table.set_description(1, "room temperature").unwrap();
    assert!(table.add_row("#hidden", vec!["30.0".into()]).is_err());
    assert!(table.add_row("co\tld", vec![]).is_ok());
    assert!(table.add_row("co ld", vec![]).is_err());

    let loaded = ConfigTable::load(path).unwrap();
    assert_eq!(loaded.labels(), vec!["cold", "warm", "co ld"]);
    assert_eq!(loaded.describe_row(1).unwrap(), "warm: room temperature");

    let mut tables = TableSet::new(Arc::clone(&beamline.motors));
    tables.insert(loaded).unwrap();
    tables.apply("sample", "warm").await.unwrap();
    let motor = beamline.motor("temperature.value").unwrap();
    assert_eq!(motor.commands().last(), Some(&MotorValue::Number(25.0)));
}
