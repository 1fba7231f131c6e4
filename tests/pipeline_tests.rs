//! Full-pipeline scenarios driven through the library API over temp
//! directories.

mod common;

use std::fs;

use chrono::NaiveDate;
use serde_json::json;

use availability_ledger::core::config::Config;
use availability_ledger::identity::keys::ExternalKey;
use availability_ledger::ingest::feed::Feed;
use availability_ledger::output::csv_sink::{IDS_FILE, LOCATIONS_FILE};
use availability_ledger::pipeline::driver::{Driver, RunOptions};

use common::{UUID_A, UUID_B, Workspace, snapshot_row};

fn config(ws: &Workspace) -> Config {
    let mut cfg = Config::default();
    cfg.paths.raw_dir = ws.raw_dir();
    cfg.paths.out_dir = ws.out_dir();
    cfg.paths.state_dir = ws.state_dir();
    cfg
}

fn days(first: u32, last: u32) -> Vec<NaiveDate> {
    (first..=last)
        .map(|d| NaiveDate::from_ymd_opt(2021, 5, d).unwrap())
        .collect()
}

fn options(days: Vec<NaiveDate>) -> RunOptions {
    RunOptions {
        days,
        slots: true,
        flush: false,
        clean_run: false,
        verbose: false,
    }
}

/// Three days of two locations flipping between states, with slots.
fn seed_three_days(ws: &Workspace) {
    let with_slot = |mut row: serde_json::Value, open: &str| {
        row["availability"]["slots"] =
            json!([{"start": "2021-05-04T10:00:00-04:00", "available": open}]);
        row
    };
    for (stamp, valid_at, a, b) in [
        ("20210501_1000", "2021-05-01T14:00:00Z", ("NO", None), ("YES", Some(3))),
        ("20210501_2200", "2021-05-02T02:00:00Z", ("NO", None), ("YES", Some(3))),
        ("20210502_1000", "2021-05-02T14:00:00Z", ("YES", Some(7)), ("YES", Some(3))),
        ("20210502_1800", "2021-05-02T22:00:00Z", ("YES", Some(7)), ("NO", None)),
        ("20210503_1000", "2021-05-03T14:00:00Z", ("UNKNOWN", None), ("NO", None)),
    ] {
        let rows = [
            with_slot(snapshot_row(UUID_A, valid_at, a.0, a.1), a.0),
            snapshot_row(UUID_B, valid_at, b.0, b.1),
        ];
        ws.write_snapshot(stamp, &rows);
    }
}

#[test]
fn day_by_day_runs_match_one_multi_day_run() {
    let whole = Workspace::new();
    seed_three_days(&whole);
    let mut driver = Driver::from_config(config(&whole), Feed::UnivafSnapshot).unwrap();
    let summary = driver.run(&options(days(1, 3))).unwrap();
    assert_eq!(summary.days.len(), 3);

    let split = Workspace::new();
    seed_three_days(&split);
    for day in days(1, 3) {
        let mut driver = Driver::from_config(config(&split), Feed::UnivafSnapshot).unwrap();
        let summary = driver.run(&options(vec![day])).unwrap();
        assert_eq!(summary.days[0].checkpoint_loaded, day.to_string() != "2021-05-01");
    }

    for name in [
        "avs_2021-05-01.csv",
        "avs_2021-05-02.csv",
        "avs_2021-05-03.csv",
        "slots_2021-05-01.csv",
        "slots_2021-05-02.csv",
        "slots_2021-05-03.csv",
        IDS_FILE,
        LOCATIONS_FILE,
    ] {
        assert_eq!(whole.read_out(name), split.read_out(name), "{name} differs");
    }

    // Location A: NO from day 1 into day 2, then a count of 7.
    let day2 = whole.read_out("avs_2021-05-02.csv");
    assert!(day2.contains("1,2021-05-01 14:00:00,2021-05-02 02:00:00,-4,0\n"));
    let day3 = whole.read_out("avs_2021-05-03.csv");
    assert!(day3.contains("1,2021-05-02 14:00:00,2021-05-02 22:00:00,-4,7\n"));
    // Location B: a count of 3 until it closes late on day 2.
    assert!(day2.contains("2,2021-05-01 14:00:00,2021-05-02 14:00:00,-4,3\n"));
}

#[test]
fn locations_table_reflects_normalized_records() {
    let ws = Workspace::new();
    ws.write_snapshot(
        "20210501_0900",
        &[snapshot_row(UUID_A, "2021-05-01T13:00:00Z", "NO", None)],
    );
    let mut driver = Driver::from_config(config(&ws), Feed::UnivafSnapshot).unwrap();
    driver.run(&options(days(1, 1))).unwrap();

    let table = ws.read_out(LOCATIONS_FILE);
    let mut lines = table.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("id,uuid,name,provider,type,address"));
    let row = lines.next().unwrap();
    assert!(row.starts_with(&format!("1,{UUID_A},Cvs Pharmacy #123,cvs,")));
    assert!(row.contains(",Boston,"));
    assert!(row.contains(",MA,02115,"));
    assert!(row.ends_with(",America/New_York"));
}

#[test]
fn vaccinespotter_change_log_end_to_end() {
    let ws = Workspace::new();
    let location = json!({
        "id": 77, "name": "WALGREENS 1234", "brand": "Walgreens",
        "city": "CHICAGO", "state": "il", "time_zone": "America/Chicago"
    });
    let mut opened = location.clone();
    opened["appointments_available"] = json!(true);
    opened["appointments"] = json!([{"time": "a"}, {"time": "b"}]);
    opened["appointments_last_fetched"] = json!("2021-05-01T09:59:00Z");
    let mut closed_before = location.clone();
    closed_before["appointments_available"] = json!(false);
    closed_before["updated_at"] = json!("2021-05-01T09:00:00Z");
    closed_before["time_zone"] = json!(null);
    let mut closed_after = location.clone();
    closed_after["appointments_available"] = json!(false);
    closed_after["appointments"] = json!([]);
    closed_after["updated_at"] = json!("2021-05-01T11:00:00Z");

    ws.write_change_log(
        "2021-05-01",
        &[
            json!({
                "action": "UPDATE",
                "transaction_timestamp": "2021-05-01 10:00:00+00",
                "changed_data": {"appointments_available": true},
                "previous_data": closed_before,
                "data": opened
            }),
            json!({
                "action": "UPDATE",
                "changed_data": {"name": "WALGREENS #1234"},
                "previous_data": location,
                "data": location
            }),
            json!({"action": "TRUNCATE"}),
            json!({
                "action": "UPDATE",
                "changed_data": {"appointments": []},
                "previous_data": opened,
                "data": closed_after
            }),
        ],
    );

    let mut driver = Driver::from_config(config(&ws), Feed::Vaccinespotter).unwrap();
    let mut opts = options(days(1, 1));
    opts.flush = true;
    let summary = driver.run(&opts).unwrap();

    let day = &summary.days[0];
    assert_eq!(day.records, 4);
    assert_eq!(day.skipped_records, 1);
    assert_eq!(day.observations, 4);
    assert_eq!(day.avs_emitted, 3);
    assert_eq!(
        ws.read_out("avs_2021-05-01.csv"),
        "1,2021-05-01 09:00:00,2021-05-01 09:00:00,-5,0\n\
         1,2021-05-01 09:59:00,2021-05-01 09:59:00,-5,2\n\
         1,2021-05-01 11:00:00,2021-05-01 11:00:00,-5,0\n"
    );
    assert!(!ws.out_dir().join("slots_2021-05-01.csv").exists());
    assert_eq!(
        driver
            .ids()
            .get(&ExternalKey::parse("vaccinespotter:77").unwrap()),
        Some(1)
    );
}

#[test]
fn legacy_keys_in_an_existing_map_are_rewritten() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.out_dir()).unwrap();
    fs::write(
        ws.out_dir().join(IDS_FILE),
        "eid,iid\nunivaf_v1_3:abc,4\nvtsgeo:9,2\n",
    )
    .unwrap();
    let mut row = snapshot_row(UUID_A, "2021-05-01T13:00:00Z", "NO", None);
    row["external_ids"] = json!({"univaf_v1": "abc"});
    ws.write_snapshot("20210501_0900", &[row]);

    let mut driver = Driver::from_config(config(&ws), Feed::UnivafSnapshot).unwrap();
    let summary = driver.run(&options(days(1, 1))).unwrap();
    assert_eq!(summary.legacy_keys_rewritten, 1);
    assert_eq!(summary.internal_ids, 2);

    let ids = ws.read_out(IDS_FILE);
    assert!(ids.contains("univaf_v1:abc,4\n"));
    assert!(ids.contains(&format!("uuid:{UUID_A},4\n")));
    assert!(!ids.contains("univaf_v1_3"));
}

#[test]
fn conflicting_ids_are_reported_and_never_repointed() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.out_dir()).unwrap();
    fs::write(
        ws.out_dir().join(IDS_FILE),
        "eid,iid\ncvs:1,1\nwalgreens:2,2\n",
    )
    .unwrap();
    let mut row = snapshot_row(UUID_A, "2021-05-01T13:00:00Z", "NO", None);
    row["external_ids"] = json!([["cvs", "1"], ["walgreens", "2"]]);
    ws.write_snapshot("20210501_0900", &[row]);

    let mut driver = Driver::from_config(config(&ws), Feed::UnivafSnapshot).unwrap();
    let summary = driver.run(&options(days(1, 1))).unwrap();
    assert_eq!(summary.days[0].merge_conflicts, 1);

    let ids = driver.ids();
    assert_eq!(ids.get(&ExternalKey::parse("cvs:1").unwrap()), Some(1));
    assert_eq!(ids.get(&ExternalKey::parse("walgreens:2").unwrap()), Some(2));
    assert_eq!(ids.get(&ExternalKey::uuid(UUID_A).unwrap()), Some(1));
}

#[test]
fn late_snapshot_never_moves_last_seen_back() {
    let ws = Workspace::new();
    ws.write_snapshot("20210501_1000", &[snapshot_row(UUID_A, "2021-05-01T10:00:00Z", "NO", None)]);
    ws.write_snapshot("20210501_1100", &[snapshot_row(UUID_A, "2021-05-01T09:30:00Z", "NO", None)]);
    ws.write_snapshot("20210501_1200", &[snapshot_row(UUID_A, "2021-05-01T12:00:00Z", "YES", Some(3))]);

    let mut driver = Driver::from_config(config(&ws), Feed::UnivafSnapshot).unwrap();
    driver.run(&options(days(1, 1))).unwrap();
    assert_eq!(
        ws.read_out("avs_2021-05-01.csv"),
        "1,2021-05-01 10:00:00,2021-05-01 10:00:00,-4,0\n"
    );
}

#[test]
fn clean_run_ignores_previous_snapshots() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.out_dir()).unwrap();
    fs::write(ws.out_dir().join(IDS_FILE), "eid,iid\ncvs:1,40\n").unwrap();
    ws.write_snapshot("20210501_0900", &[snapshot_row(UUID_A, "2021-05-01T13:00:00Z", "NO", None)]);

    let mut driver = Driver::from_config(config(&ws), Feed::UnivafSnapshot).unwrap();
    let mut opts = options(days(1, 1));
    opts.clean_run = true;
    driver.run(&opts).unwrap();
    assert_eq!(driver.ids().get(&ExternalKey::uuid(UUID_A).unwrap()), Some(1));
    assert!(!ws.read_out(IDS_FILE).contains("cvs:1,40"));
}

#[test]
fn clean_run_takes_ids_and_metadata_from_the_newest_snapshot() {
    let ws = Workspace::new();
    ws.write_snapshot(
        "20210501_0900",
        &[
            snapshot_row(UUID_A, "2021-05-01T13:00:00Z", "NO", None),
            snapshot_row(UUID_B, "2021-05-01T13:00:00Z", "NO", None),
        ],
    );
    let mut moved = snapshot_row(UUID_A, "2021-05-03T13:00:00Z", "YES", Some(9));
    moved["city"] = json!("CAMBRIDGE");
    ws.write_snapshot(
        "20210503_0900",
        &[snapshot_row(UUID_B, "2021-05-03T13:00:00Z", "YES", Some(1)), moved],
    );

    let mut driver = Driver::from_config(config(&ws), Feed::UnivafSnapshot).unwrap();
    let mut opts = options(days(1, 1));
    opts.clean_run = true;
    opts.flush = true;
    driver.run(&opts).unwrap();

    let ids = driver.ids();
    assert_eq!(ids.get(&ExternalKey::uuid(UUID_B).unwrap()), Some(1));
    assert_eq!(ids.get(&ExternalKey::uuid(UUID_A).unwrap()), Some(2));

    // Only day 1 is observed, so no count of 9 or 1 shows up.
    assert_eq!(
        ws.read_out("avs_2021-05-01.csv"),
        "1,2021-05-01 13:00:00,2021-05-01 13:00:00,-4,0\n\
         2,2021-05-01 13:00:00,2021-05-01 13:00:00,-4,0\n"
    );
    let table = ws.read_out(LOCATIONS_FILE);
    let row_a = table.lines().find(|line| line.starts_with("2,")).unwrap();
    assert!(row_a.contains(",Cambridge,"));
}
