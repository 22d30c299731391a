//! Derivation of the measurement, device, apparatus and flight tables from the unified feed.
//!
//! Every function here borrows the unified records and returns a freshly built table. For each
//! table the steps are: project the columns, normalise the key, drop rows without a key,
//! deduplicate keeping the first occurrence, then coerce the remaining typed columns.

use crate::models::{
    ApparatusRow, DeviceRow, FlightRow, MeasurementRow, Scalar, UnifiedRecord,
};

use hashbrown::HashSet;
use std::hash::Hash;

/// Normalise a device or apparatus identifier.
///
/// Lower-cases the value, then strips surrounding quote characters and whitespace. An empty
/// result is treated as absent. The function is idempotent.
pub fn normalize_identifier(raw: Option<&str>) -> Option<String> {
    let lowered = raw?.to_lowercase();
    let stripped = lowered.trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace());
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Coerce an optional loosely typed value to a nullable integer.
fn nullable_int(value: Option<&Scalar>) -> Option<i64> {
    value.and_then(Scalar::as_nullable_int)
}

/// Keep the first row for each key, preserving order.
fn dedup_first<T, K, F>(rows: impl IntoIterator<Item = T>, key: F) -> Vec<T>
where
    K: Eq + Hash + Clone,
    F: Fn(&T) -> &K,
{
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(key(row).clone()))
        .collect()
}

/// Build the measurements table.
///
/// One row per report. `rain` and `storm` default to 0. Device and apparatus references are
/// normalised and the flight reference coerced so that they join against the other tables.
pub fn measurements_table(records: &[UnifiedRecord]) -> Vec<MeasurementRow> {
    records
        .iter()
        .map(|r| MeasurementRow {
            report_uuid: r.report_uuid.clone(),
            apparatus_id: normalize_identifier(r.apparatus_id.as_deref()),
            temperature: r.temperature,
            value: r.value,
            hits_number: r.hits_number,
            start_time: r.start_time.clone(),
            end_time: r.end_time.clone(),
            latitude: r.latitude,
            longitude: r.longitude,
            device_uuid: normalize_identifier(r.device_uuid.as_deref()),
            user_id: r.user_id.clone(),
            measurement_environment: r.measurement_environment.clone(),
            rain: nullable_int(r.rain.as_ref()).unwrap_or(0),
            storm: nullable_int(r.storm.as_ref()).unwrap_or(0),
            flight_id: nullable_int(r.flight_id.as_ref()),
            date_and_time_of_creation: r.date_and_time_of_creation.clone(),
        })
        .collect()
}

/// Build the devices table, keyed by normalised `deviceUuid`.
pub fn devices_table(records: &[UnifiedRecord]) -> Vec<DeviceRow> {
    let rows = records.iter().filter_map(|r| {
        normalize_identifier(r.device_uuid.as_deref()).map(|device_uuid| DeviceRow {
            device_uuid,
            device_platform: r.device_platform.clone(),
            device_version: r.device_version.clone(),
            device_model: r.device_model.clone(),
        })
    });
    dedup_first(rows, |row| &row.device_uuid)
}

/// Build the apparatus table, keyed by normalised `apparatusId`.
pub fn apparatus_table(records: &[UnifiedRecord]) -> Vec<ApparatusRow> {
    let rows = records.iter().filter_map(|r| {
        normalize_identifier(r.apparatus_id.as_deref()).map(|apparatus_id| ApparatusRow {
            apparatus_id,
            apparatus_version: r.apparatus_version.clone(),
            apparatus_sensor_type: r.apparatus_sensor_type.clone(),
            apparatus_tube_type: r.apparatus_tube_type.clone(),
        })
    });
    dedup_first(rows, |row| &row.apparatus_id)
}

/// Build the flights table, keyed by `flightId` coerced to an integer.
pub fn flights_table(records: &[UnifiedRecord]) -> Vec<FlightRow> {
    let keyed = records
        .iter()
        .filter_map(|r| nullable_int(r.flight_id.as_ref()).map(|flight_id| (flight_id, r)));
    dedup_first(keyed, |(flight_id, _)| flight_id)
        .into_iter()
        .map(|(flight_id, r)| FlightRow {
            flight_id,
            flight_number: r.flight_number.clone(),
            seat_number: r.seat_number.clone(),
            window_seat: nullable_int(r.window_seat.as_ref()),
            departure_time: r.departure_time.clone(),
            arrival_time: r.arrival_time.clone(),
            airport_origin: r.airport_origin.clone(),
            airport_destination: r.airport_destination.clone(),
            aircraft_type: r.aircraft_type.clone(),
        })
        .collect()
}

/// Order the feed newest first.
///
/// The sort is stable; records whose creation timestamp is missing or unparseable go last. The
/// recent filter of the streaming responder stops at the first out-of-window record and relies
/// on this order.
pub fn sort_by_creation_desc(records: &mut [UnifiedRecord]) {
    records.sort_by_cached_key(|r| std::cmp::Reverse(r.created_at()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::record;

    #[test]
    fn normalize_identifier_cases() {
        assert_eq!(Some("abc-1".to_string()), normalize_identifier(Some(" ABC-1 ")));
        assert_eq!(Some("abc-1".to_string()), normalize_identifier(Some("\"ABC-1\"")));
        assert_eq!(Some("abc".to_string()), normalize_identifier(Some(" ' \"Abc\" ' ")));
        assert_eq!(Some("a b".to_string()), normalize_identifier(Some("A B")));
        assert_eq!(None, normalize_identifier(Some("")));
        assert_eq!(None, normalize_identifier(Some("   ")));
        assert_eq!(None, normalize_identifier(Some("\"\"")));
        assert_eq!(None, normalize_identifier(None));
    }

    #[test]
    fn normalize_identifier_idempotent() {
        let inputs = [
            " ABC-1 ", "\"x\"", "' \" Y \" '", "", " ", "\"", "MiXeD", "a\"b", "\t'q'\n",
            "ÉTÉ",
        ];
        for input in inputs {
            let once = normalize_identifier(Some(input));
            let twice = normalize_identifier(once.as_deref());
            assert_eq!(once, twice, "input: {input:?}");
        }
    }

    #[test]
    fn scenario_device_and_rain() {
        let mut first = record("r1");
        first.device_uuid = Some(" ABC-1 ".to_string());
        first.apparatus_id = None;
        first.rain = None;
        let mut second = record("r2");
        second.device_uuid = Some("abc-1".to_string());
        second.apparatus_id = Some("X1".to_string());
        second.rain = Some(Scalar::Int(1));
        let records = vec![first, second];

        let devices = devices_table(&records);
        assert_eq!(1, devices.len());
        assert_eq!("abc-1", devices[0].device_uuid);

        let measurements = measurements_table(&records);
        assert_eq!(2, measurements.len());
        assert_eq!(0, measurements[0].rain);
        assert_eq!(1, measurements[1].rain);
        assert_eq!(0, measurements[0].storm);
    }

    #[test]
    fn devices_keep_first_occurrence() {
        let mut first = record("r1");
        first.device_uuid = Some("Dev".to_string());
        first.device_model = Some("first".to_string());
        let mut second = record("r2");
        second.device_uuid = Some("\"dev\"".to_string());
        second.device_model = Some("second".to_string());
        let mut missing = record("r3");
        missing.device_uuid = Some("  ".to_string());

        let devices = devices_table(&[first, second, missing]);
        assert_eq!(1, devices.len());
        assert_eq!(Some("first".to_string()), devices[0].device_model);
    }

    #[test]
    fn apparatus_drop_absent_and_dedup() {
        let mut a = record("r1");
        a.apparatus_id = Some("X1".to_string());
        a.apparatus_tube_type = Some("SBM-20".to_string());
        let mut b = record("r2");
        b.apparatus_id = Some("x1".to_string());
        let mut c = record("r3");
        c.apparatus_id = Some("Y2".to_string());
        let d = record("r4");

        let apparatus = apparatus_table(&[a, b, c, d]);
        let keys: Vec<&str> = apparatus.iter().map(|r| r.apparatus_id.as_str()).collect();
        assert_eq!(vec!["x1", "y2"], keys);
        assert_eq!(Some("SBM-20".to_string()), apparatus[0].apparatus_tube_type);
    }

    #[test]
    fn flights_coerce_key_and_window_seat() {
        let mut a = record("r1");
        a.flight_id = Some(Scalar::Float(12.0));
        a.window_seat = Some(Scalar::Bool(true));
        let mut b = record("r2");
        b.flight_id = Some(Scalar::Text("12".to_string()));
        let mut c = record("r3");
        c.flight_id = Some(Scalar::Text("not a number".to_string()));
        let mut d = record("r4");
        d.flight_id = Some(Scalar::Int(7));
        d.window_seat = Some(Scalar::Text("".to_string()));

        let flights = flights_table(&[a, b, c, d]);
        assert_eq!(2, flights.len());
        assert_eq!(12, flights[0].flight_id);
        assert_eq!(Some(1), flights[0].window_seat);
        assert_eq!(7, flights[1].flight_id);
        assert_eq!(None, flights[1].window_seat);
    }

    #[test]
    fn derived_keys_unique_and_sourced() {
        let ids = ["A", "a", " b ", "", "B", "c", "\"C\""];
        let records: Vec<UnifiedRecord> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut r = record(&i.to_string());
                r.device_uuid = Some(id.to_string());
                r.apparatus_id = Some(id.to_string());
                r
            })
            .collect();

        let devices = devices_table(&records);
        let keys: HashSet<&String> = devices.iter().map(|d| &d.device_uuid).collect();
        assert_eq!(devices.len(), keys.len());
        for key in keys {
            assert!(records
                .iter()
                .any(|r| normalize_identifier(r.device_uuid.as_deref()).as_ref() == Some(key)));
        }
        assert_eq!(devices.len(), apparatus_table(&records).len());
    }

    #[test]
    fn measurements_normalise_references() {
        let mut r = record("r1");
        r.device_uuid = Some(" DEV ".to_string());
        r.apparatus_id = Some("''".to_string());
        r.flight_id = Some(Scalar::Text("42".to_string()));
        r.storm = Some(Scalar::Bool(true));

        let measurements = measurements_table(&[r.clone()]);
        assert_eq!(Some("dev".to_string()), measurements[0].device_uuid);
        assert_eq!(None, measurements[0].apparatus_id);
        assert_eq!(Some(42), measurements[0].flight_id);
        assert_eq!(1, measurements[0].storm);
        // The input is left untouched.
        assert_eq!(Some(" DEV ".to_string()), r.device_uuid);
    }

    #[test]
    fn sort_newest_first() {
        let mut records: Vec<UnifiedRecord> = [
            ("a", Some("2023-05-01T00:00:00Z")),
            ("b", None),
            ("c", Some("2025-01-01 10:00:00")),
            ("d", Some("garbage")),
            ("e", Some("2024-07-01T00:00:00Z")),
        ]
        .into_iter()
        .map(|(id, ts)| {
            let mut r = record(id);
            r.date_and_time_of_creation = ts.map(str::to_string);
            r
        })
        .collect();

        sort_by_creation_desc(&mut records);
        let order: Vec<&str> = records
            .iter()
            .map(|r| r.report_uuid.as_deref().unwrap())
            .collect();
        assert_eq!(vec!["c", "e", "a", "b", "d"], order);
    }
}
