//! Data types and associated functions and methods

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

/// Name of the column holding the creation timestamp of a measurement.
pub const CREATION_TIME_FIELD: &str = "dateAndTimeOfCreation";

/// A loosely typed cell value.
///
/// Some columns of the feed have been published as booleans, integers, floats or strings over
/// time. They are kept as-is at load time and coerced by the normaliser.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Coerce to a nullable integer.
    ///
    /// Integral floats and numeric strings are accepted, booleans map to 0/1.
    /// Anything else, including empty strings and fractional numbers, is absent.
    pub fn as_nullable_int(&self) -> Option<i64> {
        match self {
            Scalar::Bool(b) => Some(i64::from(*b)),
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) => float_to_int(*f),
            Scalar::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else if let Ok(i) = s.parse::<i64>() {
                    Some(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    float_to_int(f)
                } else if s.eq_ignore_ascii_case("true") {
                    Some(1)
                } else if s.eq_ignore_ascii_case("false") {
                    Some(0)
                } else {
                    None
                }
            }
        }
    }
}

fn float_to_int(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// One row of the raw OpenRadiation feed.
///
/// Column names follow the published CSV header. Every field may be missing.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnifiedRecord {
    pub apparatus_id: Option<String>,
    pub apparatus_version: Option<String>,
    pub apparatus_sensor_type: Option<String>,
    pub apparatus_tube_type: Option<String>,
    pub temperature: Option<f64>,
    pub value: Option<f64>,
    pub hits_number: Option<i64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub device_uuid: Option<String>,
    pub device_platform: Option<String>,
    pub device_version: Option<String>,
    pub device_model: Option<String>,
    pub report_uuid: Option<String>,
    pub manual_reporting: Option<Scalar>,
    pub organisation_reporting: Option<String>,
    pub description: Option<String>,
    pub measurement_height: Option<f64>,
    pub user_id: Option<String>,
    pub measurement_environment: Option<String>,
    pub rain: Option<Scalar>,
    pub storm: Option<Scalar>,
    pub flight_number: Option<String>,
    pub seat_number: Option<String>,
    pub window_seat: Option<Scalar>,
    pub flight_id: Option<Scalar>,
    pub departure_time: Option<String>,
    pub arrival_time: Option<String>,
    pub airport_origin: Option<String>,
    pub airport_destination: Option<String>,
    pub aircraft_type: Option<String>,
    pub date_and_time_of_creation: Option<String>,
    pub qualification: Option<String>,
    pub reliability: Option<f64>,
    pub atypical: Option<Scalar>,
}

impl UnifiedRecord {
    /// Parsed creation timestamp, if present and well formed.
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.date_and_time_of_creation
            .as_deref()
            .and_then(parse_timestamp)
    }
}

/// A row of the measurements table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRow {
    pub report_uuid: Option<String>,
    pub apparatus_id: Option<String>,
    pub temperature: Option<f64>,
    pub value: Option<f64>,
    pub hits_number: Option<i64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub device_uuid: Option<String>,
    pub user_id: Option<String>,
    pub measurement_environment: Option<String>,
    pub rain: i64,
    pub storm: i64,
    pub flight_id: Option<i64>,
    pub date_and_time_of_creation: Option<String>,
}

/// A row of the devices table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRow {
    pub device_uuid: String,
    pub device_platform: Option<String>,
    pub device_version: Option<String>,
    pub device_model: Option<String>,
}

/// A row of the apparatus table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApparatusRow {
    pub apparatus_id: String,
    pub apparatus_version: Option<String>,
    pub apparatus_sensor_type: Option<String>,
    pub apparatus_tube_type: Option<String>,
}

/// A row of the flights table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightRow {
    pub flight_id: i64,
    pub flight_number: Option<String>,
    pub seat_number: Option<String>,
    pub window_seat: Option<i64>,
    pub departure_time: Option<String>,
    pub arrival_time: Option<String>,
    pub airport_origin: Option<String>,
    pub airport_destination: Option<String>,
    pub aircraft_type: Option<String>,
}

/// Datasets persisted by the pipeline and served by the API.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Dataset {
    /// The full feed, one [UnifiedRecord] per line
    #[serde(rename = "openradiation")]
    #[strum(serialize = "openradiation")]
    Feed,
    /// [MeasurementRow]
    Measurements,
    /// [DeviceRow]
    Devices,
    /// [ApparatusRow]
    Apparatus,
    /// [FlightRow]
    Flights,
}

impl Dataset {
    /// All datasets, feed first.
    pub const ALL: [Dataset; 5] = [
        Dataset::Feed,
        Dataset::Measurements,
        Dataset::Devices,
        Dataset::Apparatus,
        Dataset::Flights,
    ];

    /// File name of the JSON lines export.
    pub fn file_name(self) -> String {
        format!("{}.jsonl", self)
    }

    /// Whether rows carry a creation timestamp usable by the recent filter.
    pub fn has_creation_time(self) -> bool {
        matches!(self, Dataset::Feed | Dataset::Measurements)
    }
}

/// Parse a timestamp as published in the feed.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` with optional fractional seconds, the same with a `T`
/// separator and no offset, and bare dates. Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts);
    }
    let naive_formats = [
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    ];
    for format in naive_formats {
        if let Ok(ts) = PrimitiveDateTime::parse(s, format) {
            return Some(ts.assume_utc());
        }
    }
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|date| date.midnight().assume_utc())
}
