//! Best-effort coordinate extraction from a telemetry record.
//!
//! Pure, no I/O. An unresolvable location is `None`, never an error: the
//! dispatcher still alerts, it just cannot say where.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::feed::TelemetryRecord;

/// A signed latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both coordinates are inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }

    /// `lat,lng` as used in map query strings.
    pub fn query_pair(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude, self.longitude)
    }
}

/// Which record fields carry the coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationFields {
    pub latitude: String,
    pub longitude: String,
}

impl Default for LocationFields {
    fn default() -> Self {
        Self {
            latitude: "field2".to_string(),
            longitude: "field3".to_string(),
        }
    }
}

/// Resolve a location from `record`, or `None` if either coordinate is
/// missing, not a finite number, or outside WGS84 ranges.
pub fn resolve(record: &TelemetryRecord, fields: &LocationFields) -> Option<Location> {
    let latitude = coordinate(record, &fields.latitude)?;
    let longitude = coordinate(record, &fields.longitude)?;
    let location = Location::new(latitude, longitude);
    if !location.is_valid() {
        warn!(latitude, longitude, "Telemetry coordinates out of range; location treated as absent");
        return None;
    }
    Some(location)
}

fn coordinate(record: &TelemetryRecord, field: &str) -> Option<f64> {
    record
        .field(field)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}
