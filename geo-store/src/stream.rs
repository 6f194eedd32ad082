//! Lazy NDJSON record stream.
//!
//! Every physical line of the source consumes one position (1-based), whether
//! it yields a [`Record`] or is skipped. Resuming at `P + 1` therefore never
//! re-reads a line that was already consumed, even if earlier lines were
//! invalid. Invalid lines are reported as [`StreamItem::Skipped`] instead of
//! being dropped silently; only I/O errors end the stream with an error.

use std::collections::BTreeMap;
use std::io::BufRead;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::CoordinateOrder;
use crate::errors::GeoError;
use crate::geo::is_valid_point;
use crate::record::Record;

/// Why a source line did not produce a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Empty or whitespace-only line.
    Blank,
    /// Not valid UTF-8 or not a JSON object.
    MalformedJson,
    /// `text` missing, not a string, or blank.
    MissingText,
    /// `coordinates` missing or shorter than two values.
    MissingCoordinates,
    /// Coordinates not numeric, or out of range for the declared order.
    InvalidCoordinates,
}

/// One step of the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    Record(Record),
    Skipped { position: u64, reason: SkipReason },
}

impl StreamItem {
    /// Source position consumed by this item.
    pub fn position(&self) -> u64 {
        match self {
            StreamItem::Record(r) => r.position,
            StreamItem::Skipped { position, .. } => *position,
        }
    }
}

/// Tally of skipped lines per reason.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SkipStats {
    pub by_reason: BTreeMap<SkipReason, u64>,
}

impl SkipStats {
    pub fn record(&mut self, reason: SkipReason) {
        *self.by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.by_reason.values().sum()
    }

    pub fn count(&self, reason: SkipReason) -> u64 {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }
}

/// Iterator over the records of an NDJSON source, starting at a given position.
pub struct RecordStream<R> {
    reader: R,
    order: CoordinateOrder,
    start: u64,
    position: u64,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> RecordStream<R> {
    /// Wraps any buffered reader. Positions before `start` are read but not parsed.
    pub fn new(reader: R, start: u64, order: CoordinateOrder) -> Self {
        Self {
            reader,
            order,
            start: start.max(1),
            position: 0,
            buf: Vec::new(),
            done: false,
        }
    }

    /// Reads the next physical line into `self.buf`. `Ok(false)` at end of input.
    fn read_line(&mut self) -> Result<bool, GeoError> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(false);
        }
        self.position += 1;
        Ok(true)
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = Result<StreamItem, GeoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.read_line() {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Record stream exhausted at position {}", self.position);
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
            if self.position < self.start {
                continue;
            }

            let position = self.position;
            let item = match std::str::from_utf8(&self.buf) {
                Ok(line) => match parse_line(line, self.order) {
                    Ok((text, latitude, longitude)) => StreamItem::Record(Record {
                        position,
                        text,
                        latitude,
                        longitude,
                    }),
                    Err(reason) => StreamItem::Skipped { position, reason },
                },
                Err(_) => StreamItem::Skipped {
                    position,
                    reason: SkipReason::MalformedJson,
                },
            };
            if let StreamItem::Skipped { reason, .. } = &item {
                trace!("Skipping line {position}: {reason:?}");
            }
            return Some(Ok(item));
        }
    }
}

/// Parses one NDJSON line into `(text, latitude, longitude)`.
pub fn parse_line(line: &str, order: CoordinateOrder) -> Result<(String, f64, f64), SkipReason> {
    if line.trim().is_empty() {
        return Err(SkipReason::Blank);
    }
    let value: Value = serde_json::from_str(line).map_err(|_| SkipReason::MalformedJson)?;
    let obj = value.as_object().ok_or(SkipReason::MalformedJson)?;

    let text = obj
        .get("text")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .ok_or(SkipReason::MissingText)?;

    let coords = obj
        .get("coordinates")
        .and_then(Value::as_array)
        .filter(|c| c.len() >= 2)
        .ok_or(SkipReason::MissingCoordinates)?;

    let first = coord_value(&coords[0]).ok_or(SkipReason::InvalidCoordinates)?;
    let second = coord_value(&coords[1]).ok_or(SkipReason::InvalidCoordinates)?;
    let (latitude, longitude) =
        resolve_order(first, second, order).ok_or(SkipReason::InvalidCoordinates)?;

    Ok((text.to_string(), latitude, longitude))
}

/// Interprets the pair `(first, second)` as `(latitude, longitude)` for `order`.
fn resolve_order(first: f64, second: f64, order: CoordinateOrder) -> Option<(f64, f64)> {
    let lon_lat = (second, first);
    let lat_lon = (first, second);
    let valid = |(lat, lon): (f64, f64)| is_valid_point(lat, lon);
    match order {
        CoordinateOrder::LonLat => Some(lon_lat).filter(|p| valid(*p)),
        CoordinateOrder::LatLon => Some(lat_lon).filter(|p| valid(*p)),
        // Compatibility with sources that mix both orders.
        CoordinateOrder::Auto => [lon_lat, lat_lon].into_iter().find(|p| valid(*p)),
    }
}

/// Accepts JSON numbers and numeric strings.
fn coord_value(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}
