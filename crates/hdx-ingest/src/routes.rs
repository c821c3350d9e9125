//! Workout route summaries
//!
//! Workouts reference GPX files through `WorkoutRoute/FileReference@path`.
//! Only the point count and the travelled distance are kept.

use hdx_common::{HdxError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;
use std::path::{Component, Path, PathBuf};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RouteSummary {
    pub points: u64,
    pub distance_m: f64,
}

/// Reads GPX files relative to the export directory
#[derive(Debug, Clone)]
pub struct RouteSummarizer {
    base_dir: PathBuf,
}

impl RouteSummarizer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve a file reference such as `/workout-routes/route_1.gpx`
    pub fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let relative = Path::new(reference.trim_start_matches(['/', '\\']));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(HdxError::config(format!(
                "Route reference escapes the export directory: {reference}"
            )));
        }
        Ok(self.base_dir.join(relative))
    }

    pub fn summarize(&self, reference: &str) -> Result<RouteSummary> {
        let path = self.resolve(reference)?;
        let file = std::fs::File::open(&path)?;
        summarize_gpx(std::io::BufReader::new(file))
    }
}

/// Count track/route points and sum great-circle distances between them
pub fn summarize_gpx<R: BufRead>(source: R) -> Result<RouteSummary> {
    let mut reader = Reader::from_reader(source);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut summary = RouteSummary::default();
    let mut previous: Option<(f64, f64)> = None;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            HdxError::structural(reader.error_position() as u64, e.to_string())
        })?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if let Some(point) = point_of(e) {
                    if let Some(prev) = previous {
                        summary.distance_m += haversine_m(prev, point);
                    }
                    summary.points += 1;
                    previous = Some(point);
                }
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    Ok(summary)
}

fn point_of(e: &BytesStart<'_>) -> Option<(f64, f64)> {
    let name = e.local_name();
    if name.as_ref() != b"trkpt" && name.as_ref() != b"rtept" {
        return None;
    }

    let mut lat = None;
    let mut lon = None;
    for attr in e.attributes().flatten() {
        let value = std::str::from_utf8(&attr.value).ok()?.trim().parse::<f64>().ok();
        match attr.key.as_ref() {
            b"lat" => lat = value,
            b"lon" => lon = value,
            _ => {},
        }
    }
    Some((lat?, lon?))
}

fn haversine_m((lat1, lon1): (f64, f64), (lat2, lon2): (f64, f64)) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}
