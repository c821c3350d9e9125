//! Metric routing and field extraction
//!
//! A [`RoutingTable`] maps raw type tags to a [`MetricKind`] and an
//! [`Extraction`]. The [`Router`] applies it in two steps so failures can be
//! attributed: [`Router::classify`] looks the tag up, [`Router::extract`]
//! normalizes the shared fields and then runs the extraction.

use crate::error::RecordError;
use crate::normalize::{SourceNormalizer, TimestampNormalizer};
use crate::parser::{RawElement, RawRecord};
use crate::routes::RouteSummarizer;
use chrono::NaiveDateTime;
use hdx_common::checksum::Fingerprint;
use hdx_common::types::TIMESTAMP_FORMAT;
use hdx_common::MetricKind;
use std::collections::HashMap;
use tracing::warn;

const QUANTITY_PREFIX: &str = "HKQuantityTypeIdentifier";
const DIETARY_PREFIX: &str = "HKQuantityTypeIdentifierDietary";
const SLEEP_VALUE_PREFIX: &str = "HKCategoryValueSleepAnalysis";
const WORKOUT_ACTIVITY_PREFIX: &str = "HKWorkoutActivityType";
pub const WORKOUT_TAG: &str = "Workout";

/// How the fields of a routed record are read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// Numeric `value` and `unit`
    Quantity,
    /// Quantity plus a `metric_type` column naming the raw type
    TypedQuantity,
    /// Quantity plus the nutrient named by the tag
    Nutrition,
    /// Stage interval with a duration
    Sleep,
    Workout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub metric: MetricKind,
    pub extraction: Extraction,
}

/// Immutable tag → route rules
///
/// Exact tags win over prefixes; prefixes are tried in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    exact: HashMap<String, Route>,
    prefixes: Vec<(String, Route)>,
}

impl RoutingTable {
    /// A table with no rules
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, tag: &str, metric: MetricKind, extraction: Extraction) -> Self {
        self.exact.insert(tag.to_string(), Route { metric, extraction });
        self
    }

    pub fn with_prefix(mut self, prefix: &str, metric: MetricKind, extraction: Extraction) -> Self {
        self.prefixes
            .push((prefix.to_string(), Route { metric, extraction }));
        self
    }

    fn with_quantities(self, metric: MetricKind, extraction: Extraction, names: &[&str]) -> Self {
        names.iter().fold(self, |table, name| {
            table.with_rule(&format!("{QUANTITY_PREFIX}{name}"), metric, extraction)
        })
    }

    /// Rules for Apple Health exports
    pub fn apple_health() -> Self {
        use Extraction::*;
        use MetricKind as M;

        Self::empty()
            .with_quantities(M::HeartRate, Quantity, &["HeartRate"])
            .with_quantities(M::RestingHeartRate, Quantity, &["RestingHeartRate"])
            .with_quantities(M::HeartRateVariability, Quantity, &["HeartRateVariabilitySDNN"])
            .with_quantities(M::WalkingHeartRate, Quantity, &["WalkingHeartRateAverage"])
            .with_quantities(M::HeartRateRecovery, Quantity, &["HeartRateRecoveryOneMinute"])
            .with_quantities(M::Vo2Max, Quantity, &["VO2Max"])
            .with_quantities(M::StepCount, Quantity, &["StepCount"])
            .with_quantities(M::DistanceWalkingRunning, Quantity, &["DistanceWalkingRunning"])
            .with_quantities(M::DistanceCycling, Quantity, &["DistanceCycling"])
            .with_quantities(M::FlightsClimbed, Quantity, &["FlightsClimbed"])
            .with_quantities(M::ExerciseTime, Quantity, &["AppleExerciseTime"])
            .with_quantities(M::StandTime, Quantity, &["AppleStandTime"])
            .with_quantities(M::ActiveEnergy, Quantity, &["ActiveEnergyBurned"])
            .with_quantities(M::BasalEnergy, Quantity, &["BasalEnergyBurned"])
            .with_quantities(
                M::WalkingMetrics,
                TypedQuantity,
                &[
                    "WalkingSpeed",
                    "WalkingStepLength",
                    "WalkingAsymmetryPercentage",
                    "WalkingDoubleSupportPercentage",
                    "AppleWalkingSteadiness",
                    "StairAscentSpeed",
                    "StairDescentSpeed",
                    "SixMinuteWalkTestDistance",
                ],
            )
            .with_quantities(M::Weight, Quantity, &["BodyMass"])
            .with_quantities(M::BodyMassIndex, Quantity, &["BodyMassIndex"])
            .with_quantities(
                M::BodyComposition,
                TypedQuantity,
                &["Height", "BodyFatPercentage", "LeanBodyMass", "WaistCircumference"],
            )
            .with_quantities(M::BloodOxygen, Quantity, &["OxygenSaturation"])
            .with_quantities(M::RespiratoryRate, Quantity, &["RespiratoryRate"])
            .with_quantities(M::NutritionWater, Quantity, &["DietaryWater"])
            .with_quantities(M::NutritionCaffeine, Quantity, &["DietaryCaffeine"])
            .with_prefix(DIETARY_PREFIX, M::Nutrition, Nutrition)
            .with_quantities(
                M::AudioExposure,
                TypedQuantity,
                &[
                    "EnvironmentalAudioExposure",
                    "HeadphoneAudioExposure",
                    "EnvironmentalSoundReduction",
                ],
            )
            .with_quantities(M::TimeInDaylight, Quantity, &["TimeInDaylight"])
            .with_rule("HKCategoryTypeIdentifierSleepAnalysis", M::SleepAnalysis, Sleep)
            .with_rule(WORKOUT_TAG, M::Workout, Workout)
    }

    pub fn lookup(&self, tag: &str) -> Option<Route> {
        if let Some(route) = self.exact.get(tag) {
            return Some(*route);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| tag.starts_with(prefix.as_str()))
            .map(|(_, route)| *route)
    }
}

/// Row value: numeric for quantities, text for categories
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// A record ready for its metric table
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub metric: MetricKind,
    pub timestamp: NaiveDateTime,
    pub end_timestamp: Option<NaiveDateTime>,
    pub value: Value,
    pub unit: Option<String>,
    pub source: String,
    pub raw_source: String,
    /// Values of `metric.extra_columns()`, empty when absent
    pub extra: Vec<String>,
}

impl NormalizedRecord {
    /// Field values in table column order
    pub fn to_row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(6 + self.extra.len());
        row.push(self.timestamp.format(TIMESTAMP_FORMAT).to_string());
        row.push(
            self.end_timestamp
                .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
                .unwrap_or_default(),
        );
        row.push(self.value.to_string());
        row.push(self.unit.clone().unwrap_or_default());
        row.push(self.source.clone());
        row.push(self.raw_source.clone());
        row.extend(self.extra.iter().cloned());
        row
    }

    /// Identity for exact-duplicate detection; ignores the raw source
    pub fn fingerprint(&self, row: &[String]) -> Fingerprint {
        let mut fields: Vec<&str> = Vec::with_capacity(row.len());
        fields.push(self.metric.as_str());
        fields.extend(
            row.iter()
                .enumerate()
                .filter(|(idx, _)| *idx != 5)
                .map(|(_, field)| field.as_str()),
        );
        Fingerprint::of(&fields)
    }
}

/// Output of a successful extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub record: NormalizedRecord,
    /// A timestamp had no usable offset and the reference zone was assumed
    pub timestamp_fallback: bool,
}

pub struct Router {
    table: RoutingTable,
    sources: SourceNormalizer,
    timestamps: TimestampNormalizer,
    routes: Option<RouteSummarizer>,
}

impl Router {
    pub fn new(
        table: RoutingTable,
        sources: SourceNormalizer,
        timestamps: TimestampNormalizer,
    ) -> Self {
        Self {
            table,
            sources,
            timestamps,
            routes: None,
        }
    }

    /// Read GPX route files while extracting workouts
    pub fn with_route_summarizer(mut self, summarizer: RouteSummarizer) -> Self {
        self.routes = Some(summarizer);
        self
    }

    /// Find the route of a record by its type tag
    pub fn classify(&self, raw: &RawRecord) -> Result<Route, RecordError> {
        let tag = raw.type_tag().ok_or(RecordError::MissingField("type"))?;
        self.table
            .lookup(tag)
            .ok_or_else(|| RecordError::Unroutable(tag.to_string()))
    }

    /// Normalize and extract a classified record
    pub fn extract(&self, raw: &RawRecord, route: Route) -> Result<Routed, RecordError> {
        let start = raw.attr("startDate").ok_or(RecordError::MissingField("startDate"))?;
        let start = self.timestamps.normalize(start, None)?;
        let end = raw
            .attr("endDate")
            .filter(|s| !s.trim().is_empty())
            .map(|s| self.timestamps.normalize(s, None))
            .transpose()?;

        let raw_source = raw.attr("sourceName").unwrap_or_default();
        let source = self.sources.normalize(raw_source)?;

        let end_timestamp = end.map(|ts| ts.value);
        let fields = match route.extraction {
            Extraction::Quantity => quantity(raw, Vec::new())?,
            Extraction::TypedQuantity => {
                let tag = raw.type_tag().unwrap_or_default();
                quantity(raw, vec![snake_case(strip(tag, QUANTITY_PREFIX))])?
            },
            Extraction::Nutrition => {
                let tag = raw.type_tag().unwrap_or_default();
                quantity(raw, vec![snake_case(strip(tag, DIETARY_PREFIX))])?
            },
            Extraction::Sleep => sleep(raw, start.value, end_timestamp)?,
            Extraction::Workout => self.workout(raw, start.value, end_timestamp)?,
        };

        Ok(Routed {
            record: NormalizedRecord {
                metric: route.metric,
                timestamp: start.value,
                end_timestamp,
                value: fields.value,
                unit: fields.unit,
                source,
                raw_source: raw_source.to_string(),
                extra: fields.extra,
            },
            timestamp_fallback: start.fallback || end.is_some_and(|ts| ts.fallback),
        })
    }

    fn workout(
        &self,
        raw: &RawRecord,
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
    ) -> Result<Fields, RecordError> {
        let activity = raw
            .attr("workoutActivityType")
            .filter(|s| !s.trim().is_empty())
            .ok_or(RecordError::MissingField("workoutActivityType"))?;

        let duration = match raw.attr("duration") {
            Some(d) => parse_number("duration", d)?,
            None => {
                let end = end.ok_or(RecordError::MissingField("duration"))?;
                minutes_between(start, end)?
            },
        };
        let duration_unit = match raw.attr("duration") {
            Some(_) => raw.attr("durationUnit").unwrap_or("min"),
            None => "min",
        };

        let energy = total(
            raw,
            "totalEnergyBurned",
            "totalEnergyBurnedUnit",
            |t| t == "HKQuantityTypeIdentifierActiveEnergyBurned",
        )?;
        let distance = total(raw, "totalDistance", "totalDistanceUnit", |t| {
            t.starts_with("HKQuantityTypeIdentifierDistance")
        })?;

        let (route_points, route_distance) = match self.route_summary(&raw.element) {
            Some(summary) => (
                summary.points.to_string(),
                format!("{:.1}", summary.distance_m),
            ),
            None => (String::new(), String::new()),
        };

        let (total_energy, energy_unit) = energy.unwrap_or_default();
        let (total_distance, distance_unit) = distance.unwrap_or_default();

        Ok(Fields {
            value: Value::Number(duration),
            unit: Some(duration_unit.to_string()),
            extra: vec![
                snake_case(strip(activity, WORKOUT_ACTIVITY_PREFIX)),
                total_energy,
                energy_unit,
                total_distance,
                distance_unit,
                route_points,
                route_distance,
            ],
        })
    }

    fn route_summary(&self, workout: &RawElement) -> Option<crate::routes::RouteSummary> {
        let summarizer = self.routes.as_ref()?;
        let path = workout
            .children_named("WorkoutRoute")
            .flat_map(|route| route.children_named("FileReference"))
            .find_map(|file| file.attr("path"))?;

        match summarizer.summarize(path) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(path, error = %e, "Failed to summarize workout route");
                None
            },
        }
    }
}

struct Fields {
    value: Value,
    unit: Option<String>,
    extra: Vec<String>,
}

fn quantity(raw: &RawRecord, extra: Vec<String>) -> Result<Fields, RecordError> {
    let value = raw.attr("value").ok_or(RecordError::MissingField("value"))?;
    let unit = raw
        .attr("unit")
        .filter(|u| !u.trim().is_empty())
        .ok_or(RecordError::MissingField("unit"))?;

    Ok(Fields {
        value: Value::Number(parse_number("value", value)?),
        unit: Some(unit.to_string()),
        extra,
    })
}

fn sleep(
    raw: &RawRecord,
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
) -> Result<Fields, RecordError> {
    let end = end.ok_or(RecordError::MissingField("endDate"))?;
    let stage = raw
        .attr("value")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(RecordError::MissingField("value"))?;

    Ok(Fields {
        value: Value::Text(snake_case(strip(stage, SLEEP_VALUE_PREFIX))),
        unit: None,
        extra: vec![format!("{}", minutes_between(start, end)?)],
    })
}

/// Attribute total, else the sum of matching `WorkoutStatistics`
fn total(
    raw: &RawRecord,
    attr: &'static str,
    unit_attr: &str,
    matches: impl Fn(&str) -> bool,
) -> Result<Option<(String, String)>, RecordError> {
    if let Some(value) = raw.attr(attr).filter(|v| !v.trim().is_empty()) {
        let value = parse_number(attr, value)?;
        let unit = raw.attr(unit_attr).unwrap_or_default();
        return Ok(Some((value.to_string(), unit.to_string())));
    }

    let mut sum = None;
    let mut unit = String::new();
    for stat in raw.element.children_named("WorkoutStatistics") {
        if !stat.attr("type").is_some_and(&matches) {
            continue;
        }
        let Some(value) = stat.attr("sum") else {
            continue;
        };
        *sum.get_or_insert(0.0) += parse_number("sum", value)?;
        if unit.is_empty() {
            unit = stat.attr("unit").unwrap_or_default().to_string();
        }
    }
    Ok(sum.map(|s: f64| (s.to_string(), unit)))
}

fn parse_number(field: &'static str, raw: &str) -> Result<f64, RecordError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RecordError::invalid_value(field, raw))
}

fn minutes_between(start: NaiveDateTime, end: NaiveDateTime) -> Result<f64, RecordError> {
    if end < start {
        return Err(RecordError::invalid_value(
            "endDate",
            end.format(TIMESTAMP_FORMAT).to_string(),
        ));
    }
    Ok((end - start).num_seconds() as f64 / 60.0)
}

fn strip<'a>(s: &'a str, prefix: &str) -> &'a str {
    s.strip_prefix(prefix).unwrap_or(s)
}

/// `FatTotal` → `fat_total`, `AsleepREM` → `asleep_rem`
pub fn snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}
