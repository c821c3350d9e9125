//! Metric vocabulary shared by the pipeline and the table consumers

use crate::error::HdxError;
use serde::{Deserialize, Serialize};

/// Columns every metric table starts with, in order
pub const BASE_COLUMNS: [&str; 6] = [
    "timestamp",
    "end_timestamp",
    "value",
    "unit",
    "source",
    "raw_source",
];

/// Rendering of every normalized timestamp in the tables
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Closed set of metric categories.
///
/// Each variant owns one output table named after [`MetricKind::as_str`].
/// New kinds are added here together with a routing rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    HeartRate,
    RestingHeartRate,
    HeartRateVariability,
    WalkingHeartRate,
    HeartRateRecovery,
    Vo2Max,
    StepCount,
    DistanceWalkingRunning,
    DistanceCycling,
    FlightsClimbed,
    ExerciseTime,
    StandTime,
    ActiveEnergy,
    BasalEnergy,
    WalkingMetrics,
    Weight,
    BodyMassIndex,
    BodyComposition,
    BloodOxygen,
    RespiratoryRate,
    NutritionWater,
    NutritionCaffeine,
    Nutrition,
    AudioExposure,
    TimeInDaylight,
    SleepAnalysis,
    Workout,
}

impl MetricKind {
    pub const ALL: [MetricKind; 27] = [
        MetricKind::HeartRate,
        MetricKind::RestingHeartRate,
        MetricKind::HeartRateVariability,
        MetricKind::WalkingHeartRate,
        MetricKind::HeartRateRecovery,
        MetricKind::Vo2Max,
        MetricKind::StepCount,
        MetricKind::DistanceWalkingRunning,
        MetricKind::DistanceCycling,
        MetricKind::FlightsClimbed,
        MetricKind::ExerciseTime,
        MetricKind::StandTime,
        MetricKind::ActiveEnergy,
        MetricKind::BasalEnergy,
        MetricKind::WalkingMetrics,
        MetricKind::Weight,
        MetricKind::BodyMassIndex,
        MetricKind::BodyComposition,
        MetricKind::BloodOxygen,
        MetricKind::RespiratoryRate,
        MetricKind::NutritionWater,
        MetricKind::NutritionCaffeine,
        MetricKind::Nutrition,
        MetricKind::AudioExposure,
        MetricKind::TimeInDaylight,
        MetricKind::SleepAnalysis,
        MetricKind::Workout,
    ];

    /// Stable table name
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::HeartRate => "heart_rate",
            MetricKind::RestingHeartRate => "resting_heart_rate",
            MetricKind::HeartRateVariability => "heart_rate_variability",
            MetricKind::WalkingHeartRate => "walking_heart_rate",
            MetricKind::HeartRateRecovery => "heart_rate_recovery",
            MetricKind::Vo2Max => "vo2_max",
            MetricKind::StepCount => "step_count",
            MetricKind::DistanceWalkingRunning => "distance_walking_running",
            MetricKind::DistanceCycling => "distance_cycling",
            MetricKind::FlightsClimbed => "flights_climbed",
            MetricKind::ExerciseTime => "exercise_time",
            MetricKind::StandTime => "stand_time",
            MetricKind::ActiveEnergy => "active_energy",
            MetricKind::BasalEnergy => "basal_energy",
            MetricKind::WalkingMetrics => "walking_metrics",
            MetricKind::Weight => "weight",
            MetricKind::BodyMassIndex => "body_mass_index",
            MetricKind::BodyComposition => "body_composition",
            MetricKind::BloodOxygen => "blood_oxygen",
            MetricKind::RespiratoryRate => "respiratory_rate",
            MetricKind::NutritionWater => "nutrition_water",
            MetricKind::NutritionCaffeine => "nutrition_caffeine",
            MetricKind::Nutrition => "nutrition",
            MetricKind::AudioExposure => "audio_exposure",
            MetricKind::TimeInDaylight => "time_in_daylight",
            MetricKind::SleepAnalysis => "sleep_analysis",
            MetricKind::Workout => "workout",
        }
    }

    /// Metric-specific columns appended after [`BASE_COLUMNS`]
    pub fn extra_columns(self) -> &'static [&'static str] {
        match self {
            MetricKind::WalkingMetrics
            | MetricKind::BodyComposition
            | MetricKind::AudioExposure => &["metric_type"],
            MetricKind::Nutrition => &["nutrient"],
            MetricKind::SleepAnalysis => &["duration_minutes"],
            MetricKind::Workout => &[
                "activity_type",
                "total_energy",
                "energy_unit",
                "total_distance",
                "distance_unit",
                "route_points",
                "route_distance_m",
            ],
            _ => &[],
        }
    }

    /// Full ordered column list of the metric's table
    pub fn columns(self) -> Vec<&'static str> {
        BASE_COLUMNS
            .iter()
            .chain(self.extra_columns())
            .copied()
            .collect()
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = HdxError;

    /// Accepts table names, with `-` allowed in place of `_`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| HdxError::UnknownMetric(s.to_string()))
    }
}
