// COLOCATE LOAD CLASSIFIER
// PURE-RUST MODULE: NO OS DEPENDENCIES, TESTABLE OFFLINE
// PREDICTED QUERY RATE -> LOAD LEVEL -> CACHE SERVICE CORE BUDGET

use std::fmt;
use std::str::FromStr;

use crate::cores::CoreSet;
use crate::error::{SchedError, SchedResult};
use crate::metrics::Sample;

// LEVEL THRESHOLDS (QUERIES PER SECOND)
// NO HYSTERESIS: THE LEVEL FOLLOWS THE PREDICTION TICK BY TICK.

pub const MEDIUM_ENTER_QPS: f64 = 25_000.0;
pub const HIGH_ENTER_QPS: f64   = 30_000.0;

// DEMAND MODELS (OFFLINE LINEAR FITS, QPS = A * METRIC + B)

pub const NET_MODEL_SLOPE: f64     = 0.99665492;
pub const NET_MODEL_INTERCEPT: f64 = -846.6694402145367;
pub const CPU_MODEL_SLOPE: f64     = 585.58444342;
pub const CPU_MODEL_INTERCEPT: f64 = -822.4653955572503;

// LOAD LEVEL

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum LoadLevel {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl LoadLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    // CORES THE CACHE SERVICE OWNS AT THIS LEVEL
    pub fn service_cores(self) -> CoreSet {
        match self {
            Self::Low => CoreSet::of(&[0]),
            Self::Medium | Self::High => CoreSet::of(&[0, 1]),
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// LEVEL CLASSIFICATION
// TOTAL OVER f64: NAN FAILS BOTH COMPARISONS AND LANDS ON HIGH.
// CALLERS REJECT NON-FINITE DEMAND BEFORE GETTING HERE.

pub fn classify(predicted_qps: f64, _previous: LoadLevel) -> LoadLevel {
    if predicted_qps < MEDIUM_ENTER_QPS {
        LoadLevel::Low
    } else if predicted_qps < HIGH_ENTER_QPS {
        LoadLevel::Medium
    } else {
        LoadLevel::High
    }
}

// DEMAND MODEL
// NET IS AUTHORITATIVE. CPU IS KEPT AS A SWAPPABLE ALTERNATIVE.

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DemandModel {
    #[default]
    Net,
    Cpu,
}

impl DemandModel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Net => "net",
            Self::Cpu => "cpu",
        }
    }

    // THE RAW METRIC THIS MODEL READS FROM A SAMPLE
    pub fn metric(self, sample: &Sample) -> f64 {
        match self {
            Self::Net => sample.packets_per_second(),
            Self::Cpu => sample.service_cpu_percent,
        }
    }

    pub fn predict_demand(self, metric: f64) -> f64 {
        match self {
            Self::Net => NET_MODEL_SLOPE * metric + NET_MODEL_INTERCEPT,
            Self::Cpu => CPU_MODEL_SLOPE * metric + CPU_MODEL_INTERCEPT,
        }
    }

    // INVERSE OF predict_demand. USED TO SYNTHESIZE SAMPLES FOR A TARGET QPS.
    pub fn metric_for_demand(self, qps: f64) -> f64 {
        match self {
            Self::Net => (qps - NET_MODEL_INTERCEPT) / NET_MODEL_SLOPE,
            Self::Cpu => (qps - CPU_MODEL_INTERCEPT) / CPU_MODEL_SLOPE,
        }
    }
}

impl FromStr for DemandModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "net" | "network" => Ok(Self::Net),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown demand model {:?} (expected net or cpu)", other)),
        }
    }
}

// PREDICT + CLASSIFY ONE SAMPLE. NON-FINITE DEMAND IS AN ERROR, NOT A LEVEL.
pub fn assess(model: DemandModel, sample: &Sample, previous: LoadLevel) -> SchedResult<(f64, LoadLevel)> {
    let qps = model.predict_demand(model.metric(sample));
    if !qps.is_finite() {
        return Err(SchedError::MetricsUnavailable(format!(
            "{} model predicted non-finite demand ({})", model.label(), qps
        )));
    }
    Ok((qps, classify(qps, previous)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_classifies_high() {
        assert_eq!(classify(f64::NAN, LoadLevel::Low), LoadLevel::High);
    }

    #[test]
    fn negative_demand_is_low() {
        assert_eq!(classify(-1e9, LoadLevel::High), LoadLevel::Low);
        assert_eq!(classify(f64::NEG_INFINITY, LoadLevel::Medium), LoadLevel::Low);
    }

    #[test]
    fn inverse_model_round_trips() {
        for model in [DemandModel::Net, DemandModel::Cpu] {
            let metric = model.metric_for_demand(27_500.0);
            let qps = model.predict_demand(metric);
            assert!((qps - 27_500.0).abs() < 1e-6, "{} model drifted: {}", model.label(), qps);
        }
    }

    #[test]
    fn overflowing_metric_is_not_a_level() {
        let mut sample = crate::metrics::synthetic_sample(DemandModel::Cpu, 0.0);
        sample.service_cpu_percent = f64::MAX;
        let err = assess(DemandModel::Cpu, &sample, LoadLevel::Medium).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn model_parse() {
        assert_eq!("net".parse::<DemandModel>().unwrap(), DemandModel::Net);
        assert_eq!("CPU".parse::<DemandModel>().unwrap(), DemandModel::Cpu);
        assert!("disk".parse::<DemandModel>().is_err());
    }

    #[test]
    fn service_core_budget() {
        assert_eq!(LoadLevel::Low.service_cores(), CoreSet::of(&[0]));
        assert_eq!(LoadLevel::Medium.service_cores(), CoreSet::of(&[0, 1]));
        assert_eq!(LoadLevel::High.service_cores(), CoreSet::of(&[0, 1]));
    }
}
