//! Parameter definitions and sampling.
//!
//! A [`SearchSpace`] is a list of typed parameters, each optionally
//! conditioned on another parameter's value. Three sampling primitives
//! feed the strategies: exhaustive grid values, independent uniform
//! draws, and stratified (Latin-Hypercube) draws that guarantee one
//! sample per equal-probability interval.
//!
//! Parameter files deserialize from YAML:
//!
//! ```yaml
//! - name: temperature
//!   type: float
//!   min: 0.0
//!   max: 1.0
//! - name: style
//!   type: choice
//!   choices: [terse, verbose]
//! - name: verbosity_level
//!   type: integer
//!   min: 1
//!   max: 3
//!   condition: {parameter: style, equals: verbose}
//! ```

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One concrete assignment of parameter values.
pub type TrialConfig = Map<String, Value>;

/// A parameter's type and range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamKind {
    Float {
        min: f64,
        max: f64,
        #[serde(default)]
        step: Option<f64>,
        /// Sample in log space (requires min > 0).
        #[serde(default)]
        log: bool,
    },
    Integer {
        min: i64,
        max: i64,
        #[serde(default = "default_int_step")]
        step: i64,
    },
    Choice { choices: Vec<Value> },
    Bool,
}

fn default_int_step() -> i64 {
    1
}

/// Activation condition: the parameter participates only when another
/// parameter has a specific value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub parameter: String,
    pub equals: Value,
}

/// A named, typed, optionally conditional parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParamKind,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Parameter {
    pub fn float(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Float {
                min,
                max,
                step: None,
                log: false,
            },
            condition: None,
        }
    }

    pub fn integer(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Integer { min, max, step: 1 },
            condition: None,
        }
    }

    pub fn choice(name: impl Into<String>, choices: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Choice { choices },
            condition: None,
        }
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Bool,
            condition: None,
        }
    }

    pub fn with_condition(mut self, parameter: impl Into<String>, equals: Value) -> Self {
        self.condition = Some(Condition {
            parameter: parameter.into(),
            equals,
        });
        self
    }

    /// Number of grid points, `None` when continuous (float without step).
    pub fn cardinality(&self) -> Option<u128> {
        match &self.kind {
            ParamKind::Float { min, max, step, .. } => step.map(|step| {
                if step <= 0.0 || max <= min {
                    1
                } else {
                    ((max - min) / step).floor() as u128 + 1
                }
            }),
            ParamKind::Integer { min, max, step } => {
                let step = (*step).max(1);
                Some(((max - min).max(0) / step) as u128 + 1)
            }
            ParamKind::Choice { choices } => Some(choices.len().max(1) as u128),
            ParamKind::Bool => Some(2),
        }
    }

    /// The discrete values grid search enumerates. Continuous floats use
    /// their step, or 10 evenly spaced points.
    pub fn grid_values(&self) -> Vec<Value> {
        match &self.kind {
            ParamKind::Float { min, max, step, .. } => {
                if max <= min {
                    return vec![Value::from(*min)];
                }
                let step = step.unwrap_or((max - min) / 9.0);
                let mut values = Vec::new();
                let mut current = *min;
                while current <= max + 1e-12 {
                    values.push(Value::from(current.min(*max)));
                    current += step;
                }
                values
            }
            ParamKind::Integer { min, max, step } => {
                let step = (*step).max(1);
                (*min..=*max)
                    .step_by(step as usize)
                    .map(Value::from)
                    .collect()
            }
            ParamKind::Choice { choices } => choices.clone(),
            ParamKind::Bool => vec![Value::from(false), Value::from(true)],
        }
    }

    /// One uniform draw.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        self.sample_at(rng.gen::<f64>())
    }

    /// The value at a position in [0, 1) of this parameter's range; the
    /// shared primitive behind uniform and stratified sampling.
    pub fn sample_at(&self, position: f64) -> Value {
        let position = position.clamp(0.0, 1.0 - 1e-12);
        match &self.kind {
            ParamKind::Float { min, max, log, .. } => {
                if *log && *min > 0.0 {
                    let (ln_min, ln_max) = (min.ln(), max.ln());
                    Value::from((ln_min + position * (ln_max - ln_min)).exp())
                } else {
                    Value::from(min + position * (max - min))
                }
            }
            ParamKind::Integer { min, max, .. } => {
                let count = (max - min + 1).max(1) as f64;
                Value::from(min + (position * count).floor() as i64)
            }
            ParamKind::Choice { choices } => {
                if choices.is_empty() {
                    return Value::Null;
                }
                let index = (position * choices.len() as f64).floor() as usize;
                choices[index.min(choices.len() - 1)].clone()
            }
            ParamKind::Bool => Value::from(position >= 0.5),
        }
    }

    /// Whether this parameter participates given the values chosen so far.
    pub fn active(&self, config: &TrialConfig) -> bool {
        match &self.condition {
            Some(condition) => config.get(&condition.parameter) == Some(&condition.equals),
            None => true,
        }
    }
}

/// The full parameter space a strategy searches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchSpace {
    pub parameters: Vec<Parameter>,
}

impl SearchSpace {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self { parameters }
    }

    /// Parses a parameter list from YAML.
    pub fn from_yaml_str(yaml: &str) -> crate::Result<Self> {
        let parameters: Vec<Parameter> = serde_yaml::from_str(yaml).map_err(|err| {
            crate::Error::configuration(format!("invalid parameter file: {}", err))
        })?;
        Ok(Self { parameters })
    }

    /// Total number of grid points, `None` when any parameter is
    /// continuous (effectively infinite).
    pub fn size(&self) -> Option<u128> {
        self.parameters
            .iter()
            .map(Parameter::cardinality)
            .try_fold(1u128, |acc, c| c.map(|c| acc.saturating_mul(c)))
    }

    /// One independent uniform draw over all (active) parameters.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> TrialConfig {
        let mut config = TrialConfig::new();
        for parameter in &self.parameters {
            if parameter.active(&config) {
                config.insert(parameter.name.clone(), parameter.sample(rng));
            }
        }
        config
    }

    /// Latin-Hypercube draws: each parameter's range is split into `n`
    /// equal intervals, one sample lands in each, and intervals are
    /// shuffled independently per parameter.
    pub fn lhs_samples<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<TrialConfig> {
        if n == 0 {
            return Vec::new();
        }
        let mut columns: Vec<Vec<Value>> = Vec::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            let mut intervals: Vec<usize> = (0..n).collect();
            intervals.shuffle(rng);
            let column = intervals
                .into_iter()
                .map(|i| {
                    let position = (i as f64 + rng.gen::<f64>()) / n as f64;
                    parameter.sample_at(position)
                })
                .collect();
            columns.push(column);
        }

        (0..n)
            .map(|row| {
                let mut config = TrialConfig::new();
                for (parameter, column) in self.parameters.iter().zip(&columns) {
                    if parameter.active(&config) {
                        config.insert(parameter.name.clone(), column[row].clone());
                    }
                }
                config
            })
            .collect()
    }

    /// Every grid combination, with inactive conditional parameters
    /// removed and the resulting duplicates collapsed.
    pub fn grid_configs(&self) -> Vec<TrialConfig> {
        let mut configs: Vec<TrialConfig> = vec![TrialConfig::new()];
        for parameter in &self.parameters {
            let values = parameter.grid_values();
            let mut expanded = Vec::with_capacity(configs.len() * values.len());
            for config in &configs {
                if parameter.active(config) {
                    for value in &values {
                        let mut next = config.clone();
                        next.insert(parameter.name.clone(), value.clone());
                        expanded.push(next);
                    }
                } else {
                    expanded.push(config.clone());
                }
            }
            configs = expanded;
        }

        let mut seen = std::collections::HashSet::new();
        configs
            .into_iter()
            .filter(|config| seen.insert(Value::Object(config.clone()).to_string()))
            .collect()
    }
}
