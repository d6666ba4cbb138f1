//! Composite loss selection and running loss statistics

use std::collections::BTreeMap;
use std::fmt;

use mlx_rs::{array, error::Exception, Array};
use tracing::debug;

use crate::models::AcousticLosses;

/// The five loss terms reported by the acoustic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LossTerm {
    Regression,
    Flow,
    Duration,
    Pitch,
    Energy,
}

impl LossTerm {
    pub const ALL: [LossTerm; 5] = [
        LossTerm::Regression,
        LossTerm::Flow,
        LossTerm::Duration,
        LossTerm::Pitch,
        LossTerm::Energy,
    ];

    /// Metric name used for logging and experiment tracking
    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::Regression => "regression_loss",
            LossTerm::Flow => "glow_loss",
            LossTerm::Duration => "duration_loss",
            LossTerm::Pitch => "pitch_loss",
            LossTerm::Energy => "energy_loss",
        }
    }

    /// Whether the term belongs to the backbone rather than the flow
    pub fn is_backbone(&self) -> bool {
        !matches!(self, LossTerm::Flow)
    }
}

impl fmt::Display for LossTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar values observed for one training step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossValues {
    pub regression: f32,
    /// `None` when the flow did not run
    pub flow: Option<f32>,
    pub duration: f32,
    pub pitch: f32,
    pub energy: f32,
    /// Style token regularization, when it was computed this step
    pub regularization: Option<f32>,
    /// Value of the composite objective
    pub total: f32,
    /// Terms that entered `total`
    pub included: Vec<LossTerm>,
}

impl LossValues {
    /// Value of a single term; the flow reads as 0 when it did not run.
    pub fn get(&self, term: LossTerm) -> f32 {
        match term {
            LossTerm::Regression => self.regression,
            LossTerm::Flow => self.flow.unwrap_or(0.0),
            LossTerm::Duration => self.duration,
            LossTerm::Pitch => self.pitch,
            LossTerm::Energy => self.energy,
        }
    }

    /// Whether `term` contributed to the composite objective
    pub fn includes(&self, term: LossTerm) -> bool {
        self.included.contains(&term)
    }
}

/// Which terms a step is allowed to optimize.
///
/// The flow term always counts when present and finite. Backbone terms are
/// excluded while the backbone is frozen. Non-finite terms never count.
pub fn select_terms(values: &LossValues, include_backbone: bool) -> Vec<LossTerm> {
    LossTerm::ALL
        .into_iter()
        .filter(|term| {
            if term.is_backbone() && !include_backbone {
                return false;
            }
            let value = match term {
                LossTerm::Flow => match values.flow {
                    Some(v) => v,
                    None => return false,
                },
                other => values.get(*other),
            };
            if !value.is_finite() {
                debug!(term = %term, value, "Excluding non-finite loss term");
                return false;
            }
            true
        })
        .collect()
}

/// Build the composite objective from the model's loss record.
///
/// Runs inside the differentiated closure. The returned array is the unweighted
/// sum of the selected terms plus the regularization loss when given.
pub fn composite_loss(
    losses: &AcousticLosses,
    regularization: Option<&Array>,
    include_backbone: bool,
) -> Result<(Array, LossValues), Exception> {
    let mut values = LossValues {
        regression: losses.regression.item::<f32>(),
        flow: losses.flow.as_ref().map(|f| f.item::<f32>()),
        duration: losses.duration.item::<f32>(),
        pitch: losses.pitch.item::<f32>(),
        energy: losses.energy.item::<f32>(),
        ..Default::default()
    };
    values.included = select_terms(&values, include_backbone);

    let mut total = array!(0.0f32);
    if let Some(reg) = regularization {
        values.regularization = Some(reg.item::<f32>());
        total = total.add(reg)?;
    }
    for term in &values.included {
        let term_loss = match term {
            LossTerm::Regression => &losses.regression,
            LossTerm::Duration => &losses.duration,
            LossTerm::Pitch => &losses.pitch,
            LossTerm::Energy => &losses.energy,
            LossTerm::Flow => match losses.flow.as_ref() {
                Some(flow) => flow,
                None => continue,
            },
        };
        total = total.add(term_loss)?;
    }
    values.total = total.item::<f32>();

    Ok((total, values))
}

/// Running per-term loss values between two checkpoints.
#[derive(Debug, Clone, Default)]
pub struct LossAggregator {
    history: BTreeMap<LossTerm, Vec<f32>>,
}

impl LossAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, term: LossTerm, value: f32) {
        self.history.entry(term).or_default().push(value);
    }

    /// Record all five terms of one step
    pub fn record_step(&mut self, values: &LossValues) {
        for term in LossTerm::ALL {
            self.record(term, values.get(term));
        }
    }

    /// Number of recorded values for `term`
    pub fn count(&self, term: LossTerm) -> usize {
        self.history.get(&term).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.history.values().all(Vec::is_empty)
    }

    /// Mean of each recorded term, without clearing
    pub fn averages(&self) -> BTreeMap<LossTerm, f32> {
        self.history
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(term, values)| (*term, values.iter().sum::<f32>() / values.len() as f32))
            .collect()
    }

    /// Mean of each recorded term; clears the history.
    pub fn drain_averages(&mut self) -> BTreeMap<LossTerm, f32> {
        let averages = self.averages();
        self.history.clear();
        averages
    }
}
