//! Provenance metadata stored alongside every result file.
//!
//! `ExperimentMetadata` records who ran the measurement, when, with which
//! software version, and a free-text description. It is serialized to JSON
//! and written as `# ` comment lines at the top of each CSV result, so the
//! data file stays self-describing without a sidecar.

use crate::experiment::{Experiment, Sweep};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Provenance of one result file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentMetadata {
    pub experiment_id: Uuid,
    /// Operator login, from `USERNAME` or `USER`.
    pub author: String,
    pub description: String,
    pub creation_time: DateTime<Local>,
    pub software: String,
    pub software_version: String,
    /// Axis label of the sweep that produced the data.
    pub sweep: String,
    /// Free-form notes.
    pub comment: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ExperimentMetadata {
    pub fn for_experiment(experiment: &Experiment, sweep: &Sweep) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "samples".to_string(),
            serde_json::Value::from(experiment.samples),
        );
        parameters.insert(
            "repetitions".to_string(),
            serde_json::Value::from(experiment.repetitions),
        );
        parameters.insert(
            "channel".to_string(),
            serde_json::Value::from(sweep.channel.title()),
        );

        Self {
            experiment_id: experiment.id,
            author: current_user(),
            description: "Pump-probe STM measurement".to_string(),
            creation_time: experiment.started_at.unwrap_or_else(Local::now),
            software: env!("CARGO_PKG_NAME").to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            sweep: sweep.axis_label(),
            comment: String::new(),
            parameters,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

fn current_user() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}
