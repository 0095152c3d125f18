use std::path::Path;

use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs::{read_to_string, write};

use crate::config::Config;

/// The persisted part of an [`ExperimentResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub x_data: Vec<i64>,
    pub data: Vec<(String, Vec<f64>)>,
}

/// Measurements of every procedure, aligned positionally with `x_data`.
#[derive(Debug, Clone)]
pub struct ExperimentResult {
    config: Config,
    x_data: Vec<i64>,
    data: Vec<(String, Vec<f64>)>,
}

impl ExperimentResult {
    pub fn new(config: Config, x_data: Vec<i64>, data: Vec<(String, Vec<f64>)>) -> Result<Self> {
        for (name, series) in &data {
            if series.len() != x_data.len() {
                bail!(
                    "Series {name} has {} values for {} x values",
                    series.len(),
                    x_data.len()
                );
            }
        }
        Ok(Self {
            config,
            x_data,
            data,
        })
    }

    pub fn from_snapshot(config: Config, snapshot: ResultSnapshot) -> Result<Self> {
        Self::new(config, snapshot.x_data, snapshot.data)
    }

    pub fn snapshot(&self) -> ResultSnapshot {
        ResultSnapshot {
            x_data: self.x_data.clone(),
            data: self.data.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn x_data(&self) -> &[i64] {
        &self.x_data
    }

    pub fn data(&self) -> &[(String, Vec<f64>)] {
        &self.data
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.data.iter().map(|(name, _)| name.as_str())
    }

    pub fn series(&self, name: &str) -> Option<SeriesView<'_>> {
        self.data
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| SeriesView {
                x_data: &self.x_data,
                values,
            })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write(path, serde_json::to_string(&self.snapshot())?)
            .await
            .with_context(|| format!("Writing results to {path:?}"))
    }

    /// Loads a saved result and binds it to `config`, the scope of the current run.
    pub async fn load(path: &Path, config: Config) -> Result<Self> {
        let snapshot: ResultSnapshot = serde_json::from_str(
            &read_to_string(path)
                .await
                .with_context(|| format!("Reading results from {path:?}"))?,
        )
        .with_context(|| format!("Parsing results in {path:?}"))?;
        Self::from_snapshot(config, snapshot)
    }

    /// One row per x value, one column per procedure.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(std::iter::once("x").chain(self.names()))?;
        for (idx, x) in self.x_data.iter().enumerate() {
            writer.write_record(
                std::iter::once(x.to_string())
                    .chain(self.data.iter().map(|(_, series)| series[idx].to_string())),
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Borrowed x -> measurement mapping for one procedure.
#[derive(Debug, Clone, Copy)]
pub struct SeriesView<'a> {
    x_data: &'a [i64],
    values: &'a [f64],
}

impl<'a> SeriesView<'a> {
    /// Measurement for `x`; when `x` was swept more than once the last run wins.
    pub fn get(&self, x: i64) -> Option<f64> {
        self.x_data
            .iter()
            .rposition(|v| *v == x)
            .map(|idx| self.values[idx])
    }

    pub fn values(&self) -> &'a [f64] {
        self.values
    }

    pub fn iter(self) -> impl Iterator<Item = (i64, f64)> + 'a {
        self.x_data.iter().copied().zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
