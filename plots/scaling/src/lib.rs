use std::collections::BTreeMap;

use common::{
    config::{Config, Overrides},
    plot::View,
    util::{efficiency, speedup},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw measurements as collected.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Time {
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

/// Measurement at the first x divided by each measurement.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Speedup {
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

/// Speedup per unit of x.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Efficiency {
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

fn options(values: &BTreeMap<String, Value>) -> Overrides {
    Overrides::from_values(values.iter().map(|(k, v)| (k.as_str(), v.clone())))
}

#[typetag::serde]
impl View for Time {
    fn title(&self) -> &'static str {
        "Execution Time"
    }

    fn options(&self) -> Overrides {
        options(&self.options)
    }

    fn defaults(&self, graph: &Config) {
        graph.default("graph_y_label", "Time (s)");
    }

    fn transform(&self, _x_data: &[i64], series: &[f64]) -> Vec<f64> {
        series.to_vec()
    }
}

#[typetag::serde]
impl View for Speedup {
    fn title(&self) -> &'static str {
        "Speedup"
    }

    fn options(&self) -> Overrides {
        options(&self.options)
    }

    fn defaults(&self, graph: &Config) {
        graph.default("graph_y_label", "Speedup");
    }

    fn transform(&self, _x_data: &[i64], series: &[f64]) -> Vec<f64> {
        speedup(series)
    }
}

#[typetag::serde]
impl View for Efficiency {
    fn title(&self) -> &'static str {
        "Efficiency"
    }

    fn options(&self) -> Overrides {
        options(&self.options)
    }

    fn defaults(&self, graph: &Config) {
        graph.default("graph_y_label", "Efficiency");
    }

    fn transform(&self, x_data: &[i64], series: &[f64]) -> Vec<f64> {
        efficiency(x_data, series)
    }
}
