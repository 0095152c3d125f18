use std::{collections::BTreeMap, path::Path};

use cmd::Environment;
use common::{
    bench::{Experiment, ProcedureGenerator},
    config::{ConfigValue, Overrides},
    plot::View,
};
use eyre::{Context, ContextCompat, Result, bail};
use scaling_plots::{Efficiency, Speedup, Time};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::read_to_string;

type Options = BTreeMap<String, Value>;

/// Everything a session runs, as written in the setup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    /// Working directory of every command.
    pub directory: String,
    /// Bound verbatim on the environment scope.
    #[serde(default)]
    pub config: Options,
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
    #[serde(default)]
    pub experiments: Vec<ExperimentEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub name: String,
    pub procedures: Vec<ProcedureEntry>,
    #[serde(default)]
    pub range: Option<Range>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub presentations: Vec<PresentationEntry>,
}

/// Alias under which a registered command takes part in an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationEntry {
    pub name: String,
    #[serde(default)]
    pub options: Options,
    #[serde(default = "default_views")]
    pub views: Vec<Box<dyn View>>,
}

fn default_views() -> Vec<Box<dyn View>> {
    vec![
        Box::new(Time::default()),
        Box::new(Speedup::default()),
        Box::new(Efficiency::default()),
    ]
}

/// Sweep values: `{ start, end, step }` with `end` excluded, or an explicit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Range {
    Bounds {
        start: i64,
        end: i64,
        #[serde(default = "default_step")]
        step: i64,
    },
    List(Vec<i64>),
}

fn default_step() -> i64 {
    1
}

impl Range {
    pub fn values(&self) -> Result<Vec<i64>> {
        match self {
            Range::Bounds { start, end, step } => {
                if *step <= 0 {
                    bail!("Range step must be positive, got {step}");
                }
                Ok((*start..*end).step_by(*step as usize).collect())
            }
            Range::List(values) => Ok(values.clone()),
        }
    }
}

/// An experiment ready to run, with the sweep and overrides it runs with.
#[derive(Debug, Clone)]
pub struct Plan {
    pub experiment: Experiment,
    pub x_range: Vec<i64>,
    pub overrides: Overrides,
    pub presentations: Vec<PresentationEntry>,
}

pub fn overrides(options: &Options) -> Overrides {
    Overrides::from_values(options.iter().map(|(k, v)| (k.as_str(), v.clone())))
}

impl Setup {
    /// Reads a YAML setup file, or TOML when the extension is `.toml`.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = read_to_string(path)
            .await
            .with_context(|| format!("Reading setup file {path:?}"))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&text).with_context(|| format!("Parsing {path:?}")),
            _ => serde_yml::from_str(&text).with_context(|| format!("Parsing {path:?}")),
        }
    }

    pub fn environment(&self) -> Environment {
        let env = Environment::new(self.directory.as_str());
        for (key, value) in &self.config {
            env.config()
                .set(key.as_str(), ConfigValue::template(value.clone()));
        }
        env
    }

    /// Registers every command on `env` and wires them into experiments.
    pub fn plan(&self, env: &Environment) -> Result<Vec<Plan>> {
        let commands = self
            .commands
            .iter()
            .map(|entry| {
                (
                    entry.name.as_str(),
                    env.command(&entry.program, &overrides(&entry.options)),
                )
            })
            .collect::<BTreeMap<_, _>>();

        self.experiments
            .iter()
            .map(|entry| {
                let procedures = entry
                    .procedures
                    .iter()
                    .map(|procedure| {
                        let generator: &ProcedureGenerator = commands
                            .get(procedure.command.as_str())
                            .with_context(|| {
                                format!(
                                    "Unknown command {} in experiment {}",
                                    procedure.command, entry.name
                                )
                            })?;
                        Ok((
                            procedure.name.clone(),
                            generator.with(&overrides(&procedure.options)),
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;

                let x_range = match &entry.range {
                    Some(range) => range
                        .values()
                        .with_context(|| format!("Range of experiment {}", entry.name))?,
                    None => (1..=num_cpus::get() as i64).collect(),
                };

                Ok(Plan {
                    experiment: env.experiment(&entry.name, procedures),
                    x_range,
                    overrides: overrides(&entry.options),
                    presentations: entry.presentations.clone(),
                })
            })
            .collect()
    }
}
