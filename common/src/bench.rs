use core::fmt::Debug;
use std::{fmt, path::PathBuf, sync::Arc};

use eyre::{Context, Result};
use serde_json::Value;
use tokio::fs::create_dir_all;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, Namespace, Overrides},
    result::ExperimentResult,
};

/// One runnable workload: sweep value in, measured time out.
#[async_trait::async_trait]
pub trait Procedure: Debug + Send + Sync {
    async fn run(&self, x: i64) -> Result<f64>;

    /// Whether a cached result produced by this procedure must be rerun.
    fn is_outdated(&self) -> bool {
        false
    }

    /// Human readable form of what [`Procedure::run`] would do for `x`.
    fn describe(&self, x: i64) -> Result<String> {
        Ok(format!("x={x}"))
    }
}

pub type ProcedureFactory = Arc<dyn Fn(Config) -> Result<Box<dyn Procedure>> + Send + Sync>;

/// Captured configuration plus a factory, turned into a [`Procedure`] once an
/// experiment supplies the scope to run under.
#[derive(Clone)]
pub struct ProcedureGenerator {
    config: Config,
    factory: ProcedureFactory,
}

impl ProcedureGenerator {
    pub fn new<F>(config: Config, factory: F) -> Self
    where
        F: Fn(Config) -> Result<Box<dyn Procedure>> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Arc::new(factory),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A new generator with `overrides` layered over the captured scope.
    pub fn with(&self, overrides: &Overrides) -> Self {
        Self {
            config: self.config.overlay(overrides),
            factory: self.factory.clone(),
        }
    }

    /// Re-parents the captured scope under `exp_config` and builds the procedure.
    pub fn generate(&self, exp_config: &Config) -> Result<Box<dyn Procedure>> {
        (self.factory)(self.config.rebase_under(exp_config))
    }
}

impl Debug for ProcedureGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureGenerator")
            .field("config", &self.config.own_keys())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    env_config: Config,
    procedures: Vec<(String, ProcedureGenerator)>,
}

impl Experiment {
    pub fn new<I, S>(name: impl Into<String>, env_config: Config, procedures: I) -> Self
    where
        I: IntoIterator<Item = (S, ProcedureGenerator)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            env_config,
            procedures: procedures
                .into_iter()
                .map(|(alias, generator)| (alias.into(), generator))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procedures(&self) -> &[(String, ProcedureGenerator)] {
        &self.procedures
    }

    /// The experiment scope a run with `overrides` resolves against.
    pub fn config(&self, overrides: &Overrides) -> Config {
        self.env_config
            .new_child(Namespace::Exp, Some(Value::from(self.name.as_str())), overrides)
    }

    pub fn result_path(&self, exp_config: &Config) -> Result<PathBuf> {
        Ok(PathBuf::from(exp_config.get_string("exp_out")?).join(format!("{}.exp", self.name)))
    }

    pub fn materialize(&self, exp_config: &Config) -> Result<Vec<(String, Box<dyn Procedure>)>> {
        self.procedures
            .iter()
            .map(|(alias, generator)| {
                let procedure = generator
                    .generate(exp_config)
                    .with_context(|| format!("Building procedure {alias}"))?;
                Ok((alias.clone(), procedure))
            })
            .collect()
    }

    /// Runs every procedure for every x, or loads the cached result of an
    /// earlier run with the same name.
    ///
    /// The cache is keyed only by name and output path: changed options or a
    /// different `x_range` do not invalidate it. Delete the `.exp` file to rerun.
    pub async fn run<I>(&self, x_range: I, overrides: &Overrides) -> Result<ExperimentResult>
    where
        I: IntoIterator<Item = i64>,
    {
        let exp_config = self.config(overrides);
        let directory = exp_config.get_string("directory")?;
        let out = PathBuf::from(exp_config.get_string("exp_out")?);
        create_dir_all(&directory)
            .await
            .with_context(|| format!("Create directory {directory}"))?;
        create_dir_all(&out)
            .await
            .with_context(|| format!("Create output directory {out:?}"))?;

        let result_path = self.result_path(&exp_config)?;
        let built = self.materialize(&exp_config)?;

        if result_path.is_file() {
            match built.iter().find(|(_, procedure)| procedure.is_outdated()) {
                Some((alias, _)) => {
                    warn!("Ignoring cached {}: {alias} is outdated", self.name);
                }
                None => {
                    info!("Loaded results for experiment: {}", self.name);
                    return ExperimentResult::load(&result_path, exp_config).await;
                }
            }
        }

        let result = self.collect(x_range, &built, exp_config).await?;
        result.save(&result_path).await?;
        result.write_csv(&out.join(format!("{}.csv", self.name)))?;
        Ok(result)
    }

    async fn collect<I>(
        &self,
        x_range: I,
        built: &[(String, Box<dyn Procedure>)],
        exp_config: Config,
    ) -> Result<ExperimentResult>
    where
        I: IntoIterator<Item = i64>,
    {
        let x_data = x_range.into_iter().collect::<Vec<_>>();
        let mut data = built
            .iter()
            .map(|(alias, _)| (alias.clone(), Vec::with_capacity(x_data.len())))
            .collect::<Vec<_>>();

        for &x in &x_data {
            for ((alias, procedure), (_, series)) in built.iter().zip(data.iter_mut()) {
                debug!("Running {alias} x={x} for {}", self.name);
                let y = procedure
                    .run(x)
                    .await
                    .with_context(|| format!("Running {alias} of {} with x={x}", self.name))?;
                info!("{} {alias} - {x} : {y}", self.name);
                series.push(y);
            }
        }

        ExperimentResult::new(exp_config, x_data, data)
    }
}
