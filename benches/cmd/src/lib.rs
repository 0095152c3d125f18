use std::{path::PathBuf, sync::Arc, time::Duration};

use common::{
    bench::{Experiment, Procedure, ProcedureGenerator},
    config::{Config, Namespace, Overrides},
    error::ConfigError,
    exec::{Executor, Invocation, SystemExecutor},
    util::{mean, parse_measurement},
};
use eyre::{Context, Result};
use itertools::Itertools;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info};

/// Root of a benchmarking session: owns the environment scope every command
/// and experiment resolves against.
#[derive(Debug, Clone)]
pub struct Environment {
    config: Config,
    executor: Arc<dyn Executor>,
}

impl Environment {
    /// `directory` is where commands run and, by default, where results land.
    pub fn new(directory: impl Into<String>) -> Self {
        let config = Config::new();
        add_defaults(&config);
        config.set("directory", directory.into());
        Self {
            config,
            executor: Arc::new(SystemExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers an external program; bare option keys land under `cmd_`.
    ///
    /// Recognized options: `args`, `env`, `trials`, `pattern`, `timeout`.
    pub fn command(&self, name: &str, overrides: &Overrides) -> ProcedureGenerator {
        let scope = self
            .config
            .new_child(Namespace::Cmd, Some(Value::from(name)), overrides);
        let executor = self.executor.clone();
        let program = name.to_owned();
        ProcedureGenerator::new(scope, move |config| {
            Ok(Box::new(Cmd {
                program: program.clone(),
                config,
                executor: executor.clone(),
            }))
        })
    }

    pub fn experiment<I, S>(&self, name: &str, procedures: I) -> Experiment
    where
        I: IntoIterator<Item = (S, ProcedureGenerator)>,
        S: Into<String>,
    {
        Experiment::new(name, self.config.clone(), procedures)
    }
}

fn add_defaults(config: &Config) {
    config.set_deferred("exp_out", |c| {
        Ok(json!(format!("{}/results", c.get_string("directory")?)))
    });
    config.set("cmd_trials", 5);
    config.set("cmd_pattern", ".*([0-9.]+).*");
    config.set("cmd_env", json!({}));
    config.set("cmd_args", json!([]));
    config.set_deferred("pres_title", |c| c.get("pres"));
    config.set_deferred("pres_out", |c| {
        Ok(json!(format!(
            "{}/{}.svg",
            c.get_string("exp_out")?,
            c.get_string("pres")?
        )))
    });
    config.set_deferred("graph_title", |c| c.get("graph"));
    config.set("graph_x_label", "Threads");
}

/// Runs one external program per trial and averages the parsed timings.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    config: Config,
    executor: Arc<dyn Executor>,
}

/// Everything a single x value resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub invocation: Invocation,
    pub trials: u64,
    pub pattern: String,
}

impl Cmd {
    pub fn resolve(&self, x: i64) -> Result<Resolved> {
        let instance = self
            .config
            .new_child(Namespace::Instance, Some(Value::from(x)), &Overrides::new());
        let args = std::iter::once(self.program.clone())
            .chain(instance.get_string_list("cmd_args")?)
            .collect();
        let timeout = match instance.get_opt("cmd_timeout")? {
            None | Some(Value::Null) => None,
            Some(_) => {
                let seconds = instance.get_f64("cmd_timeout")?;
                let timeout = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    ConfigError::TypeMismatch {
                        key: "cmd_timeout".to_owned(),
                        expected: "non-negative number of seconds",
                        found: seconds.to_string(),
                    }
                })?;
                Some(timeout)
            }
        };

        Ok(Resolved {
            invocation: Invocation {
                args,
                env: instance.get_string_map("cmd_env")?,
                dir: PathBuf::from(instance.get_string("directory")?),
                timeout,
            },
            trials: instance.get_u64("cmd_trials")?,
            pattern: instance.get_string("cmd_pattern")?,
        })
    }
}

#[async_trait::async_trait]
impl Procedure for Cmd {
    async fn run(&self, x: i64) -> Result<f64> {
        let Resolved {
            invocation,
            trials,
            pattern,
        } = self.resolve(x)?;
        let regex = Regex::new(&pattern).with_context(|| format!("Compile pattern {pattern}"))?;

        let mut times = Vec::new();
        for trial in 0..trials {
            let output = self.executor.exec(&invocation).await?;
            let time = parse_measurement(&output, &regex)?;
            debug!("trial={trial} program={} time={time}", self.program);
            times.push(time);
        }

        let result = mean(&times);
        info!(
            "Running {} - {x} -> [{}] : {result}",
            self.program,
            invocation.args.iter().join(", ")
        );
        Ok(result)
    }

    fn describe(&self, x: i64) -> Result<String> {
        let resolved = self.resolve(x)?;
        Ok(format!(
            "x={x} trials={} pattern={:?} dir={:?} :: {}",
            resolved.trials,
            resolved.pattern,
            resolved.invocation.dir,
            resolved.invocation.command_line()
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use common::error::ParseError;

    use super::*;

    /// Hands out canned outputs in order and records every invocation.
    #[derive(Debug, Default)]
    struct Scripted {
        outputs: Mutex<VecDeque<String>>,
        seen: Mutex<Vec<Invocation>>,
    }

    impl Scripted {
        fn new(outputs: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
                seen: Mutex::default(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Executor for Scripted {
        async fn exec(&self, invocation: &Invocation) -> Result<String> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(self.outputs.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn environment(dir: &std::path::Path, executor: Arc<Scripted>) -> Environment {
        let env = Environment::new(dir.to_str().unwrap()).with_executor(executor);
        env.config().set("cmd_pattern", r"Time taken : ([0-9.]+)\.");
        env
    }

    #[tokio::test]
    async fn averages_trials() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&[
            "Time taken : 2.0.",
            "Time taken : 4.0.",
            "Time taken : 6.0.",
        ]);
        let env = environment(dir.path(), executor.clone());
        let knap = env.command("knap2", &Overrides::new().set("trials", 3));
        let experiment = env.experiment("knap2", [("knap2", knap)]);
        let procedure = experiment
            .materialize(&experiment.config(&Overrides::new()))
            .unwrap()
            .pop()
            .unwrap()
            .1;

        assert_eq!(procedure.run(1).await.unwrap(), 4.0);
        assert_eq!(executor.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn zero_trials_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&[]);
        let env = environment(dir.path(), executor.clone());
        let experiment = env.experiment(
            "none",
            [("p", env.command("p", &Overrides::new().set("trials", 0)))],
        );
        let result = experiment.run([1, 2], &Overrides::new()).await.unwrap();

        assert_eq!(result.series("p").unwrap().values(), &[0.0, 0.0]);
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolves_per_x_arguments_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&["Time taken : 1.5."; 2]);
        let env = environment(dir.path(), executor.clone());
        env.config().set("cmd_trials", 1);
        let omp = Overrides::new()
            .set("args", vec!["k100x20M.txt", "101"])
            .deferred("env", |c| Ok(json!({ "OMP_NUM_THREADS": c.get("x")? })));
        let depth = Overrides::new().deferred("args", |c| Ok(json!(["k100x20M.txt", c.get("x")?])));

        let experiment = env.experiment(
            "mixed",
            [
                ("threads", env.command("knap2", &omp)),
                ("depth", env.command("knap2", &depth)),
            ],
        );
        experiment.run([4], &Overrides::new()).await.unwrap();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].args, vec!["knap2", "k100x20M.txt", "101"]);
        assert_eq!(seen[0].env.get("OMP_NUM_THREADS"), Some(&"4".to_owned()));
        assert_eq!(seen[1].args, vec!["knap2", "k100x20M.txt", "4"]);
        assert!(seen[1].env.is_empty());
        assert_eq!(seen[0].dir, dir.path());
        assert_eq!(seen[0].timeout, None);
    }

    #[tokio::test]
    async fn experiment_overrides_reach_commands() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&["Time taken : 1.0."; 8]);
        let env = environment(dir.path(), executor.clone());
        let experiment = env.experiment("trials", [("p", env.command("p", &Overrides::new()))]);

        experiment
            .run([1], &Overrides::new().set("cmd_trials", 2).set("cmd_timeout", 1.5))
            .await
            .unwrap();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].timeout, Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn invalid_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&["Time taken : 1.0."]);
        let env = environment(dir.path(), executor.clone());
        let experiment = env.experiment(
            "negative",
            [("p", env.command("p", &Overrides::new().set("timeout", -1.0)))],
        );

        let err = experiment.run([1], &Overrides::new()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::TypeMismatch {
                key: "cmd_timeout".to_owned(),
                expected: "non-negative number of seconds",
                found: "-1".to_owned(),
            })
        );
        assert!(executor.seen.lock().unwrap().is_empty());

        let env = environment(dir.path(), Scripted::new(&[]));
        env.config().set("cmd_timeout", f64::MAX);
        let generator = env.command("p", &Overrides::new());
        let experiment = env.experiment("overflow", [("p", generator)]);
        let built = experiment
            .materialize(&experiment.config(&Overrides::new()))
            .unwrap();
        assert!(built[0].1.describe(1).is_err());
    }

    #[tokio::test]
    async fn huge_trial_count_fails_on_first_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&[]);
        let env = environment(dir.path(), executor.clone());
        let experiment = env.experiment(
            "huge",
            [("p", env.command("p", &Overrides::new().set("trials", u64::MAX)))],
        );

        let err = experiment.run([1], &Overrides::new()).await.unwrap_err();
        assert!(err.downcast_ref::<ParseError>().is_some());
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn generator_layers_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&[]);
        let env = environment(dir.path(), executor);
        let base = env.command("knap3", &Overrides::new().set("args", vec!["a"]).set("trials", 1));
        let special = base.with(&Overrides::new().set("args", vec!["b"]));
        let experiment = env.experiment("layers", [("base", base), ("special", special)]);

        let built = experiment
            .materialize(&experiment.config(&Overrides::new()))
            .unwrap();
        assert!(built[0].1.describe(2).unwrap().ends_with(":: knap3 a"));
        assert!(built[1].1.describe(2).unwrap().ends_with(":: knap3 b"));
        assert!(built[1].1.describe(2).unwrap().contains("trials=1"));
    }

    #[tokio::test]
    async fn parse_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&["Time taken : 1.0.", "Done."]);
        let env = environment(dir.path(), executor.clone());
        let experiment = env.experiment(
            "broken",
            [("p", env.command("p", &Overrides::new().set("trials", 3)))],
        );

        let err = experiment.run([1], &Overrides::new()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ParseError>(),
            Some(&ParseError::Unparseable {
                output: "Done.".to_owned(),
                pattern: r"Time taken : ([0-9.]+)\.".to_owned(),
            })
        );
        assert_eq!(executor.seen.lock().unwrap().len(), 2);
        assert!(!dir.path().join("results/broken.exp").exists());
    }

    #[tokio::test]
    async fn cache_hit_skips_processes() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Scripted::new(&["Time taken : 3.0."; 2]);
        let env = environment(dir.path(), executor.clone());
        env.config().set("cmd_trials", 1);
        let experiment = env.experiment("knap3", [("knap3", env.command("knap3", &Overrides::new()))]);

        let first = experiment.run(1..=2, &Overrides::new()).await.unwrap();
        let second = experiment.run(1..=8, &Overrides::new()).await.unwrap();

        assert_eq!(executor.seen.lock().unwrap().len(), 2);
        assert_eq!(second.snapshot(), first.snapshot());
    }

    #[test]
    fn default_output_paths() {
        let env = Environment::new("pa3");
        let exp = env
            .config()
            .new_child(Namespace::Exp, Some(json!("knap3")), &Overrides::new());
        let pres = exp.new_child(Namespace::Pres, Some(json!("threads")), &Overrides::new());

        assert_eq!(exp.get_string("exp_out").unwrap(), "pa3/results");
        assert_eq!(pres.get_string("pres_out").unwrap(), "pa3/results/threads.svg");
        assert_eq!(pres.get_string("pres_title").unwrap(), "threads");

        let moved = exp.new_child(Namespace::Exp, None, &Overrides::new().set("directory", "x"));
        // `directory` is not an option key, so the bare form is namespaced away.
        assert_eq!(moved.get_string("exp_out").unwrap(), "pa3/results");
        moved.set("directory", "elsewhere");
        assert_eq!(moved.get_string("exp_out").unwrap(), "elsewhere/results");
    }

    #[test]
    fn environments_do_not_share_scopes() {
        let a = Environment::new("a");
        let b = Environment::new("b");
        a.config().set("cmd_trials", 1);
        assert_eq!(b.config().get_u64("cmd_trials").unwrap(), 5);
        assert_eq!(b.config().get_string("directory").unwrap(), "b");
    }
}
