use std::{path::Path, time::Duration};

use chrono::{DateTime, Local};
use console::style;
use eyre::{Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs::{metadata, remove_file};
use tracing::{debug, info};

use crate::setup::{Plan, Setup, overrides};

async fn load_plans(setup_file: &Path) -> Result<Vec<Plan>> {
    let setup = Setup::load(setup_file).await?;
    let env = setup.environment();
    debug!("Loaded setup from {setup_file:?}");
    setup.plan(&env)
}

/// Keeps the plans named in `names`, or all of them when `names` is empty.
fn select(plans: Vec<Plan>, names: &[String]) -> Result<Vec<Plan>> {
    if let Some(missing) = names
        .iter()
        .find(|name| !plans.iter().any(|plan| plan.experiment.name() == name.as_str()))
    {
        bail!("No experiment named {missing}");
    }
    Ok(plans
        .into_iter()
        .filter(|plan| names.is_empty() || names.iter().any(|n| n == plan.experiment.name()))
        .collect())
}

fn spinner(no_progress: bool, name: &str) -> Result<ProgressBar> {
    if no_progress {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    bar.set_message(format!("Running {name}"));
    bar.enable_steady_tick(Duration::from_millis(120));
    Ok(bar)
}

pub async fn run_experiments(
    setup_file: &Path,
    no_progress: bool,
    skip_plot: bool,
    only: Vec<String>,
) -> Result<()> {
    for plan in select(load_plans(setup_file).await?, &only)? {
        let name = plan.experiment.name();
        let bar = spinner(no_progress, name)?;
        let result = plan
            .experiment
            .run(plan.x_range.iter().copied(), &plan.overrides)
            .await;
        bar.finish_and_clear();
        let result = result?;
        println!(
            "{} {} x values, {} procedures",
            style(name).bold(),
            result.x_data().len(),
            result.data().len()
        );

        if skip_plot {
            continue;
        }
        for presentation in &plan.presentations {
            let out = result.presentation(
                &presentation.name,
                &presentation.views,
                &overrides(&presentation.options),
            )?;
            println!("  {} -> {}", presentation.name, out.display());
        }
    }
    Ok(())
}

/// Lists every experiment with the age of its cached result.
pub async fn list_results(setup_file: &Path) -> Result<()> {
    for plan in load_plans(setup_file).await? {
        let exp_config = plan.experiment.config(&plan.overrides);
        let path = plan.experiment.result_path(&exp_config)?;
        match metadata(&path).await {
            Ok(meta) => {
                let modified: DateTime<Local> = meta.modified()?.into();
                println!(
                    "{} -> {} ({})",
                    style(plan.experiment.name()).bold(),
                    path.display(),
                    modified.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Err(_) => println!(
                "{} -> {}",
                style(plan.experiment.name()).bold(),
                style("not run").dim()
            ),
        }
    }
    Ok(())
}

/// Deletes cached results so the next `run` measures again.
pub async fn clean(setup_file: &Path, names: Vec<String>) -> Result<()> {
    for plan in select(load_plans(setup_file).await?, &names)? {
        let exp_config = plan.experiment.config(&plan.overrides);
        let exp_path = plan.experiment.result_path(&exp_config)?;
        for path in [exp_path.clone(), exp_path.with_extension("csv")] {
            if path.is_file() {
                remove_file(&path).await?;
                info!("Removed {path:?}");
                println!("Removed {}", path.display());
            }
        }
    }
    Ok(())
}

/// Prints what `run` would execute without running anything.
pub async fn print_commands(setup_file: &Path, only: Vec<String>) -> Result<()> {
    for plan in select(load_plans(setup_file).await?, &only)? {
        let exp_config = plan.experiment.config(&plan.overrides);
        let built = plan.experiment.materialize(&exp_config)?;
        println!("{}", style(plan.experiment.name()).bold());
        for x in &plan.x_range {
            for (alias, procedure) in &built {
                println!("  {alias}: {}", procedure.describe(*x)?);
            }
        }
    }
    Ok(())
}
