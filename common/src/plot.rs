use core::fmt::Debug;
use std::{
    fs,
    path::{Path, PathBuf},
};

use dyn_clone::{DynClone, clone_trait_object};
use eyre::{Context, Result};
use plotters::{coord::Shift, prelude::*};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    config::{Config, Namespace, Overrides},
    result::ExperimentResult,
};

/// A derived series drawn as one row (chart + table) of a presentation.
#[typetag::serde(tag = "type")]
pub trait View: Debug + DynClone + Send + Sync {
    /// Bound as the graph scope's root value; the default graph title.
    fn title(&self) -> &'static str;
    /// Graph-level options for this view; bare keys land under `graph_`.
    fn options(&self) -> Overrides {
        Overrides::new()
    }
    /// Fallbacks for the graph scope, installed with [`Config::default`].
    fn defaults(&self, _graph: &Config) {}
    fn transform(&self, x_data: &[i64], series: &[f64]) -> Vec<f64>;
}
clone_trait_object!(View);

pub fn graph_config(view: &dyn View, pres: &Config) -> Config {
    let graph = pres.new_child(
        Namespace::Graph,
        Some(Value::from(view.title())),
        &view.options(),
    );
    view.defaults(&graph);
    graph
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub x_data: Vec<i64>,
    pub series: Vec<(String, Vec<f64>)>,
}

impl Panel {
    pub fn from_view(
        view: &dyn View,
        graph: &Config,
        x_data: &[i64],
        data: &[(String, Vec<f64>)],
    ) -> Result<Self> {
        Ok(Self {
            title: graph.get_string("graph_title")?,
            x_label: graph.get_string("graph_x_label")?,
            y_label: graph.get_string("graph_y_label")?,
            x_data: x_data.to_vec(),
            series: data
                .iter()
                .map(|(name, series)| (name.clone(), view.transform(x_data, series)))
                .collect(),
        })
    }

    /// Header and rows of the table drawn next to the chart.
    pub fn table(&self) -> (Vec<String>, Vec<Vec<String>>) {
        let header = std::iter::once(self.x_label.clone())
            .chain(self.series.iter().map(|(name, _)| name.clone()))
            .collect();
        let rows = self
            .x_data
            .iter()
            .enumerate()
            .map(|(idx, x)| {
                std::iter::once(x.to_string())
                    .chain(
                        self.series
                            .iter()
                            .map(|(_, values)| format!("{:0.5}", values[idx])),
                    )
                    .collect()
            })
            .collect();
        (header, rows)
    }
}

/// Panels collected for one image; [`Figure::save`] renders and clears them.
#[derive(Debug, Default)]
pub struct Figure {
    panels: Vec<Panel>,
}

type Area<'a> = DrawingArea<SVGBackend<'a>, Shift>;

const ROW_HEIGHT: u32 = 420;
const WIDTH: u32 = 1400;

impl Figure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, panel: Panel) {
        self.panels.push(panel);
    }

    pub fn panels(&self) -> &[Panel] {
        &self.panels
    }

    pub fn save(&mut self, path: &Path, title: &str) -> Result<()> {
        let rows = self.panels.len().max(1);
        debug!("Rendering {rows} rows to {path:?}");
        {
            let root =
                SVGBackend::new(path, (WIDTH, ROW_HEIGHT * rows as u32 + 60)).into_drawing_area();
            root.fill(&WHITE)?;
            let root = root.titled(title, ("sans-serif", 28))?;
            let areas = root.split_evenly((rows, 2));
            for (panel, cells) in self.panels.iter().zip(areas.chunks(2)) {
                draw_chart(&cells[0], panel)?;
                draw_table(&cells[1], panel)?;
            }
            root.present()?;
        }
        self.panels.clear();
        Ok(())
    }
}

fn tick_label(x_data: &[i64], position: f64) -> String {
    let idx = position.round();
    if (position - idx).abs() > 1e-6 || idx < 0.0 {
        return String::new();
    }
    x_data
        .get(idx as usize)
        .map(|x| x.to_string())
        .unwrap_or_default()
}

fn draw_chart(area: &Area<'_>, panel: &Panel) -> Result<()> {
    let points = panel.x_data.len();
    let y_max = panel
        .series
        .iter()
        .flat_map(|(_, values)| values.iter().copied())
        .filter(|y| y.is_finite())
        .fold(0.0_f64, f64::max);
    let y_max = if y_max > 0.0 { y_max * 1.1 } else { 1.0 };
    let x_max = points.saturating_sub(1).max(1) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption(&panel.title, ("sans-serif", 20))
        .margin(12)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..x_max, 0.0..y_max)?;

    let x_data = &panel.x_data;
    chart
        .configure_mesh()
        .x_labels(points.max(2))
        .x_label_formatter(&|v| tick_label(x_data, *v))
        .y_labels(6)
        .x_desc(panel.x_label.as_str())
        .y_desc(panel.y_label.as_str())
        .draw()?;

    for (idx, (name, values)) in panel.series.iter().enumerate() {
        let color = Palette99::pick(idx).to_rgba();
        chart
            .draw_series(LineSeries::new(
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, y)| y.is_finite())
                    .map(|(i, y)| (i as f64, *y)),
                color.stroke_width(2),
            ))?
            .label(name.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
    }

    if panel.series.len() > 1 {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;
    }
    Ok(())
}

fn draw_table(area: &Area<'_>, panel: &Panel) -> Result<()> {
    let (header, rows) = panel.table();
    let style = TextStyle::from(("monospace", 14).into_font()).color(&BLACK);
    let (width, height) = area.dim_in_pixel();
    let column_width = (width as i32 - 20) / header.len().max(1) as i32;
    let line_height = 22;
    let top = ((height as i32 - line_height * (rows.len() as i32 + 1)) / 2).max(10);

    for (row_idx, cells) in std::iter::once(&header).chain(rows.iter()).enumerate() {
        for (col_idx, cell) in cells.iter().enumerate() {
            area.draw_text(
                cell,
                &style,
                (
                    10 + col_idx as i32 * column_width,
                    top + row_idx as i32 * line_height,
                ),
            )?;
        }
    }
    Ok(())
}

impl ExperimentResult {
    /// Renders one row per view into a single image at the resolved `pres_out`.
    ///
    /// Scopes: experiment -> presentation (`name`, `overrides`) -> graph (per view).
    pub fn presentation(
        &self,
        name: &str,
        views: &[Box<dyn View>],
        overrides: &Overrides,
    ) -> Result<PathBuf> {
        let pres = self
            .config()
            .new_child(Namespace::Pres, Some(Value::from(name)), overrides);
        let title = pres.get_string("pres_title")?;
        let out = PathBuf::from(pres.get_string("pres_out")?);

        let mut figure = Figure::new();
        for view in views {
            let graph = graph_config(view.as_ref(), &pres);
            figure.push(
                Panel::from_view(view.as_ref(), &graph, self.x_data(), self.data())
                    .with_context(|| format!("Building {} graph of {name}", view.title()))?,
            );
        }

        if let Some(parent) = out.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        figure
            .save(&out, &title)
            .with_context(|| format!("Rendering presentation {name}"))?;
        info!("Saved presentation {name} to {out:?}");
        Ok(out)
    }
}
