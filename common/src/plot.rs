use std::{fs, path::Path};

use eyre::{ContextCompat, Result, bail, eyre};
use plotters::{
    coord::{
        Shift,
        cartesian::Cartesian2d,
        types::{RangedCoordf64, RangedCoordi64},
    },
    prelude::*,
};
use tracing::{debug, info};

use crate::{
    aggregate::AggregatedResult,
    config::{Marker, Metric, PlotSettings},
    progress::ProgressSeries,
};

const FONT: &str = "sans-serif";
const TITLE_SIZE: u32 = 30;
const LABEL_SIZE: u32 = 22;
const LEGEND_HEIGHT: u32 = 120;
const LEGEND_COLUMNS: usize = 2;
const MARKER_SIZE: i32 = 6;
const STROKE_WIDTH: u32 = 2;

/// Parses a `#rrggbb` colour
pub fn parse_color(color: &str) -> Result<RGBColor> {
    let hex = color
        .strip_prefix('#')
        .filter(|hex| hex.len() == 6)
        .context(format!("Colour '{color}' is not of the form #rrggbb"))?;
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| eyre!("Invalid colour '{color}'"))
    };
    Ok(RGBColor(channel(0)?, channel(2)?, channel(4)?))
}

/// A configuration as drawn in every panel and in the shared legend
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesStyle {
    pub id: String,
    pub label: String,
    pub color: RGBColor,
    pub marker: Marker,
}

/// Resolves the legend entries in configuration order. A configuration
/// without a display name is an error.
pub fn series_styles(settings: &PlotSettings) -> Result<Vec<SeriesStyle>> {
    settings
        .configurations
        .iter()
        .map(|cfg| {
            let Some(label) = settings.display_names.get(&cfg.id) else {
                bail!("No display name for configuration '{}'", cfg.id);
            };
            Ok(SeriesStyle {
                id: cfg.id.clone(),
                label: label.clone(),
                color: parse_color(&cfg.color)?,
                marker: cfg.marker,
            })
        })
        .collect()
}

/// Rows and columns of the panel grid
pub fn grid_shape(panels: usize, columns: usize) -> (usize, usize) {
    let columns = columns.max(1);
    (panels.div_ceil(columns).max(1), columns)
}

fn draw_err<E: std::fmt::Display>(err: E) -> eyre::Report {
    eyre!("Drawing failed: {err}")
}

type Panel<'a, DB> = ChartContext<'a, DB, Cartesian2d<RangedCoordi64, RangedCoordf64>>;

fn diamond() -> Vec<(i32, i32)> {
    let s = MARKER_SIZE;
    vec![(0, -s), (s, 0), (0, s), (-s, 0), (0, -s)]
}

/// Points drawn for a series. An empty series still shows up as a single
/// zero point.
pub fn plotted_points(series: &ProgressSeries, metric: Metric) -> Vec<(i64, f64)> {
    if series.is_empty() {
        vec![(0, 0.0)]
    } else {
        series.metric(metric)
    }
}

fn draw_markers<DB: DrawingBackend>(
    chart: &mut Panel<'_, DB>,
    points: &[(i64, f64)],
    marker: Marker,
    style: ShapeStyle,
) -> Result<()> {
    let s = MARKER_SIZE;
    let at = points.iter().copied();
    match marker {
        Marker::Circle => chart
            .draw_series(at.map(|p| Circle::new(p, s, style)))
            .map(|_| ()),
        Marker::Triangle => chart
            .draw_series(at.map(|p| TriangleMarker::new(p, s, style)))
            .map(|_| ()),
        Marker::Square => chart
            .draw_series(at.map(|p| EmptyElement::at(p) + Rectangle::new([(-s, -s), (s, s)], style)))
            .map(|_| ()),
        Marker::Diamond => chart
            .draw_series(at.map(|p| EmptyElement::at(p) + PathElement::new(diamond(), style)))
            .map(|_| ()),
    }
    .map_err(draw_err)
}

fn draw_legend_marker<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    at: (i32, i32),
    marker: Marker,
    style: ShapeStyle,
) -> Result<()> {
    let s = MARKER_SIZE;
    match marker {
        Marker::Circle => area.draw(&Circle::new(at, s, style)),
        Marker::Triangle => area.draw(&TriangleMarker::new(at, s, style)),
        Marker::Square => area.draw(&(EmptyElement::at(at) + Rectangle::new([(-s, -s), (s, s)], style))),
        Marker::Diamond => area.draw(&(EmptyElement::at(at) + PathElement::new(diamond(), style))),
    }
    .map_err(draw_err)
}

fn hollow(color: RGBColor) -> ShapeStyle {
    ShapeStyle {
        color: color.to_rgba(),
        filled: false,
        stroke_width: STROKE_WIDTH,
    }
}

/// Renders one panel per workload and a shared legend into a PNG at `path`,
/// and dumps the plotted data next to it as JSON.
pub fn render(result: &AggregatedResult, settings: &PlotSettings, path: &Path) -> Result<()> {
    let styles = series_styles(settings)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
    }
    let data_path = path.with_extension("json");
    fs::write(&data_path, serde_json::to_string(result)?)?;
    debug!("Wrote plot data to {}", data_path.display());

    let root = BitMapBackend::new(path, (settings.width, settings.height)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let (grid, legend) = root.split_vertically(settings.height.saturating_sub(LEGEND_HEIGHT));
    let (rows, columns) = grid_shape(settings.workloads.len(), settings.columns);
    let panels = grid.split_evenly((rows, columns));

    for (workload, area) in settings.workloads.iter().zip(panels.iter()) {
        let y_max = styles
            .iter()
            .flat_map(|style| result.get(&workload.id, &style.id).metric(settings.metric))
            .filter(|(tick, _)| (0..=settings.x_max).contains(tick))
            .map(|(_, value)| value)
            .fold(1.0_f64, f64::max)
            * 1.05;

        let mut chart = ChartBuilder::on(area)
            .caption(&workload.display, (FONT, TITLE_SIZE))
            .margin(12)
            .x_label_area_size(40)
            .y_label_area_size(80)
            .build_cartesian_2d(0i64..settings.x_max, 0f64..y_max)
            .map_err(draw_err)?;
        chart
            .configure_mesh()
            .x_labels(5)
            .y_labels(6)
            .label_style((FONT, LABEL_SIZE))
            .y_label_formatter(&|y| format!("{y:.0}"))
            .draw()
            .map_err(draw_err)?;

        for style in &styles {
            let points = plotted_points(result.get(&workload.id, &style.id), settings.metric);
            debug!(
                "Plotting {} points of {} for {}",
                points.len(),
                style.id,
                workload.id
            );
            chart
                .draw_series(LineSeries::new(
                    points.iter().copied(),
                    style.color.stroke_width(STROKE_WIDTH),
                ))
                .map_err(draw_err)?;
            draw_markers(&mut chart, &points, style.marker, hollow(style.color))?;
        }
    }

    draw_legend(&legend, &styles, settings.width)?;
    root.present().map_err(draw_err)?;
    info!("Generated plot at {}", path.display());
    Ok(())
}

fn draw_legend<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    styles: &[SeriesStyle],
    width: u32,
) -> Result<()> {
    let slot_width = 360;
    let row_height = 36;
    let columns = LEGEND_COLUMNS.min(styles.len()).max(1);
    let x_start = (width as i32 - slot_width * columns as i32).max(0) / 2;

    for (i, style) in styles.iter().enumerate() {
        let x = x_start + slot_width * (i % columns) as i32;
        let y = 20 + row_height * (i / columns) as i32;
        area.draw(&PathElement::new(
            vec![(x, y), (x + 40, y)],
            style.color.stroke_width(STROKE_WIDTH),
        ))
        .map_err(draw_err)?;
        draw_legend_marker(area, (x + 20, y), style.marker, hollow(style.color))?;
        area.draw(&Text::new(
            style.label.clone(),
            (x + 55, y - LABEL_SIZE as i32 / 2),
            (FONT, LABEL_SIZE).into_font().color(&BLACK),
        ))
        .map_err(draw_err)?;
    }
    Ok(())
}
