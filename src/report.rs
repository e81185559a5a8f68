//! # Report Tree and Output
//!
//! Every component that contributes to the final report (histograms,
//! workloads, groups, system inventory) produces a [`ReportNode`]: a named
//! node with string attributes, optional text and ordered children. The tree
//! does not know about any particular output format; [`ReportWriter`] renders
//! it as pretty-printed JSON and as a console summary table.
//!
//! ## Report Directory
//!
//! Each run gets its own directory `<workdir>/rteval-YYYYMMDD-N`, where `N`
//! is the first number not already taken for that date. Module logs go to a
//! `logs/` subdirectory.

use crate::utils::{print_table_row, print_table_separator};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use colored::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the JSON report inside the report directory
pub const SUMMARY_FILE: &str = "summary.json";

/// A named node of the report tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportNode {
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<ReportNode>,
}

impl ReportNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A node carrying only text, e.g. `<samples>1200</samples>`
    pub fn leaf(name: impl Into<String>, text: impl ToString) -> Self {
        Self::new(name).text(text)
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn text(mut self, text: impl ToString) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn child(mut self, child: ReportNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl ToString) {
        self.attributes.insert(key.into(), value.to_string());
    }

    pub fn push(&mut self, child: ReportNode) {
        self.children.push(child);
    }

    pub fn extend(&mut self, children: impl IntoIterator<Item = ReportNode>) {
        self.children.extend(children);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn text_value(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn children(&self) -> &[ReportNode] {
        &self.children
    }

    /// First direct child with the given name
    pub fn find(&self, name: &str) -> Option<&ReportNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given name
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ReportNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// One row of the latency summary table
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub module: String,
    pub source: String,
    pub samples: String,
    pub minimum: String,
    pub maximum: String,
    pub mean: String,
    pub median: String,
    pub mode: String,
    pub std_dev: String,
}

/// Collect every node that carries a `statistics` child into table rows
pub fn summary_rows(report: &ReportNode) -> Vec<SummaryRow> {
    let mut rows = Vec::new();
    collect_rows(report, "", &mut rows);
    rows
}

fn collect_rows(node: &ReportNode, parent: &str, rows: &mut Vec<SummaryRow>) {
    if let Some(stats) = node.find("statistics") {
        let value = |name: &str| {
            stats
                .find(name)
                .and_then(ReportNode::text_value)
                .map(format_number)
                .unwrap_or_else(|| "-".to_string())
        };
        let source = match node.attribute("id") {
            Some(id) => format!("{} {}", node.name(), id),
            None => node.name().to_string(),
        };
        rows.push(SummaryRow {
            module: parent.to_string(),
            source,
            samples: value("samples"),
            minimum: value("minimum"),
            maximum: value("maximum"),
            mean: value("mean"),
            median: value("median"),
            mode: value("mode"),
            std_dev: value("standard_deviation"),
        });
        return;
    }
    for child in node.children() {
        collect_rows(child, node.name(), rows);
    }
}

/// Trim floating point noise for display
fn format_number(text: &str) -> String {
    match text.parse::<f64>() {
        Ok(v) if v.fract() != 0.0 => format!("{:.2}", v),
        _ => text.to_string(),
    }
}

/// Print the run header and latency table for a report
pub fn print_summary(report: &ReportNode) {
    println!();
    println!("{}", "rteval run summary".bold());
    if let Some(run_id) = report.attribute("run_id") {
        println!("  Run ID:        {}", run_id);
    }
    if let Some(info) = report.find("run_info") {
        let field = |name: &str| info.attribute(name).unwrap_or("-").to_string();
        println!("  Date:          {} {}", field("date"), field("time"));
        println!(
            "  Duration:      {}d {}h {}m {}s",
            field("days"),
            field("hours"),
            field("minutes"),
            field("seconds")
        );
        if let Some(annotation) = info.find("annotate").and_then(ReportNode::text_value) {
            println!("  Annotation:    {}", annotation);
        }
    }
    if let Some(kernel) = report
        .find("kernel")
        .and_then(|k| k.attribute("release"))
    {
        println!("  Kernel:        {}", kernel);
    }
    if let Some(loadavg) = report.find("loads").and_then(|l| l.attribute("load_average")) {
        println!("  Load average:  {}", loadavg);
    }
    println!();

    let rows = summary_rows(report);
    if rows.is_empty() {
        println!("{}", "No latency statistics recorded".yellow());
        return;
    }

    let headers = [
        "Module", "Source", "Samples", "Min", "Max", "Mean", "Median", "Mode", "Std Dev",
    ];
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    let cells: Vec<[&str; 9]> = rows
        .iter()
        .map(|r| {
            [
                r.module.as_str(),
                r.source.as_str(),
                r.samples.as_str(),
                r.minimum.as_str(),
                r.maximum.as_str(),
                r.mean.as_str(),
                r.median.as_str(),
                r.mode.as_str(),
                r.std_dev.as_str(),
            ]
        })
        .collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    println!("Latency (us):");
    print_table_separator(&widths);
    print_table_row(&headers, &widths);
    print_table_separator(&widths);
    for row in &cells {
        print_table_row(row, &widths);
    }
    print_table_separator(&widths);
}

/// Writes the final report into a report directory
pub struct ReportWriter {
    reportdir: PathBuf,
}

impl ReportWriter {
    pub fn new(reportdir: impl Into<PathBuf>) -> Self {
        Self {
            reportdir: reportdir.into(),
        }
    }

    pub fn summary_path(&self) -> PathBuf {
        self.reportdir.join(SUMMARY_FILE)
    }

    /// Serialize the report as pretty JSON and return the file written
    pub fn write(&self, report: &ReportNode) -> Result<PathBuf> {
        let path = self.summary_path();
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        info!("Report written to {:?}", path);
        Ok(path)
    }
}

/// Read a JSON report back from disk
pub fn load_report(path: &Path) -> Result<ReportNode> {
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read report {:?}", path))?;
    let report = serde_json::from_str(&json)
        .with_context(|| format!("{:?} is not an rteval report", path))?;
    Ok(report)
}

/// Print summaries of previously written reports
///
/// A directory argument is taken to be a report directory and its
/// `summary.json` is used.
pub fn summarize(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let file = if path.is_dir() {
            path.join(SUMMARY_FILE)
        } else {
            path.clone()
        };
        debug!("Summarizing {:?}", file);
        let report = load_report(&file)?;
        println!("{}", format!("Report: {}", file.display()).cyan());
        print_summary(&report);
    }
    Ok(())
}

/// Create `<workdir>/rteval-YYYYMMDD-N` and its `logs/` subdirectory
pub fn create_report_dir(workdir: &Path, date: NaiveDate) -> Result<PathBuf> {
    let stamp = date.format("%Y%m%d").to_string();
    let mut n = 1u32;
    let dir = loop {
        let candidate = workdir.join(format!("rteval-{}-{}", stamp, n));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    fs::create_dir_all(dir.join("logs"))
        .with_context(|| format!("Failed to create report directory {:?}", dir))?;
    debug!("Report directory: {:?}", dir);
    Ok(dir)
}
