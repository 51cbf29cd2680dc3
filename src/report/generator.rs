//! Run report generation.
//!
//! This module renders a finished run as a Markdown document (or JSON)
//! summarizing every city, its most active cells, and what failed.

use crate::models::{CityDigest, CityFailure, RunMetadata, RunReport};
use anyhow::Result;

/// Cells listed per city in the failures section before truncating.
const MAX_LISTED_FAILURES: usize = 20;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("# Cellpulse Activity Report\n\n");

    output.push_str(&generate_metadata_section(&report.metadata));

    output.push_str(&generate_table_of_contents(report));

    output.push_str(&generate_summary_section(&report.cities));

    output.push_str(&generate_cities_section(&report.cities));

    output.push_str(&generate_failures_section(&report.cities, &report.failed_cities));

    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &RunMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Run Date:** {}\n",
        metadata.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Service:** {}\n", metadata.base_url));
    section.push_str(&format!("- **Interval:** `{}`\n", metadata.interval));
    section.push_str(&format!("- **Top K:** {}\n", metadata.top_k));
    section.push_str(&format!("- **Workers:** {}\n", metadata.max_workers));
    section.push_str(&format!(
        "- **Cities Processed:** {}\n",
        metadata.cities_processed
    ));
    if metadata.cities_failed > 0 {
        section.push_str(&format!("- **Cities Failed:** {}\n", metadata.cities_failed));
    }
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the table of contents.
fn generate_table_of_contents(report: &RunReport) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");
    toc.push_str("- [Top Cells by City](#top-cells-by-city)\n");

    for city in &report.cities {
        toc.push_str(&format!("  - [{}](#{})\n", city.city, anchor(&city.city)));
    }

    if has_failures(&report.cities, &report.failed_cities) {
        toc.push_str("- [Failures](#failures)\n");
    }

    toc.push('\n');

    toc
}

/// Generate the cross-city summary table.
fn generate_summary_section(cities: &[CityDigest]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    if cities.is_empty() {
        section.push_str("No city produced results.\n\n");
        return section;
    }

    section.push_str("| City | Total Activity | Average | Max | Cells | Failed Cells |\n");
    section.push_str("|:---|---:|---:|---:|---:|---:|\n");

    let mut sorted: Vec<&CityDigest> = cities.iter().collect();
    sorted.sort_by(|a, b| {
        b.summary
            .total
            .cmp(&a.summary.total)
            .then_with(|| a.city.cmp(&b.city))
    });

    for city in sorted {
        section.push_str(&format!(
            "| {} | {} | {:.2} | {} | {} | {} |\n",
            city.city,
            city.summary.total,
            city.summary.mean,
            city.summary.max,
            city.summary.count,
            city.failed_cells.len()
        ));
    }
    section.push('\n');

    section
}

/// Generate the per-city top cells.
fn generate_cities_section(cities: &[CityDigest]) -> String {
    let mut section = String::new();

    section.push_str("## Top Cells by City\n\n");

    for city in cities {
        section.push_str(&format!("### {}\n\n", city.city));

        if city.top.is_empty() {
            section.push_str("*No cells.*\n\n");
            continue;
        }

        section.push_str("| Rank | Cell | Total Activity |\n");
        section.push_str("|---:|---:|---:|\n");
        for (i, cell) in city.top.iter().enumerate() {
            section.push_str(&format!(
                "| {} | {} | {} |\n",
                i + 1,
                cell.id,
                cell.total_activity
            ));
        }
        section.push('\n');
    }

    section
}

/// Generate the failures section.
fn generate_failures_section(cities: &[CityDigest], failed_cities: &[CityFailure]) -> String {
    if !has_failures(cities, failed_cities) {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Failures\n\n");

    for failure in failed_cities {
        section.push_str(&format!(
            "- ⛔ **{}** was skipped: {}\n",
            failure.city, failure.error
        ));
    }
    if !failed_cities.is_empty() {
        section.push('\n');
    }

    for city in cities.iter().filter(|c| !c.failed_cells.is_empty()) {
        section.push_str(&format!(
            "**{}**: {} cell(s) scored 0 (failed or unparsed)\n\n",
            city.city,
            city.failed_cells.len()
        ));

        for cell in city.failed_cells.iter().take(MAX_LISTED_FAILURES) {
            section.push_str(&format!(
                "- cell {} ({}, {} attempts): {}\n",
                cell.id,
                cell.status,
                cell.attempts,
                cell.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if city.failed_cells.len() > MAX_LISTED_FAILURES {
            section.push_str(&format!(
                "- ... and {} more (see the raw log)\n",
                city.failed_cells.len() - MAX_LISTED_FAILURES
            ));
        }
        section.push('\n');
    }

    section
}

fn has_failures(cities: &[CityDigest], failed_cities: &[CityFailure]) -> bool {
    !failed_cities.is_empty() || cities.iter().any(|c| !c.failed_cells.is_empty())
}

/// The fragment GitHub generates for a heading.
fn anchor(heading: &str) -> String {
    heading
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('-'),
            c if c.is_alphanumeric() || c == '-' || c == '_' => Some(c),
            _ => None,
        })
        .collect()
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str("*Report generated by cellpulse. Counts from the ohsome API.*\n");

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
