/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Text reports for fitted event-based models.
//
// Created on: 15 Oct 2026
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Reports
//!
//! Renders mixtures, positional variance, staging, and chain agreement as
//! `comfy_table` text tables.

use comfy_table::{
    Attribute, Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED,
};

use super::ebm::{ConvergenceSummary, EbmFit, PositionalVarianceDiagram, StageResult};
use super::mixture::{MixtureDiagnostics, MixtureModel};

/// Rendered tables for one fit.
#[derive(Debug, Clone)]
pub struct EbmTables {
    pub mixtures: String,
    pub positional_variance: String,
    pub stages: String,
    pub convergence: String,
}

/// Render every table of a fit.
///
/// `max_stage_rows` limits the staging table; the remaining subjects are
/// summarized in a trailing row.
#[must_use]
pub fn render_fit_tables(fit: &EbmFit, max_stage_rows: usize) -> EbmTables {
    let names = &fit.model.biomarker_names;
    EbmTables {
        mixtures: render_mixture_table(&fit.model.mixtures, &fit.mixture_diagnostics, names),
        positional_variance: render_positional_variance_table(&fit.positional_variance, names),
        stages: render_stage_table(&fit.stages, max_stage_rows),
        convergence: render_convergence_table(&fit.convergence),
    }
}

#[must_use]
pub fn render_mixture_table(
    models: &[MixtureModel],
    diagnostics: &[MixtureDiagnostics],
    names: &[String],
) -> String {
    let mut table = make_table(&[
        "biomarker",
        "direction",
        "mixing",
        "pre median",
        "post median",
        "separation",
        "em iters",
        "flags",
    ]);
    for (model, diagnostic) in models.iter().zip(diagnostics) {
        let flags = if diagnostic.degenerate.is_empty() {
            Cell::new("-")
        } else {
            Cell::new(format!("{:?}", diagnostic.degenerate)).fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(label(names, model.biomarker)),
            Cell::new(format!("{:?}", model.direction)),
            Cell::new(format!("{:.3}", model.mixing_weight)),
            Cell::new(format!("{:.3}", model.pre_event.median())),
            Cell::new(format!("{:.3}", model.post_event.median())),
            Cell::new(format!("{:.2}", diagnostic.separation)),
            Cell::new(diagnostic.iterations),
            flags,
        ]);
    }
    table.to_string()
}

/// Positional variance with rows in reference order; each row's modal
/// position is highlighted.
#[must_use]
pub fn render_positional_variance_table(
    diagram: &PositionalVarianceDiagram,
    names: &[String],
) -> String {
    let n_events = diagram.n_events();
    let positions = (1..=n_events).map(|p| p.to_string()).collect::<Vec<_>>();
    let mut headers = vec!["event"];
    headers.extend(positions.iter().map(String::as_str));
    let mut table = make_table(&headers);
    for event in &diagram.reference {
        let modal = diagram.modal_position(*event);
        let mut row = vec![Cell::new(label(names, *event))];
        row.extend((0..n_events).map(|position| {
            let cell = Cell::new(format!("{:.2}", diagram.frequency(*event, position)));
            if position == modal {
                cell.fg(Color::Green).add_attribute(Attribute::Bold)
            } else {
                cell
            }
        }));
        table.add_row(row);
    }
    table.to_string()
}

#[must_use]
pub fn render_stage_table(stages: &[StageResult], max_rows: usize) -> String {
    let mut table = make_table(&["subject", "most likely", "expected", "p(most likely)"]);
    for (subject, stage) in stages.iter().enumerate().take(max_rows) {
        table.add_row(vec![
            Cell::new(subject),
            Cell::new(stage.most_likely),
            Cell::new(format!("{:.2}", stage.expected)),
            Cell::new(format!("{:.3}", stage.posterior[stage.most_likely])),
        ]);
    }
    if stages.len() > max_rows {
        table.add_row(vec![
            Cell::new(format!("... {} more", stages.len() - max_rows)),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
        ]);
    }
    table.to_string()
}

#[must_use]
pub fn render_convergence_table(summary: &ConvergenceSummary) -> String {
    let mut table = make_table(&["chain", "best loglik", "acceptance", "ess", "distance"]);
    for chain in &summary.chains {
        let distance = chain
            .distance_to_best
            .map_or_else(|| Cell::new("-"), |distance| {
                if distance > 0 {
                    Cell::new(distance).fg(Color::Yellow)
                } else {
                    Cell::new(distance)
                }
            });
        table.add_row(vec![
            Cell::new(chain.chain),
            Cell::new(
                chain
                    .best_log_likelihood
                    .map_or_else(|| "-".to_string(), |value| format!("{value:.2}")),
            ),
            Cell::new(format!("{:.3}", chain.acceptance_rate)),
            Cell::new(format!("{:.1}", chain.log_likelihood_ess)),
            distance,
        ]);
    }
    table.to_string()
}

fn label(names: &[String], index: usize) -> String {
    names
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("biomarker_{index}"))
}

fn make_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(*h)).collect::<Vec<_>>());
    table
}

#[cfg(test)]
mod tests {
    use faer::Mat;

    use super::*;
    use crate::models::ebm::{SequenceSample, positional_variance};

    #[test]
    fn positional_variance_table_lists_events_in_reference_order() {
        let samples = [
            SequenceSample {
                log_likelihood: -1.0,
                ordering: vec![1, 0],
            },
            SequenceSample {
                log_likelihood: -2.0,
                ordering: vec![0, 1],
            },
        ];
        let diagram = positional_variance(&samples, None).expect("pvd");
        let names = vec!["alpha".to_string(), "beta".to_string()];
        let rendered = render_positional_variance_table(&diagram, &names);
        let beta = rendered.find("beta").expect("beta row");
        let alpha = rendered.find("alpha").expect("alpha row");
        assert!(beta < alpha);
        assert!(rendered.contains("0.50"));
    }

    #[test]
    fn stage_table_truncates_long_inputs() {
        let stage = StageResult {
            posterior: vec![0.9, 0.1],
            most_likely: 0,
            expected: 0.1,
        };
        let rendered = render_stage_table(&vec![stage; 5], 2);
        assert!(rendered.contains("3 more"));
        assert!(rendered.contains("0.900"));
    }

    #[test]
    fn unnamed_events_fall_back_to_index_labels() {
        let diagram = PositionalVarianceDiagram {
            frequencies: Mat::from_fn(1, 1, |_, _| 1.0),
            reference: vec![0],
            n_samples: 1,
        };
        assert!(render_positional_variance_table(&diagram, &[]).contains("biomarker_0"));
    }
}
