#[cfg(test)]
mod test;

pub mod cli;
pub mod scenarios;

use std::io;

use log::warn;
use serde::Serialize;

use aot_common::config::ArtifactDir;
use aot_common::lines;
use aot_common::progress_ui;
use aot_common::report_error::{report_error, Report, Reportable};
use aot_common::util::progress_logger::{ProgressLogger, ProgressSession};

use crate::scenarios::{Outcome, Scenario, SCENARIOS};

#[derive(Debug)]
enum ErrorKind {
    UnknownScenario(String),
    Aot {
        scenario: &'static str,
        err: aot_tensor::Error,
    },
    Mismatch {
        scenario: &'static str,
        detail: String,
    },
    Artifact(io::Error),
    Output(io::Error),
}

// This type is separate from 'ErrorKind' because enums cannot have private variants, and we don't
// want to expose the error types appearing in the variants of 'ErrorKind'.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind }
    }
}

impl Reportable for Error {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()> {
        use ErrorKind::*;
        match &self.kind {
            UnknownScenario(name) => report_error(
                dest,
                Report {
                    title: "Unknown Scenario",
                    context: None,
                    message: Some(&format!(
                        lines![
                            "There is no scenario named '{}'. The available scenarios are:",
                            "",
                            "{}",
                        ],
                        name,
                        scenarios::names().join(", ")
                    )),
                },
            ),
            Aot { scenario, err } => {
                writeln!(dest, "While compiling scenario '{}':", scenario)?;
                err.report(dest)
            }
            Mismatch { scenario, detail } => report_error(
                dest,
                Report {
                    title: "Eager Mismatch",
                    context: Some(*scenario),
                    message: Some(&format!(
                        "The compiled function disagrees with eager execution: {}",
                        detail
                    )),
                },
            ),
            Artifact(err) => writeln!(dest, "Could not write compilation artifacts: {}", err),
            Output(err) => writeln!(dest, "Could not write results: {}", err),
        }
    }

    fn exit_status(&self) -> i32 {
        match &self.kind {
            ErrorKind::Aot { err, .. } => err.exit_status(),
            ErrorKind::Mismatch { .. } => 101,
            _ => 1,
        }
    }
}

#[derive(Serialize)]
struct ScenarioListing {
    name: &'static str,
    description: &'static str,
}

fn list(json: bool, out: &mut impl io::Write) -> io::Result<()> {
    if json {
        let listing: Vec<_> = SCENARIOS
            .iter()
            .map(|s| ScenarioListing {
                name: s.name,
                description: s.description,
            })
            .collect();
        serde_json::to_writer_pretty(&mut *out, &listing)?;
        writeln!(out)
    } else {
        let width = SCENARIOS.iter().map(|s| s.name.len()).max().unwrap_or(0);
        for s in SCENARIOS {
            writeln!(out, "{:width$}  {}", s.name, s.description, width = width)?;
        }
        Ok(())
    }
}

fn selected(names: &[String]) -> Result<Vec<&'static Scenario>, Error> {
    if names.is_empty() {
        return Ok(SCENARIOS.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            scenarios::find(name).ok_or_else(|| ErrorKind::UnknownScenario(name.clone()).into())
        })
        .collect()
}

fn print_outcome(outcome: &Outcome, out: &mut impl io::Write) -> io::Result<()> {
    let meta = &outcome.meta;
    writeln!(
        out,
        "{}: {}",
        outcome.name,
        outcome.mismatch.as_deref().unwrap_or("ok")
    )?;
    writeln!(
        out,
        "    {} mutated inputs, {} aliased outputs, {} intermediate bases",
        meta.num_mutated_inputs(),
        meta.num_outputs_aliased(),
        meta.num_intermediate_bases
    )?;
    for (i, info) in meta.output_info.iter().enumerate() {
        match info.base_idx {
            Some(base) => writeln!(out, "    output {}: {:?} of {}", i, info.output_type, base)?,
            None => writeln!(out, "    output {}: {:?}", i, info.output_type)?,
        }
    }
    writeln!(out, "    graphs: {}", outcome.graphs.join(", "))
}

/// Runs the selected scenarios, stopping at the first which fails to compile. Returns every
/// outcome, including mismatching ones.
pub fn run(config: &cli::RunConfig) -> Result<Vec<Outcome>, Error> {
    let to_run = selected(&config.scenarios)?;
    let artifact_dir = match &config.artifact_dir {
        Some(path) => Some(ArtifactDir::create(path, "aot").map_err(ErrorKind::Artifact)?),
        None => None,
    };

    let mut progress =
        progress_ui::bar(config.progress, "scenarios").start_session(Some(to_run.len()));
    let mut outcomes = Vec::with_capacity(to_run.len());
    for scenario in to_run {
        progress.note(scenario.name);
        let outcome = scenarios::run_scenario(scenario, config.options, artifact_dir.as_ref())?;
        if let Some(detail) = &outcome.mismatch {
            warn!("scenario {} disagrees with eager execution: {}", scenario.name, detail);
        }
        outcomes.push(outcome);
        progress.update(1);
    }
    progress.finish();
    Ok(outcomes)
}

pub fn handle_config(config: cli::Config, out: &mut impl io::Write) -> Result<(), Error> {
    match config {
        cli::Config::List { json } => list(json, out).map_err(|err| ErrorKind::Output(err).into()),
        cli::Config::Run(run_config) => {
            let outcomes = run(&run_config)?;
            let written = if run_config.json {
                serde_json::to_writer_pretty(&mut *out, &outcomes)
                    .map_err(io::Error::from)
                    .and_then(|()| writeln!(out))
            } else {
                outcomes
                    .iter()
                    .try_for_each(|outcome| print_outcome(outcome, out))
            };
            written.map_err(ErrorKind::Output)?;

            match outcomes.into_iter().find(|o| o.mismatch.is_some()) {
                Some(Outcome {
                    name,
                    mismatch: Some(detail),
                    ..
                }) => Err(ErrorKind::Mismatch {
                    scenario: name,
                    detail,
                }
                .into()),
                _ => Ok(()),
            }
        }
    }
}
