use clap::builder::{styling, PossibleValuesParser};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

use aot_common::progress_ui::ProgressMode;

use crate::scenarios;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileOptions {
    pub keep_input_mutations: bool,
    pub unsafe_view_outputs: bool,
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Empty means every scenario.
    pub scenarios: Vec<String>,
    pub options: CompileOptions,
    pub artifact_dir: Option<PathBuf>,
    pub progress: ProgressMode,
    pub json: bool,
}

#[derive(Clone, Debug)]
pub enum Config {
    List { json: bool },
    Run(RunConfig),
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Print machine-readable JSON instead of text.")
}

fn with_run_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("keep-input-mutations")
                .long("keep-input-mutations")
                .action(ArgAction::SetTrue)
                .help(
                    "Leave data mutations of inputs inside inference graphs as a trailing copy \
                    instead of applying them after the graph runs.",
                ),
        )
        .arg(
            Arg::new("unsafe-view-outputs")
                .long("unsafe-view-outputs")
                .action(ArgAction::SetTrue)
                .help(
                    "Return views of intermediates as fresh tensors when no other output shares \
                    their storage.",
                ),
        )
        .arg(
            Arg::new("artifact-dir")
                .long("artifact-dir")
                .short('a')
                .value_parser(clap::value_parser!(PathBuf))
                .help(
                    "Write every compiled graph and the collected metadata of each scenario to \
                    this directory.",
                ),
        )
        .arg(
            Arg::new("progress")
                .long("progress")
                .action(ArgAction::SetTrue)
                .help("Set whether or not to show progress"),
        )
        .arg(json_arg())
}

impl Config {
    pub fn from_args() -> Self {
        let styles = styling::Styles::styled()
            .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .literal(styling::AnsiColor::Cyan.on_default() | styling::Effects::BOLD)
            .placeholder(styling::AnsiColor::Cyan.on_default());

        let matches = Command::new(std::env!("CARGO_PKG_NAME"))
            .version(std::env!("CARGO_PKG_VERSION"))
            .about(std::env!("CARGO_PKG_DESCRIPTION"))
            .styles(styles)
            .next_line_help(true)
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(
                Command::new("list")
                    .about("Lists the built-in scenarios")
                    .arg(json_arg()),
            )
            .subcommand(with_run_args(
                Command::new("run")
                    .about("Compiles scenarios and checks them against eager execution")
                    .arg(
                        Arg::new("scenario")
                            .help("Specify the scenarios to run.")
                            .required(true)
                            .action(ArgAction::Append)
                            .value_parser(PossibleValuesParser::new(scenarios::names())),
                    ),
            ))
            .subcommand(with_run_args(
                Command::new("run-all").about("Same as 'run', for every built-in scenario"),
            ))
            .get_matches();

        match matches.subcommand() {
            Some(("list", matches)) => Config::List {
                json: matches.get_flag("json"),
            },
            Some(("run", matches)) => {
                let scenarios = matches
                    .get_many::<String>("scenario")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default();
                Config::Run(run_config(matches, scenarios))
            }
            Some(("run-all", matches)) => Config::Run(run_config(matches, Vec::new())),
            // Clap exits gracefully when no subcommand is provided.
            _ => unreachable!(),
        }
    }
}

fn run_config(matches: &ArgMatches, scenarios: Vec<String>) -> RunConfig {
    let progress = if matches.get_flag("progress") {
        ProgressMode::Visible
    } else {
        ProgressMode::Hidden
    };

    RunConfig {
        scenarios,
        options: CompileOptions {
            keep_input_mutations: matches.get_flag("keep-input-mutations"),
            unsafe_view_outputs: matches.get_flag("unsafe-view-outputs"),
        },
        artifact_dir: matches.get_one::<PathBuf>("artifact-dir").cloned(),
        progress,
        json: matches.get_flag("json"),
    }
}
