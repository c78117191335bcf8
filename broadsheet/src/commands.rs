use crate::CLAP_STYLING;
use clap::{Arg, ArgAction, arg, command};
use std::path::PathBuf;

/// Arguments shared by every batch stage.
fn stage_args(cmd: clap::Command) -> clap::Command {
    cmd.arg(
        arg!(-l --"limit" <N>)
            .required(false)
            .help("Maximum number of items to process (default: the configured batch size)")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        arg!(-f --"force")
            .required(false)
            .help("Ignore due-time scheduling and process items now")
            .action(ArgAction::SetTrue),
    )
    .arg(
        arg!(-s --"source" <HOST>)
            .required(false)
            .help("Restrict the run to one source host"),
    )
    .arg(
        arg!(--"deadline" <SECONDS>)
            .required(false)
            .help("Stop picking up new items after this many seconds")
            .value_parser(clap::value_parser!(u64)),
    )
    .arg(
        arg!(--"json")
            .required(false)
            .help("Print the stage report as JSON")
            .action(ArgAction::SetTrue),
    )
}

fn report_args(cmd: clap::Command) -> clap::Command {
    cmd.arg(
        arg!(-o --"output" <PATH>)
            .required(false)
            .help("Save report to file (default: display to screen)")
            .value_parser(clap::value_parser!(PathBuf)),
    )
    .arg(
        arg!(--"format" <FORMAT>)
            .required(false)
            .help("Report format: text, json")
            .value_parser(["text", "json"])
            .default_value("text"),
    )
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("broadsheet")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("broadsheet")
        .about("News discovery, verification and extraction pipeline")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and progress spinners").global(true))
        .arg(arg!(-v --"verbose" "Log at debug level unless RUST_LOG is set").global(true))
        .arg(
            Arg::new("database")
                .long("database")
                .value_name("URL")
                .global(true)
                .env("BROADSHEET_DATABASE_URL")
                .default_value("~/.config/broadsheet/broadsheet.db")
                .help("SQLite path, sqlite:// URL or postgres:// URL"),
        )
        .arg(
            arg!(-d --"dataset" <SLUG>)
                .required(false)
                .global(true)
                .help("Operate on one dataset instead of the default production scope"),
        )
        .arg(
            arg!(--"batch-size" <N>)
                .required(false)
                .global(true)
                .help("Override the configured batch size")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            arg!(--"session-state" <PATH>)
                .required(false)
                .global(true)
                .help("Restore per-host session state from this file and save it on exit")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init").about("Creates the database and its schema").arg(
                arg!(-f --"force")
                    .help("Delete an existing SQLite database file first")
                    .required(false)
                    .action(ArgAction::SetTrue),
            ),
        )
        .subcommand(
            command!("source")
                .about("Manage news sources")
                .subcommand_required(true)
                .subcommand(
                    command!("import")
                        .about("Import sources from a file of `host,name[,feed1|feed2]` lines")
                        .arg(
                            arg!(<FILE>)
                                .help("Path to the source list")
                                .value_parser(clap::value_parser!(PathBuf)),
                        )
                        .arg(
                            arg!(--"frequency" <HOURS>)
                                .required(false)
                                .help("Discovery frequency for imported sources")
                                .value_parser(clap::value_parser!(i64)),
                        ),
                )
                .subcommand(
                    command!("list").about("List sources").arg(
                        arg!(-a --"all")
                            .required(false)
                            .help("Include disabled sources")
                            .action(ArgAction::SetTrue),
                    ),
                )
                .subcommand(
                    command!("disable")
                        .about("Stop scheduling a source; its records are kept")
                        .arg(arg!(<HOST>).help("Source host")),
                )
                .subcommand(
                    command!("enable")
                        .about("Resume scheduling a disabled source")
                        .arg(arg!(<HOST>).help("Source host")),
                ),
        )
        .subcommand(
            command!("dataset")
                .about("Manage datasets")
                .subcommand_required(true)
                .subcommand(
                    command!("create")
                        .about("Create or update a dataset")
                        .arg(arg!(<SLUG>).help("Short identifier used with --dataset"))
                        .arg(
                            arg!(-n --"name" <NAME>)
                                .required(false)
                                .help("Display name (default: the slug)"),
                        )
                        .arg(
                            arg!(--"isolated")
                                .required(false)
                                .help("Exclude the dataset from default scheduling")
                                .action(ArgAction::SetTrue),
                        ),
                )
                .subcommand(command!("list").about("List datasets")),
        )
        .subcommand(stage_args(
            command!("discover").about("Find candidate article links for due sources"),
        ))
        .subcommand(stage_args(
            command!("verify").about("Check discovered links are live, unique articles"),
        ))
        .subcommand(stage_args(
            command!("extract").about("Fetch and parse verified articles"),
        ))
        .subcommand(stage_args(
            command!("clean").about("Strip boilerplate from extracted articles"),
        ))
        .subcommand(
            command!("housekeeping")
                .about("Pause expired links and report stalled stages")
                .arg(
                    arg!(--"json")
                        .required(false)
                        .help("Print the report as JSON")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(stage_args(
            command!("run").about("Discover, verify, extract and clean in sequence"),
        ))
        .subcommand(report_args(
            command!("status").about("Show pipeline status counts and telemetry"),
        ))
        .subcommand(report_args(
            command!("telemetry")
                .about("Show telemetry aggregates")
                .arg(
                    arg!(--"failures" <N>)
                        .required(false)
                        .help("Number of recent failures to list")
                        .value_parser(clap::value_parser!(i64))
                        .default_value("20"),
                ),
        ))
        .subcommand(
            command!("reset")
                .about("Move a candidate link back to discovered")
                .arg(
                    arg!(<ID>)
                        .help("Candidate link id")
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_definition_is_valid() {
        command_argument_builder().debug_assert();
    }

    #[test]
    fn test_stage_flags_parse() {
        let matches = command_argument_builder()
            .try_get_matches_from([
                "broadsheet", "verify", "--limit", "10", "--force", "--dataset", "pilot",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "verify");
        assert_eq!(sub.get_one::<usize>("limit"), Some(&10));
        assert!(sub.get_flag("force"));
        assert_eq!(sub.get_one::<String>("dataset").map(String::as_str), Some("pilot"));
    }

    #[test]
    fn test_source_requires_subcommand() {
        let result = command_argument_builder().try_get_matches_from(["broadsheet", "source"]);
        assert!(result.is_err());
    }
}
