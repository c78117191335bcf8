use broadsheet::handlers::{self, Context, Stage};
use broadsheet_core::model::SourceStatus;
use clap::ArgMatches;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use colored::Colorize;
use commands::command_argument_builder;
use tracing_subscriber::EnvFilter;

mod commands;

pub const CLAP_STYLING: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
    .valid(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .invalid(AnsiColor::Yellow.on_default().effects(Effects::BOLD));

fn print_banner() {
    println!(
        "{} {}",
        "broadsheet".bright_white().bold(),
        env!("CARGO_PKG_VERSION").dimmed()
    );
    println!("{}", "news discovery, verification and extraction".dimmed());
    println!();
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(ctx: &Context, matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("init", args)) => handlers::handle_init(ctx, args).await,
        Some(("source", primary_command)) => match primary_command.subcommand() {
            Some(("import", args)) => handlers::handle_source_import(ctx, args).await,
            Some(("list", args)) => handlers::handle_source_list(ctx, args).await,
            Some(("disable", args)) => {
                handlers::handle_source_status(ctx, args, SourceStatus::Disabled).await
            }
            Some(("enable", args)) => {
                handlers::handle_source_status(ctx, args, SourceStatus::Active).await
            }
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("dataset", primary_command)) => match primary_command.subcommand() {
            Some(("create", args)) => handlers::handle_dataset_create(ctx, args).await,
            Some(("list", _)) => handlers::handle_dataset_list(ctx).await,
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("discover", args)) => handlers::handle_stage(ctx, args, Stage::Discover).await,
        Some(("verify", args)) => handlers::handle_stage(ctx, args, Stage::Verify).await,
        Some(("extract", args)) => handlers::handle_stage(ctx, args, Stage::Extract).await,
        Some(("clean", args)) => handlers::handle_stage(ctx, args, Stage::Clean).await,
        Some(("run", args)) => handlers::handle_stage(ctx, args, Stage::Run).await,
        Some(("housekeeping", args)) => handlers::handle_housekeeping(ctx, args).await,
        Some(("status", args)) => handlers::handle_status(ctx, args).await,
        Some(("telemetry", args)) => handlers::handle_telemetry(ctx, args).await,
        Some(("reset", args)) => handlers::handle_reset(ctx, args).await,
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let chosen_command = command_argument_builder().get_matches();
    let quiet = chosen_command.get_flag("quiet");
    init_logging(chosen_command.get_flag("verbose"));

    if !quiet {
        print_banner();
    }
    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    let result = match Context::from_matches(&chosen_command) {
        Ok(ctx) => dispatch(&ctx, &chosen_command).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}
