use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use linkrank::handlers::{
    expand_path, handle_crawl, handle_index, handle_init, handle_rank, handle_score, handle_seed,
    handle_stats, load_pipeline_config,
};
use linkrank_core::print_banner;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    if let Err(e) = run(&chosen_command).await {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let data_dir = matches
        .get_one::<String>("data-dir")
        .map(|dir| expand_path(dir))
        .unwrap_or_else(|| PathBuf::from("."));
    let config_file = matches.get_one::<PathBuf>("config");

    match matches.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command, &data_dir),
        Some((name, primary_command)) => {
            let config = load_pipeline_config(&data_dir, config_file.map(PathBuf::as_path))?;
            match name {
                "seed" => handle_seed(primary_command, &config).await,
                "crawl" => handle_crawl(primary_command, &config).await,
                "rank" => handle_rank(primary_command, &config),
                "index" => handle_index(primary_command, &config).await,
                "score" => handle_score(primary_command, &config),
                "stats" => handle_stats(&config).await,
                _ => unreachable!("clap should ensure we don't get here"),
            }
        }
        None => Ok(()),
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
