use crate::CLAP_STYLING;
use clap::{arg, command};
use url::Url;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("linkrank")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("linkrank")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-d --"data-dir" <PATH>)
                .required(false)
                .global(true)
                .help("Directory holding the database, edge shards and score snapshot")
                .default_value("~/.config/linkrank/"),
        )
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Configuration file (default: <data-dir>/linkrank.json if present)")
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Creates the data directory, database and default configuration")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Data directory to initialize (default: --data-dir)"),
                )
                .arg(
                    arg!(-f --"force")
                        .help(
                            "Overwrite an existing configuration and database at the specified \
                        location.",
                        )
                        .required(false),
                ),
        )
        .subcommand(
            command!("seed")
                .about("Admits one or more URLs to the crawl frontier")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("A URL to seed; may be repeated")
                        .value_parser(clap::value_parser!(Url))
                        .action(clap::ArgAction::Append)
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of URLs to seed")
                        .value_parser(clap::value_parser!(std::path::PathBuf))
                        .conflicts_with("url"),
                ),
        )
        .subcommand(
            command!("crawl")
                .about(
                    "Runs crawl workers against the frontier. Feeds the link graph and the \
                indexing queue.",
                )
                .arg(
                    arg!(-t --"threads" <NUM_WORKERS>)
                        .required(false)
                        .help("The number of async workers (default: crawl.workers)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"follow-all")
                        .required(false)
                        .help("Admit every discovered link, not only cross-domain ones")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"until-idle")
                        .required(false)
                        .help("Exit once the frontier is drained instead of waiting for new URLs")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"timeout" <SECONDS>)
                        .required(false)
                        .help("Request timeout in seconds (default: fetch.timeout_secs)")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            command!("rank")
                .about("Ranks the accumulated link graph and publishes a new score snapshot")
                .arg(
                    arg!(-i --"iterations" <ROUNDS>)
                        .required(false)
                        .help("Number of ranking rounds (default: rank.iterations)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"damping" <FACTOR>)
                        .required(false)
                        .help("Damping factor between 0 and 1 for this run (default: rank.damping); unranked URLs keep 1 - rank.damping")
                        .value_parser(clap::value_parser!(f64)),
                ),
        )
        .subcommand(
            command!("index")
                .about("Consumes crawled content and indexes it with its current rank")
                .arg(
                    arg!(--"until-idle")
                        .required(false)
                        .help("Exit once the content queue is drained")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("score")
                .about("Looks up the current rank of a URL")
                .arg(arg!(<URL>).help("The URL to look up")),
        )
        .subcommand(command!("stats").about("Shows frontier, queue, graph and snapshot counters"))
}
