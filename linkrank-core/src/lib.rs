use colored::Colorize;

pub mod config;
pub mod crawl;
pub mod data;
pub mod error;
pub mod frontier;
pub mod graph;
pub mod index;
pub mod model;
pub mod queue;
pub mod rank;
pub mod scores;
pub mod urls;

pub use config::PipelineConfig;
pub use error::{CoreError, Result};

pub fn print_banner() {
    let banner = r#"
  _ _       _                    _
 | (_)_ __ | | ___ __ __ _ _ __ | | __
 | | | '_ \| |/ / '__/ _` | '_ \| |/ /
 | | | | | |   <| | | (_| | | | |   <
 |_|_|_| |_|_|\_\_|  \__,_|_| |_|_|\_\
"#;
    println!("{}", banner.cyan());
    println!(
        "  {} {}\n",
        "crawl, link, rank".dimmed(),
        env!("CARGO_PKG_VERSION").dimmed()
    );
}
