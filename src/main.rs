// musql: compose load → query → render steps from command-line and ini
// file directives. Data lands in an embedded SQLite store, arbitrary SQL
// runs against it, and results render through logic-less templates.

use clap::Parser;
use musql::config::Config;
use musql::logger;
use musql::progress::ProgressManager;

// Command-line flags plus the directive token stream.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Enable debug logging (disables progress bars).
    #[arg(long)]
    debug: bool,

    /// Directives: insert/expand/select/ini/db/attach/set/sql tokens.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    directives: Vec<String>,
}

fn main() {
    let args = Args::parse();
    logger::set_debug(args.debug);
    if let Err(e) = run(args) {
        logger::error(&format!("{}", e));
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut tokens = args.directives;
    // a local musql.ini is picked up automatically when present
    tokens.push("-defini".to_string());
    tokens.push("musql.ini".to_string());

    let config = Config::parse(&tokens)?;
    let progress = ProgressManager::new(!args.debug);
    config.apply(progress)?;
    Ok(())
}
