use anyhow::{Context, Result};
use argh::FromArgs;
use shell_pipeline::Interpreter;
use shell_pipeline::env::{Environment, SEARCH_PATH_VAR};
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Run one tokenized command pipeline, e.g. `shell_pipeline -- ls '|' wc -l`.
struct Args {
    #[argh(switch, short = 'v')]
    /// increase log verbosity; repeat for more detail.
    verbose: u8,

    #[argh(option)]
    /// colon separated directories to search instead of $PATH.
    path: Option<String>,

    #[argh(positional, greedy)]
    /// command tokens; `|`, `<` and `>` must be separate tokens.
    tokens: Vec<String>,
}

fn setup_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> Result<i32> {
    let mut env = Environment::new();
    if let Some(path) = args.path {
        env.set_var(SEARCH_PATH_VAR, path);
    }

    let statuses = Interpreter::new(env)
        .run(args.tokens.as_slice())
        .context("pipeline failed")?;
    for (tokens, status) in args.tokens.split(|t| t == "|").zip(&statuses) {
        tracing::info!(command = %tokens.join(" "), code = status.code(), "stage finished");
    }
    Ok(statuses.last().map_or(0, |status| status.code()))
}

fn main() {
    let args: Args = argh::from_env();
    setup_logging(args.verbose);

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("shell_pipeline: {e:#}");
            std::process::exit(1);
        }
    }
}
