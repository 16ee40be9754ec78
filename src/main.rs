//! Braid CLI - run a serialized execution graph

use std::env;
use std::fs;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use braid::sink::PublicationSink;
use braid::{prelude, Engine, EngineConfig, Graph, RunOutcome, Value};

const USAGE: &str = "usage: braid <graph.json> [--config <file>]";

/// Prints publications on stdout and uncaught errors on stderr
struct ConsoleSink;

impl PublicationSink for ConsoleSink {
    fn on_publish(&mut self, value: Value) {
        println!("{value}");
    }

    fn on_uncaught(&mut self, error: &Value) {
        eprintln!("uncaught error: {error}");
    }
}

struct Options {
    graph: String,
    config: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut graph = None;
    let mut config = None;
    let mut rest = args.iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--config" => match rest.next() {
                Some(path) => config = Some(path.clone()),
                None => return Err("--config needs a file".into()),
            },
            "-h" | "--help" => return Err(USAGE.into()),
            flag if flag.starts_with('-') => return Err(format!("unknown flag `{flag}`")),
            path if graph.is_none() => graph = Some(path.to_string()),
            extra => return Err(format!("unexpected argument `{extra}`")),
        }
    }
    let graph = graph.ok_or_else(|| USAGE.to_string())?;
    Ok(Options { graph, config })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    match run_file(&options) {
        Ok(RunOutcome::Completed | RunOutcome::PublicationLimit) => ExitCode::SUCCESS,
        Ok(RunOutcome::Quiescent { parked }) => {
            eprintln!("run stalled with {parked} token(s) still waiting");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Terminated) => ExitCode::from(130),
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run_file(options: &Options) -> Result<RunOutcome, String> {
    let config = match &options.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::from_env(),
    }
    .map_err(|e| e.to_string())?;

    let source = fs::read_to_string(&options.graph)
        .map_err(|e| format!("cannot read {}: {e}", options.graph))?;
    let graph = Graph::from_json(&source).map_err(|e| e.to_string())?;

    let mut engine = Engine::new(config, prelude::site_table(), ConsoleSink);
    engine.start(graph).map_err(|e| e.to_string())?;
    engine.run().map_err(|e| e.to_string())
}
