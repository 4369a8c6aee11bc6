use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

use clap::{Args, Parser, Subcommand};
use tagrun::{
    ast::{build::*, Flavor, Node},
    config::{ConfigError, RuntimeConfig},
    connection::Console,
    runtime::Runtime,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// JSON runtime configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Really wait for sleeping jobs instead of jumping the clock.
    #[arg(long, global = true)]
    real_time: bool,
    #[arg(long, global = true)]
    max_cycles: Option<u64>,
    /// Do not echo toplevel results.
    #[arg(long, global = true)]
    quiet: bool,
}

impl Cli {
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Demo)
    }

    fn runtime_config(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        config.real_time |= self.real_time;
        if self.max_cycles.is_some() {
            config.max_cycles = self.max_cycles;
        }
        if self.quiet {
            config.report_results = false;
        }
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program stored as a JSON syntax tree.
    Run(FileArgs),
    /// Pretty-print a JSON syntax tree.
    Print(FileArgs),
    /// Run a built-in program showing tags and concurrent statements.
    Demo,
}

#[derive(Debug, Args)]
struct FileArgs {
    file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("cannot read program: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid program: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let result = match args.command() {
        Command::Run(file) => load(&file.file).and_then(|program| run(&args, &program)),
        Command::Print(file) => load(&file.file).map(|program| println!("{}", program)),
        Command::Demo => run(&args, &demo_program()),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn load(path: &Path) -> Result<Rc<Node>, RunError> {
    let source = std::fs::read_to_string(path)?;
    Ok(Rc::new(serde_json::from_str(&source)?))
}

fn run(args: &Cli, program: &Rc<Node>) -> Result<(), RunError> {
    let config = args.runtime_config()?;
    let console = Rc::new(RefCell::new(Console::new(std::io::stdout())));
    let runtime = Runtime::new(config, console);
    let cycles = runtime.interpret(program);
    tracing::info!(cycles, now = ?runtime.scheduler().now(), "program finished");
    runtime.shutdown();
    Ok(())
}

/// ```text
/// var n = 0;
/// ticker: every (1) { n = n + 1 },
/// sleep(5);
/// ticker.stop;
/// echo(n);
/// ```
fn demo_program() -> Rc<Node> {
    toplevel(vec![
        declare("n", float(0.0)),
        comma(tagged(
            ident("ticker"),
            every(Flavor::Semicolon, float(1.0), scope(vec![increment("n")])),
        )),
        apply("sleep", vec![float(5.0)]),
        send(ident("ticker"), "stop", vec![]),
        apply("echo", vec![ident("n")]),
    ])
}
