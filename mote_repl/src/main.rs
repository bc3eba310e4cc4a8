use std::path::PathBuf;

use clap::Parser;
use codesnake::{Block, CodeWidth, Label, LineIndex};
use mote::{Config, Error, ReadError, Vm};
use tracing_subscriber::EnvFilter;
use yansi::Paint;

#[derive(Parser, Debug)]
#[command(version, about = "Interactive mote session")]
struct Args {
    /// Files to load, in order, before the prompt starts
    files: Vec<PathBuf>,
    /// Log more (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Instructions each evaluation may run
    #[arg(long)]
    fuel: Option<i32>,
    /// Deepest allowed call nesting, 0 for unbounded
    #[arg(long, default_value_t = 10_000)]
    max_call_depth: usize,
    /// Deepest allowed nesting of native calls into the evaluator, 0 for
    /// unbounded
    #[arg(long, default_value_t = 128)]
    max_native_depth: usize,
    #[arg(long, default_value_t = 1024)]
    stack_capacity: usize,
    #[arg(long, default_value_t = 64)]
    call_capacity: usize,
    #[arg(long, default_value_t = 256)]
    global_capacity: usize,
    #[arg(long, default_value_t = 1024)]
    code_capacity: usize,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            stack_capacity: self.stack_capacity,
            call_capacity: self.call_capacity,
            global_capacity: self.global_capacity,
            code_capacity: self.code_capacity,
            max_call_depth: (self.max_call_depth > 0).then_some(self.max_call_depth),
            max_native_depth: (self.max_native_depth > 0).then_some(self.max_native_depth),
            fuel: self.fuel,
        }
    }

    fn filter(&self) -> EnvFilter {
        let level = match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }
}

fn report_read_error(name: &str, source: &str, error: &ReadError) {
    let idx = LineIndex::new(source);
    let label = Label::new(error.span())
        .with_text(error.to_string().red().to_string())
        .with_style(|s| s.red().to_string());
    match Block::new(&idx, [label]) {
        Some(block) => {
            let block = block.map_code(|c| CodeWidth::new(c, c.len()));
            println!("{}[{name}]", block.prologue());
            print!("{block}");
            println!("{}", block.epilogue());
        }
        None => println!("{}", error.red()),
    }
}

fn report(name: &str, source: &str, error: &Error) {
    match error {
        Error::Read(error) => report_read_error(name, source, error),
        Error::Compile(error) => println!("{} {error}", "compile error:".red().bold()),
        Error::Runtime(error) => println!("{} {error}", "error:".red().bold()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.filter())
        .init();

    let mut vm = Vm::new(args.config());
    for path in &args.files {
        let source = std::fs::read_to_string(path)?;
        if let Err(error) = vm.load_source(&source) {
            report(&path.display().to_string(), &source, &error);
            anyhow::bail!("failed to load {}", path.display());
        }
    }

    let mut readline = rustyline::DefaultEditor::new()?;
    while let Ok(input) = readline.readline(">> ") {
        if input.trim().is_empty() {
            continue;
        }
        let _ = readline.add_history_entry(input.as_str());
        match vm.load_source(&input) {
            Ok(value) => println!("{}", value.green()),
            Err(error) => report("repl", &input, &error),
        }
    }

    Ok(())
}
