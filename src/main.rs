// File: src/main.rs
//
// Command-line entry point for the Panda scripting language.
// Dispatches to run (source or compiled bytecode), compile (emit an .mpbc
// file), eval, or the interactive REPL.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod engine;
mod environment;
mod errors;
mod iterator;
mod lexer;
mod module;
mod parser;
mod repl;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use engine::Engine;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "panda",
    about = "Panda: a small embeddable scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a .panda script or a compiled .mpbc file
    Run {
        /// Path to the script
        file: PathBuf,

        /// Print the bytecode listing before running
        #[arg(long)]
        disassemble: bool,
    },

    /// Compile a script to an .mpbc bytecode file
    Compile {
        /// Path to the .panda file
        file: PathBuf,

        /// Output path (defaults to the input with an .mpbc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Evaluate an expression and print the result
    Eval {
        /// The expression to evaluate
        expr: String,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, disassemble } => {
            let bytes = match fs::read(&file) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let label = file.to_string_lossy().to_string();
            let mut engine = Engine::new();

            if disassemble {
                let proto = if bytecode::is_bytecode(&bytes) {
                    bytecode::FunctionProto::deserialize(&bytes)
                } else {
                    match std::str::from_utf8(&bytes) {
                        Ok(source) => compiler::compile_source(source, &label),
                        Err(_) => {
                            eprintln!("{} is not valid UTF-8", file.display());
                            return ExitCode::FAILURE;
                        }
                    }
                };
                match proto {
                    Ok(proto) => print!("{}", proto.chunk.disassemble(&proto.trace_name())),
                    Err(e) => {
                        eprintln!("{}", e);
                        return ExitCode::FAILURE;
                    }
                }
            }

            match engine.run_bytes_labeled(&bytes, &label, None, false) {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Compile { file, output } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let engine = Engine::new();
            match engine.compile(&source) {
                Ok(compiled) => {
                    let out_path = output.unwrap_or_else(|| file.with_extension("mpbc"));
                    match fs::write(&out_path, compiled.to_bytes()) {
                        Ok(()) => {
                            println!("Wrote {}", out_path.display());
                            ExitCode::SUCCESS
                        }
                        Err(e) => {
                            eprintln!("Failed to write {}: {}", out_path.display(), e);
                            ExitCode::FAILURE
                        }
                    }
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Eval { expr } => {
            let mut engine = Engine::new();
            match engine.eval(&expr) {
                Ok(value) => {
                    println!("{}", value.to_display_string());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => match repl.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}
