// File: src/main.rs
//
// Entry point. Parses CLI arguments and dispatches to the appropriate
// subcommand (run, repl, disassemble).

mod builtins;
mod chunk;
mod compiler;
mod disassemble;
mod errors;
mod heap;
mod module;
mod object;
mod repl;
mod scanner;
mod table;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(name = "ruff", about = "Ruff: a small embeddable scripting language", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run a .ruff script
    Run {
        /// Path to the .ruff file
        file: PathBuf,

        /// Disassemble the compiled chunk before running it
        #[arg(long)]
        debug: bool,
    },

    /// Launch the interactive REPL
    Repl,

    /// Compile a .ruff file and print its disassembly without running it
    Disassemble {
        /// Path to the .ruff file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, debug } => run(&file, debug),
        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {e}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {e}");
                std::process::exit(1);
            }
        },
        Commands::Disassemble { file } => disassemble_file(&file),
    }
}

fn run(file: &PathBuf, debug: bool) {
    let source = fs::read_to_string(file).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {e}", file.display());
        std::process::exit(1);
    });
    let filename = file.to_string_lossy().to_string();

    let mut vm = vm::Vm::new();
    let function = match compiler::compile(&source, &filename, &mut vm.heap) {
        Ok(f) => f,
        Err(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            std::process::exit(1);
        }
    };

    if debug {
        print!("{}", disassemble::disassemble_chunk(&function.chunk, &vm.heap, &filename));
    }

    if let Err(exc) = vm.interpret(function) {
        let rendered = builtins::display_repr(&mut vm, exc).unwrap_or_else(|_| "<exception>".to_string());
        eprintln!("Unhandled exception: {rendered}");
        std::process::exit(1);
    }
}

fn disassemble_file(file: &PathBuf) {
    let source = fs::read_to_string(file).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {e}", file.display());
        std::process::exit(1);
    });
    let filename = file.to_string_lossy().to_string();

    let mut heap = heap::Heap::new();
    match compiler::compile(&source, &filename, &mut heap) {
        Ok(function) => print!("{}", disassemble::disassemble_chunk(&function.chunk, &heap, &filename)),
        Err(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            std::process::exit(1);
        }
    }
}
