//! Command-line entry point: a REPL with no arguments, or run a script file.
//!
//! The CLI only feeds source text to the core and maps the returned error
//! kind to an exit code (65 compile, 70 runtime, 74 unreadable file).

use std::{
    fs,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use vesper::{StdPrint, Vm};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: vesper [path]");
            ExitCode::from(64)
        }
    }
}

fn repl() -> ExitCode {
    let mut vm = Vm::new();
    let mut print = StdPrint;
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                return ExitCode::SUCCESS;
            }
            Ok(_) => {
                // Errors are reported and the session continues.
                if let Err(error) = vm.interpret(&line, &mut print) {
                    eprintln!("{error}");
                }
            }
            Err(error) => {
                eprintln!("Could not read input: {error}");
                return ExitCode::from(74);
            }
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not open file \"{path}\": {error}");
            return ExitCode::from(74);
        }
    };
    let mut vm = Vm::new();
    let mut print = StdPrint;
    match vm.interpret(&source, &mut print) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}
