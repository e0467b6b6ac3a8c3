// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop). Provides an interactive shell
// for executing source with:
// - Multi-line input support keyed on unmatched brackets/indentation
// - Command history with up/down arrow navigation
// - Special commands (:help, :clear, :quit, :vars)
// - Persistent module state across inputs

use crate::object::{Obj, RFunction};
use crate::value::Value;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// REPL session that maintains VM + module state and handles user interaction.
pub struct Repl {
    vm: Vm,
    module: crate::value::ObjRef,
    editor: DefaultEditor,
    line_no: u32,
}

impl Repl {
    /// Creates a new REPL session with a fresh VM and a dedicated `__main__`
    /// module so the top-level module is never aliased across sessions.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        let mut vm = Vm::new();
        let module = vm.new_module("__main__");
        Ok(Repl { vm, module, editor, line_no: 0 })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║             Ruff REPL - Interactive Shell             ║".bright_cyan());
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Leave brackets unclosed to continue a statement", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt =
                if buffer.is_empty() { "ruff> ".bright_green().to_string() } else { "....> ".bright_blue().to_string() };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if !self.handle_command(line.trim()) {
                            break;
                        }
                        continue;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns true to keep the REPL running, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":vars" | ":v" => {
                self.show_variables();
                true
            }
            ":reset" | ":r" => {
                self.vm = Vm::new();
                self.module = self.vm.new_module("__main__");
                println!("{}", "Environment reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h     ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q     ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c    ".dimmed());
        println!("  {}{}  Show defined variables", ":vars".bright_yellow(), " or :v    ".dimmed());
        println!("  {}{}  Reset environment", ":reset".bright_yellow(), " or :r   ".dimmed());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "↑/↓ arrows".bright_blue());
        println!("  {}  Interrupt current input", "Ctrl+C    ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D    ".bright_blue());
        println!();
    }

    fn show_variables(&mut self) {
        println!();
        println!("{}", "Defined Variables:".bright_cyan().bold());
        println!();
        let module = self.module;
        let fields = match self.vm.heap.get(module) {
            Obj::Instance(inst) => inst
                .fields
                .keys()
                .filter(|key| !matches!(key, Value::Obj(r) if self.vm.heap.as_str(*r) == Some("__repl_last__")))
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        if fields.is_empty() {
            println!("  {}", "(none)".dimmed());
        }
        for key in fields {
            let name = match key {
                Value::Obj(r) => self.vm.heap.as_str(r).unwrap_or("?").to_string(),
                _ => "?".to_string(),
            };
            if let Some(v) = self.vm.heap.instance_field_get(module, key) {
                let rendered = crate::builtins::display_repr(&mut self.vm, v).unwrap_or_else(|_| "?".to_string());
                println!("  {} = {}", name.bright_yellow(), rendered);
            }
        }
        println!();
    }

    /// Evaluates one chunk of REPL input.
    ///
    /// Module-level execution always yields `None` (there's no "last
    /// expression" concept at that level, same as a Python module body), so
    /// a bare expression like `1 + 1` wouldn't have anything to echo if we
    /// just ran it as-is. We first speculatively compile the input as an
    /// assignment to a scratch global; if that parses, the input was a bare
    /// expression and we display the stashed result afterward. If it
    /// doesn't parse (the input is a statement, a `def`, an `if`, etc.) we
    /// fall back to compiling and running it unmodified with no echo.
    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }
        self.line_no += 1;
        let filename = format!("<repl:{}>", self.line_no);
        let wrapped = format!("__repl_last__ = (\n{input}\n)");
        if let Ok(function) = crate::compiler::compile(&wrapped, &filename, &mut self.vm.heap) {
            self.run_function(function, true);
            return;
        }
        match crate::compiler::compile(input, &filename, &mut self.vm.heap) {
            Ok(function) => self.run_function(function, false),
            Err(errors) => {
                for e in &errors {
                    println!("{}", e);
                }
            }
        }
    }

    fn run_function(&mut self, function: RFunction, echo: bool) {
        let module = self.module;
        match self.vm.interpret_in_module(function, module) {
            Ok(_) if echo => {
                let key = Value::Obj(self.vm.heap.intern("__repl_last__"));
                if let Some(value) = self.vm.heap.instance_field_get(module, key) {
                    let rendered = crate::builtins::display_repr(&mut self.vm, value).unwrap_or_else(|_| "?".to_string());
                    println!("{} {}", "=>".bright_blue(), rendered);
                }
            }
            Ok(_) => {}
            Err(exc) => self.print_exception(exc),
        }
    }

    fn print_exception(&mut self, exc: Value) {
        let rendered = crate::builtins::display_repr(&mut self.vm, exc).unwrap_or_else(|_| format!("{exc}"));
        println!("{} {}", "Error:".bright_red().bold(), rendered.bright_red());
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("Failed to create REPL")
    }
}

/// True if all brackets/braces/parentheses are balanced and no string
/// literal is left open -- the same signal a line-buffered REPL for an
/// indentation-sensitive language needs to decide whether Enter should
/// submit the buffer or merely continue it.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut paren = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut in_comment = false;

    for ch in trimmed.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '#' if !in_string => in_comment = true,
            '{' if !in_string => brace += 1,
            '}' if !in_string => brace -= 1,
            '[' if !in_string => bracket += 1,
            ']' if !in_string => bracket -= 1,
            '(' if !in_string => paren += 1,
            ')' if !in_string => paren -= 1,
            _ => {}
        }
    }

    !in_string && brace == 0 && bracket == 0 && paren == 0
}
