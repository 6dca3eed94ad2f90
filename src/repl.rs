// File: src/repl.rs
//
// Interactive REPL for the Panda scripting language.
// Expressions echo their value; declarations persist in a dedicated scope so
// later lines can build on earlier ones.

use crate::engine::Engine;
use crate::errors::PandaError;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::value::Value;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const SCOPE: &str = "repl";

pub struct Repl {
    engine: Engine,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, PandaError> {
        let editor = DefaultEditor::new()
            .map_err(|e| PandaError::runtime(format!("Failed to start line editor: {}", e)))?;
        Ok(Self {
            engine: Engine::new(),
            editor,
        })
    }

    pub fn run(&mut self) -> Result<(), PandaError> {
        println!("Panda {} (type 'exit' to quit)", env!("CARGO_PKG_VERSION"));
        loop {
            match self.editor.readline(">> ") {
                Ok(line) => {
                    let mut input = line;
                    if input.trim().is_empty() {
                        continue;
                    }
                    if matches!(input.trim(), "exit" | "quit") {
                        break;
                    }
                    // Keep reading while brackets are unbalanced.
                    while needs_more(&input) {
                        match self.editor.readline(".. ") {
                            Ok(next) => {
                                input.push('\n');
                                input.push_str(&next);
                            }
                            Err(_) => break,
                        }
                    }
                    let _ = self.editor.add_history_entry(&input);
                    self.execute(&input);
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    return Err(PandaError::runtime(format!("Line editor error: {}", e)));
                }
            }
        }
        Ok(())
    }

    fn execute(&mut self, input: &str) {
        let result = if parses_as_expression(input) {
            self.engine.eval_in(input, None, Some(SCOPE), false)
        } else {
            self.engine.run(input, Some(SCOPE), false)
        };
        match result {
            Ok(Value::Null) => {}
            Ok(value) => println!("{}", value.to_display_string().bright_green()),
            Err(err) => eprintln!("{}", err),
        }
    }
}

/// True when the input has more open brackets than closed ones, so the REPL
/// should keep reading continuation lines.
fn needs_more(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_string => {
                chars.next();
            }
            '"' => in_string = !in_string,
            '{' | '(' | '[' if !in_string => depth += 1,
            '}' | ')' | ']' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth > 0
}

/// A line that parses as a single expression echoes its value; anything else
/// runs as statements.
fn parses_as_expression(input: &str) -> bool {
    let Ok(tokens) = Lexer::new(input).tokenize() else {
        return false;
    };
    Parser::new(tokens).parse_expression().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_tracks_bracket_depth() {
        assert!(needs_more("func f() {"));
        assert!(needs_more("var a = [1,"));
        assert!(!needs_more("func f() { return 1 }"));
        assert!(!needs_more("var s = \"{\""));
    }

    #[test]
    fn expressions_are_distinguished_from_statements() {
        assert!(parses_as_expression("1 + 2"));
        assert!(parses_as_expression("f(3)"));
        assert!(!parses_as_expression("var x = 1"));
        assert!(!parses_as_expression("if x { }"));
    }
}
