//! Line-oriented console glue over the script engine.
//!
//! Feeds user input to the engine one line at a time, accumulating lines
//! while the parser reports the chunk as incomplete so multi-line constructs
//! can be typed naturally. Presentation stays with the host: every call
//! returns the text to print, which prompt to show next and whether a
//! special command was recognized.

use crate::engine::{CallResult, ScriptEngine};
use crate::value::{Value, ValueKind};

const MAX_KEY_COLUMN: usize = 24;
const MAX_VALUE_COLUMN: usize = 48;

/// Which prompt the host should display next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    Primary,
    /// More input is needed to complete the current chunk.
    Continuation,
}

/// Special command recognized in the input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    None,
    Quit,
    Clear,
}

#[derive(Debug)]
pub struct ConsoleReply {
    pub output: String,
    pub prompt: Prompt,
    pub action: ConsoleAction,
}

pub struct Console<'e> {
    engine: &'e ScriptEngine,
    chunk: String,
    continuation: bool,
}

impl<'e> Console<'e> {
    pub fn new(engine: &'e ScriptEngine) -> Self {
        Self {
            engine,
            chunk: String::new(),
            continuation: false,
        }
    }

    /// True while previous input is waiting for its continuation.
    pub fn pending(&self) -> bool {
        self.continuation
    }

    pub fn feed_line(&mut self, line: &str) -> ConsoleReply {
        if line.is_empty() {
            return self.reply(String::new(), ConsoleAction::None);
        }

        if self.continuation {
            self.chunk.push('\n');
        } else {
            self.chunk.clear();
        }

        let trimmed = line.trim();
        if trimmed == "quit" {
            self.chunk.clear();
            self.continuation = false;
            return self.reply(String::new(), ConsoleAction::Quit);
        }
        if trimmed == "clear" {
            self.chunk.clear();
            self.continuation = false;
            return self.reply(String::new(), ConsoleAction::Clear);
        }

        self.chunk.push_str(line);
        self.continuation = false;
        let result = self.engine.execute_sync(&self.chunk, "input");
        self.absorb(result)
    }

    fn absorb(&mut self, result: CallResult) -> ConsoleReply {
        let mut output = String::new();
        if result.success {
            for value in &result.results {
                if value.kind() == ValueKind::Table {
                    render_table(value, &mut output);
                } else {
                    output.push_str(&value.to_string());
                    output.push('\n');
                }
            }
        } else if result.incomplete {
            self.continuation = true;
        } else {
            output.push_str(&result.error_message);
            output.push('\n');
        }

        if !self.continuation {
            self.chunk.clear();
        }
        self.reply(output, ConsoleAction::None)
    }

    fn reply(&self, output: String, action: ConsoleAction) -> ConsoleReply {
        ConsoleReply {
            output,
            prompt: if self.continuation {
                Prompt::Continuation
            } else {
                Prompt::Primary
            },
            action,
        }
    }
}

/// Render a table result as aligned key/value lines. Nested tables print as
/// their type name; string values are quoted.
fn render_table(value: &Value, out: &mut String) {
    let Ok(data) = value.table() else {
        out.push_str("not a table\n");
        return;
    };
    if data.entries.is_empty() {
        out.push_str("[empty table]\n");
        return;
    }

    let mut key_width = 0;
    for key in data.entries.keys() {
        key_width = key_width.max(key.to_string().len());
    }
    key_width = key_width.min(MAX_KEY_COLUMN);

    for (key, val) in &data.entries {
        push_limited(out, &key.to_string(), key_width, true);
        out.push_str("    ");
        if val.kind() == ValueKind::String {
            out.push('"');
            push_limited(out, &val.to_string(), MAX_VALUE_COLUMN - 2, false);
            out.push('"');
        } else {
            push_limited(out, &val.to_string(), MAX_VALUE_COLUMN, false);
        }
        out.push('\n');
    }
}

/// Append `text` collapsed to one line and truncated to `max_len` bytes
/// without splitting a UTF-8 character, padding with spaces when asked.
fn push_limited(out: &mut String, text: &str, max_len: usize, pad: bool) {
    let mut line = text.to_string();
    if let Some(pos) = line.find(['\r', '\n']) {
        line.replace_range(pos.., "...");
    }
    if line.len() <= max_len {
        out.push_str(&line);
        if pad {
            for _ in line.len()..max_len {
                out.push(' ');
            }
        }
    } else {
        let mut cut = max_len.saturating_sub(3);
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&line[..cut]);
        out.push_str("...");
        if pad {
            for _ in cut + 3..max_len {
                out.push(' ');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptEngine;

    #[test]
    fn test_single_line_result() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);
        let reply = console.feed_line("return 1 + 1");
        assert_eq!(reply.output, "2\n");
        assert_eq!(reply.prompt, Prompt::Primary);
        assert_eq!(reply.action, ConsoleAction::None);
    }

    #[test]
    fn test_incomplete_input_continues() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);

        let reply = console.feed_line("if true then");
        assert_eq!(reply.output, "");
        assert_eq!(reply.prompt, Prompt::Continuation);
        assert!(console.pending());

        let reply = console.feed_line("x = 5 end");
        assert_eq!(reply.prompt, Prompt::Primary);
        assert!(!console.pending());

        let reply = console.feed_line("return x");
        assert_eq!(reply.output, "5\n");
    }

    #[test]
    fn test_error_is_reported_once() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);
        let reply = console.feed_line("error('boom')");
        assert!(reply.output.contains("boom"));
        assert_eq!(reply.prompt, Prompt::Primary);
    }

    #[test]
    fn test_quit_and_clear() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);
        assert_eq!(console.feed_line("quit").action, ConsoleAction::Quit);

        console.feed_line("if true then");
        assert!(console.pending());
        let reply = console.feed_line("clear");
        assert_eq!(reply.action, ConsoleAction::Clear);
        assert!(!console.pending());
    }

    #[test]
    fn test_empty_line_keeps_state() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);
        console.feed_line("if true then");
        let reply = console.feed_line("");
        assert_eq!(reply.prompt, Prompt::Continuation);
        assert!(console.pending());
    }

    #[test]
    fn test_table_rendering() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);
        let reply = console.feed_line("return { alpha = 'one', beta = 2 }");
        assert!(reply.output.contains("alpha"));
        assert!(reply.output.contains("\"one\""));
        assert!(reply.output.contains("beta"));
        assert!(reply.output.contains('2'));
    }

    #[test]
    fn test_empty_table_rendering() {
        let engine = ScriptEngine::new().expect("engine");
        let mut console = Console::new(&engine);
        let reply = console.feed_line("return {}");
        assert_eq!(reply.output, "[empty table]\n");
    }

    #[test]
    fn test_limited_print_truncates_on_char_boundary() {
        let mut out = String::new();
        push_limited(&mut out, "ααααααααααα", 10, false);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 10);
        assert!(out.is_char_boundary(out.len() - 3));
    }
}
