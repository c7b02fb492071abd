use async_trait::async_trait;
use colored::{Color, Colorize};
use std::io::{BufRead, IsTerminal, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    #[default]
    None,
    Minimum,
    Medium,
    Maximum,
}

impl Verbosity {
    pub fn from_count(count: u8) -> Self {
        match count {
            0 => Verbosity::None,
            1 => Verbosity::Minimum,
            2 => Verbosity::Medium,
            _ => Verbosity::Maximum,
        }
    }
}

pub struct Transcript {
    sink: Box<dyn Write + Send>,
    colored: bool,
    verbosity: Verbosity,
    ends_with_newline: bool,
}

impl Transcript {
    pub fn new(sink: Box<dyn Write + Send>, verbosity: Verbosity, colored: bool) -> Self {
        Self {
            sink,
            colored,
            verbosity,
            ends_with_newline: true,
        }
    }

    pub fn stdout(verbosity: Verbosity) -> Self {
        let colored = std::io::stdout().is_terminal();
        Self::new(Box::new(std::io::stdout()), verbosity, colored)
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn write(&mut self, text: &str, color: Color) {
        if text.is_empty() {
            return;
        }

        let _ = if self.colored {
            write!(self.sink, "{}", text.color(color))
        } else {
            write!(self.sink, "{}", text)
        };
        let _ = self.sink.flush();

        self.ends_with_newline = text.ends_with('\n');
    }

    fn write_line(&mut self, text: &str, color: Color) {
        if text.ends_with('\n') {
            self.write(text, color);
        } else {
            self.write(&format!("{}\n", text), color);
        }
    }

    pub fn reasoning_marker(&mut self, marker: &str) {
        self.write(marker, Color::BrightGreen);
    }

    pub fn reasoning(&mut self, text: &str) {
        self.write(text, Color::BrightWhite);
    }

    pub fn content(&mut self, text: &str) {
        self.write(text, Color::BrightWhite);
    }

    pub fn notice(&mut self, text: &str) {
        self.write_line(text, Color::BrightWhite);
    }

    pub fn result(&mut self, text: &str) {
        self.write_line(text, Color::BrightCyan);
    }

    pub fn skipped(&mut self, text: &str) {
        self.write_line(text, Color::BrightYellow);
    }

    pub fn warn(&mut self, text: &str) {
        self.write_line(&format!("[WARN] {}", text), Color::Red);
    }

    pub fn verbose(&mut self, level: Verbosity, text: &str) {
        if self.verbosity < level || level == Verbosity::None {
            return;
        }

        let color = match level {
            Verbosity::Minimum => Color::Green,
            _ => Color::Yellow,
        };
        self.write_line(&format!(">>> {}", text), color);
    }

    pub fn ensure_newline(&mut self) {
        if !self.ends_with_newline {
            let _ = writeln!(self.sink);
            let _ = self.sink.flush();
            self.ends_with_newline = true;
        }
    }
}

#[async_trait]
pub trait Operator: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;

    async fn read_line(&self, prompt: &str) -> std::io::Result<String>;
}

pub struct ConsoleOperator;

fn trim_line_break(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn confirm(&self, prompt: &str) -> bool {
        let prompt = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            print!("{} (y/N): ", prompt);
            std::io::stdout().flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok::<_, std::io::Error>(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => line.trim().to_lowercase().starts_with('y'),
            Ok(Err(e)) => {
                tracing::warn!("failed to read confirmation: {}", e);
                false
            }
            Err(e) => {
                tracing::warn!("confirmation prompt aborted: {}", e);
                false
            }
        }
    }

    async fn read_line(&self, prompt: &str) -> std::io::Result<String> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            print!("{}: ", prompt);
            std::io::stdout().flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok::<_, std::io::Error>(trim_line_break(line))
        })
        .await
        .map_err(std::io::Error::other)?
    }
}
