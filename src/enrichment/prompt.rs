// 🙋 Operator Prompt - one question per unresolved key
// The cache decides what to ask and validates answers; a Prompter only talks to the operator.

use anyhow::{bail, Context, Result};
use crossterm::style::{style, Stylize};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Stdout, StdinLock, Write};
use std::path::Path;

/// Everything the operator sees before answering one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyContext {
    pub natural_key: String,
    /// 1-based position among this run's unresolved keys
    pub position: usize,
    pub total: usize,
    pub target: String,
    /// Context columns as (column, value) pairs, one entry per row sharing the key
    pub rows: Vec<Vec<(String, String)>>,
    /// External detail text, or the reason it could not be fetched
    pub detail: Option<String>,
}

pub trait Prompter {
    fn present(&mut self, context: &KeyContext) -> Result<()>;

    /// Raw answer line; validation is the caller's job
    fn ask(&mut self, context: &KeyContext) -> Result<String>;

    fn reject(&mut self, answer: &str, reason: &str) -> Result<()>;
}

// ============================================================================
// CONSOLE PROMPTER
// ============================================================================

pub struct ConsolePrompter<R, W> {
    input: R,
    output: W,
    styled: bool,
}

impl<R: BufRead, W: Write> ConsolePrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        ConsolePrompter {
            input,
            output,
            styled: false,
        }
    }

    pub fn styled(mut self, styled: bool) -> Self {
        self.styled = styled;
        self
    }

    fn heading(&self, text: &str) -> String {
        if self.styled {
            style(text).cyan().bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn warning(&self, text: &str) -> String {
        if self.styled {
            style(text).red().bold().to_string()
        } else {
            text.to_string()
        }
    }
}

impl ConsolePrompter<StdinLock<'static>, Stdout> {
    /// Terminal prompter; colors only when stdout is a terminal
    pub fn stdio() -> Self {
        let styled = io::stdout().is_terminal();
        ConsolePrompter::new(io::stdin().lock(), io::stdout()).styled(styled)
    }
}

impl<R: BufRead, W: Write> Prompter for ConsolePrompter<R, W> {
    fn present(&mut self, context: &KeyContext) -> Result<()> {
        let title = format!(
            "[{}/{}] {} ({} rows)",
            context.position,
            context.total,
            context.natural_key,
            context.rows.len()
        );
        let title = self.heading(&title);
        writeln!(self.output)?;
        writeln!(self.output, "{}", title)?;

        for row in &context.rows {
            let line = row
                .iter()
                .map(|(column, value)| format!("{}={}", column, value))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(self.output, "   {}", line)?;
        }

        if let Some(detail) = &context.detail {
            writeln!(self.output, "   ℹ️  {}", detail)?;
        }

        self.output.flush()?;
        Ok(())
    }

    fn ask(&mut self, context: &KeyContext) -> Result<String> {
        write!(self.output, "{} for {}: ", context.target, context.natural_key)?;
        self.output.flush()?;

        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("Failed to read operator answer")?;
        if read == 0 {
            bail!(
                "operator input closed while asking for {} of '{}'",
                context.target,
                context.natural_key
            );
        }

        Ok(line)
    }

    fn reject(&mut self, answer: &str, reason: &str) -> Result<()> {
        let message = format!("❌ '{}' rejected: {}", answer.trim(), reason);
        let message = self.warning(&message);
        writeln!(self.output, "{}", message)?;
        Ok(())
    }
}

// ============================================================================
// SCRIPTED PROMPTER (answers file, tests)
// ============================================================================

/// Replays a fixed list of answers, recording what it was shown
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub asked: usize,
    pub presented: Vec<String>,
    pub rejected: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedPrompter {
            answers: answers.into_iter().map(Into::into).collect(),
            ..ScriptedPrompter::default()
        }
    }

    /// One answer per line; blank lines are kept so rejections can be scripted too
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read answers file: {}", path.display()))?;
        Ok(ScriptedPrompter::new(content.lines()))
    }
}

impl Prompter for ScriptedPrompter {
    fn present(&mut self, context: &KeyContext) -> Result<()> {
        self.presented.push(context.natural_key.clone());
        Ok(())
    }

    fn ask(&mut self, context: &KeyContext) -> Result<String> {
        self.asked += 1;
        match self.answers.pop_front() {
            Some(answer) => Ok(answer),
            None => bail!(
                "no scripted answer left for {} of '{}'",
                context.target,
                context.natural_key
            ),
        }
    }

    fn reject(&mut self, answer: &str, _reason: &str) -> Result<()> {
        self.rejected.push(answer.to_string());
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
