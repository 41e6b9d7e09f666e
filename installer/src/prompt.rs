// Operator prompts
//
// The engine asks questions only through `Prompter`; non-interactive runs get a prompter that
// never asks, so every decision falls back to its documented default.

use anyhow::Result;
use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{IsTerminal, Write};

use crate::reconcile::validator::{MismatchPolicy, ValidationReport};

#[async_trait]
pub trait Prompter: Send + Sync {
    fn is_interactive(&self) -> bool;

    /// Ask whether to regenerate credentials although data exists. Default answer: no.
    async fn confirm_regenerate(&self, question: &str) -> Result<bool>;

    async fn choose_mismatch_policy(&self, report: &ValidationReport) -> Result<MismatchPolicy>;
}

/// Never asks; answers with the defaults.
pub struct NonInteractivePrompter;

#[async_trait]
impl Prompter for NonInteractivePrompter {
    fn is_interactive(&self) -> bool {
        false
    }

    async fn confirm_regenerate(&self, _question: &str) -> Result<bool> {
        Ok(false)
    }

    async fn choose_mismatch_policy(&self, _report: &ValidationReport) -> Result<MismatchPolicy> {
        Ok(MismatchPolicy::Continue)
    }
}

/// Single-key prompts on the controlling terminal.
pub struct TerminalPrompter;

impl TerminalPrompter {
    /// A terminal prompter when stdin/stdout are a TTY.
    pub fn detect() -> Option<Self> {
        (std::io::stdin().is_terminal() && std::io::stdout().is_terminal()).then_some(Self)
    }
}

/// Read keys in raw mode until `map` accepts one. Ctrl-C / Esc return `None`.
fn read_choice<T>(prompt: &str, map: impl Fn(char) -> Option<T>) -> Result<Option<T>> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{} ", prompt)?;
    stdout.flush()?;

    enable_raw_mode()?;
    let result = (|| -> Result<Option<T>> {
        loop {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Esc => return Ok(None),
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Ok(None)
                    }
                    KeyCode::Enter => {
                        if let Some(v) = map('\n') {
                            return Ok(Some(v));
                        }
                    }
                    KeyCode::Char(c) => {
                        if let Some(v) = map(c.to_ascii_lowercase()) {
                            return Ok(Some(v));
                        }
                    }
                    _ => {}
                }
            }
        }
    })();
    let _ = disable_raw_mode();
    println!();
    result
}

#[async_trait]
impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    async fn confirm_regenerate(&self, question: &str) -> Result<bool> {
        let prompt = format!("{} [y/N]", question);
        let answer = tokio::task::spawn_blocking(move || {
            read_choice(&prompt, |c| match c {
                'y' => Some(true),
                'n' | '\n' => Some(false),
                _ => None,
            })
        })
        .await??;
        Ok(answer.unwrap_or(false))
    }

    async fn choose_mismatch_policy(&self, report: &ValidationReport) -> Result<MismatchPolicy> {
        let prompt = format!(
            "Stored credentials could not be confirmed against existing data ({}).\n\
             [c]ontinue anyway, [r]etry after a delay, reset the [d]atabase volume, \
             [f]ull clean (removes ALL data), [a]bort?",
            report.verdict
        );
        let answer = tokio::task::spawn_blocking(move || {
            read_choice(&prompt, |c| match c {
                'c' => Some(MismatchPolicy::Continue),
                'r' => Some(MismatchPolicy::Retry),
                'd' => Some(MismatchPolicy::ResetVolume),
                'f' => Some(MismatchPolicy::FullClean),
                'a' => Some(MismatchPolicy::Abort),
                _ => None,
            })
        })
        .await??;
        Ok(answer.unwrap_or(MismatchPolicy::Abort))
    }
}
