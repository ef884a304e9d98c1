//! Turns a span of tokens into a [`Stage`].

use crate::env::Environment;
use crate::error::{RedirectionFault, Result, SyntaxFault};
use crate::resolve::{base_name, resolve};
use crate::stage::{Redirection, Sink, Source, Stage};
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use tracing::debug;

/// A token with special meaning to the pipeline builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// `<`
    InputRedirect,
    /// `>`
    OutputRedirect,
    /// `|`
    PipeSeparator,
}

impl Symbol {
    /// Decode a whole token. Anything other than exactly `<`, `>` or `|` is a word.
    pub fn decode(token: &str) -> Option<Symbol> {
        match token {
            "<" => Some(Symbol::InputRedirect),
            ">" => Some(Symbol::OutputRedirect),
            "|" => Some(Symbol::PipeSeparator),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Symbol::InputRedirect => '<',
            Symbol::OutputRedirect => '>',
            Symbol::PipeSeparator => '|',
        }
    }
}

/// Read-only view of a token sequence with a moving position.
pub struct TokenCursor<'a, S> {
    tokens: &'a [S],
    pos: usize,
}

impl<'a, S: AsRef<str>> TokenCursor<'a, S> {
    pub fn new(tokens: &'a [S]) -> Self {
        TokenCursor { tokens, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(AsRef::as_ref)
    }

    pub fn peek_symbol(&self) -> Option<Symbol> {
        self.peek().and_then(Symbol::decode)
    }

    pub fn consume(&mut self) -> Option<&'a str> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

/// Build one stage starting at the cursor.
///
/// Consumes the executable token, its arguments and any trailing redirections, and leaves
/// the cursor on the following `|` (or past the end). On error every file opened for this
/// stage is closed again before returning.
pub fn parse_stage<S: AsRef<str>>(
    cursor: &mut TokenCursor<'_, S>,
    env: &Environment,
) -> Result<Stage> {
    let position = cursor.pos();
    let command = match cursor.peek() {
        Some(token) if Symbol::decode(token).is_none() => token,
        _ => return Err(SyntaxFault::MissingCommand { position }.into()),
    };

    reject_nul(command)?;

    let mut stage = if command.starts_with('/') {
        Stage::new(PathBuf::from(command), base_name(command).to_string())
    } else {
        Stage::new(resolve(env, command)?, command.to_string())
    };
    cursor.consume();

    while let Some(token) = cursor.peek() {
        if Symbol::decode(token).is_some() {
            break;
        }
        reject_nul(token)?;
        stage.arguments.push(token.to_string());
        cursor.consume();
    }

    while let Some(symbol) = cursor.peek_symbol() {
        if symbol == Symbol::PipeSeparator {
            break;
        }
        cursor.consume();
        parse_redirect(&mut stage, cursor, symbol)?;
    }

    debug!(
        command = stage.display_name(),
        path = %stage.executable_path().display(),
        args = stage.arguments().len() - 1,
        "built stage"
    );
    Ok(stage)
}

/// Handle the filename after a `<` or `>` that the cursor has just moved past.
fn parse_redirect<S: AsRef<str>>(
    stage: &mut Stage,
    cursor: &mut TokenCursor<'_, S>,
    symbol: Symbol,
) -> Result<()> {
    let target = match cursor.peek() {
        Some(token) if Symbol::decode(token).is_none() => token,
        _ => {
            return Err(RedirectionFault::MissingFilename {
                symbol: symbol.as_char(),
            }
            .into());
        }
    };

    match symbol {
        Symbol::InputRedirect => {
            if !matches!(stage.stdin, Source::Inherit) {
                return Err(duplicate(stage, symbol).into());
            }
            stage.stdin = Source::File(open_input(target)?);
        }
        Symbol::OutputRedirect => {
            if !matches!(stage.stdout, Sink::Inherit) {
                return Err(duplicate(stage, symbol).into());
            }
            stage.stdout = Sink::File(open_output(target)?);
        }
        Symbol::PipeSeparator => unreachable!("separators end the redirection list"),
    }
    cursor.consume();
    Ok(())
}

/// `execv` takes C strings, so a NUL inside a word can never reach the program intact.
fn reject_nul(token: &str) -> Result<()> {
    if token.contains('\0') {
        return Err(SyntaxFault::NulByte {
            token: token.to_string(),
        }
        .into());
    }
    Ok(())
}

fn duplicate(stage: &Stage, symbol: Symbol) -> RedirectionFault {
    RedirectionFault::Duplicate {
        command: stage.display_name.clone(),
        symbol: symbol.as_char(),
    }
}

fn open_input(target: &str) -> Result<Redirection> {
    let file = File::open(target).map_err(|source| RedirectionFault::Open {
        path: target.into(),
        source,
    })?;
    Ok(Redirection::new(target.into(), OwnedFd::from(file)))
}

fn open_output(target: &str) -> Result<Redirection> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)
        .map_err(|source| RedirectionFault::Open {
            path: target.into(),
            source,
        })?;
    Ok(Redirection::new(target.into(), OwnedFd::from(file)))
}
