//! Operator command console.
//!
//! Reads one command per line and applies it synchronously to the shared
//! [`CacheStore`] and [`Shutdown`] flag while traffic keeps flowing.
//!
//! | command               | effect                                   |
//! |-----------------------|------------------------------------------|
//! | `clear cache`/`clear` | empty the cache                          |
//! | `del <key>`           | delete one entry                         |
//! | `ls`/`liste`          | list stored keys, 1-indexed              |
//! | `exit`                | stop accepting and terminate             |
//!
//! Commands are trimmed and matched case-insensitively.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::cache::CacheStore;
use crate::proxy::cache_key;
use crate::shutdown::Shutdown;

/// Prompt written before each command is read.
pub const PROMPT: &str = "$server@proxy> ";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Clear,
    Delete(String),
    List,
    Exit,
    Unknown(String),
}

impl Command {
    /// Parses one input line. Never fails: unrecognized input becomes [`Command::Unknown`].
    pub fn parse(line: &str) -> Self {
        let command = line.trim().to_lowercase();
        match command.as_str() {
            "clear cache" | "clear" => Self::Clear,
            "ls" | "liste" => Self::List,
            "exit" => Self::Exit,
            _ => match command.strip_prefix("del ") {
                Some(key) => Self::Delete(cache_key(key)),
                None => Self::Unknown(command),
            },
        }
    }
}

/// The operator-facing result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Cleared,
    Deleted(String),
    NotFound(String),
    Keys(Vec<String>),
    Stopping,
    Unknown(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleared => write!(f, "[CACHE CLEARED]"),
            Self::Deleted(key) => write!(f, "[CACHE DELETED] key: {key}"),
            Self::NotFound(key) => write!(f, "[CACHE KEY NOT FOUND] key: {key}"),
            Self::Keys(keys) if keys.is_empty() => write!(f, "[CACHE EMPTY]"),
            Self::Keys(keys) => {
                write!(f, "[STORED CACHE KEYS]:")?;
                for (i, key) in keys.iter().enumerate() {
                    write!(f, "\n{}. key: {key}", i + 1)?;
                }
                Ok(())
            }
            Self::Stopping => write!(f, "[SERVER STOPPING]"),
            Self::Unknown(command) => write!(f, "[UNKNOWN COMMAND]: {command}"),
        }
    }
}

/// Why [`Console::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator issued `exit`; shutdown has been triggered.
    Exit,
    /// The input closed. Shutdown has not been triggered.
    EndOfInput,
}

/// Applies operator commands to the shared proxy state.
#[derive(Debug, Clone)]
pub struct Console {
    cache: Arc<CacheStore>,
    shutdown: Shutdown,
}

impl Console {
    pub fn new(cache: Arc<CacheStore>, shutdown: Shutdown) -> Self {
        Self { cache, shutdown }
    }

    /// Applies `command` and returns the reply to show the operator.
    pub fn execute(&self, command: Command) -> Reply {
        match command {
            Command::Clear => {
                self.cache.clear();
                Reply::Cleared
            }
            Command::Delete(key) => {
                if self.cache.delete(&key) {
                    Reply::Deleted(key)
                } else {
                    Reply::NotFound(key)
                }
            }
            Command::List => Reply::Keys(self.cache.list_keys()),
            Command::Exit => {
                self.shutdown.trigger();
                Reply::Stopping
            }
            Command::Unknown(command) => Reply::Unknown(command),
        }
    }

    /// Reads commands from `input` until `exit` or end of input, writing prompts
    /// and replies to `output`.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading `input` or writing `output`.
    pub async fn run<R, W>(&self, mut input: R, mut output: W) -> io::Result<ConsoleExit>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();
        loop {
            output.write_all(PROMPT.as_bytes()).await?;
            output.flush().await?;

            line.clear();
            if input.read_line(&mut line).await? == 0 {
                info!("console input closed");
                return Ok(ConsoleExit::EndOfInput);
            }

            let command = Command::parse(&line);
            let exit = command == Command::Exit;
            let reply = self.execute(command);
            output.write_all(format!("{reply}\n").as_bytes()).await?;
            output.flush().await?;

            if exit {
                info!("shutdown requested from console");
                return Ok(ConsoleExit::Exit);
            }
        }
    }
}
