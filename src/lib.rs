use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Lex(String),
    Syntax(String),
    Selection(String),
    Precondition(String),
    UnrecognizedCommand(String),
    ArgumentType(String),
    CommandFailed(String),
    Driver(String),
    Exec(String),
    ScriptFailure(String),
    StackUnderflow(String),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lex(msg) => write!(f, "lex error: {msg}"),
            Self::Syntax(msg) => write!(f, "syntax error: {msg}"),
            Self::Selection(msg) => write!(f, "selection error: {msg}"),
            Self::Precondition(msg) => write!(f, "precondition error: {msg}"),
            Self::UnrecognizedCommand(msg) => write!(f, "unrecognized command: {msg}"),
            Self::ArgumentType(msg) => write!(f, "argument type error: {msg}"),
            Self::CommandFailed(msg) => write!(f, "command failed: {msg}"),
            Self::Driver(msg) => write!(f, "driver error: {msg}"),
            Self::Exec(msg) => write!(f, "exec error: {msg}"),
            Self::ScriptFailure(msg) => write!(f, "script failure: {msg}"),
            Self::StackUnderflow(msg) => write!(f, "stack underflow: {msg}"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl StdError for Error {}

mod blocks;
mod context;
mod driver;
mod flow;
mod interpreter;
pub mod mock;
mod retry;
mod selection;
mod tokenizer;

pub use context::{ExecutionContext, Value};
pub use driver::{
    BrowserConfig, Clock, Driver, DriverError, DriverFactory, DriverResult, Element, Locator,
    LogEntry, LogLevel, MouseAction, Point, PrefValue, ScriptValue, Size, SystemClock,
};
pub use interpreter::{ExitStatus, Interpreter};
pub use selection::{Selection, SelectorDescriptor, SelectorKind};
pub use tokenizer::{Token, Tokenizer};
