use thiserror::Error;

use crate::signal::Signal;

pub type Result<T> = std::result::Result<T, Error>;

/// A value could not be coerced to the requested type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}{}", context_suffix(.context))]
pub struct ConversionError {
    /// The engine's own diagnostic, e.g. `expected integer but got "x"`.
    pub message: String,
    pub context: Option<String>,
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        ConversionError {
            message: message.into(),
            context: None,
        }
    }

    /// Attach "while converting argument N" style context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

fn context_suffix(context: &Option<String>) -> String {
    context
        .as_ref()
        .map(|c| format!(" (while converting {c})"))
        .unwrap_or_default()
}

/// Message, trace and machine-readable code of a script error, captured
/// together right after the failure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorEnvelope {
    pub message: String,
    pub error_info: String,
    pub error_code: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("{}", .0.message)]
    Interp(Box<ErrorEnvelope>),
    #[error("{message}")]
    Message {
        message: String,
        error_code: Option<String>,
    },
    /// Inside a command the engine names the first `leading` words of the
    /// invocation before `usage`; standalone, only `usage` is shown.
    #[error("wrong # args: should be \"{usage}\"")]
    WrongNumArgs { leading: usize, usage: String },
    /// The error is already in the interpreter result.
    #[error("error already recorded in interpreter")]
    Recorded,
    #[error("unexpected return")]
    Return,
    #[error("unexpected break")]
    Break,
    #[error("unexpected continue")]
    Continue,
    #[error("unrecognized completion code {0}")]
    Protocol(i32),
    #[error("{0}")]
    Host(Box<dyn std::error::Error>),
}

impl Error {
    pub fn message(message: impl Into<String>) -> Self {
        Error::Message {
            message: message.into(),
            error_code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, error_code: impl Into<String>) -> Self {
        Error::Message {
            message: message.into(),
            error_code: Some(error_code.into()),
        }
    }

    pub fn host(err: impl std::error::Error + 'static) -> Self {
        Error::Host(Box::new(err))
    }

    /// The control-flow signal this error carries, if it is one.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Error::Return => Some(Signal::Return),
            Error::Break => Some(Signal::Break),
            Error::Continue => Some(Signal::Continue),
            _ => None,
        }
    }

    pub fn envelope(&self) -> Option<&ErrorEnvelope> {
        match self {
            Error::Interp(envelope) => Some(envelope),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_context_in_message() {
        let e = ConversionError::new("expected integer but got \"x\"").with_context("argument 2");
        assert_eq!(
            e.to_string(),
            "expected integer but got \"x\" (while converting argument 2)"
        );
        assert_eq!(ConversionError::new("bad").to_string(), "bad");
    }

    #[test]
    fn signals_are_distinct_from_failures() {
        assert_eq!(Error::Break.signal(), Some(Signal::Break));
        assert_eq!(Error::message("x").signal(), None);
        assert!(Error::Conversion(ConversionError::new("c")).signal().is_none());
    }

    #[test]
    fn interp_error_displays_message() {
        let e = Error::Interp(Box::new(ErrorEnvelope {
            message: "boom".into(),
            error_info: "boom\n    while executing".into(),
            error_code: "NONE".into(),
        }));
        assert_eq!(e.to_string(), "boom");
        assert_eq!(e.envelope().map(|env| env.error_code.as_str()), Some("NONE"));
    }

    #[test]
    fn wrong_num_args_reads_like_the_engine() {
        let e = Error::WrongNumArgs {
            leading: 1,
            usage: "key ?default?".into(),
        };
        assert_eq!(e.to_string(), "wrong # args: should be \"key ?default?\"");
    }
}
