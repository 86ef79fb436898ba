//! Tagged completion codes.
//!
//! The engine reports every evaluation and command outcome as a bare
//! integer.  [`Completion`] is that integer decoded at the boundary;
//! [`Signal`] is the subset a host command may finish with.

use crate::engine::{self, Code};

/// Decoded engine completion code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ok,
    Error,
    Return,
    Break,
    Continue,
    /// Anything else, e.g. from `return -code 7`.
    Unknown(i32),
}

impl Completion {
    pub fn code(self) -> Code {
        match self {
            Completion::Ok => engine::OK,
            Completion::Error => engine::ERROR,
            Completion::Return => engine::RETURN,
            Completion::Break => engine::BREAK,
            Completion::Continue => engine::CONTINUE,
            Completion::Unknown(code) => code,
        }
    }
}

impl From<Code> for Completion {
    fn from(code: Code) -> Self {
        match code {
            engine::OK => Completion::Ok,
            engine::ERROR => Completion::Error,
            engine::RETURN => Completion::Return,
            engine::BREAK => Completion::Break,
            engine::CONTINUE => Completion::Continue,
            other => Completion::Unknown(other),
        }
    }
}

/// Non-error outcome of a host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    Ok,
    Return,
    Break,
    Continue,
}

impl Signal {
    pub fn code(self) -> Code {
        match self {
            Signal::Ok => engine::OK,
            Signal::Return => engine::RETURN,
            Signal::Break => engine::BREAK,
            Signal::Continue => engine::CONTINUE,
        }
    }
}

impl From<Signal> for Completion {
    fn from(signal: Signal) -> Self {
        Completion::from(signal.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0..=6 {
            assert_eq!(Completion::from(code).code(), code);
        }
        assert_eq!(Completion::from(7), Completion::Unknown(7));
    }

    #[test]
    fn signals_map_to_completions() {
        assert_eq!(Completion::from(Signal::Ok), Completion::Ok);
        assert_eq!(Completion::from(Signal::Break), Completion::Break);
        assert_eq!(Signal::Continue.code(), engine::CONTINUE);
    }
}
