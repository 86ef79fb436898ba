//! Typed host bridge over an embedded Tcl-style scripting runtime.
//!
//! ```
//! use tclbridge::{check_arity, Session, Value};
//!
//! let s = Session::new();
//! s.create_command("twice", |_: &Session, args: &[Value]| {
//!     check_arity(args, 1, Some(1), "n")?;
//!     Ok(args[0].to_int()? * 2)
//! });
//! assert_eq!(s.eval::<i64>("twice [expr {20 + 1}]").unwrap(), 42);
//! ```

pub mod cli;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod signal;
pub mod value;

pub use command::{arg, check_arity, CommandOutput, Output};
pub use config::{ConfigError, SessionConfig};
pub use engine::{SubstFlags, VarFlags};
pub use error::{ConversionError, Error, ErrorEnvelope, Result};
pub use session::Session;
pub use signal::{Completion, Signal};
pub use value::{FromValue, Value};
