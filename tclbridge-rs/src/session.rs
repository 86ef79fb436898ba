//! Interpreter session: the typed front door to one [`RawInterp`].
//!
//! Every engine completion code is decoded here and turned into either a
//! typed result or an [`Error`]; raw codes never leave this module or the
//! command trampoline.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::command::{self, CommandOutput, Registration};
use crate::config::SessionConfig;
use crate::engine::{Code, ObjPtr, RawInterp, SubstFlags, VarFlags};
use crate::error::{Error, ErrorEnvelope, Result};
use crate::signal::Completion;
use crate::value::{FromValue, Value};

pub(crate) struct SessionInner {
    // Dropped first: deleting the engine's commands consults the
    // registration table below.
    pub(crate) raw: RawInterp,
    pub(crate) commands: RefCell<HashMap<String, Rc<Registration>>>,
    config: SessionConfig,
}

/// One interpreter context plus its host command registrations.
///
/// Cheap to clone; clones share the interpreter.  The context is torn down
/// when the last clone is dropped.  Values created through a session keep
/// only a weak link to it.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Rc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Session {
        Session::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Session {
        let raw = RawInterp::new();
        raw.set_recursion_limit(config.recursion_limit);
        for (name, value) in &config.globals {
            // SAFETY: freshly allocated.
            unsafe { raw.set_var2(name, None, ObjPtr::new_string(value.as_str()), VarFlags::GLOBAL_ONLY) };
        }
        debug!(
            recursion_limit = config.recursion_limit,
            diagnostics = config.diagnostics,
            globals = config.globals.len(),
            "session created"
        );
        Session {
            inner: Rc::new(SessionInner {
                raw,
                commands: RefCell::new(HashMap::new()),
                config,
            }),
        }
    }

    /// The underlying engine context.
    pub fn raw(&self) -> &RawInterp {
        &self.inner.raw
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// A value bound to this session.
    pub fn value(&self, value: impl Into<Value>) -> Value {
        value.into().bind(&self.inner)
    }

    /// Bound handle over a live engine cell.
    pub(crate) fn wrap(&self, ptr: ObjPtr) -> Value {
        // SAFETY: callers pass cells held by the engine for the duration.
        unsafe { Value::from_raw_in(ptr, Rc::downgrade(&self.inner)) }
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Evaluate `script` and decode its result as `T`.
    pub fn eval<T: FromValue>(&self, script: &str) -> Result<T> {
        debug!(len = script.len(), level = self.inner.raw.level(), "eval");
        let code = self.inner.raw.eval(script);
        self.check(code)?;
        self.result()
    }

    pub fn eval_value(&self, script: &str) -> Result<Value> {
        self.eval(script)
    }

    /// Read and evaluate a script file.
    pub fn eval_file<T: FromValue>(&self, path: impl AsRef<Path>) -> Result<T> {
        let path = path.as_ref();
        let script = std::fs::read_to_string(path).map_err(|e| {
            Error::with_code(
                format!("couldn't read file \"{}\": {e}", path.display()),
                "POSIX IO",
            )
        })?;
        debug!(path = %path.display(), "eval file");
        self.eval(&script)
    }

    /// Map a raw completion code to `Ok(())` or the matching error.
    pub(crate) fn check(&self, code: Code) -> Result<()> {
        match Completion::from(code) {
            Completion::Ok => Ok(()),
            Completion::Error => Err(Error::Interp(Box::new(self.capture_error()))),
            Completion::Return => Err(Error::Return),
            Completion::Break => Err(Error::Break),
            Completion::Continue => Err(Error::Continue),
            Completion::Unknown(other) => Err(Error::Protocol(other)),
        }
    }

    /// Snapshot the message, `::errorInfo` and `::errorCode` together.
    fn capture_error(&self) -> ErrorEnvelope {
        let raw = &self.inner.raw;
        // Seeds errorInfo/errorCode when nothing has logged this error yet.
        raw.add_error_info("");
        let global = |name: &str| {
            raw.get_var2(name, None, VarFlags::GLOBAL_ONLY)
                // SAFETY: the variable holds the cell while we read it.
                .map(|p| unsafe { p.get() }.string())
                .unwrap_or_default()
        };
        let envelope = ErrorEnvelope {
            message: raw.result_string(),
            error_info: global("errorInfo"),
            error_code: global("errorCode"),
        };
        if self.inner.config.diagnostics {
            warn!(
                message = %envelope.message,
                error_code = %envelope.error_code,
                error_info = %envelope.error_info,
                "script error"
            );
        }
        envelope
    }

    fn recorded_failure(&self) -> Error {
        Error::message(self.inner.raw.result_string())
    }

    // ── Interpreter result ────────────────────────────────────────────────────

    pub fn result<T: FromValue>(&self) -> Result<T> {
        T::from_value(&self.result_value())
    }

    /// New handle on the current result cell.
    pub fn result_value(&self) -> Value {
        self.wrap(self.inner.raw.result())
    }

    pub fn result_string(&self) -> String {
        self.inner.raw.result_string()
    }

    pub fn set_result(&self, value: impl Into<Value>) {
        let value = value.into();
        // SAFETY: `value` holds the cell during the call.
        unsafe { self.inner.raw.set_result(value.as_ptr()) };
    }

    pub fn reset_result(&self) {
        self.inner.raw.reset_result();
    }

    // ── Error state ───────────────────────────────────────────────────────────

    pub fn add_error_info(&self, message: &str) {
        self.inner.raw.add_error_info(message);
    }

    pub fn set_error_code(&self, code: impl Into<Value>) {
        let code = code.into();
        // SAFETY: `code` holds the cell during the call.
        unsafe { self.inner.raw.set_error_code(code.as_ptr()) };
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    /// Read a variable (`name` or `name(elem)`), failing when it is unset
    /// or does not decode as `T`.
    pub fn var<T: FromValue>(&self, name: &str) -> Result<T> {
        T::from_value(&self.get_var2(name, None, VarFlags::empty())?)
    }

    /// Like [`var`](Self::var) but `None` instead of an error.
    pub fn try_var<T: FromValue>(&self, name: &str) -> Option<T> {
        let p = self.inner.raw.get_var(name, VarFlags::empty())?;
        T::from_value(&self.wrap(p)).ok()
    }

    pub fn set_var(&self, name: &str, value: impl Into<Value>) -> Result<Value> {
        self.set_var2(name, None, value, VarFlags::empty())
    }

    pub fn array_var<T: FromValue>(&self, name: &str, elem: &str) -> Result<T> {
        T::from_value(&self.get_var2(name, Some(elem), VarFlags::empty())?)
    }

    pub fn set_array_var(&self, name: &str, elem: &str, value: impl Into<Value>) -> Result<Value> {
        self.set_var2(name, Some(elem), value, VarFlags::empty())
    }

    pub fn unset_var(&self, name: &str) -> Result<()> {
        match self.inner.raw.unset_var(name, VarFlags::LEAVE_ERR_MSG) {
            crate::engine::OK => Ok(()),
            _ => Err(self.recorded_failure()),
        }
    }

    /// Read with explicit flags.  With no element, `name(elem)` syntax is
    /// honoured.
    pub fn get_var2(&self, name: &str, elem: Option<&str>, flags: VarFlags) -> Result<Value> {
        let flags = flags | VarFlags::LEAVE_ERR_MSG;
        let found = match elem {
            Some(_) => self.inner.raw.get_var2(name, elem, flags),
            None => self.inner.raw.get_var(name, flags),
        };
        found.map(|p| self.wrap(p)).ok_or_else(|| self.recorded_failure())
    }

    /// Write with explicit flags, returning the value now bound (which
    /// differs from `value` when appending).
    pub fn set_var2(
        &self,
        name: &str,
        elem: Option<&str>,
        value: impl Into<Value>,
        flags: VarFlags,
    ) -> Result<Value> {
        let value = value.into();
        let flags = flags | VarFlags::LEAVE_ERR_MSG;
        let raw = &self.inner.raw;
        // SAFETY: `value` holds the cell during the call.
        let stored = unsafe {
            match elem {
                Some(_) => raw.set_var2(name, elem, value.as_ptr(), flags),
                None => raw.set_var(name, value.as_ptr(), flags),
            }
        };
        stored.map(|p| self.wrap(p)).ok_or_else(|| self.recorded_failure())
    }

    // ── Substitution ──────────────────────────────────────────────────────────

    pub fn subst(&self, template: &str, flags: SubstFlags) -> Result<Value> {
        match self.inner.raw.subst(template, flags) {
            Ok(p) => Ok(self.wrap(p)),
            Err(code) => {
                self.check(code)?;
                Err(Error::Protocol(code))
            }
        }
    }

    // ── Host commands ─────────────────────────────────────────────────────────

    /// Register `f` as the script command `name`, replacing any command of
    /// that name.
    ///
    /// The closure must not hold a clone of this session: the session owns
    /// the closure, so that would keep both alive forever.  Use the
    /// `&Session` argument instead.
    pub fn create_command<F, R>(&self, name: &str, f: F)
    where
        F: Fn(&Session, &[Value]) -> Result<R> + 'static,
        R: CommandOutput,
    {
        let registration = Rc::new(Registration::new(name, Rc::downgrade(&self.inner), f));
        command::install(&self.inner.raw, &registration);
        let old = self
            .inner
            .commands
            .borrow_mut()
            .insert(name.to_owned(), registration);
        drop(old);
        debug!(name, "host command registered");
    }

    /// Remove a command (host or built-in).  Returns false if there was none.
    pub fn delete_command(&self, name: &str) -> bool {
        let removed = self.inner.raw.delete_command(name);
        if removed {
            debug!(name, "command deleted");
        }
        removed
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.inner.raw.command_exists(name)
    }

    /// Every command name, built-in and host, sorted.
    pub fn command_names(&self) -> Vec<String> {
        self.inner.raw.command_names()
    }

    /// Names of the live host registrations, sorted.
    pub fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.commands.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    #[test]
    fn eval_typed_results() {
        let s = Session::new();
        assert_eq!(s.eval::<i64>("expr {6 * 7}").unwrap(), 42);
        assert_eq!(s.eval::<f64>("expr {1 / 4.0}").unwrap(), 0.25);
        assert!(s.eval::<bool>("expr {2 > 1}").unwrap());
        assert_eq!(s.eval::<String>("list a {b c}").unwrap(), "a {b c}");
        s.eval::<()>("set unused 1").unwrap();
        let v = s.eval_value("list 1 2 3").unwrap();
        assert_eq!(v.llength().unwrap(), 3);
    }

    #[test]
    fn eval_result_conversion_failure() {
        let s = Session::new();
        match s.eval::<i64>("set x abc") {
            Err(Error::Conversion(e)) => assert_eq!(e.message, "expected integer but got \"abc\""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn eval_error_envelope() {
        let s = Session::new();
        let err = s.eval::<()>("error boom {} {APP FAIL}").unwrap_err();
        let env = err.envelope().expect("interp error");
        assert_eq!(env.message, "boom");
        assert_eq!(env.error_code, "APP FAIL");
        assert_eq!(env.error_info, "boom\n    while executing\n\"error boom {} {APP FAIL}\"");
    }

    #[test]
    fn control_flow_surfaces_as_signals() {
        let s = Session::new();
        assert_eq!(s.eval::<()>("break").unwrap_err().signal(), Some(Signal::Break));
        assert_eq!(s.eval::<()>("continue").unwrap_err().signal(), Some(Signal::Continue));
        assert_eq!(s.eval::<()>("return 5").unwrap_err().signal(), Some(Signal::Return));
        assert!(matches!(s.eval::<()>("proc p {} { return -code 7 }; p"), Err(Error::Protocol(7))));
    }

    #[test]
    fn variables_round_trip() {
        let s = Session::new();
        s.set_var("n", 12).unwrap();
        assert_eq!(s.var::<i64>("n").unwrap(), 12);
        assert_eq!(s.eval::<i64>("incr n").unwrap(), 13);
        s.set_array_var("cfg", "depth", 3).unwrap();
        assert_eq!(s.array_var::<i64>("cfg", "depth").unwrap(), 3);
        assert_eq!(s.var::<i64>("cfg(depth)").unwrap(), 3);
        assert_eq!(s.try_var::<i64>("nope"), None);
        match s.var::<i64>("nope") {
            Err(Error::Message { message, .. }) => {
                assert_eq!(message, "can't read \"nope\": no such variable")
            }
            other => panic!("unexpected {other:?}"),
        }
        s.unset_var("n").unwrap();
        assert!(s.unset_var("n").is_err());
    }

    #[test]
    fn set_var_takes_its_own_reference() {
        let s = Session::new();
        let v = s.value("payload");
        s.set_var("p", &v).unwrap();
        assert_eq!(v.ref_count(), 2);
        s.unset_var("p").unwrap();
        assert_eq!(v.ref_count(), 1);
    }

    #[test]
    fn append_flags() {
        let s = Session::new();
        s.set_var2("l", None, "a b", VarFlags::LIST_ELEMENT | VarFlags::APPEND_VALUE)
            .unwrap();
        let l = s
            .set_var2("l", None, "c", VarFlags::LIST_ELEMENT | VarFlags::APPEND_VALUE)
            .unwrap();
        assert_eq!(l.as_string(), "{a b} c");
        s.set_var2("t", None, "x", VarFlags::APPEND_VALUE).unwrap();
        assert_eq!(s.set_var2("t", None, "y", VarFlags::APPEND_VALUE).unwrap(), "xy");
    }

    #[test]
    fn global_only_from_proc() {
        let s = Session::new();
        s.set_var("g", "outer").unwrap();
        s.create_command("peek", |s: &Session, _args: &[Value]| {
            s.get_var2("g", None, VarFlags::GLOBAL_ONLY).map(|v| v.as_string())
        });
        assert_eq!(s.eval::<String>("proc f {} { set g inner; peek }; f").unwrap(), "outer");
    }

    #[test]
    fn result_slot() {
        let s = Session::new();
        s.set_result(3.5);
        assert_eq!(s.result::<f64>().unwrap(), 3.5);
        s.reset_result();
        assert_eq!(s.result_string(), "");
    }

    #[test]
    fn subst_scopes() {
        let s = Session::new();
        s.set_var("who", "world").unwrap();
        let all = s.subst("hi $who [string length $who]\\n", SubstFlags::ALL).unwrap();
        assert_eq!(all.as_string(), "hi world 5\n");
        let vars = s.subst("$who [x]", SubstFlags::VARIABLES).unwrap();
        assert_eq!(vars.as_string(), "world [x]");
        let err = s.subst("$missing", SubstFlags::ALL).unwrap_err();
        assert_eq!(err.envelope().map(|e| e.message.as_str()), Some("can't read \"missing\": no such variable"));
    }

    #[test]
    fn config_globals_and_limit() {
        let s = Session::with_config(SessionConfig::new().global("mode", "test").recursion_limit(20));
        assert_eq!(s.var::<String>("mode").unwrap(), "test");
        let err = s.eval::<()>("proc r {} { r }; r").unwrap_err();
        assert_eq!(
            err.envelope().map(|e| e.message.as_str()),
            Some("too many nested evaluations (infinite loop?)")
        );
    }

    #[test]
    fn default_limit_is_an_error_on_a_small_stack() {
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let s = Session::new();
                let err = s.eval::<()>("proc r {} { r }; r").unwrap_err();
                err.envelope().map(|e| e.message.clone())
            })
            .unwrap();
        assert_eq!(
            handle.join().unwrap().as_deref(),
            Some("too many nested evaluations (infinite loop?)")
        );
    }

    #[test]
    fn eval_file_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.tcl");
        std::fs::write(&path, "set loaded 1\nexpr {$loaded + 1}\n").unwrap();
        let s = Session::new();
        assert_eq!(s.eval_file::<i64>(&path).unwrap(), 2);
        assert!(s.eval_file::<()>(dir.path().join("absent.tcl")).is_err());
    }

    #[test]
    fn values_outlive_session() {
        let v = {
            let s = Session::new();
            s.eval_value("list a b").unwrap()
        };
        assert_eq!(v.llength().unwrap(), 2);
        assert!(v.to_int().is_err());
    }
}
