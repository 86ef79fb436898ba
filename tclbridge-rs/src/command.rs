//! Host closures as script commands.
//!
//! Every registered closure is reached through one shared trampoline.  The
//! trampoline wraps `objv[1..]` in [`Value`]s, calls the closure and turns
//! whatever comes back into a completion code plus interpreter state.  No
//! error and no panic crosses back into the engine.

use std::any::Any;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::engine::{ClientData, Code, ObjPtr, RawInterp, ERROR, OK};
use crate::error::{Error, Result};
use crate::session::{Session, SessionInner};
use crate::signal::Signal;
use crate::value::{FromValue, Value};

type Callback = dyn Fn(&Session, &[Value]) -> Result<Output>;

/// What a command produced on success.
pub enum Output {
    /// Complete with a control-flow code; the result is left as is.
    Signal(Signal),
    /// Becomes the interpreter result; completes with `OK`.
    Value(Value),
}

/// Return types accepted from command closures.
pub trait CommandOutput {
    fn into_output(self) -> Output;
}

impl CommandOutput for Output {
    fn into_output(self) -> Output {
        self
    }
}

impl CommandOutput for Signal {
    fn into_output(self) -> Output {
        Output::Signal(self)
    }
}

impl CommandOutput for () {
    fn into_output(self) -> Output {
        Output::Value(Value::new())
    }
}

impl CommandOutput for Value {
    fn into_output(self) -> Output {
        Output::Value(self)
    }
}

macro_rules! value_output {
    ($($t:ty),*) => {$(
        impl CommandOutput for $t {
            fn into_output(self) -> Output {
                Output::Value(Value::from(self))
            }
        }
    )*};
}

value_output!(String, &'static str, i64, i32, f64, bool);

pub(crate) struct Registration {
    name: String,
    callback: Box<Callback>,
    session: Weak<SessionInner>,
}

impl Registration {
    pub(crate) fn new<F, R>(name: &str, session: Weak<SessionInner>, f: F) -> Registration
    where
        F: Fn(&Session, &[Value]) -> Result<R> + 'static,
        R: CommandOutput,
    {
        Registration {
            name: name.to_owned(),
            callback: Box::new(move |session, args| f(session, args).map(R::into_output)),
            session,
        }
    }
}

/// Hand `registration` to the engine.  The engine holds one strong
/// reference as client data and gives it back through [`forget`].
pub(crate) fn install(raw: &RawInterp, registration: &Rc<Registration>) {
    let data = Rc::into_raw(Rc::clone(registration)) as *mut c_void;
    raw.create_obj_command(&registration.name, trampoline, data, Some(forget));
}

fn trampoline(data: ClientData, raw: &RawInterp, objv: &[ObjPtr]) -> Code {
    // SAFETY: `data` came from `Rc::into_raw` in `install` and the engine's
    // reference is only released by `forget`.  Taking our own strong count
    // keeps the closure alive even if it deletes or replaces its command.
    let registration = unsafe {
        let borrowed = ManuallyDrop::new(Rc::from_raw(data as *const Registration));
        Rc::clone(&borrowed)
    };
    let Some(inner) = registration.session.upgrade() else {
        raw.set_result_string(&format!(
            "host command \"{}\" invoked after its session ended",
            registration.name
        ));
        return ERROR;
    };
    let session = Session { inner };
    let args: Vec<Value> = objv.iter().skip(1).map(|&p| session.wrap(p)).collect();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (registration.callback)(&session, &args)));
    drop(args);
    match outcome {
        Ok(Ok(output)) => complete(raw, output),
        Ok(Err(err)) => fail(raw, objv, &registration.name, err),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            debug!(name = %registration.name, %message, "host command panicked");
            raw.set_result_string(&format!(
                "host command \"{}\" panicked: {message}",
                registration.name
            ));
            ERROR
        }
    }
}

fn complete(raw: &RawInterp, output: Output) -> Code {
    match output {
        Output::Value(value) => {
            // SAFETY: `value` holds the cell during the call.
            unsafe { raw.set_result(value.as_ptr()) };
            OK
        }
        Output::Signal(signal) => {
            if signal == Signal::Return {
                raw.set_return_options(OK, None, None);
            }
            signal.code()
        }
    }
}

fn fail(raw: &RawInterp, objv: &[ObjPtr], name: &str, err: Error) -> Code {
    if let Some(signal) = err.signal() {
        return complete(raw, Output::Signal(signal));
    }
    if let Error::Recorded = err {
        return ERROR;
    }
    // Drop error state left over from nested evaluations the closure handled.
    raw.reset_result();
    match err {
        Error::Return | Error::Break | Error::Continue | Error::Recorded => ERROR,
        Error::Message {
            message,
            error_code,
        } => {
            raw.set_result_string(&message);
            if let Some(code) = error_code {
                // SAFETY: freshly allocated.
                unsafe { raw.set_error_code(ObjPtr::new_string(code)) };
            }
            ERROR
        }
        Error::Conversion(conversion) => {
            raw.set_result_string(&conversion.to_string());
            ERROR
        }
        Error::Interp(envelope) => {
            raw.set_result_string(&envelope.message);
            raw.set_error_info(&envelope.error_info);
            // SAFETY: freshly allocated.
            unsafe { raw.set_error_code(ObjPtr::new_string(envelope.error_code)) };
            ERROR
        }
        Error::WrongNumArgs { leading, usage } => {
            let leading = leading.min(objv.len());
            // SAFETY: the engine keeps objv alive for the whole call.
            unsafe { raw.wrong_num_args(objv, leading, Some(usage.as_str()).filter(|u| !u.is_empty())) };
            ERROR
        }
        Error::Protocol(_) | Error::Host(_) => {
            raw.set_result_string(&format!("host command \"{name}\" failed: {err}"));
            ERROR
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Delete procedure: release the engine's reference and drop the table
/// entry if it still points at this registration.
fn forget(data: ClientData) {
    // SAFETY: paired with the `Rc::into_raw` in `install`; called once.
    let registration = unsafe { Rc::from_raw(data as *const Registration) };
    // Fails while the session itself is being torn down.
    let Some(inner) = registration.session.upgrade() else {
        return;
    };
    let removed = {
        let mut commands = inner.commands.borrow_mut();
        match commands.get(&registration.name) {
            Some(current) if Rc::ptr_eq(current, &registration) => {
                commands.remove(&registration.name)
            }
            _ => None,
        }
    };
    drop(removed);
    debug!(name = %registration.name, "host command released");
}

/// Fail with `WrongNumArgs` unless `min <= args.len() <= max`.
///
/// `usage` describes the arguments after the command name, e.g.
/// `"key ?default?"`.
pub fn check_arity(args: &[Value], min: usize, max: Option<usize>, usage: &str) -> Result<()> {
    let n = args.len();
    if n < min || max.is_some_and(|max| n > max) {
        return Err(Error::WrongNumArgs {
            leading: 1,
            usage: usage.to_owned(),
        });
    }
    Ok(())
}

/// Decode argument `index` as `T`, naming the argument in the error.
pub fn arg<T: FromValue>(args: &[Value], index: usize) -> Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| Error::message(format!("missing argument {}", index + 1)))?;
    T::from_value(value).map_err(|err| match err {
        Error::Conversion(c) => c.with_context(format!("argument {}", index + 1)).into(),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorEnvelope;

    fn session() -> Session {
        Session::new()
    }

    #[test]
    fn outputs_become_results() {
        let s = session();
        s.create_command("answer", |_: &Session, _: &[Value]| Ok(42));
        s.create_command("half", |_: &Session, _: &[Value]| Ok(0.5));
        s.create_command("yes", |_: &Session, _: &[Value]| Ok(true));
        s.create_command("greet", |_: &Session, args: &[Value]| {
            Ok(format!("hello {}", args[0]))
        });
        s.create_command("nothing", |_: &Session, _: &[Value]| Ok(()));
        assert_eq!(s.eval::<i64>("answer").unwrap(), 42);
        assert_eq!(s.eval::<f64>("half").unwrap(), 0.5);
        assert!(s.eval::<bool>("yes").unwrap());
        assert_eq!(s.eval::<String>("greet you").unwrap(), "hello you");
        assert_eq!(s.eval::<String>("nothing").unwrap(), "");
    }

    #[test]
    fn args_skip_command_name() {
        let s = session();
        s.create_command("count", |_: &Session, args: &[Value]| Ok(args.len() as i64));
        assert_eq!(s.eval::<i64>("count").unwrap(), 0);
        assert_eq!(s.eval::<i64>("count a {b c} d").unwrap(), 3);
    }

    #[test]
    fn conversion_failure_is_script_error() {
        let s = session();
        s.create_command("double", |_: &Session, args: &[Value]| {
            check_arity(args, 1, Some(1), "n")?;
            Ok(arg::<i64>(args, 0)? * 2)
        });
        assert_eq!(s.eval::<i64>("double 21").unwrap(), 42);
        let err = s.eval::<()>("double x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected integer but got \"x\" (while converting argument 1)"
        );
        assert_eq!(
            s.eval::<String>("catch {double x} msg; set msg").unwrap(),
            "expected integer but got \"x\" (while converting argument 1)"
        );
    }

    #[test]
    fn arity_uses_canonical_text() {
        let s = session();
        s.create_command("pair", |_: &Session, args: &[Value]| {
            check_arity(args, 2, Some(2), "key value")?;
            Ok(())
        });
        s.create_command("bare", |_: &Session, args: &[Value]| {
            check_arity(args, 0, Some(0), "")?;
            Ok(())
        });
        let err = s.eval::<()>("pair a").unwrap_err();
        assert_eq!(err.to_string(), "wrong # args: should be \"pair key value\"");
        let err = s.eval::<()>("bare x").unwrap_err();
        assert_eq!(err.to_string(), "wrong # args: should be \"bare\"");
    }

    #[test]
    fn signals_propagate() {
        let s = session();
        s.create_command("stop", |_: &Session, _: &[Value]| Ok(Signal::Break));
        s.create_command("skip", |_: &Session, _: &[Value]| Err::<(), _>(Error::Continue));
        let total = s
            .eval::<i64>("set t 0; foreach i {1 2 3 4} { if {$i == 2} skip; if {$i == 4} stop; incr t $i }; set t")
            .unwrap();
        assert_eq!(total, 4);
        assert!(matches!(s.eval::<()>("stop"), Err(Error::Break)));
    }

    #[test]
    fn return_signal_ends_proc() {
        let s = session();
        s.create_command("leave", |s: &Session, args: &[Value]| {
            s.set_result(&args[0]);
            Ok(Signal::Return)
        });
        assert_eq!(s.eval::<String>("proc f {} { leave early; return late }; f").unwrap(), "early");
    }

    #[test]
    fn message_errors_carry_code() {
        let s = session();
        s.create_command("deny", |_: &Session, _: &[Value]| {
            Err::<(), _>(Error::with_code("denied", "APP DENIED"))
        });
        let err = s.eval::<()>("deny").unwrap_err();
        let env = err.envelope().unwrap();
        assert_eq!(env.message, "denied");
        assert_eq!(env.error_code, "APP DENIED");
        assert_eq!(env.error_info, "denied\n    while executing\n\"deny\"");
    }

    #[test]
    fn nested_eval_errors_keep_trace() {
        let s = session();
        s.create_command("inner", |s: &Session, _: &[Value]| s.eval::<Value>("error deep {} {X Y}"));
        let err = s.eval::<()>("inner").unwrap_err();
        let env = err.envelope().unwrap();
        assert_eq!(env.message, "deep");
        assert_eq!(env.error_code, "X Y");
        assert!(env.error_info.starts_with("deep\n    while executing\n\"error deep {} {X Y}\""));
        assert!(env.error_info.ends_with("invoked from within\n\"inner\""));
    }

    #[test]
    fn restores_envelope() {
        let s = session();
        s.create_command("replay", |_: &Session, _: &[Value]| {
            Err::<(), _>(Error::Interp(Box::new(ErrorEnvelope {
                message: "old".into(),
                error_info: "old\n    from elsewhere".into(),
                error_code: "OLD".into(),
            })))
        });
        let env = s.eval::<()>("replay").unwrap_err().envelope().cloned().unwrap();
        assert_eq!(env.message, "old");
        assert_eq!(env.error_code, "OLD");
        assert!(env.error_info.starts_with("old\n    from elsewhere"));
    }

    #[test]
    fn recorded_leaves_state() {
        let s = session();
        s.create_command("raw", |s: &Session, _: &[Value]| {
            s.set_result("written by hand");
            Err::<(), _>(Error::Recorded)
        });
        assert_eq!(s.eval::<()>("raw").unwrap_err().to_string(), "written by hand");
    }

    #[test]
    fn host_errors_and_panics_are_contained() {
        let s = session();
        s.create_command("io", |_: &Session, _: &[Value]| {
            Err::<(), _>(Error::host(std::io::Error::other("disk gone")))
        });
        s.create_command("crash", |_: &Session, _: &[Value]| -> Result<()> { panic!("kaboom") });
        assert_eq!(
            s.eval::<()>("io").unwrap_err().to_string(),
            "host command \"io\" failed: disk gone"
        );
        assert_eq!(
            s.eval::<()>("crash").unwrap_err().to_string(),
            "host command \"crash\" panicked: kaboom"
        );
        assert_eq!(s.eval::<i64>("expr 1 + 1").unwrap(), 2);
    }

    #[test]
    fn self_deletion_is_safe() {
        let s = session();
        s.create_command("once", |s: &Session, _: &[Value]| {
            s.delete_command("once");
            Ok("ran")
        });
        assert_eq!(s.eval::<String>("once").unwrap(), "ran");
        assert!(!s.has_command("once"));
        assert!(s.registered_commands().is_empty());
        assert!(s.eval::<()>("once").is_err());
    }

    #[test]
    fn replacement_keeps_newest() {
        let s = session();
        s.create_command("v", |_: &Session, _: &[Value]| Ok(1));
        s.create_command("v", |_: &Session, _: &[Value]| Ok(2));
        assert_eq!(s.eval::<i64>("v").unwrap(), 2);
        assert_eq!(s.registered_commands(), ["v"]);
        assert!(s.command_names().contains(&"v".to_owned()));
        assert!(s.delete_command("v"));
        assert!(s.registered_commands().is_empty());
    }

    #[test]
    fn closure_dropped_with_session() {
        let token = Rc::new(());
        {
            let s = session();
            let held = Rc::clone(&token);
            s.create_command("t", move |_: &Session, _: &[Value]| Ok(Rc::strong_count(&held) as i64));
            assert_eq!(s.eval::<i64>("t").unwrap(), 2);
        }
        assert_eq!(Rc::strong_count(&token), 1);
    }
}
