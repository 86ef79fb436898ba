//! Interpreter context: result slot, variable frames, command table and
//! error state, plus the evaluator that ties them together.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;

use bitflags::bitflags;

use super::expr::{self, ExprContext, Failure, Operand};
use super::obj::ObjPtr;
use super::parse::{Parser, Part, Word};
use super::{builtins, ensure_sufficient_stack, Code, ERROR, OK};

/// Opaque pointer handed back to a command procedure on every call.
pub type ClientData = *mut c_void;

/// Command procedure.  `objv[0]` is the command word itself.
pub type ObjCmdProc = fn(ClientData, &RawInterp, &[ObjPtr]) -> Code;

/// Called once when a command is deleted or replaced.
pub type CmdDeleteProc = fn(ClientData);

pub const DEFAULT_RECURSION_LIMIT: usize = 1000;

const TRACE_LIMIT: usize = 150;

bitflags! {
    /// Options for variable access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarFlags: u32 {
        /// Resolve the name in the global frame only.
        const GLOBAL_ONLY = 1;
        /// On failure, leave a message in the interpreter result.
        const LEAVE_ERR_MSG = 1 << 1;
        /// Append to the current value instead of replacing it.
        const APPEND_VALUE = 1 << 2;
        /// Treat the new value as a list element.
        const LIST_ELEMENT = 1 << 3;
    }
}

bitflags! {
    /// Which substitutions `subst` performs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubstFlags: u32 {
        const COMMANDS = 1;
        const VARIABLES = 1 << 1;
        const BACKSLASHES = 1 << 2;
        const ALL = Self::COMMANDS.bits() | Self::VARIABLES.bits() | Self::BACKSLASHES.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct ErrFlags: u8 {
        const IN_PROGRESS = 1;
        const ALREADY_LOGGED = 1 << 1;
        const CODE_SET = 1 << 2;
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

fn held(p: ObjPtr) -> ObjPtr {
    // SAFETY: callers pass cells that are live at the point of the call.
    unsafe { p.incr_ref_count() };
    p
}

/// A variable binding; owns one reference on its value.
struct Slot(ObjPtr);

impl Slot {
    fn new(p: ObjPtr) -> Slot {
        Slot(held(p))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: the slot owns the reference taken in `Slot::new`.
        unsafe { self.0.decr_ref_count() };
    }
}

enum Var {
    Scalar(Slot),
    Array(HashMap<String, Slot>),
    /// Alias for a global variable (`global name`).
    Link(String),
}

#[derive(Default)]
struct Frame {
    vars: HashMap<String, Var>,
}

struct Command {
    proc_: ObjCmdProc,
    client_data: ClientData,
    delete: Option<CmdDeleteProc>,
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(delete) = self.delete {
            delete(self.client_data);
        }
    }
}

#[derive(Default)]
struct ReturnOptions {
    code: Code,
    error_code: Option<String>,
    error_info: Option<String>,
}

// ── RawInterp ─────────────────────────────────────────────────────────────────

/// One interpreter context.
///
/// Every method takes `&self`: command procedures receive the interpreter
/// by shared reference and may re-enter it freely.
pub struct RawInterp {
    result: Cell<ObjPtr>,
    frames: RefCell<Vec<Frame>>,
    commands: RefCell<HashMap<String, Rc<Command>>>,
    err_flags: Cell<ErrFlags>,
    error_line: Cell<usize>,
    return_options: RefCell<ReturnOptions>,
    depth: Cell<usize>,
    recursion_limit: Cell<usize>,
}

impl Default for RawInterp {
    fn default() -> Self {
        Self::new()
    }
}

impl RawInterp {
    /// New interpreter with the core command set registered.
    pub fn new() -> RawInterp {
        let interp = RawInterp {
            result: Cell::new(held(ObjPtr::new_empty())),
            frames: RefCell::new(vec![Frame::default()]),
            commands: RefCell::new(HashMap::new()),
            err_flags: Cell::new(ErrFlags::empty()),
            error_line: Cell::new(0),
            return_options: RefCell::new(ReturnOptions::default()),
            depth: Cell::new(0),
            recursion_limit: Cell::new(DEFAULT_RECURSION_LIMIT),
        };
        builtins::register(&interp);
        interp
    }

    /// Set the nesting limit, returning the previous one.
    pub fn set_recursion_limit(&self, limit: usize) -> usize {
        self.recursion_limit.replace(limit.max(1))
    }

    // ── Result ────────────────────────────────────────────────────────────────

    /// The current result.  The interpreter keeps the reference; take one
    /// before running anything else if the cell must outlive the result.
    pub fn result(&self) -> ObjPtr {
        self.result.get()
    }

    pub fn result_string(&self) -> String {
        // SAFETY: the result slot always holds a reference.
        unsafe { self.result.get().get() }.string()
    }

    /// # Safety
    /// `obj` must be live.
    pub unsafe fn set_result(&self, obj: ObjPtr) {
        obj.incr_ref_count();
        let old = self.result.replace(obj);
        old.decr_ref_count();
    }

    pub fn set_result_string(&self, text: &str) {
        // SAFETY: freshly allocated.
        unsafe { self.set_result(ObjPtr::new_string(text)) }
    }

    /// Empty the result and clear any error in progress.
    pub fn reset_result(&self) {
        // SAFETY: freshly allocated.
        unsafe { self.set_result(ObjPtr::new_empty()) };
        self.err_flags.set(ErrFlags::empty());
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Evaluate a script and return its raw completion code.  `RETURN`,
    /// `BREAK` and `CONTINUE` come back unconverted.
    pub fn eval(&self, script: &str) -> Code {
        self.eval_script(script)
    }

    pub(crate) fn eval_script(&self, script: &str) -> Code {
        let depth = self.depth.get();
        if depth >= self.recursion_limit.get() {
            self.set_result_string("too many nested evaluations (infinite loop?)");
            return ERROR;
        }
        self.depth.set(depth + 1);
        let code = ensure_sufficient_stack(|| self.eval_commands(script));
        self.depth.set(depth);
        code
    }

    fn eval_commands(&self, script: &str) -> Code {
        self.reset_result();
        let mut parser = Parser::new(script);
        loop {
            let before = parser.pos();
            let command = match parser.next_command() {
                Ok(Some(command)) => command,
                Ok(None) => return OK,
                Err(message) => {
                    self.set_result_string(&message);
                    let rest = &script[before..];
                    let start = before + rest.len() - rest.trim_start().len();
                    self.log_command_info(script, start, rest.trim());
                    return ERROR;
                }
            };

            let mut objv = Vec::with_capacity(command.words.len());
            let mut code = self.substitute_words(&command.words, &mut objv);
            if code == OK && !objv.is_empty() {
                code = self.invoke(&objv);
            }
            for p in objv {
                // SAFETY: every word holds one reference taken during substitution.
                unsafe { p.decr_ref_count() };
            }
            if code != OK {
                if code == ERROR {
                    self.log_command_info(script, command.start, &command.source);
                }
                return code;
            }
        }
    }

    fn substitute_words(&self, words: &[Word], objv: &mut Vec<ObjPtr>) -> Code {
        for word in words {
            let value = match self.substitute_parts(&word.parts) {
                Ok(p) => p,
                Err(code) => return code,
            };
            if word.expand {
                // SAFETY: `value` holds a reference for the duration.
                let elems = unsafe { value.get() }.list_elements(Some(self));
                if let Ok(items) = &elems {
                    objv.extend(items.iter().map(|&item| held(item)));
                }
                unsafe { value.decr_ref_count() };
                if elems.is_err() {
                    return ERROR;
                }
            } else {
                objv.push(value);
            }
        }
        OK
    }

    /// Substitute a word.  The returned cell carries a reference owned by
    /// the caller.  A word made of exactly one variable or command keeps
    /// that cell's identity.
    pub(crate) fn substitute_parts(&self, parts: &[Part]) -> Result<ObjPtr, Code> {
        if let [single] = parts {
            return self.substitute_part(single);
        }
        let mut text = String::new();
        for part in parts {
            match part {
                Part::Text(t) => text.push_str(t),
                other => {
                    let p = self.substitute_part(other)?;
                    // SAFETY: `p` carries its own reference.
                    unsafe {
                        text.push_str(&p.get().string());
                        p.decr_ref_count();
                    }
                }
            }
        }
        Ok(held(ObjPtr::new_string(text)))
    }

    fn substitute_part(&self, part: &Part) -> Result<ObjPtr, Code> {
        match part {
            Part::Text(t) => Ok(held(ObjPtr::new_string(t.as_str()))),
            Part::Var { name, index } => self.read_var(name, index.as_deref()),
            Part::Script(script) => {
                let code = self.eval_script(script);
                if code != OK {
                    return Err(code);
                }
                Ok(held(self.result()))
            }
        }
    }

    fn read_var(&self, name: &str, index: Option<&[Part]>) -> Result<ObjPtr, Code> {
        let elem = match index {
            Some(parts) => {
                let p = self.substitute_parts(parts)?;
                // SAFETY: `p` carries its own reference.
                let s = unsafe { p.get() }.string();
                unsafe { p.decr_ref_count() };
                Some(s)
            }
            None => None,
        };
        self.get_var2(name, elem.as_deref(), VarFlags::LEAVE_ERR_MSG)
            .map(held)
            .ok_or(ERROR)
    }

    /// Look up and call a command.  Falls back to `unknown` when defined.
    pub(crate) fn invoke(&self, objv: &[ObjPtr]) -> Code {
        let Some(&first) = objv.first() else {
            return OK;
        };
        self.reset_result();
        // SAFETY: objv cells are live for the whole call.
        let name = unsafe { first.get() }.string();
        let found = self.commands.borrow().get(name.trim_start_matches("::")).cloned();
        if let Some(cmd) = found {
            return (cmd.proc_)(cmd.client_data, self, objv);
        }

        let unknown = self.commands.borrow().get("unknown").cloned();
        match unknown {
            Some(handler) => {
                let word = held(ObjPtr::new_string("unknown"));
                let mut args = Vec::with_capacity(objv.len() + 1);
                args.push(word);
                args.extend_from_slice(objv);
                let code = (handler.proc_)(handler.client_data, self, &args);
                unsafe { word.decr_ref_count() };
                code
            }
            None => {
                self.set_result_string(&format!("invalid command name \"{name}\""));
                ERROR
            }
        }
    }

    /// Substitute `text` as a template.  `BREAK` from an embedded command
    /// ends substitution early, `CONTINUE` substitutes nothing, `RETURN`
    /// substitutes the returned value.  The new cell has a zero count.
    pub fn subst(&self, text: &str, flags: SubstFlags) -> Result<ObjPtr, Code> {
        self.reset_result();
        let parts = match super::parse::template(text, flags) {
            Ok(parts) => parts,
            Err(message) => {
                self.set_result_string(&message);
                return Err(ERROR);
            }
        };
        let mut out = String::new();
        for part in &parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Var { name, index } => {
                    let p = self.read_var(name, index.as_deref())?;
                    // SAFETY: `p` carries its own reference.
                    unsafe {
                        out.push_str(&p.get().string());
                        p.decr_ref_count();
                    }
                }
                Part::Script(script) => match self.eval_script(script) {
                    super::OK | super::RETURN => out.push_str(&self.result_string()),
                    super::BREAK => break,
                    super::CONTINUE => {}
                    code => return Err(code),
                },
            }
        }
        Ok(ObjPtr::new_string(out))
    }

    // ── Expressions ───────────────────────────────────────────────────────────

    pub(crate) fn eval_expr(&self, text: &str) -> Result<Operand, Code> {
        expr::eval_str(text, self).map_err(|failure| self.fail(failure))
    }

    pub(crate) fn eval_condition(&self, text: &str) -> Result<bool, Code> {
        let value = self.eval_expr(text)?;
        value.truth().map_err(|failure| self.fail(failure))
    }

    fn fail(&self, failure: Failure) -> Code {
        match failure {
            Failure::Message(message) => {
                self.set_result_string(&message);
                ERROR
            }
            Failure::Code(code) => code,
        }
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    /// Frame index and key after applying `::` prefixes, `GLOBAL_ONLY` and
    /// `global` links.
    fn resolve(&self, name: &str, flags: VarFlags) -> (usize, String) {
        if let Some(stripped) = name.strip_prefix("::") {
            return (0, stripped.to_owned());
        }
        let frames = self.frames.borrow();
        let idx = if flags.contains(VarFlags::GLOBAL_ONLY) {
            0
        } else {
            frames.len() - 1
        };
        match frames[idx].vars.get(name) {
            Some(Var::Link(target)) => (0, target.clone()),
            _ => (idx, name.to_owned()),
        }
    }

    /// Read a variable or array element.  The cell stays owned by the
    /// variable.
    pub fn get_var2(&self, name: &str, elem: Option<&str>, flags: VarFlags) -> Option<ObjPtr> {
        let (idx, key) = self.resolve(name, flags);
        let found = {
            let frames = self.frames.borrow();
            match (frames[idx].vars.get(&key), elem) {
                (None | Some(Var::Link(_)), _) => Err("no such variable"),
                (Some(Var::Scalar(slot)), None) => Ok(slot.0),
                (Some(Var::Scalar(_)), Some(_)) => Err("variable isn't array"),
                (Some(Var::Array(_)), None) => Err("variable is array"),
                (Some(Var::Array(elems)), Some(e)) => {
                    elems.get(e).map(|slot| slot.0).ok_or("no such element in array")
                }
            }
        };
        match found {
            Ok(p) => Some(p),
            Err(why) => {
                if flags.contains(VarFlags::LEAVE_ERR_MSG) {
                    self.set_result_string(&format!(
                        "can't read \"{}\": {why}",
                        display_name(name, elem)
                    ));
                }
                None
            }
        }
    }

    /// Write a variable or array element, returning the cell now bound.
    ///
    /// With `APPEND_VALUE` the text is appended; with `LIST_ELEMENT` the
    /// value is appended as a list element.  A shared current value is
    /// copied before either kind of append.
    ///
    /// # Safety
    /// `value` must be live.  A zero-count `value` is freed if the write
    /// fails.
    pub unsafe fn set_var2(
        &self,
        name: &str,
        elem: Option<&str>,
        value: ObjPtr,
        flags: VarFlags,
    ) -> Option<ObjPtr> {
        value.incr_ref_count();
        let outcome = self.store(name, elem, value, flags);
        value.decr_ref_count();
        match outcome {
            Ok(p) => Some(p),
            Err(message) => {
                if flags.contains(VarFlags::LEAVE_ERR_MSG) {
                    self.set_result_string(&message);
                }
                None
            }
        }
    }

    unsafe fn store(
        &self,
        name: &str,
        elem: Option<&str>,
        value: ObjPtr,
        flags: VarFlags,
    ) -> Result<ObjPtr, String> {
        let (idx, key) = self.resolve(name, flags);
        let cant = |why: &str| format!("can't set \"{}\": {why}", display_name(name, elem));

        let current = {
            let frames = self.frames.borrow();
            match (frames[idx].vars.get(&key), elem) {
                (None | Some(Var::Link(_)), _) => None,
                (Some(Var::Scalar(slot)), None) => Some(slot.0),
                (Some(Var::Scalar(_)), Some(_)) => return Err(cant("variable isn't array")),
                (Some(Var::Array(_)), None) => return Err(cant("variable is array")),
                (Some(Var::Array(elems)), Some(e)) => elems.get(e).map(|slot| slot.0),
            }
        };

        let new_value = if flags.intersects(VarFlags::APPEND_VALUE | VarFlags::LIST_ELEMENT) {
            let target = match current {
                Some(p) if !p.get().is_shared() => p,
                Some(p) => p.get().duplicate(),
                None => ObjPtr::new_empty(),
            };
            if flags.contains(VarFlags::LIST_ELEMENT) {
                if let Err(message) = target.get().list_append(None, value) {
                    if Some(target) != current {
                        target.decr_ref_count();
                    }
                    return Err(message);
                }
            } else {
                target.get().append_string(&value.get().string());
            }
            target
        } else {
            value
        };

        if Some(new_value) != current {
            let slot = Slot::new(new_value);
            let mut frames = self.frames.borrow_mut();
            let vars = &mut frames[idx].vars;
            match elem {
                None => {
                    vars.insert(key, Var::Scalar(slot));
                }
                Some(e) => {
                    let entry = vars
                        .entry(key)
                        .or_insert_with(|| Var::Array(HashMap::new()));
                    if !matches!(entry, Var::Array(_)) {
                        *entry = Var::Array(HashMap::new());
                    }
                    if let Var::Array(elems) = entry {
                        elems.insert(e.to_owned(), slot);
                    }
                }
            }
        }
        Ok(new_value)
    }

    /// Remove a variable, an array element, or (with no element) a whole
    /// array.
    pub fn unset_var2(&self, name: &str, elem: Option<&str>, flags: VarFlags) -> Code {
        let (idx, key) = self.resolve(name, flags);
        let outcome = {
            let mut frames = self.frames.borrow_mut();
            let vars = &mut frames[idx].vars;
            match elem {
                None => match vars.remove(&key) {
                    Some(Var::Link(_)) | None => Err("no such variable"),
                    Some(_) => Ok(()),
                },
                Some(e) => match vars.get_mut(&key) {
                    Some(Var::Array(elems)) => {
                        elems.remove(e).map(drop).ok_or("no such element in array")
                    }
                    Some(Var::Scalar(_)) => Err("variable isn't array"),
                    _ => Err("no such variable"),
                },
            }
        };
        match outcome {
            Ok(()) => OK,
            Err(why) => {
                if flags.contains(VarFlags::LEAVE_ERR_MSG) {
                    self.set_result_string(&format!(
                        "can't unset \"{}\": {why}",
                        display_name(name, elem)
                    ));
                }
                ERROR
            }
        }
    }

    /// [`get_var2`](Self::get_var2) with `name(elem)` syntax.
    pub fn get_var(&self, name: &str, flags: VarFlags) -> Option<ObjPtr> {
        let (base, elem) = split_var_name(name);
        self.get_var2(base, elem, flags)
    }

    /// [`set_var2`](Self::set_var2) with `name(elem)` syntax.
    ///
    /// # Safety
    /// Same as [`set_var2`](Self::set_var2).
    pub unsafe fn set_var(&self, name: &str, value: ObjPtr, flags: VarFlags) -> Option<ObjPtr> {
        let (base, elem) = split_var_name(name);
        self.set_var2(base, elem, value, flags)
    }

    pub fn unset_var(&self, name: &str, flags: VarFlags) -> Code {
        let (base, elem) = split_var_name(name);
        self.unset_var2(base, elem, flags)
    }

    /// True if `name` (scalar, array, or `name(elem)`) is set.
    pub fn var_exists(&self, name: &str, flags: VarFlags) -> bool {
        let (base, elem) = split_var_name(name);
        let (idx, key) = self.resolve(base, flags);
        let frames = self.frames.borrow();
        match (frames[idx].vars.get(&key), elem) {
            (Some(Var::Scalar(_)), None) | (Some(Var::Array(_)), None) => true,
            (Some(Var::Array(elems)), Some(e)) => elems.contains_key(e),
            _ => false,
        }
    }

    /// Names of the variables visible in the current frame.
    pub fn var_names(&self) -> Vec<String> {
        let frames = self.frames.borrow();
        let mut names: Vec<String> = frames[frames.len() - 1].vars.keys().cloned().collect();
        names.sort();
        names
    }

    fn set_global_text(&self, name: &str, text: &str) {
        // SAFETY: freshly allocated.
        unsafe { self.set_var2(name, None, ObjPtr::new_string(text), VarFlags::GLOBAL_ONLY) };
    }

    // ── Frames ────────────────────────────────────────────────────────────────

    /// Current frame depth; 0 is the global frame.
    pub fn level(&self) -> usize {
        self.frames.borrow().len() - 1
    }

    pub(crate) fn push_frame(&self) {
        self.frames.borrow_mut().push(Frame::default());
    }

    pub(crate) fn pop_frame(&self) {
        let frame = {
            let mut frames = self.frames.borrow_mut();
            if frames.len() > 1 {
                frames.pop()
            } else {
                None
            }
        };
        drop(frame);
    }

    /// Make `name` in the current frame refer to the global of that name.
    pub(crate) fn link_global(&self, name: &str) {
        let mut frames = self.frames.borrow_mut();
        if frames.len() > 1 {
            if let Some(frame) = frames.last_mut() {
                frame.vars.insert(name.to_owned(), Var::Link(name.to_owned()));
            }
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Register `proc_` under `name`, replacing (and deleting) any command
    /// already there.
    pub fn create_obj_command(
        &self,
        name: &str,
        proc_: ObjCmdProc,
        client_data: ClientData,
        delete: Option<CmdDeleteProc>,
    ) {
        let command = Rc::new(Command {
            proc_,
            client_data,
            delete,
        });
        let old = self
            .commands
            .borrow_mut()
            .insert(name.trim_start_matches("::").to_owned(), command);
        drop(old);
    }

    /// Remove a command.  Its delete procedure runs once no invocation of
    /// it is still on the stack.
    pub fn delete_command(&self, name: &str) -> bool {
        let old = self.commands.borrow_mut().remove(name.trim_start_matches("::"));
        old.is_some()
    }

    pub fn command_exists(&self, name: &str) -> bool {
        self.commands.borrow().contains_key(name.trim_start_matches("::"))
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    // ── Error state ───────────────────────────────────────────────────────────

    /// Append to `::errorInfo`.  The first call after an error seeds it with
    /// the current result and defaults `::errorCode` to `NONE`.
    pub fn add_error_info(&self, message: &str) {
        let mut flags = self.err_flags.get();
        if !flags.contains(ErrFlags::IN_PROGRESS) {
            flags.insert(ErrFlags::IN_PROGRESS);
            self.err_flags.set(flags);
            let seed = self.result_string();
            self.set_global_text("errorInfo", &seed);
            if !flags.contains(ErrFlags::CODE_SET) {
                self.set_global_text("errorCode", "NONE");
            }
        }
        // SAFETY: freshly allocated.
        unsafe {
            self.set_var2(
                "errorInfo",
                None,
                ObjPtr::new_string(message),
                VarFlags::GLOBAL_ONLY | VarFlags::APPEND_VALUE,
            )
        };
    }

    /// Set `::errorCode`.
    ///
    /// # Safety
    /// `code` must be live.
    pub unsafe fn set_error_code(&self, code: ObjPtr) {
        self.set_var2("errorCode", None, code, VarFlags::GLOBAL_ONLY);
        self.err_flags.set(self.err_flags.get() | ErrFlags::CODE_SET);
    }

    /// Replace `::errorInfo` outright, marking an error as in progress.
    pub fn set_error_info(&self, info: &str) {
        self.set_global_text("errorInfo", info);
        self.err_flags.set(self.err_flags.get() | ErrFlags::IN_PROGRESS);
    }

    /// Keep the next command-level trace line out of `::errorInfo`.
    pub(crate) fn set_already_logged(&self) {
        self.err_flags.set(self.err_flags.get() | ErrFlags::ALREADY_LOGGED);
    }

    /// Line, within its script, of the command that most recently failed.
    pub(crate) fn error_line(&self) -> usize {
        self.error_line.get()
    }

    fn log_command_info(&self, script: &str, start: usize, source: &str) {
        let mut flags = self.err_flags.get();
        if flags.contains(ErrFlags::ALREADY_LOGGED) {
            flags.remove(ErrFlags::ALREADY_LOGGED);
            self.err_flags.set(flags);
            return;
        }
        self.error_line.set(1 + script[..start].matches('\n').count());
        let text = ellipsize(source);
        let message = if flags.contains(ErrFlags::IN_PROGRESS) {
            format!("\n    invoked from within\n\"{text}\"")
        } else {
            format!("\n    while executing\n\"{text}\"")
        };
        self.add_error_info(&message);
    }

    /// Leave `wrong # args: should be "..."` in the result, naming the
    /// first `leading` words of `objv` followed by `message`.
    ///
    /// # Safety
    /// The first `leading` cells of `objv` must be live.
    pub unsafe fn wrong_num_args(&self, objv: &[ObjPtr], leading: usize, message: Option<&str>) {
        let words: Vec<String> = objv.iter().take(leading).map(|p| p.get().string()).collect();
        let mut text = String::from("wrong # args: should be \"");
        text.push_str(&words.join(" "));
        if let Some(message) = message {
            if !words.is_empty() {
                text.push(' ');
            }
            text.push_str(message);
        }
        text.push('"');
        self.set_result_string(&text);
    }

    // ── `return` options ──────────────────────────────────────────────────────

    pub(crate) fn set_return_options(
        &self,
        code: Code,
        error_code: Option<String>,
        error_info: Option<String>,
    ) {
        *self.return_options.borrow_mut() = ReturnOptions {
            code,
            error_code,
            error_info,
        };
    }

    /// Consume the pending `return` options, producing the code the
    /// enclosing procedure (or `source`) completes with.
    pub(crate) fn update_return_info(&self) -> Code {
        let options = std::mem::take(&mut *self.return_options.borrow_mut());
        if options.code == ERROR {
            let code = options.error_code.unwrap_or_else(|| "NONE".to_owned());
            // SAFETY: freshly allocated.
            unsafe { self.set_error_code(ObjPtr::new_string(code)) };
            if let Some(info) = options.error_info {
                self.set_error_info(&info);
                self.set_already_logged();
            }
        }
        options.code
    }
}

impl Drop for RawInterp {
    fn drop(&mut self) {
        let commands: Vec<Rc<Command>> = self.commands.borrow_mut().drain().map(|(_, c)| c).collect();
        drop(commands);
        let frames = std::mem::take(&mut *self.frames.borrow_mut());
        drop(frames);
        // SAFETY: the result slot owns one reference.
        unsafe { self.result.get().decr_ref_count() };
    }
}

impl ExprContext for RawInterp {
    fn variable(&self, name: &str, index: Option<&[Part]>) -> Result<String, Failure> {
        let p = self.read_var(name, index).map_err(Failure::Code)?;
        // SAFETY: `p` carries its own reference.
        let text = unsafe { p.get() }.string();
        unsafe { p.decr_ref_count() };
        Ok(text)
    }

    fn command(&self, script: &str) -> Result<String, Failure> {
        match self.eval_script(script) {
            OK => Ok(self.result_string()),
            code => Err(Failure::Code(code)),
        }
    }

    fn substitute(&self, parts: &[Part]) -> Result<String, Failure> {
        let p = self.substitute_parts(parts).map_err(Failure::Code)?;
        // SAFETY: `p` carries its own reference.
        let text = unsafe { p.get() }.string();
        unsafe { p.decr_ref_count() };
        Ok(text)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Split `name(elem)` into its parts.
pub fn split_var_name(name: &str) -> (&str, Option<&str>) {
    if name.ends_with(')') {
        if let Some(open) = name.find('(') {
            return (&name[..open], Some(&name[open + 1..name.len() - 1]));
        }
    }
    (name, None)
}

fn display_name(name: &str, elem: Option<&str>) -> String {
    match elem {
        Some(e) => format!("{name}({e})"),
        None => name.to_owned(),
    }
}

fn ellipsize(source: &str) -> String {
    if source.chars().count() > TRACE_LIMIT {
        let mut s: String = source.chars().take(TRACE_LIMIT).collect();
        s.push_str("...");
        s
    } else {
        source.to_owned()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BREAK, RETURN};

    fn var(interp: &RawInterp, name: &str) -> Option<String> {
        interp
            .get_var(name, VarFlags::empty())
            .map(|p| unsafe { p.get() }.string())
    }

    #[test]
    fn eval_sets_result() {
        let interp = RawInterp::new();
        assert_eq!(interp.eval("set a 5; set b $a"), OK);
        assert_eq!(interp.result_string(), "5");
    }

    #[test]
    fn control_codes_are_returned_raw() {
        let interp = RawInterp::new();
        assert_eq!(interp.eval("break"), BREAK);
        assert_eq!(interp.eval("return x"), RETURN);
        assert_eq!(interp.result_string(), "x");
    }

    #[test]
    fn unknown_command() {
        let interp = RawInterp::new();
        assert_eq!(interp.eval("frobnicate 1"), ERROR);
        assert_eq!(interp.result_string(), "invalid command name \"frobnicate\"");
        assert_eq!(
            var(&interp, "errorInfo").unwrap(),
            "invalid command name \"frobnicate\"\n    while executing\n\"frobnicate 1\""
        );
        assert_eq!(var(&interp, "errorCode").unwrap(), "NONE");
    }

    #[test]
    fn nested_error_trace() {
        let interp = RawInterp::new();
        assert_eq!(interp.eval("set x [nope]"), ERROR);
        assert_eq!(
            var(&interp, "errorInfo").unwrap(),
            "invalid command name \"nope\"\n    while executing\n\"nope\"\n    invoked from within\n\"set x [nope]\""
        );
    }

    #[test]
    fn missing_variable_message() {
        let interp = RawInterp::new();
        assert_eq!(interp.eval("set y $nope"), ERROR);
        assert_eq!(interp.result_string(), "can't read \"nope\": no such variable");
    }

    #[test]
    fn array_variables() {
        let interp = RawInterp::new();
        assert_eq!(interp.eval("set a(x) 1; set k x; set a($k)"), OK);
        assert_eq!(interp.result_string(), "1");
        assert_eq!(interp.eval("set a"), ERROR);
        assert_eq!(interp.result_string(), "can't read \"a\": variable is array");
        assert_eq!(interp.eval("set s 1; set s(x) 2"), ERROR);
        assert_eq!(interp.result_string(), "can't set \"s(x)\": variable isn't array");
    }

    #[test]
    fn append_copies_shared_values() {
        let interp = RawInterp::new();
        let shared = ObjPtr::new_string("a");
        unsafe {
            shared.incr_ref_count();
            interp.set_var2("v", None, shared, VarFlags::empty());
            interp.set_var2("v", None, ObjPtr::new_string("b"), VarFlags::APPEND_VALUE);
            assert_eq!(shared.get().string(), "a");
            shared.decr_ref_count();
        }
        assert_eq!(var(&interp, "v").unwrap(), "ab");
    }

    #[test]
    fn list_element_append() {
        let interp = RawInterp::new();
        unsafe {
            interp.set_var2("l", None, ObjPtr::new_string("x y"), VarFlags::LIST_ELEMENT | VarFlags::APPEND_VALUE);
            interp.set_var2("l", None, ObjPtr::new_string("x y"), VarFlags::LIST_ELEMENT | VarFlags::APPEND_VALUE);
        }
        assert_eq!(var(&interp, "l").unwrap(), "{x y} {x y}");
    }

    #[test]
    fn unset_reports_missing() {
        let interp = RawInterp::new();
        assert_eq!(interp.unset_var2("zz", None, VarFlags::LEAVE_ERR_MSG), ERROR);
        assert_eq!(interp.result_string(), "can't unset \"zz\": no such variable");
    }

    #[test]
    fn wrong_num_args_format() {
        let interp = RawInterp::new();
        let objv = [ObjPtr::new_string("cmd"), ObjPtr::new_string("sub")];
        for p in objv {
            unsafe { p.incr_ref_count() };
        }
        unsafe { interp.wrong_num_args(&objv, 2, Some("value ?extra?")) };
        assert_eq!(interp.result_string(), "wrong # args: should be \"cmd sub value ?extra?\"");
        for p in objv {
            unsafe { p.decr_ref_count() };
        }
    }

    #[test]
    fn subst_break_and_continue() {
        let interp = RawInterp::new();
        interp.eval("set a 1");
        let p = interp.subst("x$a [continue]y [break]z", SubstFlags::ALL).unwrap();
        assert_eq!(unsafe { p.get() }.string(), "x1 y ");
        unsafe { p.decr_ref_count() };
    }

    #[test]
    fn recursion_limit() {
        let interp = RawInterp::new();
        interp.set_recursion_limit(20);
        assert_eq!(interp.eval("proc f {} { f }; f"), ERROR);
        assert_eq!(interp.result_string(), "too many nested evaluations (infinite loop?)");
    }

    #[test]
    fn split_names() {
        assert_eq!(split_var_name("a(b c)"), ("a", Some("b c")));
        assert_eq!(split_var_name("plain"), ("plain", None));
    }

    #[test]
    fn delete_proc_runs_once() {
        use std::cell::Cell;
        thread_local!(static DELETED: Cell<u32> = const { Cell::new(0) });
        fn noop(_: ClientData, _: &RawInterp, _: &[ObjPtr]) -> Code {
            OK
        }
        fn on_delete(_: ClientData) {
            DELETED.with(|d| d.set(d.get() + 1));
        }
        let interp = RawInterp::new();
        interp.create_obj_command("x", noop, std::ptr::null_mut(), Some(on_delete));
        interp.create_obj_command("x", noop, std::ptr::null_mut(), None);
        assert_eq!(DELETED.with(|d| d.get()), 1);
        assert!(interp.delete_command("x"));
        assert!(!interp.command_exists("x"));
        assert_eq!(DELETED.with(|d| d.get()), 1);
    }
}
