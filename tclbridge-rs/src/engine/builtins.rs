//! Core command set registered in every new interpreter.
//!
//! Each command is a plain [`ObjCmdProc`]; only `proc` uses client data
//! (a boxed [`ProcDef`] freed by its delete procedure).

use std::io::Write;
use std::ptr;

use regex::RegexBuilder;

use super::expr::Operand;
use super::interp::{ClientData, ObjCmdProc, RawInterp, SubstFlags, VarFlags};
use super::list;
use super::obj::{parse_int, Obj, ObjPtr};
use super::{Code, BREAK, CONTINUE, ERROR, OK, RETURN};

const COMMANDS: &[(&str, ObjCmdProc)] = &[
    ("set", cmd_set),
    ("unset", cmd_unset),
    ("incr", cmd_incr),
    ("append", cmd_append),
    ("lappend", cmd_lappend),
    ("list", cmd_list),
    ("llength", cmd_llength),
    ("lindex", cmd_lindex),
    ("lrange", cmd_lrange),
    ("concat", cmd_concat),
    ("join", cmd_join),
    ("split", cmd_split),
    ("expr", cmd_expr),
    ("if", cmd_if),
    ("while", cmd_while),
    ("for", cmd_for),
    ("foreach", cmd_foreach),
    ("break", cmd_break),
    ("continue", cmd_continue),
    ("return", cmd_return),
    ("error", cmd_error),
    ("catch", cmd_catch),
    ("proc", cmd_proc),
    ("eval", cmd_eval),
    ("global", cmd_global),
    ("subst", cmd_subst),
    ("info", cmd_info),
    ("string", cmd_string),
    ("regexp", cmd_regexp),
    ("puts", cmd_puts),
    ("source", cmd_source),
];

pub fn register(interp: &RawInterp) {
    for &(name, proc_) in COMMANDS {
        interp.create_obj_command(name, proc_, ptr::null_mut(), None);
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn obj<'a>(p: ObjPtr) -> &'a Obj {
    // SAFETY: command arguments and results handed to these helpers are
    // held by the caller for the duration of the command.
    unsafe { p.get() }
}

fn text(p: ObjPtr) -> String {
    obj(p).string()
}

fn usage(interp: &RawInterp, objv: &[ObjPtr], leading: usize, message: &str) -> Code {
    // SAFETY: objv cells are live for the whole call.
    unsafe { interp.wrong_num_args(objv, leading, Some(message).filter(|m| !m.is_empty())) };
    ERROR
}

fn error(interp: &RawInterp, message: &str) -> Code {
    interp.set_result_string(message);
    ERROR
}

fn set_result(interp: &RawInterp, p: ObjPtr) -> Code {
    // SAFETY: `p` is either fresh or held by the caller.
    unsafe { interp.set_result(p) };
    OK
}

fn operand_obj(value: Operand) -> ObjPtr {
    match value {
        Operand::Int(i) => ObjPtr::new_int(i),
        Operand::Double(d) => ObjPtr::new_double(d),
        Operand::Str(s) => ObjPtr::new_string(s),
    }
}

/// Parse `N`, `end`, `end-N`, `end+N`, `N+M` or `N-M` against a list or
/// string of length `len`.
fn parse_index(index: &str, len: usize) -> Result<i64, String> {
    let bad = || format!("bad index \"{index}\": must be integer?[+-]integer? or end?[+-]integer?");
    let t = index.trim();
    let (base, rest) = match t.strip_prefix("end") {
        Some(rest) => (len as i64 - 1, rest),
        None => {
            let split = t
                .char_indices()
                .skip(1)
                .find(|&(_, c)| c == '+' || c == '-')
                .map_or(t.len(), |(i, _)| i);
            (parse_int(&t[..split]).ok_or_else(bad)?, &t[split..])
        }
    };
    if rest.is_empty() {
        return Ok(base);
    }
    let offset = match rest.as_bytes()[0] {
        b'+' => parse_int(&rest[1..]),
        b'-' => parse_int(&rest[1..]).map(i64::wrapping_neg),
        _ => None,
    }
    .ok_or_else(bad)?;
    Ok(base.wrapping_add(offset))
}

/// Clamp `first..=last` to `0..len`; `None` when the range is empty.
fn clamp_range(first: i64, last: i64, len: usize) -> Option<(usize, usize)> {
    let first = first.max(0);
    let last = last.min(len as i64 - 1);
    if first > last {
        None
    } else {
        Some((first as usize, last as usize))
    }
}

/// Translate a glob pattern (`*`, `?`, `[set]`, `\x`) into an anchored
/// regex.  `None` for an unterminated set.
fn glob_to_regex(pattern: &str) -> Option<String> {
    fn literal(out: &mut String, c: char) {
        out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
    }

    let mut out = String::from("^(?s:");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => literal(&mut out, chars.next().unwrap_or('\\')),
            '[' => {
                let mut set = Vec::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        c => set.push(c),
                    }
                }
                out.push('[');
                let mut i = 0;
                while i < set.len() {
                    if i + 2 < set.len() && set[i + 1] == '-' {
                        literal(&mut out, set[i].min(set[i + 2]));
                        out.push('-');
                        literal(&mut out, set[i].max(set[i + 2]));
                        i += 3;
                    } else {
                        literal(&mut out, set[i]);
                        i += 1;
                    }
                }
                out.push(']');
            }
            c => literal(&mut out, c),
        }
    }
    out.push_str(")$");
    Some(out)
}

pub fn string_match(pattern: &str, text: &str, nocase: bool) -> bool {
    glob_to_regex(pattern)
        .and_then(|re| RegexBuilder::new(&re).case_insensitive(nocase).build().ok())
        .is_some_and(|re| re.is_match(text))
}

fn filtered(names: Vec<String>, pattern: Option<String>) -> ObjPtr {
    let kept = names
        .into_iter()
        .filter(|n| pattern.as_deref().map_or(true, |p| string_match(p, n, false)));
    ObjPtr::new_string(list::merge(kept))
}

/// Run a loop body, mapping its code to what the loop should do next.
/// `Err` carries the code the loop itself completes with.
fn loop_body(interp: &RawInterp, name: &str, body: &str) -> Result<bool, Code> {
    match interp.eval_script(body) {
        OK | CONTINUE => Ok(true),
        BREAK => Ok(false),
        ERROR => {
            interp.add_error_info(&format!(
                "\n    (\"{name}\" body line {})",
                interp.error_line()
            ));
            Err(ERROR)
        }
        code => Err(code),
    }
}

// ── Variables ─────────────────────────────────────────────────────────────────

fn cmd_set(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    match objv.len() {
        2 => match interp.get_var(&text(objv[1]), VarFlags::LEAVE_ERR_MSG) {
            Some(p) => set_result(interp, p),
            None => ERROR,
        },
        3 => {
            // SAFETY: objv[2] is live.
            let stored = unsafe { interp.set_var(&text(objv[1]), objv[2], VarFlags::LEAVE_ERR_MSG) };
            match stored {
                Some(p) => set_result(interp, p),
                None => ERROR,
            }
        }
        _ => usage(interp, objv, 1, "varName ?newValue?"),
    }
}

fn cmd_unset(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    let mut names = &objv[1..];
    let mut flags = VarFlags::LEAVE_ERR_MSG;
    while let Some(&first) = names.first() {
        match text(first).as_str() {
            "-nocomplain" => flags = VarFlags::empty(),
            "--" => {
                names = &names[1..];
                break;
            }
            _ => break,
        }
        names = &names[1..];
    }
    for &name in names {
        if interp.unset_var(&text(name), flags) != OK && !flags.is_empty() {
            return ERROR;
        }
    }
    interp.reset_result();
    OK
}

fn cmd_incr(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 2 && objv.len() != 3 {
        return usage(interp, objv, 1, "varName ?increment?");
    }
    let name = text(objv[1]);
    let amount = match objv.get(2) {
        Some(&p) => match obj(p).get_int(Some(interp)) {
            Ok(i) => i,
            Err(_) => return ERROR,
        },
        None => 1,
    };
    let current = match interp.get_var(&name, VarFlags::empty()) {
        Some(p) => match obj(p).get_int(Some(interp)) {
            Ok(i) => i,
            Err(_) => return ERROR,
        },
        None => 0,
    };
    let value = ObjPtr::new_int(current.wrapping_add(amount));
    // SAFETY: freshly allocated.
    match unsafe { interp.set_var(&name, value, VarFlags::LEAVE_ERR_MSG) } {
        Some(p) => set_result(interp, p),
        None => ERROR,
    }
}

fn append_values(interp: &RawInterp, objv: &[ObjPtr], flags: VarFlags) -> Code {
    let name = text(objv[1]);
    let flags = flags | VarFlags::APPEND_VALUE | VarFlags::LEAVE_ERR_MSG;
    let mut last = None;
    if objv.len() == 2 {
        if let Some(p) = interp.get_var(&name, VarFlags::empty()) {
            if flags.contains(VarFlags::LIST_ELEMENT) && obj(p).list_length(Some(interp)).is_err() {
                return ERROR;
            }
            return set_result(interp, p);
        }
        // SAFETY: freshly allocated.
        last = unsafe { interp.set_var(&name, ObjPtr::new_empty(), flags - VarFlags::LIST_ELEMENT) };
    }
    for &value in &objv[2..] {
        // SAFETY: objv cells are live.
        last = unsafe { interp.set_var(&name, value, flags) };
        if last.is_none() {
            return ERROR;
        }
    }
    match last {
        Some(p) => set_result(interp, p),
        None => ERROR,
    }
}

fn cmd_append(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "varName ?value ...?");
    }
    append_values(interp, objv, VarFlags::empty())
}

fn cmd_lappend(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "varName ?value ...?");
    }
    append_values(interp, objv, VarFlags::LIST_ELEMENT)
}

fn cmd_global(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    for &name in &objv[1..] {
        interp.link_global(&text(name));
    }
    interp.reset_result();
    OK
}

// ── Lists ─────────────────────────────────────────────────────────────────────

fn cmd_list(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    // SAFETY: objv cells are live.
    set_result(interp, unsafe { ObjPtr::new_list(&objv[1..]) })
}

fn cmd_llength(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 2 {
        return usage(interp, objv, 1, "list");
    }
    match obj(objv[1]).list_length(Some(interp)) {
        Ok(n) => set_result(interp, ObjPtr::new_int(n as i64)),
        Err(_) => ERROR,
    }
}

fn cmd_lindex(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "list ?index ...?");
    }
    let mut indices = Vec::new();
    for &p in &objv[2..] {
        let words = if objv.len() == 3 {
            match list::split(&text(p)) {
                Ok(words) => words,
                Err(message) => return error(interp, &message),
            }
        } else {
            vec![text(p)]
        };
        indices.extend(words);
    }

    let mut current = objv[1];
    for index in &indices {
        let len = match obj(current).list_length(Some(interp)) {
            Ok(n) => n,
            Err(_) => return ERROR,
        };
        let i = match parse_index(index, len) {
            Ok(i) => i,
            Err(message) => return error(interp, &message),
        };
        if i < 0 || i as usize >= len {
            interp.reset_result();
            return OK;
        }
        match obj(current).list_index(Some(interp), i as usize) {
            Ok(Some(elem)) => current = elem,
            Ok(None) => {
                interp.reset_result();
                return OK;
            }
            Err(_) => return ERROR,
        }
    }
    set_result(interp, current)
}

fn cmd_lrange(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 4 {
        return usage(interp, objv, 1, "list first last");
    }
    let elems = match obj(objv[1]).list_elements(Some(interp)) {
        Ok(elems) => elems,
        Err(_) => return ERROR,
    };
    let bounds = parse_index(&text(objv[2]), elems.len())
        .and_then(|first| Ok((first, parse_index(&text(objv[3]), elems.len())?)));
    let (first, last) = match bounds {
        Ok(b) => b,
        Err(message) => return error(interp, &message),
    };
    let slice = match clamp_range(first, last, elems.len()) {
        Some((a, b)) => &elems[a..=b],
        None => &[][..],
    };
    // SAFETY: the elements are held by objv[1]'s list rep.
    set_result(interp, unsafe { ObjPtr::new_list(slice) })
}

fn cmd_concat(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    let joined = concat(&objv[1..]);
    set_result(interp, ObjPtr::new_string(joined))
}

fn concat(words: &[ObjPtr]) -> String {
    words
        .iter()
        .map(|&p| text(p).trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn cmd_join(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 2 && objv.len() != 3 {
        return usage(interp, objv, 1, "list ?joinString?");
    }
    let sep = objv.get(2).map_or_else(|| " ".to_owned(), |&p| text(p));
    match obj(objv[1]).list_elements(Some(interp)) {
        Ok(elems) => {
            let parts: Vec<String> = elems.into_iter().map(text).collect();
            set_result(interp, ObjPtr::new_string(parts.join(&sep)))
        }
        Err(_) => ERROR,
    }
}

fn cmd_split(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 2 && objv.len() != 3 {
        return usage(interp, objv, 1, "string ?splitChars?");
    }
    let source = text(objv[1]);
    let chars = objv.get(2).map_or_else(|| " \t\n\r".to_owned(), |&p| text(p));
    let parts: Vec<String> = if source.is_empty() {
        Vec::new()
    } else if chars.is_empty() {
        source.chars().map(String::from).collect()
    } else {
        source.split(|c: char| chars.contains(c)).map(str::to_owned).collect()
    };
    set_result(interp, ObjPtr::new_string(list::merge(parts)))
}

// ── Control flow ──────────────────────────────────────────────────────────────

fn cmd_expr(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "arg ?arg ...?");
    }
    let source = if objv.len() == 2 { text(objv[1]) } else { concat(&objv[1..]) };
    match interp.eval_expr(&source) {
        Ok(value) => set_result(interp, operand_obj(value)),
        Err(code) => code,
    }
}

fn cmd_if(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    let mut i = 1;
    loop {
        let Some(&cond) = objv.get(i) else {
            let after = text(objv[i - 1]);
            return error(interp, &format!("wrong # args: no expression after \"{after}\" argument"));
        };
        let truth = match interp.eval_condition(&text(cond)) {
            Ok(b) => b,
            Err(code) => return code,
        };
        i += 1;
        if objv.get(i).is_some_and(|&p| text(p) == "then") {
            i += 1;
        }
        let Some(&body) = objv.get(i) else {
            let after = text(objv[i - 1]);
            return error(interp, &format!("wrong # args: no script following \"{after}\" argument"));
        };
        if truth {
            return interp.eval_script(&text(body));
        }
        i += 1;
        let Some(&next) = objv.get(i) else {
            interp.reset_result();
            return OK;
        };
        match text(next).as_str() {
            "elseif" => i += 1,
            "else" => {
                return match objv.get(i + 1) {
                    Some(&body) => interp.eval_script(&text(body)),
                    None => error(interp, "wrong # args: no script following \"else\" argument"),
                };
            }
            _ => return interp.eval_script(&text(next)),
        }
    }
}

fn cmd_while(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 3 {
        return usage(interp, objv, 1, "test command");
    }
    let (test, body) = (text(objv[1]), text(objv[2]));
    loop {
        match interp.eval_condition(&test) {
            Ok(true) => {}
            Ok(false) => break,
            Err(code) => return code,
        }
        match loop_body(interp, "while", &body) {
            Ok(true) => {}
            Ok(false) => break,
            Err(code) => return code,
        }
    }
    interp.reset_result();
    OK
}

fn cmd_for(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 5 {
        return usage(interp, objv, 1, "start test next command");
    }
    let (start, test, next, body) = (text(objv[1]), text(objv[2]), text(objv[3]), text(objv[4]));
    let code = interp.eval_script(&start);
    if code != OK {
        return code;
    }
    loop {
        match interp.eval_condition(&test) {
            Ok(true) => {}
            Ok(false) => break,
            Err(code) => return code,
        }
        match loop_body(interp, "for", &body) {
            Ok(true) => {}
            Ok(false) => break,
            Err(code) => return code,
        }
        match interp.eval_script(&next) {
            OK => {}
            BREAK => break,
            code => return code,
        }
    }
    interp.reset_result();
    OK
}

fn cmd_foreach(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 4 || objv.len() % 2 != 0 {
        return usage(interp, objv, 1, "varList list ?varList list ...? command");
    }
    let mut groups = Vec::new();
    for pair in objv[1..objv.len() - 1].chunks(2) {
        let vars = match list::split(&text(pair[0])) {
            Ok(vars) if !vars.is_empty() => vars,
            Ok(_) => return error(interp, "foreach varlist is empty"),
            Err(message) => return error(interp, &message),
        };
        let values = match list::split(&text(pair[1])) {
            Ok(values) => values,
            Err(message) => return error(interp, &message),
        };
        groups.push((vars, values));
    }
    let body = text(objv[objv.len() - 1]);
    let rounds = groups
        .iter()
        .map(|(vars, values)| values.len().div_ceil(vars.len()))
        .max()
        .unwrap_or(0);

    for round in 0..rounds {
        for (vars, values) in &groups {
            for (k, var) in vars.iter().enumerate() {
                let value = values.get(round * vars.len() + k).map_or("", String::as_str);
                // SAFETY: freshly allocated.
                let stored =
                    unsafe { interp.set_var(var, ObjPtr::new_string(value), VarFlags::LEAVE_ERR_MSG) };
                if stored.is_none() {
                    return ERROR;
                }
            }
        }
        match loop_body(interp, "foreach", &body) {
            Ok(true) => {}
            Ok(false) => break,
            Err(code) => return code,
        }
    }
    interp.reset_result();
    OK
}

fn cmd_break(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 1 {
        return usage(interp, objv, 1, "");
    }
    BREAK
}

fn cmd_continue(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 1 {
        return usage(interp, objv, 1, "");
    }
    CONTINUE
}

fn parse_code(name: &str) -> Option<Code> {
    match name {
        "ok" => Some(OK),
        "error" => Some(ERROR),
        "return" => Some(RETURN),
        "break" => Some(BREAK),
        "continue" => Some(CONTINUE),
        other => parse_int(other).and_then(|i| Code::try_from(i).ok()),
    }
}

fn cmd_return(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    let mut code = OK;
    let mut error_code = None;
    let mut error_info = None;
    let mut i = 1;
    while i + 1 < objv.len() {
        let option = text(objv[i]);
        let value = text(objv[i + 1]);
        match option.as_str() {
            "-code" => match parse_code(&value) {
                Some(c) => code = c,
                None => {
                    return error(
                        interp,
                        &format!(
                            "bad completion code \"{value}\": must be ok, error, return, break, continue, or an integer"
                        ),
                    )
                }
            },
            "-errorcode" => error_code = Some(value),
            "-errorinfo" => error_info = Some(value),
            "-level" => {}
            _ => break,
        }
        i += 2;
    }
    match objv.get(i) {
        Some(&value) if i + 1 == objv.len() => {
            set_result(interp, value);
        }
        None => interp.reset_result(),
        Some(_) => return usage(interp, objv, 1, "?-option value ...? ?result?"),
    }
    interp.set_return_options(code, error_code, error_info);
    RETURN
}

fn cmd_error(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if !(2..=4).contains(&objv.len()) {
        return usage(interp, objv, 1, "message ?errorInfo? ?errorCode?");
    }
    set_result(interp, objv[1]);
    if let Some(&info) = objv.get(2) {
        let info = text(info);
        if !info.is_empty() {
            interp.set_error_info(&info);
            interp.set_already_logged();
        }
    }
    if let Some(&code) = objv.get(3) {
        // SAFETY: objv cells are live.
        unsafe { interp.set_error_code(code) };
    }
    ERROR
}

fn cmd_catch(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if !(2..=4).contains(&objv.len()) {
        return usage(interp, objv, 1, "script ?resultVarName? ?optionVarName?");
    }
    let code = interp.eval_script(&text(objv[1]));
    let result = interp.result();
    // SAFETY: keep the result alive across the variable writes below.
    unsafe { result.incr_ref_count() };

    let mut options = vec![
        "-code".to_owned(),
        code.to_string(),
        "-level".to_owned(),
        "0".to_owned(),
    ];
    if code == ERROR {
        for (key, var) in [("-errorcode", "errorCode"), ("-errorinfo", "errorInfo")] {
            let value = interp
                .get_var2(var, None, VarFlags::GLOBAL_ONLY)
                .map(text)
                .unwrap_or_default();
            options.push(key.to_owned());
            options.push(value);
        }
    }

    interp.reset_result();
    let mut status = OK;
    // SAFETY: `result` is held above; the options cell is fresh.
    unsafe {
        if let Some(&var) = objv.get(2) {
            if interp.set_var(&text(var), result, VarFlags::LEAVE_ERR_MSG).is_none() {
                status = ERROR;
            }
        }
        if let Some(&var) = objv.get(3) {
            let opts = ObjPtr::new_string(list::merge(&options));
            if status == OK && interp.set_var(&text(var), opts, VarFlags::LEAVE_ERR_MSG).is_none() {
                status = ERROR;
            }
        }
        result.decr_ref_count();
    }
    if status != OK {
        return status;
    }
    set_result(interp, ObjPtr::new_int(i64::from(code)))
}

fn cmd_eval(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "arg ?arg ...?");
    }
    let script = if objv.len() == 2 { text(objv[1]) } else { concat(&objv[1..]) };
    let code = interp.eval_script(&script);
    if code == ERROR {
        interp.add_error_info(&format!("\n    (\"eval\" body line {})", interp.error_line()));
    }
    code
}

fn cmd_subst(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "?-nobackslashes? ?-nocommands? ?-novariables? string");
    }
    let mut flags = SubstFlags::ALL;
    for &option in &objv[1..objv.len() - 1] {
        match text(option).as_str() {
            "-nobackslashes" => flags.remove(SubstFlags::BACKSLASHES),
            "-nocommands" => flags.remove(SubstFlags::COMMANDS),
            "-novariables" => flags.remove(SubstFlags::VARIABLES),
            other => {
                return error(
                    interp,
                    &format!("bad option \"{other}\": must be -nobackslashes, -nocommands, or -novariables"),
                )
            }
        }
    }
    match interp.subst(&text(objv[objv.len() - 1]), flags) {
        Ok(p) => set_result(interp, p),
        Err(code) => code,
    }
}

// ── Procedures ────────────────────────────────────────────────────────────────

/// A script-defined procedure.
pub struct ProcDef {
    name: String,
    params: Vec<(String, Option<String>)>,
    variadic: bool,
    body: String,
}

impl ProcDef {
    fn signature(&self, invoked_as: &str) -> String {
        let mut parts = vec![invoked_as.to_owned()];
        for (name, default) in &self.params {
            parts.push(match default {
                Some(_) => format!("?{name}?"),
                None => name.clone(),
            });
        }
        if self.variadic {
            parts.push("?arg ...?".to_owned());
        }
        parts.join(" ")
    }
}

fn cmd_proc(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 4 {
        return usage(interp, objv, 1, "name args body");
    }
    let name = text(objv[1]);
    let specs = match list::split(&text(objv[2])) {
        Ok(specs) => specs,
        Err(message) => return error(interp, &message),
    };
    let mut params = Vec::with_capacity(specs.len());
    for spec in specs {
        let fields = match list::split(&spec) {
            Ok(fields) => fields,
            Err(message) => return error(interp, &message),
        };
        match fields.as_slice() {
            [param] => params.push((param.clone(), None)),
            [param, default] => params.push((param.clone(), Some(default.clone()))),
            _ => {
                return error(
                    interp,
                    &format!("too many fields in argument specifier \"{spec}\""),
                )
            }
        }
    }
    let variadic = params.last().is_some_and(|(p, _)| p == "args");
    if variadic {
        params.pop();
    }

    let def = Box::new(ProcDef {
        name: name.clone(),
        params,
        variadic,
        body: text(objv[3]),
    });
    interp.create_obj_command(&name, call_proc, Box::into_raw(def).cast(), Some(delete_proc));
    interp.reset_result();
    OK
}

fn delete_proc(client_data: ClientData) {
    // SAFETY: created by `Box::into_raw` in `cmd_proc` and deleted once.
    drop(unsafe { Box::from_raw(client_data.cast::<ProcDef>()) });
}

fn call_proc(client_data: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    // SAFETY: the command table keeps the definition alive while any
    // invocation of it is running.
    let def = unsafe { &*client_data.cast::<ProcDef>() };
    let args = &objv[1..];
    let required = def.params.iter().filter(|(_, d)| d.is_none()).count();
    if args.len() < required || (!def.variadic && args.len() > def.params.len()) {
        let sig = def.signature(&text(objv[0]));
        return error(interp, &format!("wrong # args: should be \"{sig}\""));
    }

    interp.push_frame();
    for (k, (param, default)) in def.params.iter().enumerate() {
        let value = match (args.get(k), default) {
            (Some(&p), _) => p,
            (None, Some(d)) => ObjPtr::new_string(d.as_str()),
            (None, None) => ObjPtr::new_empty(),
        };
        // SAFETY: `value` is held by objv or freshly allocated.
        unsafe { interp.set_var2(param, None, value, VarFlags::empty()) };
    }
    if def.variadic {
        let rest = args.get(def.params.len()..).unwrap_or(&[]);
        // SAFETY: objv cells are live.
        unsafe { interp.set_var2("args", None, ObjPtr::new_list(rest), VarFlags::empty()) };
    }

    let code = interp.eval_script(&def.body);
    interp.pop_frame();

    match code {
        OK => OK,
        RETURN => interp.update_return_info(),
        ERROR => {
            interp.add_error_info(&format!(
                "\n    (procedure \"{}\" line {})",
                def.name,
                interp.error_line()
            ));
            ERROR
        }
        BREAK => error(interp, "invoked \"break\" outside of a loop"),
        CONTINUE => error(interp, "invoked \"continue\" outside of a loop"),
        other => other,
    }
}

// ── Introspection ─────────────────────────────────────────────────────────────

fn cmd_info(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "subcommand ?arg ...?");
    }
    let pattern = objv.get(2).map(|&p| text(p));
    match text(objv[1]).as_str() {
        "exists" => match (objv.len(), pattern) {
            (3, Some(name)) => {
                let found = interp.var_exists(&name, VarFlags::empty());
                set_result(interp, ObjPtr::new_boolean(found))
            }
            _ => usage(interp, objv, 2, "varName"),
        },
        "commands" if objv.len() <= 3 => set_result(interp, filtered(interp.command_names(), pattern)),
        "vars" if objv.len() <= 3 => set_result(interp, filtered(interp.var_names(), pattern)),
        "level" if objv.len() == 2 => set_result(interp, ObjPtr::new_int(interp.level() as i64)),
        "commands" | "vars" => usage(interp, objv, 2, "?pattern?"),
        "level" => usage(interp, objv, 2, ""),
        other => error(
            interp,
            &format!("unknown or ambiguous subcommand \"{other}\": must be commands, exists, level, or vars"),
        ),
    }
}

// ── Strings ───────────────────────────────────────────────────────────────────

const STRING_SUBCOMMANDS: &str =
    "equal, index, length, match, range, repeat, tolower, toupper, or trim";

/// Largest string `string repeat` will build.
const MAX_STRING_LEN: usize = i32::MAX as usize;

fn cmd_string(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() < 2 {
        return usage(interp, objv, 1, "subcommand ?arg ...?");
    }
    let sub = text(objv[1]);
    let mut args: Vec<String> = objv[2..].iter().map(|&p| text(p)).collect();
    let nocase = args.first().is_some_and(|a| a == "-nocase")
        && matches!(sub.as_str(), "equal" | "match");
    if nocase {
        args.remove(0);
    }
    let fold = |s: &str| if nocase { s.to_lowercase() } else { s.to_owned() };

    let value = match (sub.as_str(), args.as_slice()) {
        ("length", [s]) => ObjPtr::new_int(s.chars().count() as i64),
        ("tolower", [s]) => ObjPtr::new_string(s.to_lowercase()),
        ("toupper", [s]) => ObjPtr::new_string(s.to_uppercase()),
        ("trim", [s]) => ObjPtr::new_string(s.trim()),
        ("trim", [s, set]) => ObjPtr::new_string(s.trim_matches(|c: char| set.contains(c))),
        ("equal", [a, b]) => ObjPtr::new_boolean(fold(a) == fold(b)),
        ("match", [pattern, s]) => ObjPtr::new_boolean(string_match(pattern, s, nocase)),
        ("repeat", [s, count]) => match parse_int(count) {
            Some(n) => {
                let n = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
                if s.len().checked_mul(n).map_or(true, |len| len > MAX_STRING_LEN) {
                    return error(interp, "result exceeds max size");
                }
                ObjPtr::new_string(s.repeat(n))
            }
            None => return error(interp, &format!("expected integer but got \"{count}\"")),
        },
        ("index", [s, index]) => {
            let chars: Vec<char> = s.chars().collect();
            match parse_index(index, chars.len()) {
                Ok(i) if i >= 0 && (i as usize) < chars.len() => {
                    ObjPtr::new_string(chars[i as usize].to_string())
                }
                Ok(_) => ObjPtr::new_empty(),
                Err(message) => return error(interp, &message),
            }
        }
        ("range", [s, first, last]) => {
            let chars: Vec<char> = s.chars().collect();
            let bounds = parse_index(first, chars.len())
                .and_then(|f| Ok((f, parse_index(last, chars.len())?)));
            match bounds {
                Ok((f, l)) => match clamp_range(f, l, chars.len()) {
                    Some((a, b)) => ObjPtr::new_string(chars[a..=b].iter().collect::<String>()),
                    None => ObjPtr::new_empty(),
                },
                Err(message) => return error(interp, &message),
            }
        }
        (
            "length" | "tolower" | "toupper" | "trim" | "equal" | "match" | "repeat" | "index"
            | "range",
            _,
        ) => return usage(interp, objv, 2, string_usage(&sub)),
        (other, _) => {
            return error(
                interp,
                &format!("unknown or ambiguous subcommand \"{other}\": must be {STRING_SUBCOMMANDS}"),
            )
        }
    };
    set_result(interp, value)
}

fn string_usage(sub: &str) -> &'static str {
    match sub {
        "trim" => "string ?chars?",
        "equal" => "?-nocase? string1 string2",
        "match" => "?-nocase? pattern string",
        "repeat" => "string count",
        "index" => "string charIndex",
        "range" => "string first last",
        _ => "string",
    }
}

fn cmd_regexp(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    let mut i = 1;
    let mut nocase = false;
    while let Some(&p) = objv.get(i) {
        match text(p).as_str() {
            "-nocase" => nocase = true,
            "--" => {
                i += 1;
                break;
            }
            _ => break,
        }
        i += 1;
    }
    if objv.len() < i + 2 {
        return usage(interp, objv, 1, "?-switch ...? exp string ?matchVar? ?subMatchVar ...?");
    }
    let re = match RegexBuilder::new(&text(objv[i])).case_insensitive(nocase).build() {
        Ok(re) => re,
        Err(e) => return error(interp, &format!("couldn't compile regular expression pattern: {e}")),
    };
    let subject = text(objv[i + 1]);
    let vars = &objv[i + 2..];

    let Some(caps) = re.captures(&subject) else {
        return set_result(interp, ObjPtr::new_int(0));
    };
    for (k, &var) in vars.iter().enumerate() {
        let matched = caps.get(k).map_or("", |m| m.as_str());
        // SAFETY: freshly allocated.
        let stored =
            unsafe { interp.set_var(&text(var), ObjPtr::new_string(matched), VarFlags::LEAVE_ERR_MSG) };
        if stored.is_none() {
            return ERROR;
        }
    }
    set_result(interp, ObjPtr::new_int(1))
}

// ── I/O ───────────────────────────────────────────────────────────────────────

fn cmd_puts(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    let mut args = &objv[1..];
    let newline = !args.first().is_some_and(|&p| text(p) == "-nonewline");
    if !newline {
        args = &args[1..];
    }
    let (channel, message) = match args {
        [message] => ("stdout".to_owned(), text(*message)),
        [channel, message] => (text(*channel), text(*message)),
        _ => return usage(interp, objv, 1, "?-nonewline? ?channelId? string"),
    };
    let mut line = message;
    if newline {
        line.push('\n');
    }
    let written = match channel.as_str() {
        "stdout" => std::io::stdout().lock().write_all(line.as_bytes()),
        "stderr" => std::io::stderr().lock().write_all(line.as_bytes()),
        other => return error(interp, &format!("can not find channel named \"{other}\"")),
    };
    match written {
        Ok(()) => {
            interp.reset_result();
            OK
        }
        Err(e) => error(interp, &format!("error writing \"{channel}\": {e}")),
    }
}

fn cmd_source(_: ClientData, interp: &RawInterp, objv: &[ObjPtr]) -> Code {
    if objv.len() != 2 {
        return usage(interp, objv, 1, "fileName");
    }
    let path = text(objv[1]);
    let script = match std::fs::read_to_string(&path) {
        Ok(script) => script,
        Err(e) => return error(interp, &format!("couldn't read file \"{path}\": {e}")),
    };
    match interp.eval_script(&script) {
        RETURN => interp.update_return_info(),
        ERROR => {
            interp.add_error_info(&format!("\n    (file \"{path}\" line {})", interp.error_line()));
            ERROR
        }
        code => code,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
