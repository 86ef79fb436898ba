//! End-to-end behaviour of the value handle, the session and the command
//! bridge, driven through scripts.

use std::collections::HashMap;

use tclbridge::engine::{obj_stats, ERROR, OK};
use tclbridge::{arg, check_arity, Error, Session, SessionConfig, Signal, SubstFlags, Value, VarFlags};

fn session() -> Session {
    let s = Session::new();
    s.create_command("double-or-fail", |_: &Session, args: &[Value]| {
        check_arity(args, 1, Some(1), "number")?;
        Ok(args[0].to_double()? * 2.0)
    });
    s
}

// ── Value handles ─────────────────────────────────────────────────────────────

#[test]
fn scalar_round_trips() {
    let s = Session::new();
    assert_eq!(s.value(i64::MIN).to_int().unwrap(), i64::MIN);
    assert_eq!(s.value(-0.125).to_double().unwrap(), -0.125);
    assert!(!s.value(false).to_bool().unwrap());
    assert_eq!(s.value("a {b} c").as_string(), "a {b} c");
}

#[test]
fn sequential_appends() {
    let s = Session::new();
    let list = s.value(Value::new());
    let items = ["x", "y z", "", "{"];
    for item in items {
        list.lappend(item).unwrap();
    }
    assert_eq!(list.llength().unwrap(), items.len());
    for (i, item) in items.iter().enumerate() {
        assert_eq!(list.lindex(i as i64).unwrap().unwrap().as_string(), *item);
    }
    assert!(list.lindex(items.len() as i64).unwrap().is_none());
    s.set_var("l", &list).unwrap();
    assert_eq!(s.eval::<i64>("llength $l").unwrap(), 4);
    assert_eq!(s.eval::<String>("lindex $l 1").unwrap(), "y z");
}

#[test]
fn lrange_clamps() {
    let list: Value = (0..5).map(|i| i as i64).collect();
    let ints = |vals: Vec<Value>| vals.iter().map(|v| v.to_int().unwrap()).collect::<Vec<_>>();
    assert_eq!(ints(list.lrange(2, 99).unwrap()), [2, 3, 4]);
    assert_eq!(ints(list.lrange(-3, 1).unwrap()), [0, 1]);
    assert!(list.lrange(5, 9).unwrap().is_empty());
}

#[test]
fn map_decode() {
    let s = Session::new();
    let pairs = s.eval_value("list a 1 b 2").unwrap();
    let map: HashMap<String, i64> = pairs.to_map().unwrap();
    assert_eq!(map, HashMap::from([("a".to_owned(), 1), ("b".to_owned(), 2)]));

    let odd = s.eval_value("list a 1 b").unwrap();
    let err = odd.to_map::<String, i64>().unwrap_err();
    assert_eq!(err.to_string(), "missing value to go with key");

    let bad = s.eval_value("list a 1 b two").unwrap();
    assert!(bad.to_map::<String, i64>().is_err());
}

#[test]
fn handles_freed_exactly_once() {
    let s = Session::new();
    let before = obj_stats();
    {
        let v = s.value("payload");
        let handles: Vec<Value> = (0..16).map(|_| v.clone()).collect();
        assert!(handles.iter().all(|h| h.same_cell(&v)));
        assert_eq!(v.ref_count(), 17);
        s.set_var("p", &handles[3]).unwrap();
        drop(v);
        drop(handles);
        assert_eq!(s.var::<String>("p").unwrap(), "payload");
        s.unset_var("p").unwrap();
    }
    let after = obj_stats();
    assert_eq!(after.live(), before.live());
}

#[test]
fn handle_mutation_is_shared() {
    let s = Session::new();
    let a = s.value(1);
    let b = a.clone();
    b.set_int(9);
    assert_eq!(a.to_int().unwrap(), 9);
    s.set_var("v", &a).unwrap();
    a.set_string("changed");
    assert_eq!(s.var::<String>("v").unwrap(), "changed");
}

#[test]
fn element_write_is_seen_by_both_list_views() {
    let s = Session::new();
    s.eval::<()>("set l {a b}; llength $l").unwrap();
    let e = s.eval_value("lindex $l 0").unwrap();
    e.set_string("zz");
    assert_eq!(s.eval::<String>("set l").unwrap(), "zz b");
    assert_eq!(s.eval::<String>("lindex $l 0").unwrap(), "zz");
}

#[test]
fn mutual_appends_terminate_and_free() {
    let before = obj_stats();
    {
        let a = Value::from("a");
        let b = Value::from("b");
        a.lappend(&b).unwrap();
        b.lappend(&a).unwrap();
        assert_eq!(a.as_string(), "a b");
        assert_eq!(b.as_string(), "b {a b}");
    }
    assert_eq!(obj_stats().live(), before.live());
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[test]
fn double_or_fail_reports_conversion_error() {
    let s = session();
    assert_eq!(s.eval::<f64>("double-or-fail 2.25").unwrap(), 4.5);

    assert_eq!(s.raw().eval("double-or-fail abc"), ERROR);
    assert_eq!(s.result_string(), "expected floating-point number but got \"abc\"");

    match s.eval::<f64>("double-or-fail abc") {
        Err(Error::Interp(env)) => {
            assert_eq!(env.message, "expected floating-point number but got \"abc\"");
            assert_eq!(env.error_code, "NONE");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn too_few_arguments() {
    let s = session();
    assert_eq!(s.raw().eval("double-or-fail"), ERROR);
    assert_eq!(s.result_string(), "wrong # args: should be \"double-or-fail number\"");
    assert_eq!(s.raw().eval("double-or-fail 1 2"), ERROR);

    // Seen outside a command, the same error reads the same way.
    let err = check_arity(&[], 1, Some(1), "number").unwrap_err();
    assert_eq!(err.to_string(), "wrong # args: should be \"number\"");
}

#[test]
fn break_from_closure_reaches_caller() {
    let s = session();
    s.create_command("halt", |_: &Session, _: &[Value]| Ok(Signal::Break));
    let sum = s
        .eval::<i64>("set n 0; while 1 { incr n; if {$n == 3} { halt } }; set n")
        .unwrap();
    assert_eq!(sum, 3);

    let err = s.eval::<()>("halt").unwrap_err();
    assert!(matches!(err, Error::Break), "{err:?}");
    assert_eq!(err.signal(), Some(Signal::Break));
    assert!(err.envelope().is_none());
}

#[test]
fn callbacks_can_eval_and_touch_variables() {
    let s = session();
    s.create_command("accumulate", |s: &Session, args: &[Value]| {
        let n: i64 = arg(args, 0)?;
        s.set_var2("total", None, n, VarFlags::GLOBAL_ONLY | VarFlags::LIST_ELEMENT | VarFlags::APPEND_VALUE)?;
        s.eval::<i64>("expr [join $::total +]")
    });
    assert_eq!(s.eval::<i64>("accumulate 1").unwrap(), 1);
    assert_eq!(s.eval::<i64>("foreach i {2 3} { accumulate $i }; accumulate 4").unwrap(), 10);
    assert_eq!(s.var::<Vec<i64>>("total").unwrap(), [1, 2, 3, 4]);
}

#[test]
fn catch_sees_host_errors() {
    let s = session();
    s.create_command("reject", |_: &Session, args: &[Value]| {
        Err::<(), _>(Error::with_code(format!("rejected {}", args.len()), "HOST REJECT"))
    });
    let code = s
        .eval::<i64>("catch {reject a b} msg opts")
        .unwrap();
    assert_eq!(code, 1);
    assert_eq!(s.var::<String>("msg").unwrap(), "rejected 2");
    let opts: HashMap<String, String> = s.var("opts").unwrap();
    assert_eq!(opts["-errorcode"], "HOST REJECT");
}

#[test]
fn unknown_hook_dispatches_to_host() {
    let s = session();
    s.create_command("unknown", |_: &Session, args: &[Value]| {
        Ok(format!("unknown:{}", args[0]))
    });
    assert_eq!(s.eval::<String>("frob 1 2").unwrap(), "unknown:frob");
}

#[test]
fn procs_call_host_commands() {
    let s = session();
    let out = s
        .eval::<String>("proc twice {x} { return [double-or-fail $x] }; twice 21")
        .unwrap();
    assert_eq!(out.parse::<f64>().unwrap(), 42.0);
    let err = s.eval::<()>("twice nope").unwrap_err();
    let info = &err.envelope().unwrap().error_info;
    assert!(info.contains("(procedure \"twice\" line 1)"), "{info}");
}

// ── Session ───────────────────────────────────────────────────────────────────

#[test]
fn sessions_are_independent() {
    let a = Session::new();
    let b = Session::new();
    a.set_var("x", 1).unwrap();
    a.create_command("only-a", |_: &Session, _: &[Value]| Ok(()));
    assert!(b.try_var::<i64>("x").is_none());
    assert!(!b.has_command("only-a"));
}

#[test]
fn subst_with_host_command() {
    let s = session();
    s.set_var("n", 4).unwrap();
    let v = s.subst("n=$n doubled=[double-or-fail $n]", SubstFlags::ALL).unwrap();
    assert_eq!(v.as_string(), "n=4 doubled=8.0");
}

#[test]
fn raw_codes_stay_inside() {
    let s = session();
    assert_eq!(s.raw().eval("set ok 1"), OK);
    assert!(matches!(s.eval::<()>("proc p {} { return -code 42 }; p"), Err(Error::Protocol(42))));
    assert!(matches!(s.eval::<()>("continue"), Err(Error::Continue)));
}

#[test]
fn runaway_recursion_is_an_ordinary_error() {
    let s = Session::new();
    let err = s.eval::<()>("proc r {} { r }; r").unwrap_err();
    assert_eq!(
        err.envelope().map(|e| e.message.as_str()),
        Some("too many nested evaluations (infinite loop?)")
    );
    // The session is still usable afterwards.
    assert_eq!(s.eval::<i64>("expr {1 + 1}").unwrap(), 2);
}

#[test]
fn diagnostics_config_does_not_change_results() {
    let s = Session::with_config(SessionConfig::new().diagnostics(true));
    let err = s.eval::<()>("error loud").unwrap_err();
    assert_eq!(err.to_string(), "loud");
}
