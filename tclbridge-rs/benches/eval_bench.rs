use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tclbridge::{Session, Value};

const LOOP: &str = "set t 0; for {set i 0} {$i < 200} {incr i} { incr t $i }; set t";

fn bench_eval(c: &mut Criterion) {
    let s = Session::new();
    s.create_command("host-add", |_: &Session, args: &[Value]| {
        Ok(args[0].to_int()? + args[1].to_int()?)
    });

    let mut g = c.benchmark_group("eval");
    g.bench_function("script_loop", |b| b.iter(|| s.eval::<i64>(black_box(LOOP))));
    g.bench_function("host_command_loop", |b| {
        b.iter(|| {
            s.eval::<i64>(black_box(
                "set t 0; foreach i {1 2 3 4 5 6 7 8 9 10} { set t [host-add $t $i] }; set t",
            ))
        })
    });
    g.bench_function("proc_call", |b| {
        s.eval::<()>("proc sq {x} { expr {$x * $x} }").ok();
        b.iter(|| s.eval::<i64>(black_box("sq 12")))
    });
    g.finish();
}

fn bench_lists(c: &mut Criterion) {
    let mut g = c.benchmark_group("lists");
    g.bench_function("lappend_1000", |b| {
        b.iter(|| {
            let list = Value::new();
            for i in 0..1000i64 {
                let _ = list.lappend(i);
            }
            list
        })
    });
    g.bench_function("collect_and_decode_1000", |b| {
        b.iter(|| {
            let list: Value = (0..1000i64).collect();
            let text = Value::from(list.as_string());
            text.to_vec::<i64>()
        })
    });
    g.finish();
}

criterion_group!(benches, bench_eval, bench_lists);
criterion_main!(benches);
