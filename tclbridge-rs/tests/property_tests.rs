use proptest::prelude::*;
use tclbridge::engine::list;
use tclbridge::engine::obj_stats;
use tclbridge::{Session, Value};

proptest! {
    /// Reading a scalar back through its own accessor is lossless.
    #[test]
    fn int_round_trip(n in any::<i64>()) {
        prop_assert_eq!(Value::from(n).to_int().unwrap(), n);
        // Through the string form too.
        prop_assert_eq!(Value::from(n.to_string()).to_int().unwrap(), n);
    }

    #[test]
    fn double_round_trip(d in any::<f64>().prop_filter("finite", |d| d.is_finite())) {
        prop_assert_eq!(Value::from(d).to_double().unwrap(), d);
        let text = Value::from(d).as_string();
        prop_assert_eq!(Value::from(text).to_double().unwrap(), d);
    }

    #[test]
    fn bool_round_trip(b in any::<bool>()) {
        prop_assert_eq!(Value::from(b).to_bool().unwrap(), b);
    }

    #[test]
    fn string_round_trip(s in "\\PC*") {
        prop_assert_eq!(Value::from(s.as_str()).as_string(), s);
    }
}

proptest! {
    /// Appending N items yields length N with each item at its index.
    #[test]
    fn appends_index_in_order(items in prop::collection::vec("\\PC{0,8}", 0..24)) {
        let list = Value::new();
        for item in &items {
            list.lappend(item.as_str()).unwrap();
        }
        prop_assert_eq!(list.llength().unwrap(), items.len());
        for (i, item) in items.iter().enumerate() {
            prop_assert_eq!(list.lindex(i as i64).unwrap().unwrap().as_string(), item.clone());
        }
        // The string form re-parses to the same elements.
        let reparsed = Value::from(list.as_string());
        prop_assert_eq!(reparsed.to_vec::<String>().unwrap(), items);
    }

    /// `lrange` clamps both ends into the list.
    #[test]
    fn lrange_clamping(len in 0usize..16, first in -8i64..24, extra in 0i64..16) {
        let list: Value = (0..len as i64).collect();
        let n = len as i64;
        let last = n + extra;
        let got: Vec<i64> = list.lrange(first, last).unwrap().iter().map(|v| v.to_int().unwrap()).collect();
        let start = first.max(0);
        let expected: Vec<i64> = if start >= n { Vec::new() } else { (start..n).collect() };
        prop_assert_eq!(got.len() as i64, (n - start).max(0));
        prop_assert_eq!(got, expected);
    }

    /// Even pair lists decode completely; odd ones never decode at all.
    #[test]
    fn pair_decoding(keys in prop::collection::hash_set("[a-z]{1,6}", 0..10), odd in any::<bool>()) {
        let mut flat: Vec<Value> = Vec::new();
        for (i, k) in keys.iter().enumerate() {
            flat.push(Value::from(k.as_str()));
            flat.push(Value::from(i as i64));
        }
        if odd {
            flat.push(Value::from("dangling"));
        }
        let list = Value::from(flat);
        let decoded = list.to_map::<String, i64>();
        if odd {
            prop_assert!(decoded.is_err());
        } else {
            let map = decoded.unwrap();
            prop_assert_eq!(map.len(), keys.len());
            for (i, k) in keys.iter().enumerate() {
                prop_assert_eq!(map[k], i as i64);
            }
        }
    }

    /// Splitting a merged list gives back the original elements.
    #[test]
    fn list_merge_split(items in prop::collection::vec("\\PC{0,10}", 0..12)) {
        let merged = list::merge(items.iter());
        prop_assert_eq!(list::split(&merged).unwrap(), items);
    }

    /// Cloning and dropping handles never leaks or double-frees.
    #[test]
    fn handle_clones_balance(copies in 1usize..32) {
        let before = obj_stats();
        {
            let v = Value::from("cell");
            let all: Vec<Value> = (0..copies).map(|_| v.clone()).collect();
            prop_assert_eq!(v.ref_count(), copies + 1);
            drop(all);
        }
        prop_assert_eq!(obj_stats().live(), before.live());
    }

    /// The engine never panics on arbitrary scripts.
    #[test]
    fn eval_does_not_panic(script in "[ -~]{0,40}") {
        let s = Session::new();
        let _ = s.eval::<tclbridge::Value>(&script);
    }
}
