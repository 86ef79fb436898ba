//! Reference-counted, dual-ported value cells.
//!
//! A cell carries a string representation and an internal representation
//! (integer, double, boolean, list, or none).  Either side is regenerated
//! from the other on demand, so `"42"` read as an integer caches `Int(42)`
//! and an `Int(42)` read as a string caches `"42"`.
//!
//! Cells are heap allocated and reached through the `Copy` pointer
//! [`ObjPtr`].  The pointer does not own anything; holders call
//! [`ObjPtr::incr_ref_count`] and [`ObjPtr::decr_ref_count`] explicitly.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use super::interp::RawInterp;
use super::{ensure_sufficient_stack, list};

// ── Instrumentation ───────────────────────────────────────────────────────────

/// Per-thread allocation counters, used to verify reference-count discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjStats {
    pub allocated: u64,
    pub freed: u64,
}

impl ObjStats {
    /// Cells allocated on this thread and not yet freed.
    pub fn live(&self) -> u64 {
        self.allocated - self.freed
    }
}

thread_local! {
    static STATS: Cell<ObjStats> = const { Cell::new(ObjStats { allocated: 0, freed: 0 }) };
    /// Advances on every in-place write; orders writes against cached list strings.
    static EPOCH: Cell<u64> = const { Cell::new(0) };
}

/// Snapshot of the allocation counters for the current thread.
pub fn obj_stats() -> ObjStats {
    STATS.with(|s| s.get())
}

fn record(f: impl FnOnce(&mut ObjStats)) {
    STATS.with(|s| {
        let mut stats = s.get();
        f(&mut stats);
        s.set(stats);
    });
}

fn epoch() -> u64 {
    EPOCH.with(Cell::get)
}

fn tick() -> u64 {
    EPOCH.with(|e| {
        let next = e.get() + 1;
        e.set(next);
        next
    })
}

// ── Representation ────────────────────────────────────────────────────────────

/// Which internal representation a cell currently caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Untyped,
    Int,
    Double,
    Boolean,
    List,
}

/// Owned list payload; each element holds one reference.
struct ListRep(Vec<ObjPtr>);

impl Drop for ListRep {
    fn drop(&mut self) {
        for p in self.0.drain(..) {
            // SAFETY: every element was incremented when it entered the list.
            unsafe { p.decr_ref_count() };
        }
    }
}

enum Internal {
    None,
    Int(i64),
    Double(f64),
    Boolean(bool),
    List(ListRep),
}

struct Rep {
    bytes: Option<String>,
    /// Epoch at which `bytes` was last written.  A list's cached string is
    /// stale once any cell below it was modified after this.
    stamp: u64,
    internal: Internal,
}

/// A value cell.  Only ever accessed through an [`ObjPtr`].
pub struct Obj {
    ref_count: Cell<usize>,
    /// Epoch of the last in-place write to this cell.
    modified: Cell<u64>,
    rep: RefCell<Rep>,
}

impl Drop for Obj {
    fn drop(&mut self) {
        record(|s| s.freed += 1);
    }
}

/// Raw pointer to an engine cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjPtr(NonNull<Obj>);

impl ObjPtr {
    fn alloc(bytes: Option<String>, internal: Internal) -> ObjPtr {
        let obj = Box::new(Obj {
            ref_count: Cell::new(0),
            modified: Cell::new(0),
            rep: RefCell::new(Rep {
                bytes,
                stamp: epoch(),
                internal,
            }),
        });
        record(|s| s.allocated += 1);
        ObjPtr(NonNull::from(Box::leak(obj)))
    }

    /// New empty-string cell with a reference count of zero.
    pub fn new_empty() -> ObjPtr {
        Self::alloc(Some(String::new()), Internal::None)
    }

    pub fn new_string(s: impl Into<String>) -> ObjPtr {
        Self::alloc(Some(s.into()), Internal::None)
    }

    pub fn new_int(i: i64) -> ObjPtr {
        Self::alloc(None, Internal::Int(i))
    }

    pub fn new_double(d: f64) -> ObjPtr {
        Self::alloc(None, Internal::Double(d))
    }

    pub fn new_boolean(b: bool) -> ObjPtr {
        Self::alloc(None, Internal::Boolean(b))
    }

    /// New list cell holding a reference on each element.
    ///
    /// # Safety
    /// Every pointer in `elems` must refer to a live cell.
    pub unsafe fn new_list(elems: &[ObjPtr]) -> ObjPtr {
        for e in elems {
            e.incr_ref_count();
        }
        Self::alloc(None, Internal::List(ListRep(elems.to_vec())))
    }

    /// # Safety
    /// The cell must be live.
    pub unsafe fn incr_ref_count(self) {
        let obj = self.0.as_ref();
        obj.ref_count.set(obj.ref_count.get() + 1);
    }

    /// Drops one reference, freeing the cell when none remain.
    ///
    /// # Safety
    /// The cell must be live, and the caller must own the reference it
    /// releases (a zero-count cell may be released once by its creator).
    pub unsafe fn decr_ref_count(self) {
        let obj = self.0.as_ref();
        let count = obj.ref_count.get();
        if count <= 1 {
            drop(Box::from_raw(self.0.as_ptr()));
        } else {
            obj.ref_count.set(count - 1);
        }
    }

    /// Borrow the cell.
    ///
    /// # Safety
    /// The cell must stay live for `'a`.
    pub unsafe fn get<'a>(self) -> &'a Obj {
        &*self.0.as_ptr()
    }

    pub fn as_raw(self) -> *const Obj {
        self.0.as_ptr()
    }
}

// ── Cell operations ───────────────────────────────────────────────────────────

fn fail(interp: Option<&RawInterp>, message: String) -> String {
    if let Some(interp) = interp {
        interp.set_result_string(&message);
    }
    message
}

impl Obj {
    pub fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count.get() > 1
    }

    pub fn kind(&self) -> ObjKind {
        match self.rep.borrow().internal {
            Internal::None => ObjKind::Untyped,
            Internal::Int(_) => ObjKind::Int,
            Internal::Double(_) => ObjKind::Double,
            Internal::Boolean(_) => ObjKind::Boolean,
            Internal::List(_) => ObjKind::List,
        }
    }

    /// String representation, generated from the internal one if needed.
    /// A list regenerates its string when an element was written in place
    /// since the string was cached.
    pub fn string(&self) -> String {
        {
            let rep = self.rep.borrow();
            if let Some(s) = &rep.bytes {
                let stale = match &rep.internal {
                    Internal::List(l) => changed_since(&l.0, rep.stamp),
                    _ => false,
                };
                if !stale {
                    return s.clone();
                }
            }
        }
        let generated = match &self.rep.borrow().internal {
            Internal::None => String::new(),
            Internal::Int(i) => i.to_string(),
            Internal::Double(d) => format_double(*d),
            Internal::Boolean(b) => String::from(if *b { "1" } else { "0" }),
            // SAFETY: list elements are kept alive by the list's references.
            Internal::List(l) => ensure_sufficient_stack(|| {
                list::merge(l.0.iter().map(|p| unsafe { p.get() }.string()))
            }),
        };
        let mut rep = self.rep.borrow_mut();
        rep.bytes = Some(generated.clone());
        rep.stamp = epoch();
        generated
    }

    /// Whether `target` is an element of this list, at any depth.
    fn contains(&self, target: *const Obj) -> bool {
        match &self.rep.borrow().internal {
            Internal::List(l) => l.0.iter().any(|p| {
                // SAFETY: list elements are kept alive by the list's references.
                std::ptr::eq(p.as_raw(), target) || unsafe { p.get() }.contains(target)
            }),
            _ => false,
        }
    }

    /// What to store when `elem` goes into this list: `elem` itself, or a
    /// copy when storing it would make the list contain itself.
    ///
    /// # Safety
    /// `elem` must refer to a live cell.
    unsafe fn storable(&self, elem: ObjPtr) -> ObjPtr {
        if std::ptr::eq(elem.as_raw(), self) {
            self.duplicate()
        } else if elem.get().contains(self) {
            ObjPtr::new_string(elem.get().string())
        } else {
            elem
        }
    }

    fn touch(&self) {
        self.modified.set(tick());
    }

    /// Cache a scalar internal rep.  List reps are left alone: callers may
    /// still hold borrowed element pointers.
    fn cache(&self, internal: Internal) {
        let mut rep = self.rep.borrow_mut();
        if !matches!(rep.internal, Internal::List(_)) {
            rep.internal = internal;
        }
    }

    fn replace_internal(&self, internal: Internal, bytes: Option<String>) {
        let old = {
            let mut rep = self.rep.borrow_mut();
            rep.bytes = bytes;
            rep.stamp = epoch();
            std::mem::replace(&mut rep.internal, internal)
        };
        drop(old);
    }

    /// Integer view.  On failure the canonical message is also left in
    /// `interp`'s result when one is given.
    pub fn get_int(&self, interp: Option<&RawInterp>) -> Result<i64, String> {
        if let Internal::Int(i) = self.rep.borrow().internal {
            return Ok(i);
        }
        let text = self.string();
        match parse_int(&text) {
            Some(i) => {
                self.cache(Internal::Int(i));
                Ok(i)
            }
            None => Err(fail(interp, format!("expected integer but got \"{text}\""))),
        }
    }

    pub fn get_double(&self, interp: Option<&RawInterp>) -> Result<f64, String> {
        match self.rep.borrow().internal {
            Internal::Double(d) => return Ok(d),
            Internal::Int(i) => return Ok(i as f64),
            _ => {}
        }
        let text = self.string();
        match parse_double(&text) {
            Some(d) => {
                self.cache(Internal::Double(d));
                Ok(d)
            }
            None => Err(fail(
                interp,
                format!("expected floating-point number but got \"{text}\""),
            )),
        }
    }

    pub fn get_boolean(&self, interp: Option<&RawInterp>) -> Result<bool, String> {
        match self.rep.borrow().internal {
            Internal::Boolean(b) => return Ok(b),
            Internal::Int(i) => return Ok(i != 0),
            Internal::Double(d) => return Ok(d != 0.0),
            _ => {}
        }
        let text = self.string();
        match parse_boolean(&text) {
            Some(b) => {
                self.cache(Internal::Boolean(b));
                Ok(b)
            }
            None => Err(fail(interp, format!("expected boolean value but got \"{text}\""))),
        }
    }

    // ── In-place writes (visible through every alias) ─────────────────────────

    pub fn set_string(&self, s: &str) {
        self.replace_internal(Internal::None, Some(s.to_owned()));
        self.touch();
    }

    pub fn set_int(&self, i: i64) {
        self.replace_internal(Internal::Int(i), None);
        self.touch();
    }

    pub fn set_double(&self, d: f64) {
        self.replace_internal(Internal::Double(d), None);
        self.touch();
    }

    pub fn set_boolean(&self, b: bool) {
        self.replace_internal(Internal::Boolean(b), None);
        self.touch();
    }

    /// Replace the contents with `elems`.  An element that is or contains
    /// this cell is stored as a copy.
    ///
    /// # Safety
    /// Every pointer in `elems` must refer to a live cell.
    pub unsafe fn set_list(&self, elems: &[ObjPtr]) {
        let items: Vec<ObjPtr> = elems.iter().map(|&e| self.storable(e)).collect();
        for e in &items {
            e.incr_ref_count();
        }
        self.replace_internal(Internal::List(ListRep(items)), None);
        self.touch();
    }

    pub fn append_string(&self, s: &str) {
        let mut text = self.string();
        text.push_str(s);
        self.set_string(&text);
    }

    /// Fresh unshared copy (reference count zero).
    pub fn duplicate(&self) -> ObjPtr {
        let rep = self.rep.borrow();
        let internal = match &rep.internal {
            Internal::None => Internal::None,
            Internal::Int(i) => Internal::Int(*i),
            Internal::Double(d) => Internal::Double(*d),
            Internal::Boolean(b) => Internal::Boolean(*b),
            Internal::List(l) => {
                for p in &l.0 {
                    // SAFETY: elements are live while the source list holds them.
                    unsafe { p.incr_ref_count() };
                }
                Internal::List(ListRep(l.0.clone()))
            }
        };
        let copy = ObjPtr::alloc(rep.bytes.clone(), internal);
        // SAFETY: freshly allocated.
        unsafe { copy.get() }.rep.borrow_mut().stamp = rep.stamp;
        copy
    }

    // ── List view ─────────────────────────────────────────────────────────────

    fn ensure_list(&self, interp: Option<&RawInterp>) -> Result<(), String> {
        if matches!(self.rep.borrow().internal, Internal::List(_)) {
            return Ok(());
        }
        let text = self.string();
        let words = list::split(&text).map_err(|m| fail(interp, m))?;
        let items = words
            .into_iter()
            .map(|w| {
                let p = ObjPtr::new_string(w);
                // SAFETY: freshly allocated.
                unsafe { p.incr_ref_count() };
                p
            })
            .collect();
        self.replace_internal(Internal::List(ListRep(items)), Some(text));
        Ok(())
    }

    /// Borrowed element pointers.  They stay valid until the list is
    /// modified or freed; take a reference to keep one longer.
    pub fn list_elements(&self, interp: Option<&RawInterp>) -> Result<Vec<ObjPtr>, String> {
        self.ensure_list(interp)?;
        match &self.rep.borrow().internal {
            Internal::List(l) => Ok(l.0.clone()),
            _ => Ok(Vec::new()),
        }
    }

    pub fn list_length(&self, interp: Option<&RawInterp>) -> Result<usize, String> {
        self.ensure_list(interp)?;
        match &self.rep.borrow().internal {
            Internal::List(l) => Ok(l.0.len()),
            _ => Ok(0),
        }
    }

    /// Borrowed element at `index`, `None` when out of range.
    pub fn list_index(
        &self,
        interp: Option<&RawInterp>,
        index: usize,
    ) -> Result<Option<ObjPtr>, String> {
        self.ensure_list(interp)?;
        match &self.rep.borrow().internal {
            Internal::List(l) => Ok(l.0.get(index).copied()),
            _ => Ok(None),
        }
    }

    /// Append one element, taking a reference on it.  Appending a list to
    /// itself, or to a list nested inside it, appends a copy.
    ///
    /// # Safety
    /// `elem` must refer to a live cell.
    pub unsafe fn list_append(&self, interp: Option<&RawInterp>, elem: ObjPtr) -> Result<(), String> {
        self.ensure_list(interp)?;
        let elem = self.storable(elem);
        elem.incr_ref_count();
        {
            let mut rep = self.rep.borrow_mut();
            if let Internal::List(l) = &mut rep.internal {
                l.0.push(elem);
            }
            rep.bytes = None;
        }
        self.touch();
        Ok(())
    }
}

/// Whether any cell under `elems` was written after `stamp`.
fn changed_since(elems: &[ObjPtr], stamp: u64) -> bool {
    elems.iter().any(|p| {
        // SAFETY: list elements are kept alive by the list's references.
        let e = unsafe { p.get() };
        e.modified.get() > stamp
            || match &e.rep.borrow().internal {
                Internal::List(l) => changed_since(&l.0, stamp),
                _ => false,
            }
    })
}

// ── Scalar parsing ────────────────────────────────────────────────────────────

/// Parse an integer the way the script language reads one: optional
/// surrounding whitespace and sign, `0x`/`0o`/`0b` radix prefixes.
pub fn parse_int(text: &str) -> Option<i64> {
    let t = text.trim();
    let (neg, digits) = match t.as_bytes().first()? {
        b'-' => (true, &t[1..]),
        b'+' => (false, &t[1..]),
        _ => (false, t),
    };
    let (radix, body) = match digits.get(..2) {
        Some("0x" | "0X") => (16, &digits[2..]),
        Some("0o" | "0O") => (8, &digits[2..]),
        Some("0b" | "0B") => (2, &digits[2..]),
        _ => (10, digits),
    };
    if body.is_empty() || !body.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i128::from_str_radix(body, radix).ok()?;
    let value = if neg { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

pub fn parse_double(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    if let Some(i) = parse_int(t) {
        return Some(i as f64);
    }
    // Decimal forms plus the special values the engine prints.
    let lower = t.to_ascii_lowercase();
    match lower.trim_start_matches(['+', '-']) {
        "inf" | "infinity" | "nan" => {}
        s if s.starts_with(|c: char| c.is_ascii_digit() || c == '.') => {}
        _ => return None,
    }
    t.parse::<f64>().ok()
}

pub fn parse_boolean(text: &str) -> Option<bool> {
    let t = text.trim();
    if let Some(i) = parse_int(t) {
        return Some(i != 0);
    }
    if let Some(d) = parse_double(t) {
        return Some(d != 0.0);
    }
    match t.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Shortest round-trip form, always distinguishable from an integer.
pub fn format_double(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_owned()
    } else if d.is_infinite() {
        String::from(if d > 0.0 { "Inf" } else { "-Inf" })
    } else {
        format!("{d:?}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
