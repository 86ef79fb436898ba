//! Owning handle over one engine cell.
//!
//! A [`Value`] holds exactly one reference on its cell and releases it on
//! drop.  Cloning takes another reference to the *same* cell, so handles
//! alias: `set_int` through one clone is visible through every other.
//!
//! ```text
//! Value::from(42)      cell count 1
//! let b = a.clone();   cell count 2   (same cell)
//! drop(a); drop(b);    cell freed
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use crate::engine::{Obj, ObjKind, ObjPtr, RawInterp};
use crate::error::{ConversionError, Error, Result};
use crate::session::SessionInner;

pub struct Value {
    ptr: ObjPtr,
    /// Session the handle came from.  Only used so that coercion failures
    /// also land in that interpreter's result.
    session: Option<Weak<SessionInner>>,
}

impl Value {
    /// New empty value.
    pub fn new() -> Value {
        Value::own(ObjPtr::new_empty())
    }

    fn own(ptr: ObjPtr) -> Value {
        // SAFETY: callers pass live cells (usually freshly allocated).
        unsafe { ptr.incr_ref_count() };
        Value { ptr, session: None }
    }

    /// Wrap an existing cell, taking a new reference.  The original holder
    /// keeps its own reference.
    ///
    /// # Safety
    /// `ptr` must refer to a live cell.
    pub unsafe fn from_raw(ptr: ObjPtr) -> Value {
        Value::own(ptr)
    }

    /// # Safety
    /// `ptr` must refer to a live cell.
    pub(crate) unsafe fn from_raw_in(ptr: ObjPtr, session: Weak<SessionInner>) -> Value {
        let mut value = Value::own(ptr);
        value.session = Some(session);
        value
    }

    pub(crate) fn bind(mut self, session: &Rc<SessionInner>) -> Value {
        self.session = Some(Rc::downgrade(session));
        self
    }

    /// The underlying cell.  Stays valid while this handle lives.
    pub fn as_ptr(&self) -> ObjPtr {
        self.ptr
    }

    fn obj(&self) -> &Obj {
        // SAFETY: this handle owns a reference for as long as `self` lives.
        unsafe { self.ptr.get() }
    }

    /// Run `f` with the bound interpreter, if it is still alive.
    fn with_interp<R>(&self, f: impl FnOnce(Option<&RawInterp>) -> R) -> R {
        let inner = self.session.as_ref().and_then(Weak::upgrade);
        f(inner.as_deref().map(|s| &s.raw))
    }

    fn child(&self, ptr: ObjPtr) -> Value {
        let mut value = Value::own(ptr);
        value.session = self.session.clone();
        value
    }

    pub fn ref_count(&self) -> usize {
        self.obj().ref_count()
    }

    pub fn is_shared(&self) -> bool {
        self.obj().is_shared()
    }

    /// Cached internal representation.
    pub fn kind(&self) -> ObjKind {
        self.obj().kind()
    }

    /// True if both handles refer to the same cell.
    pub fn same_cell(&self, other: &Value) -> bool {
        self.ptr == other.ptr
    }

    // ── Typed reads ───────────────────────────────────────────────────────────

    pub fn to_int(&self) -> Result<i64> {
        self.with_interp(|interp| self.obj().get_int(interp))
            .map_err(|m| ConversionError::new(m).into())
    }

    pub fn to_double(&self) -> Result<f64> {
        self.with_interp(|interp| self.obj().get_double(interp))
            .map_err(|m| ConversionError::new(m).into())
    }

    pub fn to_bool(&self) -> Result<bool> {
        self.with_interp(|interp| self.obj().get_boolean(interp))
            .map_err(|m| ConversionError::new(m).into())
    }

    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }

    /// Integer view, 0 when the value is not an integer.
    pub fn as_int(&self) -> i64 {
        self.obj().get_int(None).unwrap_or(0)
    }

    pub fn as_double(&self) -> f64 {
        self.obj().get_double(None).unwrap_or(0.0)
    }

    pub fn as_bool(&self) -> bool {
        self.obj().get_boolean(None).unwrap_or(false)
    }

    pub fn as_string(&self) -> String {
        self.obj().string()
    }

    // ── In-place writes ───────────────────────────────────────────────────────

    pub fn set_int(&self, i: i64) {
        self.obj().set_int(i);
    }

    pub fn set_double(&self, d: f64) {
        self.obj().set_double(d);
    }

    pub fn set_bool(&self, b: bool) {
        self.obj().set_boolean(b);
    }

    pub fn set_string(&self, s: &str) {
        self.obj().set_string(s);
    }

    /// Replace the contents with a list of `items`.  An item that is, or
    /// contains, this very cell is copied first.
    pub fn set_list(&self, items: &[Value]) {
        let ptrs: Vec<ObjPtr> = items.iter().map(Value::as_ptr).collect();
        // SAFETY: every pointer is held by `items` for the call.
        unsafe { self.obj().set_list(&ptrs) };
    }

    // ── Lists ─────────────────────────────────────────────────────────────────

    /// Append one element.  Fails if the current contents do not parse as
    /// a list.
    pub fn lappend(&self, item: impl Into<Value>) -> Result<()> {
        let item = item.into();
        // SAFETY: `item` holds a reference for the duration of the call.
        self.with_interp(|interp| unsafe { self.obj().list_append(interp, item.ptr) })
            .map_err(|m| ConversionError::new(m).into())
    }

    /// Append each item of `items` as its own element.
    pub fn lappend_all<I, T>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        for item in items {
            self.lappend(item)?;
        }
        Ok(())
    }

    pub fn llength(&self) -> Result<usize> {
        self.with_interp(|interp| self.obj().list_length(interp))
            .map_err(|m| ConversionError::new(m).into())
    }

    /// Element at `index`; `None` when `index` is negative or past the end.
    pub fn lindex(&self, index: i64) -> Result<Option<Value>> {
        let Ok(i) = usize::try_from(index) else {
            self.llength()?;
            return Ok(None);
        };
        let elem = self
            .with_interp(|interp| self.obj().list_index(interp, i))
            .map_err(ConversionError::new)?;
        Ok(elem.map(|p| self.child(p)))
    }

    /// Elements `first..=last` with both ends clamped into the list.  A
    /// clamped end before the start yields the single element at the
    /// start; a start past the end yields nothing.
    pub fn lrange(&self, first: i64, last: i64) -> Result<Vec<Value>> {
        let elems = self.elements()?;
        let len = elems.len() as i64;
        if len == 0 || first >= len {
            return Ok(Vec::new());
        }
        let start = first.max(0);
        let end = last.min(len - 1).max(start);
        Ok(elems
            .into_iter()
            .skip(start as usize)
            .take((end - start + 1) as usize)
            .collect())
    }

    /// Every element, each as its own handle.
    pub fn elements(&self) -> Result<Vec<Value>> {
        let ptrs = self
            .with_interp(|interp| self.obj().list_elements(interp))
            .map_err(ConversionError::new)?;
        Ok(ptrs.into_iter().map(|p| self.child(p)).collect())
    }

    /// Decode every element as `T`.  Any failure aborts the whole decode.
    pub fn to_vec<T: FromValue>(&self) -> Result<Vec<T>> {
        self.elements()?
            .iter()
            .enumerate()
            .map(|(i, elem)| with_context(T::from_value(elem), || format!("element {i}")))
            .collect()
    }

    /// Decode alternating key/value elements.  An odd element count is an
    /// error, never a truncation.
    pub fn to_map<K, V>(&self) -> Result<HashMap<K, V>>
    where
        K: FromValue + Eq + Hash,
        V: FromValue,
    {
        Ok(self.to_pairs()?.into_iter().collect())
    }

    /// [`to_map`](Self::to_map) keeping the list order.
    pub fn to_pairs<K: FromValue, V: FromValue>(&self) -> Result<Vec<(K, V)>> {
        let elems = self.elements()?;
        if elems.len() % 2 != 0 {
            return Err(ConversionError::new("missing value to go with key").into());
        }
        elems
            .chunks(2)
            .map(|pair| {
                let key = K::from_value(&pair[0])?;
                let value = with_context(V::from_value(&pair[1]), || {
                    format!("value for key \"{}\"", pair[0].as_string())
                })?;
                Ok((key, value))
            })
            .collect()
    }

    // ── Collection constructors ───────────────────────────────────────────────

    /// List of the set's elements, in the set's iteration order.
    pub fn from_set<T: Into<Value>, S>(set: HashSet<T, S>) -> Value {
        set.into_iter().collect()
    }

    /// Flat key/value list of the map's entries, in iteration order.
    pub fn from_map<I, K, V>(map: I) -> Value
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut items = Vec::new();
        for (key, value) in map {
            items.push(Value::from(key.as_ref()));
            items.push(value.into());
        }
        list_of(items)
    }
}

fn with_context<T>(result: Result<T>, context: impl FnOnce() -> String) -> Result<T> {
    result.map_err(|e| match e {
        Error::Conversion(c) if c.context.is_none() => Error::Conversion(c.with_context(context())),
        other => other,
    })
}

fn list_of(items: Vec<Value>) -> Value {
    let ptrs: Vec<ObjPtr> = items.iter().map(Value::as_ptr).collect();
    // SAFETY: every element is held by `items` until the list has taken
    // its own references.
    Value::own(unsafe { ObjPtr::new_list(&ptrs) })
}

impl Default for Value {
    fn default() -> Self {
        Value::new()
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        self.child(self.ptr)
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        // SAFETY: releases the reference taken in `own`; the only
        // decrement site for handles.
        unsafe { self.ptr.decr_ref_count() };
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&self.as_string()).finish()
    }
}

/// Values compare by string representation.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.same_cell(other) || self.as_string() == other.as_string()
    }
}

impl PartialEq<str> for Value {
    fn eq(&self, other: &str) -> bool {
        self.as_string() == other
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        self.as_string() == *other
    }
}

// ── Construction from host values ─────────────────────────────────────────────

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::own(ObjPtr::new_int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::from(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::from(n as i64)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::own(ObjPtr::new_double(d))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::own(ObjPtr::new_boolean(b))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::own(ObjPtr::new_string(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::own(ObjPtr::new_string(s))
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::from(s.as_str())
    }
}

impl From<&Value> for Value {
    fn from(v: &Value) -> Self {
        v.clone()
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        items.into_iter().collect()
    }
}

impl<T: Into<Value>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        list_of(iter.into_iter().map(Into::into).collect())
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Fallible decoding of a [`Value`] into a host type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for () {
    fn from_value(_: &Value) -> Result<Self> {
        Ok(())
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.as_string())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.to_int()
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = value.to_int()?;
        i32::try_from(wide).map_err(|_| {
            ConversionError::new(format!("integer value too large to represent: \"{wide}\"")).into()
        })
    }
}

impl FromValue for usize {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = value.to_int()?;
        usize::try_from(wide).map_err(|_| {
            ConversionError::new(format!("expected non-negative integer but got \"{wide}\"")).into()
        })
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.to_double()
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.to_bool()
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Result<Self> {
        value.to_vec()
    }
}

impl<K: FromValue + Eq + Hash, V: FromValue> FromValue for HashMap<K, V> {
    fn from_value(value: &Value) -> Result<Self> {
        value.to_map()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
