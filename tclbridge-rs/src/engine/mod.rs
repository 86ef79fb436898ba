//! In-process Tcl-style scripting engine.
//!
//! The engine speaks the same dialect a C scripting library would: raw cell
//! pointers with manual reference counts, integer completion codes, command
//! procedures taking an opaque client-data pointer.  Everything above this
//! module (the [`Value`](crate::Value) handle, the [`Session`](crate::Session),
//! the command trampoline) goes through the surface re-exported here.
//!
//! Cell lifecycle:
//!
//! ```text
//! ObjPtr::new_*()        count 0, nobody owns it yet
//! incr_ref_count()       count 1, one holder
//! decr_ref_count()       count 0, freed
//! ```

pub mod builtins;
pub mod expr;
pub mod interp;
pub mod list;
pub mod obj;
pub mod parse;

pub use interp::{
    ClientData, CmdDeleteProc, ObjCmdProc, RawInterp, SubstFlags, VarFlags,
};
pub use obj::{obj_stats, Obj, ObjKind, ObjPtr, ObjStats};

/// Raw completion code returned by every engine entry point.
pub type Code = i32;

pub const OK: Code = 0;
pub const ERROR: Code = 1;
pub const RETURN: Code = 2;
pub const BREAK: Code = 3;
pub const CONTINUE: Code = 4;

/// Grow the stack when less than this remains.
const RED_ZONE: usize = 100 * 1024;

/// Size of each new stack segment.
const STACK_PER_RECURSION: usize = 1024 * 1024;

/// Run `f` on a stack with at least [`RED_ZONE`] bytes left, growing it
/// first if needed.  Wraps every recursive entry point (nested scripts,
/// nested expressions) so the recursion limit is reached before the
/// native stack runs out.
#[inline]
pub(crate) fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}
