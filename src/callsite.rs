//! Callsite descriptors and the process-wide interner.
//!
//! A callsite describes the shape of a call: one flag byte per argument,
//! the positional count, and the names of any named arguments. Interning
//! dedups descriptors so that shape equality becomes pointer equality, which
//! is what the call optimizer's candidate matching relies on. The intern
//! table is not a hot path; a single mutex guards all access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::model::VmString;
use crate::{Result, SpeshError};

bitflags! {
    /// Per-argument kind and modifier flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallsiteFlags: u8 {
        const OBJ   = 1;
        const INT   = 2;
        const NUM   = 4;
        const STR   = 8;
        const NAMED = 32;
        const FLAT  = 64;
    }
}

/// Callsites at or above this arity are never interned.
pub const INTERN_ARITY_LIMIT: usize = 8;

/// An immutable descriptor of a call's argument shape.
#[derive(Debug)]
pub struct Callsite {
    pub arg_flags: Vec<CallsiteFlags>,
    pub num_pos: usize,
    pub arg_count: usize,
    pub has_flattening: bool,
    pub arg_names: Option<Vec<VmString>>,
    is_interned: AtomicBool,
}

impl Callsite {
    /// A positionals-only callsite.
    pub fn positional(kinds: Vec<CallsiteFlags>) -> Arc<Callsite> {
        Arc::new(Callsite {
            num_pos: kinds.len(),
            arg_count: kinds.len(),
            arg_flags: kinds,
            has_flattening: false,
            arg_names: None,
            is_interned: AtomicBool::new(false),
        })
    }

    /// Positionals followed by named arguments; each named argument occupies
    /// a name/value pair in the argument list.
    pub fn with_nameds(
        pos: Vec<CallsiteFlags>,
        nameds: Vec<(VmString, CallsiteFlags)>,
    ) -> Arc<Callsite> {
        let num_pos = pos.len();
        let arg_count = num_pos + 2 * nameds.len();
        let mut arg_flags = pos;
        let mut arg_names = Vec::with_capacity(nameds.len());
        for (name, kind) in nameds {
            arg_flags.push(kind | CallsiteFlags::NAMED);
            arg_names.push(name);
        }
        Arc::new(Callsite {
            arg_flags,
            num_pos,
            arg_count,
            has_flattening: false,
            arg_names: Some(arg_names),
            is_interned: AtomicBool::new(false),
        })
    }

    /// Named arguments whose names are not yet known; such shapes cannot be
    /// interned until the compiler fills the names in.
    pub fn with_unknown_nameds(
        pos: Vec<CallsiteFlags>,
        named_kinds: Vec<CallsiteFlags>,
    ) -> Arc<Callsite> {
        let num_pos = pos.len();
        let arg_count = num_pos + 2 * named_kinds.len();
        let mut arg_flags = pos;
        for kind in named_kinds {
            arg_flags.push(kind | CallsiteFlags::NAMED);
        }
        Arc::new(Callsite {
            arg_flags,
            num_pos,
            arg_count,
            has_flattening: false,
            arg_names: None,
            is_interned: AtomicBool::new(false),
        })
    }

    /// A callsite with argument flattening; such shapes cannot be interned.
    pub fn flattening(kinds: Vec<CallsiteFlags>) -> Arc<Callsite> {
        Arc::new(Callsite {
            num_pos: kinds.len(),
            arg_count: kinds.len(),
            arg_flags: kinds,
            has_flattening: true,
            arg_names: None,
            is_interned: AtomicBool::new(false),
        })
    }

    pub fn num_nameds(&self) -> usize {
        (self.arg_count - self.num_pos) / 2
    }

    pub fn num_flags(&self) -> usize {
        self.num_pos + self.num_nameds()
    }

    pub fn is_interned(&self) -> bool {
        self.is_interned.load(Ordering::Relaxed)
    }

    fn mark_interned(&self) {
        self.is_interned.store(true, Ordering::Relaxed);
    }
}

fn callsites_equal(a: &Callsite, b: &Callsite, num_flags: usize, num_nameds: usize) -> bool {
    if a.arg_flags[..num_flags] != b.arg_flags[..num_flags] {
        return false;
    }
    for i in 0..num_nameds {
        let a_name = &a.arg_names.as_ref().expect("interned callsite lost names")[i];
        let b_name = &b.arg_names.as_ref().expect("callsite with nameds lost names")[i];
        if a_name != b_name {
            return false;
        }
    }
    true
}

/// Named constants for predefined callsites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonCallsiteId {
    /// Invocant only: a single object argument.
    InvArg = 0,
}

/// The arity-indexed intern table.
pub struct CallsiteInterner {
    interns: Mutex<[Vec<Arc<Callsite>>; INTERN_ARITY_LIMIT]>,
    common_callsites: Vec<Arc<Callsite>>,
}

impl CallsiteInterner {
    /// An interner pre-populated with the common callsites.
    pub fn new() -> Self {
        let mut this = CallsiteInterner {
            interns: Mutex::new(Default::default()),
            common_callsites: Vec::new(),
        };
        let mut inv_arg = Callsite::positional(vec![CallsiteFlags::OBJ]);
        this.try_intern(&mut inv_arg);
        this.common_callsites = vec![inv_arg];
        this
    }

    /// Replaces `*cs_ptr` with an already-interned equivalent if one exists,
    /// dropping the caller's duplicate; otherwise stores it for the future.
    /// Shapes with flattening, with unknown names for named arguments, or at
    /// or above the arity limit are left untouched.
    pub fn try_intern(&self, cs_ptr: &mut Arc<Callsite>) {
        if cs_ptr.has_flattening {
            return;
        }
        let num_nameds = cs_ptr.num_nameds();
        if num_nameds > 0 && cs_ptr.arg_names.is_none() {
            return;
        }
        let num_flags = cs_ptr.num_flags();
        if num_flags >= INTERN_ARITY_LIMIT {
            return;
        }

        let mut interns = self.interns.lock().unwrap();
        let bucket = &mut interns[num_flags];
        for existing in bucket.iter() {
            if callsites_equal(existing, cs_ptr, num_flags, num_nameds) {
                *cs_ptr = Arc::clone(existing);
                return;
            }
        }
        // Grow by 8 to amortize reallocation.
        if bucket.len() == bucket.capacity() {
            bucket.reserve_exact(8);
        }
        cs_ptr.mark_interned();
        bucket.push(Arc::clone(cs_ptr));
    }

    /// A predefined callsite by typed id.
    pub fn common(&self, id: CommonCallsiteId) -> Arc<Callsite> {
        Arc::clone(&self.common_callsites[id as usize])
    }

    /// A predefined callsite by raw id, as received across the opcode
    /// stream; an unknown id is a VM invariant violation.
    pub fn common_by_id(&self, id: u32) -> Result<Arc<Callsite>> {
        self.common_callsites
            .get(id as usize)
            .cloned()
            .ok_or(SpeshError::UnknownCommonCallsite(id))
    }

    /// Number of interned callsites of the given arity.
    pub fn interned_count(&self, arity: usize) -> usize {
        self.interns.lock().unwrap()[arity].len()
    }
}

impl Default for CallsiteInterner {
    fn default() -> Self {
        Self::new()
    }
}
