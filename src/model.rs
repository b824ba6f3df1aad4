//! The slice of the VM object model the optimizer collaborates with.
//!
//! The optimizer never allocates user-visible objects; it only inspects
//! metadata hanging off a type's shared table: representation id, method
//! cache, type-check cache, boolification spec, container spec and invocation
//! spec. Handles are reference-counted and compared by pointer identity,
//! which is the same contract the guard matcher and the callsite interner
//! rely on.

use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::callsite::Callsite;
use crate::graph::SpeshGraph;
use crate::ir::{BlockId, InsId};

/// VM string handle. Equality is by content, per VM string semantics.
pub type VmString = Arc<str>;

/// Shared-table handle; identity comparisons use `Rc::ptr_eq`.
pub type StRef = Rc<STable>;

/// Object handle.
pub type ObjRef = Rc<VmObject>;

/// Per-representation / per-container specialization hook: given the shared
/// table it hangs off, it may rewrite the instruction in place.
pub type SpeshHook = fn(&StRef, &mut SpeshGraph, BlockId, InsId);

/// High-level-language context a type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HllId(pub u32);

/// Representation ids, as a closed enum rather than scattered constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReprId {
    Array,
    Hash,
    Int,
    Num,
    Str,
    Code,
    Opaque,
    MultiCache,
}

/// How an object boolifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolMode {
    UnboxInt,
    UnboxNum,
    UnboxStrNotEmpty,
    UnboxStrNotEmptyOrZero,
    BigInt,
    Iter,
    HasElems,
    NotTypeObject,
    /// Requires calling into the VM; never evaluable at optimization time.
    CallMethod,
}

#[derive(Debug, Clone, Copy)]
pub struct BoolSpec {
    pub mode: BoolMode,
}

/// Container behavior of a type.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub fetch_never_invokes: bool,
    pub spesh: Option<SpeshHook>,
}

/// How to find the code object when invoking a non-code object. Single
/// dispatch goes straight through `class_handle`/`attr_name`/`hint`; multi
/// dispatch first consults the `md_valid`/`md_cache` attribute pair.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub class_handle: Option<ObjRef>,
    pub attr_name: VmString,
    pub hint: i64,
    pub md_class_handle: Option<ObjRef>,
    pub md_valid_attr_name: VmString,
    pub md_valid_hint: i64,
    pub md_cache_attr_name: VmString,
    pub md_cache_hint: i64,
}

impl InvocationSpec {
    /// Single-dispatch spec: the code object lives in the named attribute.
    pub fn single_dispatch(class_handle: ObjRef, attr_name: &str) -> Self {
        InvocationSpec {
            class_handle: Some(class_handle),
            attr_name: VmString::from(attr_name),
            hint: -1,
            md_class_handle: None,
            md_valid_attr_name: VmString::from(""),
            md_valid_hint: -1,
            md_cache_attr_name: VmString::from(""),
            md_cache_hint: -1,
        }
    }

    /// Multi-dispatch spec: validity and cache attributes on the dispatcher.
    pub fn multi_dispatch(
        md_class_handle: ObjRef,
        md_valid_attr_name: &str,
        md_cache_attr_name: &str,
    ) -> Self {
        InvocationSpec {
            class_handle: None,
            attr_name: VmString::from(""),
            hint: -1,
            md_class_handle: Some(md_class_handle),
            md_valid_attr_name: VmString::from(md_valid_attr_name),
            md_valid_hint: -1,
            md_cache_attr_name: VmString::from(md_cache_attr_name),
            md_cache_hint: -1,
        }
    }
}

/// Shared per-type table.
#[derive(Debug)]
pub struct STable {
    pub repr: ReprId,
    pub hll_owner: HllId,
    /// Authoritative method cache, when published by the meta-object.
    pub method_cache: Option<FxHashMap<VmString, ObjRef>>,
    /// Authoritative type-check cache: the set of types this type checks
    /// against. `None` means no cache, so checks are indeterminate here.
    pub type_check_cache: Option<Vec<StRef>>,
    pub boolification: Option<BoolSpec>,
    pub container: Option<ContainerSpec>,
    pub invocation: Option<InvocationSpec>,
    /// Representation-specific specialization hook.
    pub repr_spesh: Option<SpeshHook>,
}

impl STable {
    pub fn new(repr: ReprId, hll_owner: HllId) -> Self {
        STable {
            repr,
            hll_owner,
            method_cache: None,
            type_check_cache: None,
            boolification: None,
            container: None,
            invocation: None,
            repr_spesh: None,
        }
    }

    pub fn into_ref(self) -> StRef {
        Rc::new(self)
    }
}

/// A tagged value as tracked in the facts table and attribute bodies.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Num(f64),
    Str(VmString),
    Obj(ObjRef),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&VmString> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&ObjRef> {
        match self {
            Value::Obj(v) => Some(v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The body payload of an object, by representation.
#[derive(Debug)]
pub enum ObjBody {
    Empty,
    Int(i64),
    Num(f64),
    Str(VmString),
    List(Vec<Value>),
    Attrs(FxHashMap<VmString, Value>),
    Code(CodeBody),
    MultiCache(Vec<MultiCacheEntry>),
}

#[derive(Debug)]
pub struct CodeBody {
    pub sf: Rc<StaticFrame>,
    pub is_compiler_stub: bool,
}

/// One memoized multi-dispatch outcome.
#[derive(Debug)]
pub struct MultiCacheEntry {
    pub cs: Arc<Callsite>,
    pub result: ObjRef,
}

#[derive(Debug)]
pub struct VmObject {
    pub st: StRef,
    pub concrete: bool,
    pub body: ObjBody,
}

impl VmObject {
    pub fn type_object(st: StRef) -> ObjRef {
        Rc::new(VmObject {
            st,
            concrete: false,
            body: ObjBody::Empty,
        })
    }

    pub fn instance(st: StRef, body: ObjBody) -> ObjRef {
        Rc::new(VmObject {
            st,
            concrete: true,
            body,
        })
    }

    pub fn code(st: StRef, sf: Rc<StaticFrame>) -> ObjRef {
        Rc::new(VmObject {
            st,
            concrete: true,
            body: ObjBody::Code(CodeBody {
                sf,
                is_compiler_stub: false,
            }),
        })
    }

    pub fn code_body(&self) -> Option<&CodeBody> {
        match &self.body {
            ObjBody::Code(cb) => Some(cb),
            _ => None,
        }
    }

    /// Attribute fetch; the class handle and hint select a storage class in
    /// the full VM, but a flat attribute body needs only the name.
    pub fn get_attribute(
        &self,
        _class_handle: Option<&ObjRef>,
        name: &str,
        _hint: i64,
    ) -> Option<Value> {
        match &self.body {
            ObjBody::Attrs(attrs) => attrs.get(name).cloned(),
            _ => None,
        }
    }
}

/// Evaluates an object's truthiness at optimization time. `None` means the
/// boolification mode cannot be decided without running code.
pub fn coerce_istrue(obj: &ObjRef) -> Option<bool> {
    let mode = obj
        .st
        .boolification
        .map(|b| b.mode)
        .unwrap_or(BoolMode::NotTypeObject);
    match mode {
        BoolMode::CallMethod => None,
        BoolMode::UnboxInt | BoolMode::BigInt => match &obj.body {
            ObjBody::Int(i) => Some(*i != 0),
            _ => None,
        },
        BoolMode::UnboxNum => match &obj.body {
            ObjBody::Num(n) => Some(*n != 0.0),
            _ => None,
        },
        BoolMode::UnboxStrNotEmpty => match &obj.body {
            ObjBody::Str(s) => Some(!s.is_empty()),
            _ => None,
        },
        BoolMode::UnboxStrNotEmptyOrZero => match &obj.body {
            ObjBody::Str(s) => Some(!s.is_empty() && &**s != "0"),
            _ => None,
        },
        BoolMode::Iter | BoolMode::HasElems => match &obj.body {
            ObjBody::List(v) => Some(!v.is_empty()),
            _ => None,
        },
        BoolMode::NotTypeObject => Some(obj.concrete),
    }
}

/// Consults a type's published method cache only; no fallback dispatch.
pub fn find_method_cache_only(st: &StRef, name: &str) -> Option<ObjRef> {
    st.method_cache.as_ref()?.get(name).cloned()
}

/// Whether the type can do `name`, if an authoritative cache is published.
pub fn can_method_cache_only(st: &StRef, name: &str) -> Option<bool> {
    st.method_cache
        .as_ref()
        .map(|cache| cache.contains_key(name))
}

/// Type-check via the cache only. `None` when the checked object's type has
/// no authoritative cache.
pub fn try_cache_type_check(obj_st: &StRef, type_st: &StRef) -> Option<bool> {
    obj_st
        .type_check_cache
        .as_ref()
        .map(|cache| cache.iter().any(|c| Rc::ptr_eq(c, type_st)))
}

/// Looks up a memoized multi-dispatch outcome for the in-flight call. The
/// runtime cache also refines on argument types; the optimizer's probe keys
/// on the interned callsite, which pointer-identifies the shape.
pub fn multi_cache_find_spesh(
    cache: &ObjRef,
    cs: &Arc<Callsite>,
) -> Option<ObjRef> {
    match &cache.body {
        ObjBody::MultiCache(entries) => entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.cs, cs))
            .map(|e| e.result.clone()),
        _ => None,
    }
}

/// Kinds of argument guard a specialization candidate may impose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    Conc,
    Type,
    DcConc,
    DcType,
}

/// A precondition on one argument slot.
#[derive(Debug, Clone)]
pub struct ArgGuard {
    pub kind: GuardKind,
    pub slot: u16,
    pub expected: StRef,
}

/// One specialization of a static frame for a particular argument profile.
#[derive(Debug, Clone)]
pub struct SpeshCandidate {
    pub cs: Arc<Callsite>,
    pub guards: Vec<ArgGuard>,
    /// Specialized graph recorded when the candidate was produced; the
    /// inliner clones it when splicing the callee into a caller.
    pub inline_graph: Option<Box<SpeshGraph>>,
}

/// The static (per-routine) frame data the call optimizer consults.
#[derive(Debug)]
pub struct StaticFrame {
    pub name: VmString,
    pub cuid: VmString,
    pub spesh_candidates: Vec<SpeshCandidate>,
}

impl StaticFrame {
    pub fn new(name: &str, cuid: &str) -> Self {
        StaticFrame {
            name: VmString::from(name),
            cuid: VmString::from(cuid),
            spesh_candidates: Vec::new(),
        }
    }
}
