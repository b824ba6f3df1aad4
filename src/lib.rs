//! Spesh - speculative specializing optimizer for a register-based
//! dynamic-language VM.
//!
//! The optimizer consumes a per-routine control-flow graph annotated with
//! statically-inferred facts and rewrites it in place for one particular
//! argument profile. It performs:
//!
//! - **Flow-sensitive fact propagation**: a dominator-order walk, so facts a
//!   block establishes reach everything it dominates in one pass
//! - **Per-opcode rewrites**: method-lookup devirtualization, type-check and
//!   branch folding, representation-id predicates, boxing/decont/HLL
//!   coercions, logged-lexical promotion into spesh slots
//! - **Speculative call optimization**: resolving callees through invocation
//!   specs and the multi-dispatch cache, then inlining a matched
//!   specialization or pinning the invoke to it
//! - **Cleanup**: fixed-point dead-instruction elimination, unreachable-block
//!   elimination (inlined blocks excepted), unused log-guard removal
//!
//! Alongside the optimizer live the callsite interner (shape equality as
//! pointer equality) and the spesh-slot side table of constants the rewritten
//! code refers to.
//!
//! # Example
//!
//! ```rust
//! use spesh::{Facts, GraphBuilder, HllId, Op, Operand, Optimizer, RegRef, Value};
//!
//! // r1 = coerce_in r0, where r0 is known to hold the integer 3.
//! let mut b = GraphBuilder::new(HllId(0));
//! let entry = b.entry();
//! let coerce = b.push(entry, Op::CoerceIn, vec![
//!     Operand::Reg(RegRef::new(1, 0)),
//!     Operand::Reg(RegRef::new(0, 0)),
//! ]);
//! b.push(entry, Op::ReturnN, vec![Operand::Reg(RegRef::new(1, 0))]);
//! b.set_facts(RegRef::new(0, 0), Facts::known_value(Value::Int(3)));
//! let mut g = b.finish();
//!
//! Optimizer::new().optimize(&mut g)?;
//!
//! // The coercion folded to a float constant load.
//! assert_eq!(g.ins(coerce).op, Op::ConstN64);
//! # Ok::<(), spesh::SpeshError>(())
//! ```

pub mod call_opt;
pub mod callsite;
pub mod dead_code;
pub mod graph;
pub mod inline;
pub mod ir;
pub mod manipulate;
pub mod model;
pub mod optimize;
pub mod rewrite;

pub use call_opt::{CallInfo, MAX_ARGS_FOR_OPT};
pub use callsite::{
    Callsite, CallsiteFlags, CallsiteInterner, CommonCallsiteId, INTERN_ARITY_LIMIT,
};
pub use graph::{BasicBlock, GraphBuilder, LogGuard, SpeshGraph, LOG_RUNS};
pub use ir::{
    BlockId, FactFlags, Facts, Ins, InsId, Op, OpDescriptor, Operand, OperandKind, RegRef,
};
pub use model::{
    ArgGuard, BoolMode, BoolSpec, CodeBody, ContainerSpec, GuardKind, HllId, InvocationSpec,
    MultiCacheEntry, ObjBody, ObjRef, ReprId, STable, SpeshCandidate, SpeshHook, StRef,
    StaticFrame, Value, VmObject, VmString,
};
pub use optimize::{Optimizer, OptimizerConfig};

use thiserror::Error;

/// Fatal VM invariant violations. A skipped rewrite is never an error; these
/// only arise when the optimizer is handed something it must not see.
#[derive(Error, Debug)]
pub enum SpeshError {
    #[error("get_common_callsite: id {0} unknown")]
    UnknownCommonCallsite(u32),

    #[error("Spesh: unhandled invoke instruction {0}")]
    UnhandledInvoke(Op),
}

pub type Result<T> = std::result::Result<T, SpeshError>;
