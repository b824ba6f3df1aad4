//! Argument tracking and speculative call optimization.
//!
//! While walking a block the driver maintains a sliding [`CallInfo`] record
//! of the call currently being assembled: the callsite latched by `prepargs`
//! and the facts behind each argument slot. When the invoke arrives and the
//! callee's value is known, the optimizer resolves it to a concrete code
//! object, matches the call against the callee's existing specializations,
//! and either inlines the matched candidate or pins the invoke to it.

use std::rc::Rc;
use std::sync::Arc;

use smallvec::smallvec;
use tracing::debug;

use crate::callsite::Callsite;
use crate::graph::SpeshGraph;
use crate::ir::{BlockId, FactFlags, InsId, Op, Operand, RegRef};
use crate::manipulate::insert_ins_after;
use crate::model::{multi_cache_find_spesh, CodeBody, GuardKind, ObjRef, ReprId, Value};
use crate::optimize::OptimizerConfig;
use crate::{inline, Result, SpeshError};

/// Argument slots beyond this are ignored for optimization purposes.
pub const MAX_ARGS_FOR_OPT: usize = 4;

/// Sliding record of the call being assembled in the current block. Reset by
/// each `prepargs`.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub cs: Option<Arc<Callsite>>,
    pub prepargs_ins: Option<InsId>,
    /// Per-slot source register, for fact lookups at match time.
    pub arg_facts: [Option<RegRef>; MAX_ARGS_FOR_OPT],
    pub arg_ins: [Option<InsId>; MAX_ARGS_FOR_OPT],
    pub arg_is_const: [bool; MAX_ARGS_FOR_OPT],
}

impl CallInfo {
    pub fn reset(&mut self, cs: Arc<Callsite>, prepargs_ins: InsId) {
        *self = CallInfo {
            cs: Some(cs),
            prepargs_ins: Some(prepargs_ins),
            ..CallInfo::default()
        };
    }

    pub fn record_arg(&mut self, idx: usize, reg: RegRef, ins: InsId) {
        self.arg_is_const[idx] = false;
        self.arg_facts[idx] = Some(reg);
        self.arg_ins[idx] = Some(ins);
    }

    pub fn record_const_arg(&mut self, idx: usize, ins: InsId) {
        self.arg_is_const[idx] = true;
        self.arg_facts[idx] = None;
        self.arg_ins[idx] = Some(ins);
    }
}

/// Resolves the invoked value to a concrete code object, unpacking the
/// invocation spec for single dispatch and probing the multi cache for multi
/// dispatch. `None` when no resolution is possible without running code.
fn resolve_code_object(code: &ObjRef, info: &CallInfo) -> Option<ObjRef> {
    if code.st.repr == ReprId::Code {
        return Some(code.clone());
    }
    let is = code.st.invocation.as_ref()?;
    if let Some(md_class) = &is.md_class_handle {
        // Multi dispatch: only usable when the dispatcher says its cache is
        // valid, and the cache has an entry for this callsite.
        let valid = code.get_attribute(Some(md_class), &is.md_valid_attr_name, is.md_valid_hint)?;
        if valid.as_int().unwrap_or(0) == 0 {
            return None;
        }
        let cache = code
            .get_attribute(Some(md_class), &is.md_cache_attr_name, is.md_cache_hint)?
            .as_obj()?
            .clone();
        let found = multi_cache_find_spesh(&cache, info.cs.as_ref()?)?;
        if found.st.repr == ReprId::Code {
            return Some(found);
        }
        // One more level of unpacking through the found object's own spec.
        let m_is = found.st.invocation.as_ref()?;
        m_is.class_handle.as_ref()?;
        let dest = found.get_attribute(m_is.class_handle.as_ref(), &m_is.attr_name, m_is.hint)?;
        let obj = dest.as_obj()?;
        (obj.st.repr == ReprId::Code).then(|| obj.clone())
    } else if is.class_handle.is_some() {
        // Single dispatch: the code object sits in an attribute.
        let dest = code.get_attribute(is.class_handle.as_ref(), &is.attr_name, is.hint)?;
        let obj = dest.as_obj()?;
        (obj.st.repr == ReprId::Code).then(|| obj.clone())
    } else {
        None
    }
}

/// Finds a specialization of the callee whose callsite is this exact interned
/// descriptor and whose guards all hold against the tracked argument facts.
fn try_find_spesh_candidate(g: &SpeshGraph, code: &CodeBody, info: &CallInfo) -> Option<usize> {
    let cs = info.cs.as_ref()?;
    'candidates: for (i, cand) in code.sf.spesh_candidates.iter().enumerate() {
        if !Arc::ptr_eq(&cand.cs, cs) {
            continue;
        }
        for guard in &cand.guards {
            let slot = guard.slot as usize;
            let reg = if slot < MAX_ARGS_FOR_OPT {
                info.arg_facts[slot]
            } else {
                None
            };
            let Some(reg) = reg else {
                continue 'candidates;
            };
            let facts = g.facts_direct(reg);
            let holds = match guard.kind {
                GuardKind::Conc => {
                    facts.flags.contains(FactFlags::CONCRETE)
                        && facts.flags.contains(FactFlags::KNOWN_TYPE)
                        && facts
                            .type_
                            .as_ref()
                            .is_some_and(|t| Rc::ptr_eq(t, &guard.expected))
                }
                GuardKind::Type => {
                    facts.flags.contains(FactFlags::TYPEOBJ)
                        && facts.flags.contains(FactFlags::KNOWN_TYPE)
                        && facts
                            .type_
                            .as_ref()
                            .is_some_and(|t| Rc::ptr_eq(t, &guard.expected))
                }
                GuardKind::DcConc => {
                    facts.flags.contains(FactFlags::DECONT_CONCRETE)
                        && facts.flags.contains(FactFlags::KNOWN_DECONT_TYPE)
                        && facts
                            .decont_type
                            .as_ref()
                            .is_some_and(|t| Rc::ptr_eq(t, &guard.expected))
                }
                GuardKind::DcType => {
                    facts.flags.contains(FactFlags::DECONT_TYPEOBJ)
                        && facts.flags.contains(FactFlags::KNOWN_DECONT_TYPE)
                        && facts
                            .decont_type
                            .as_ref()
                            .is_some_and(|t| Rc::ptr_eq(t, &guard.expected))
                }
            };
            if !holds {
                continue 'candidates;
            }
        }
        return Some(i);
    }
    None
}

/// Drives optimization of one invoke instruction.
pub(crate) fn optimize_call(
    g: &mut SpeshGraph,
    bb: BlockId,
    ins_id: InsId,
    callee_idx: usize,
    info: &CallInfo,
    config: &OptimizerConfig,
) -> Result<()> {
    // Ensure we know what we are going to be invoking.
    let callee_reg = g.ins(ins_id).operands[callee_idx].reg();
    let code = {
        let facts = g.facts_mut(callee_reg);
        if !facts.flags.contains(FactFlags::KNOWN_VALUE) {
            return Ok(());
        }
        match &facts.value {
            Some(Value::Obj(obj)) => obj.clone(),
            _ => return Ok(()),
        }
    };

    let target = resolve_code_object(&code, info);

    // If resolution found something better than the invoked value itself,
    // load it from a spesh slot, rebinding the callee operand. The original
    // lookup chain stays; the dead-instruction pass reclaims what it can.
    if let Some(target) = &target {
        let is_stub = target
            .code_body()
            .is_some_and(|cb| cb.is_compiler_stub);
        if !Rc::ptr_eq(target, &code) && !is_stub {
            let ss = g.add_spesh_slot(Some(target.clone()));
            let callee_operand = g.ins(ins_id).operands[callee_idx].clone();
            let prev = g.ins(ins_id).prev;
            let ss_ins = g.add_ins(
                Op::SpGetSpeshSlot,
                vec![callee_operand, Operand::LitI16(ss)],
            );
            insert_ins_after(g, bb, prev, ss_ins);
            debug!(slot = ss, "devirtualized callee into a spesh slot");
        }
    }

    // See if the call can be pointed at a particular specialization.
    let Some(target) = target else {
        return Ok(());
    };
    let (cand_idx, callee_graph) = {
        let Some(code_body) = target.code_body() else {
            return Ok(());
        };
        let Some(idx) = try_find_spesh_candidate(g, code_body, info) else {
            return Ok(());
        };
        let cand = &code_body.sf.spesh_candidates[idx];
        // Splicing rewires the whole argument sequence, so every argument
        // slot must have been tracked.
        let all_args_tracked = info
            .cs
            .as_ref()
            .is_some_and(|cs| cs.num_flags() <= MAX_ARGS_FOR_OPT);
        let graph = if config.inline && all_args_tracked {
            inline::try_get_graph(cand, config.max_inline_size)
        } else {
            None
        };
        (idx, graph)
    };

    if let Some(callee_graph) = callee_graph {
        debug!(candidate = cand_idx, "inlining matched specialization");
        inline::inline(g, info, bb, ins_id, callee_idx, callee_graph);
        return Ok(());
    }

    // Cannot inline; identify the candidate on a fast invoke instead.
    let op = g.ins(ins_id).op;
    match op {
        Op::InvokeV => {
            let callee_operand = g.ins(ins_id).operands[0].clone();
            let ins = g.ins_mut(ins_id);
            ins.operands = smallvec![callee_operand, Operand::LitI16(cand_idx as i16)];
            ins.op = Op::SpFastInvokeV;
        }
        Op::InvokeI | Op::InvokeN | Op::InvokeS | Op::InvokeO => {
            let result_operand = g.ins(ins_id).operands[0].clone();
            let callee_operand = g.ins(ins_id).operands[1].clone();
            let ins = g.ins_mut(ins_id);
            ins.operands = smallvec![
                result_operand,
                callee_operand,
                Operand::LitI16(cand_idx as i16)
            ];
            ins.op = match op {
                Op::InvokeI => Op::SpFastInvokeI,
                Op::InvokeN => Op::SpFastInvokeN,
                Op::InvokeS => Op::SpFastInvokeS,
                Op::InvokeO => Op::SpFastInvokeO,
                _ => unreachable!(),
            };
        }
        other => return Err(SpeshError::UnhandledInvoke(other)),
    }
    Ok(())
}
