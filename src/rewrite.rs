//! Per-opcode rewrite rules.
//!
//! Every rule reads the facts of its operands, decides whether the rewrite is
//! safe, mutates the instruction in place, then updates facts and usage
//! counts. An indeterminate answer from a cache or a missing fact means the
//! rule simply leaves the instruction alone; that is the normal case for most
//! instructions in most graphs.

use smallvec::smallvec;
use tracing::debug;

use crate::graph::{SpeshGraph, LOG_RUNS};
use crate::ir::{BlockId, FactFlags, InsId, Op, Operand, RegRef};
use crate::manipulate::{delete_ins, remove_successor};
use crate::model::{
    can_method_cache_only, coerce_istrue, find_method_cache_only, try_cache_type_check, BoolMode,
    ReprId, Value, VmString,
};

/// Decrements the usage count of a register version, counting the access as
/// a use of its facts.
pub(crate) fn dec_usage(g: &mut SpeshGraph, r: RegRef) {
    let f = g.facts_mut(r);
    f.usages = f.usages.saturating_sub(1);
}

/// Deletes an instruction and gives back the reads it performed, keeping the
/// usage invariant intact.
pub(crate) fn delete_ins_propagating_reads(g: &mut SpeshGraph, bb: BlockId, ins_id: InsId) {
    let (op, operands) = {
        let ins = g.ins(ins_id);
        (ins.op, ins.operands.clone())
    };
    for (i, operand) in operands.iter().enumerate() {
        if op.operand_kind(i) == crate::ir::OperandKind::ReadReg {
            dec_usage(g, operand.reg());
        }
    }
    delete_ins(g, bb, ins_id);
}

/// Method lookup: resolve at compile time when the type is known, otherwise
/// rewrite to the monomorphically-caching form with two reserved slots.
pub(crate) fn optimize_method_lookup(g: &mut SpeshGraph, ins_id: InsId) {
    let obj_reg = g.ins(ins_id).operands[1].reg();
    let known_type = {
        let f = g.facts_mut(obj_reg);
        if f.flags.contains(FactFlags::KNOWN_TYPE) {
            f.type_.clone()
        } else {
            None
        }
    };

    if let Some(st) = known_type {
        let name = g.string(g.ins(ins_id).operands[2].lit_str()).clone();
        if let Some(meth) = find_method_cache_only(&st, &name) {
            let ss = g.add_spesh_slot(Some(meth.clone()));

            let dst = g.ins(ins_id).operands[0].reg();
            let meth_facts = g.facts_mut(dst);
            meth_facts.flags |= FactFlags::KNOWN_VALUE;
            meth_facts.value = Some(Value::Obj(meth));

            dec_usage(g, obj_reg);
            let dst_operand = g.ins(ins_id).operands[0].clone();
            let ins = g.ins_mut(ins_id);
            ins.op = Op::SpGetSpeshSlot;
            ins.operands = smallvec![dst_operand, Operand::LitI16(ss)];
            debug!(method = %name, slot = ss, "resolved method lookup to spesh slot");
            return;
        }
    }

    // No compile-time resolution; cache a single type/method pair to save
    // hash lookups in the monomorphic case.
    let ss = g.add_spesh_slot(None);
    g.add_spesh_slot(None);
    let ins = g.ins_mut(ins_id);
    ins.op = Op::SpFindMeth;
    ins.operands.push(Operand::LitI16(ss));
}

/// `istype` against two known types folds through the type-check cache.
pub(crate) fn optimize_istype(g: &mut SpeshGraph, ins_id: InsId) {
    let obj_reg = g.ins(ins_id).operands[1].reg();
    let type_reg = g.ins(ins_id).operands[2].reg();
    let obj_type = {
        let f = g.facts_mut(obj_reg);
        f.flags.contains(FactFlags::KNOWN_TYPE).then(|| f.type_.clone()).flatten()
    };
    let type_type = {
        let f = g.facts_mut(type_reg);
        f.flags.contains(FactFlags::KNOWN_TYPE).then(|| f.type_.clone()).flatten()
    };
    let (Some(obj_st), Some(type_st)) = (obj_type, type_type) else {
        return;
    };
    let Some(result) = try_cache_type_check(&obj_st, &type_st) else {
        return;
    };
    let result = result as i16;

    let dst_operand = g.ins(ins_id).operands[0].clone();
    let ins = g.ins_mut(ins_id);
    ins.op = Op::ConstI64_16;
    ins.operands = smallvec![dst_operand.clone(), Operand::LitI16(result)];

    let rf = g.facts_mut(dst_operand.reg());
    rf.flags |= FactFlags::KNOWN_VALUE;
    rf.value = Some(Value::Int(result as i64));
    dec_usage(g, obj_reg);
    dec_usage(g, type_reg);
}

/// Representation-id predicates: a known type answers immediately when the
/// representations differ; on a match only the concreteness check remains.
pub(crate) fn optimize_is_reprid(g: &mut SpeshGraph, ins_id: InsId) {
    let obj_reg = g.ins(ins_id).operands[1].reg();
    let known_type = {
        let f = g.facts_mut(obj_reg);
        f.flags.contains(FactFlags::KNOWN_TYPE).then(|| f.type_.clone()).flatten()
    };
    let Some(st) = known_type else {
        return;
    };
    let wanted = match g.ins(ins_id).op {
        Op::IsList => ReprId::Array,
        Op::IsHash => ReprId::Hash,
        Op::IsInt => ReprId::Int,
        Op::IsNum => ReprId::Num,
        Op::IsStr => ReprId::Str,
        _ => return,
    };

    if st.repr != wanted {
        let dst_operand = g.ins(ins_id).operands[0].clone();
        let ins = g.ins_mut(ins_id);
        ins.op = Op::ConstI64_16;
        ins.operands = smallvec![dst_operand.clone(), Operand::LitI16(0)];
        let rf = g.facts_mut(dst_operand.reg());
        rf.flags |= FactFlags::KNOWN_VALUE;
        rf.value = Some(Value::Int(0));
        dec_usage(g, obj_reg);
    } else {
        g.ins_mut(ins_id).op = Op::IsNonNull;
    }
}

/// `isconcrete` folds when concreteness is known either way.
pub(crate) fn optimize_isconcrete(g: &mut SpeshGraph, ins_id: InsId) {
    let obj_reg = g.ins(ins_id).operands[1].reg();
    let flags = g.facts_mut(obj_reg).flags;
    if !flags.intersects(FactFlags::CONCRETE | FactFlags::TYPEOBJ) {
        return;
    }
    let result = if flags.contains(FactFlags::CONCRETE) { 1 } else { 0 };

    let dst_operand = g.ins(ins_id).operands[0].clone();
    let ins = g.ins_mut(ins_id);
    ins.op = Op::ConstI64_16;
    ins.operands = smallvec![dst_operand.clone(), Operand::LitI16(result)];
    let rf = g.facts_mut(dst_operand.reg());
    rf.flags |= FactFlags::KNOWN_VALUE;
    rf.value = Some(Value::Int(result as i64));
    dec_usage(g, obj_reg);
}

/// Conditional branches on a known flag value become an unconditional `goto`
/// or disappear entirely.
pub(crate) fn optimize_iffy(g: &mut SpeshGraph, bb: BlockId, ins_id: InsId) {
    let op = g.ins(ins_id).op;
    let negated = match op {
        Op::IfI | Op::IfS | Op::IfN | Op::IfO | Op::IfNonNull => false,
        Op::UnlessI | Op::UnlessS | Op::UnlessN | Op::UnlessO => true,
        _ => return,
    };

    let flag_reg = g.ins(ins_id).operands[0].reg();
    let facts = g.facts_mut(flag_reg);
    if !facts.flags.contains(FactFlags::KNOWN_VALUE) {
        return;
    }
    let value = facts.value.clone();

    let truth = match op {
        Op::IfI | Op::UnlessI => match value {
            Some(Value::Int(i)) => i != 0,
            _ => return,
        },
        Op::IfN | Op::UnlessN => match value {
            Some(Value::Num(n)) => n != 0.0,
            _ => return,
        },
        Op::IfO | Op::UnlessO => {
            let Some(Value::Obj(obj)) = value else {
                return;
            };
            let mode = obj
                .st
                .boolification
                .map(|b| b.mode)
                .unwrap_or(BoolMode::NotTypeObject);
            if mode == BoolMode::CallMethod {
                // Boolification would call into the VM; bail out.
                return;
            }
            match coerce_istrue(&obj) {
                Some(truth) => truth,
                None => return,
            }
        }
        _ => return,
    };

    dec_usage(g, flag_reg);

    if truth != negated {
        // The branch is always taken: turn it into an unconditional jump and
        // drop the fall-through edge.
        let target = g.ins(ins_id).operands[1].target();
        let ins = g.ins_mut(ins_id);
        ins.op = Op::Goto;
        ins.operands = smallvec![Operand::Target(target)];
        let fall_through = g
            .bb(bb)
            .linear_next
            .expect("conditional branch block has no fall-through");
        remove_successor(g, bb, fall_through);
    } else {
        // The branch is never taken: drop it and the labelled edge.
        let target = g.ins(ins_id).operands[1].target();
        remove_successor(g, bb, target);
        delete_ins(g, bb, ins_id);
    }
}

/// `hllize` of a value already in the current HLL is just a copy.
pub(crate) fn optimize_hllize(g: &mut SpeshGraph, ins_id: InsId) {
    let src_reg = g.ins(ins_id).operands[1].reg();
    let known_type = {
        let f = g.facts_mut(src_reg);
        f.flags.contains(FactFlags::KNOWN_TYPE).then(|| f.type_.clone()).flatten()
    };
    let Some(st) = known_type else {
        return;
    };
    if st.hll_owner == g.hll {
        let dst = g.ins(ins_id).operands[0].reg();
        g.ins_mut(ins_id).op = Op::Set;
        g.copy_facts(dst, src_reg);
    }
}

/// `decont` of an already-decontainerized value is a copy; otherwise give a
/// non-invoking container spec a chance to specialize, then propagate what
/// the decontainerized result is known to be.
pub(crate) fn optimize_decont(g: &mut SpeshGraph, bb: BlockId, ins_id: InsId) {
    let src_reg = g.ins(ins_id).operands[1].reg();
    let src_flags = g.facts_mut(src_reg).flags;
    if src_flags.intersects(FactFlags::DECONTED | FactFlags::TYPEOBJ) {
        let dst = g.ins(ins_id).operands[0].reg();
        g.ins_mut(ins_id).op = Op::Set;
        g.copy_facts(dst, src_reg);
        return;
    }

    if src_flags.contains(FactFlags::KNOWN_TYPE) {
        if let Some(st) = g.facts_direct(src_reg).type_.clone() {
            if let Some(container) = &st.container {
                if container.fetch_never_invokes {
                    if let Some(hook) = container.spesh {
                        hook(&st, g, bb, ins_id);
                        debug!("specialized a decont via its container spec hook");
                    }
                }
            }
        }
    }

    let src = g.facts_direct(src_reg).clone();
    let dst = g.ins(ins_id).operands[0].reg();
    let rf = g.facts_mut(dst);
    if src.flags.contains(FactFlags::KNOWN_DECONT_TYPE) {
        rf.type_ = src.decont_type;
        rf.flags |= FactFlags::KNOWN_TYPE;
    }
    if src.flags.contains(FactFlags::DECONT_CONCRETE) {
        rf.flags |= FactFlags::CONCRETE;
    } else if src.flags.contains(FactFlags::DECONT_TYPEOBJ) {
        rf.flags |= FactFlags::TYPEOBJ;
    }
}

/// An `assertparamcheck` known to pass does nothing at runtime.
pub(crate) fn optimize_assertparamcheck(g: &mut SpeshGraph, bb: BlockId, ins_id: InsId) {
    let flag_reg = g.ins(ins_id).operands[0].reg();
    let facts = g.facts_mut(flag_reg);
    let passes = facts.flags.contains(FactFlags::KNOWN_VALUE)
        && matches!(facts.value, Some(Value::Int(i)) if i != 0);
    if passes {
        dec_usage(g, flag_reg);
        delete_ins(g, bb, ins_id);
    }
}

/// `can`/`can_s` through the method cache. Dispatched only behind a config
/// gate: deleting the underlying lookup interacts badly with handler-range
/// fix-up, so the rule stays off until that is proven out.
pub(crate) fn optimize_can_op(g: &mut SpeshGraph, ins_id: InsId) {
    let obj_reg = g.ins(ins_id).operands[1].reg();
    let known_type = {
        let f = g.facts_mut(obj_reg);
        f.flags.contains(FactFlags::KNOWN_TYPE).then(|| f.type_.clone()).flatten()
    };
    let Some(st) = known_type else {
        return;
    };

    let is_can_s = g.ins(ins_id).op == Op::CanS;
    let method_name: VmString = if is_can_s {
        let name_reg = g.ins(ins_id).operands[2].reg();
        let f = g.facts_mut(name_reg);
        if !f.flags.contains(FactFlags::KNOWN_VALUE) {
            return;
        }
        match &f.value {
            Some(Value::Str(s)) => s.clone(),
            _ => return,
        }
    } else {
        g.string(g.ins(ins_id).operands[2].lit_str()).clone()
    };

    let Some(can) = can_method_cache_only(&st, &method_name) else {
        return;
    };

    if is_can_s {
        let name_reg = g.ins(ins_id).operands[2].reg();
        dec_usage(g, name_reg);
    }
    let result = can as i16;
    let dst_operand = g.ins(ins_id).operands[0].clone();
    let ins = g.ins_mut(ins_id);
    ins.op = Op::ConstI64_16;
    ins.operands = smallvec![dst_operand.clone(), Operand::LitI16(result)];
    let rf = g.facts_mut(dst_operand.reg());
    rf.flags |= FactFlags::KNOWN_VALUE;
    rf.value = Some(Value::Int(result as i64));
    dec_usage(g, obj_reg);
}

/// A `coerce_in` of a known integer loads the float constant directly.
pub(crate) fn optimize_coerce(g: &mut SpeshGraph, ins_id: InsId) {
    let src_reg = g.ins(ins_id).operands[1].reg();
    let known = {
        let f = g.facts_mut(src_reg);
        if f.flags.contains(FactFlags::KNOWN_VALUE) {
            f.value.as_ref().and_then(Value::as_int)
        } else {
            None
        }
    };
    let Some(int_value) = known else {
        return;
    };
    let result = int_value as f64;

    dec_usage(g, src_reg);
    let dst_operand = g.ins(ins_id).operands[0].clone();
    let ins = g.ins_mut(ins_id);
    ins.op = Op::ConstN64;
    ins.operands = smallvec![dst_operand.clone(), Operand::LitN64(result)];
    let rf = g.facts_mut(dst_operand.reg());
    rf.flags |= FactFlags::KNOWN_VALUE;
    rf.value = Some(Value::Num(result));
}

/// Delegates to the representation's own specialization hook when the type
/// at the designated operand is known.
pub(crate) fn optimize_repr_op(
    g: &mut SpeshGraph,
    bb: BlockId,
    ins_id: InsId,
    type_operand: usize,
) {
    let reg = g.ins(ins_id).operands[type_operand].reg();
    let known_type = {
        let f = g.facts_mut(reg);
        f.flags.contains(FactFlags::KNOWN_TYPE).then(|| f.type_.clone()).flatten()
    };
    if let Some(st) = known_type {
        if let Some(hook) = st.repr_spesh {
            hook(&st, g, bb, ins_id);
        }
    }
}

/// A lexical lookup whose value was logged on previous runs can fetch the
/// logged object from a spesh slot instead.
pub(crate) fn optimize_getlex_known(g: &mut SpeshGraph, bb: BlockId, ins_id: InsId) {
    let Some(next_id) = g.ins(ins_id).next else {
        return;
    };
    if g.ins(next_id).op != Op::SpLog {
        return;
    }
    let log_slot = g.ins(next_id).operands[1].lit_i16() as usize * LOG_RUNS;
    let Some(log_obj) = g.log_slots.get(log_slot).cloned().flatten() else {
        return;
    };

    let ss = g.add_spesh_slot(Some(log_obj.clone()));

    // The log instruction read the looked-up value; give that read back.
    delete_ins_propagating_reads(g, bb, next_id);

    let ins = g.ins_mut(ins_id);
    ins.op = Op::SpGetSpeshSlot;
    ins.operands[1] = Operand::LitI16(ss);

    let dst = g.ins(ins_id).operands[0].reg();
    let f = g.facts_mut(dst);
    f.flags |= FactFlags::KNOWN_TYPE | FactFlags::KNOWN_VALUE;
    f.type_ = Some(log_obj.st.clone());
    f.value = Some(Value::Obj(log_obj.clone()));
    if log_obj.concrete {
        f.flags |= FactFlags::CONCRETE;
        if log_obj.st.container.is_none() {
            f.flags |= FactFlags::DECONTED;
        }
    } else {
        f.flags |= FactFlags::TYPEOBJ;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::ir::Facts;
    use crate::model::{HllId, ObjBody, STable, StRef, VmObject};
    use rustc_hash::FxHashMap;

    fn hll() -> HllId {
        HllId(0)
    }

    fn reg(orig: u16, version: u16) -> Operand {
        Operand::Reg(RegRef::new(orig, version))
    }

    fn known_concrete(st: StRef) -> Facts {
        Facts {
            flags: FactFlags::KNOWN_TYPE | FactFlags::CONCRETE,
            type_: Some(st),
            ..Facts::default()
        }
    }

    #[test]
    fn test_istype_folds_through_cache() {
        let int_t = STable::new(ReprId::Int, hll()).into_ref();
        let obj_st = {
            let mut st = STable::new(ReprId::Int, hll());
            st.type_check_cache = Some(vec![int_t.clone()]);
            st.into_ref()
        };
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::IsType, vec![reg(1, 0), reg(2, 0), reg(3, 0)]);
        b.push(entry, Op::ReturnI, vec![reg(1, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_type(obj_st));
        b.set_facts(RegRef::new(3, 0), Facts::known_type(int_t));
        let mut g = b.finish();

        optimize_istype(&mut g, ins);

        assert_eq!(g.ins(ins).op, Op::ConstI64_16);
        assert_eq!(g.ins(ins).operands[1], Operand::LitI16(1));
        let rf = g.facts_direct(RegRef::new(1, 0));
        assert!(rf.flags.contains(FactFlags::KNOWN_VALUE));
        assert_eq!(rf.value, Some(Value::Int(1)));
        assert_eq!(g.facts_direct(RegRef::new(2, 0)).usages, 0);
        assert_eq!(g.facts_direct(RegRef::new(3, 0)).usages, 0);
    }

    #[test]
    fn test_istype_indeterminate_cache_skips() {
        let int_t = STable::new(ReprId::Int, hll()).into_ref();
        let obj_st = STable::new(ReprId::Int, hll()).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::IsType, vec![reg(1, 0), reg(2, 0), reg(3, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_type(obj_st));
        b.set_facts(RegRef::new(3, 0), Facts::known_type(int_t));
        let mut g = b.finish();

        optimize_istype(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::IsType);
        assert_eq!(g.facts_direct(RegRef::new(2, 0)).usages, 1);
    }

    #[test]
    fn test_findmeth_resolves_to_spesh_slot() {
        let meth_st = STable::new(ReprId::Code, hll()).into_ref();
        let meth = VmObject::instance(meth_st, ObjBody::Empty);
        let greeter = {
            let mut st = STable::new(ReprId::Opaque, hll());
            let mut cache = FxHashMap::default();
            cache.insert(VmString::from("greet"), meth.clone());
            st.method_cache = Some(cache);
            st.into_ref()
        };

        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let name = b.add_string("greet");
        let ins = b.push(entry, Op::FindMeth, vec![
            reg(1, 0),
            reg(2, 0),
            Operand::LitStr(name),
        ]);
        b.set_facts(RegRef::new(2, 0), known_concrete(greeter));
        let mut g = b.finish();

        optimize_method_lookup(&mut g, ins);

        assert_eq!(g.ins(ins).op, Op::SpGetSpeshSlot);
        assert_eq!(g.ins(ins).operands.len(), 2);
        let slot = g.ins(ins).operands[1].lit_i16();
        assert!(g.spesh_slots[slot as usize].is_some());
        assert_eq!(g.facts_direct(RegRef::new(2, 0)).usages, 0);
        let rf = g.facts_direct(RegRef::new(1, 0));
        assert_eq!(rf.value, Some(Value::Obj(meth)));
    }

    #[test]
    fn test_findmeth_miss_becomes_caching_form() {
        let greeter = {
            let mut st = STable::new(ReprId::Opaque, hll());
            st.method_cache = Some(FxHashMap::default());
            st.into_ref()
        };
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let name = b.add_string("greet");
        let ins = b.push(entry, Op::FindMeth, vec![
            reg(1, 0),
            reg(2, 0),
            Operand::LitStr(name),
        ]);
        b.set_facts(RegRef::new(2, 0), known_concrete(greeter));
        let mut g = b.finish();

        optimize_method_lookup(&mut g, ins);

        assert_eq!(g.ins(ins).op, Op::SpFindMeth);
        assert_eq!(g.ins(ins).operands.len(), 4);
        let slot = g.ins(ins).operands[3].lit_i16();
        assert_eq!(slot, 0);
        // Two empty slots reserved for the type/method memo pair.
        assert_eq!(g.spesh_slots.len(), 2);
        assert!(g.spesh_slots[0].is_none());
        assert!(g.spesh_slots[1].is_none());
    }

    #[test]
    fn test_is_reprid_mismatch_folds_to_false() {
        let str_t = STable::new(ReprId::Str, hll()).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::IsList, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_type(str_t));
        let mut g = b.finish();

        optimize_is_reprid(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::ConstI64_16);
        assert_eq!(g.ins(ins).operands[1], Operand::LitI16(0));
    }

    #[test]
    fn test_is_reprid_match_still_needs_concreteness() {
        let list_t = STable::new(ReprId::Array, hll()).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::IsList, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_type(list_t));
        let mut g = b.finish();

        optimize_is_reprid(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::IsNonNull);
        assert_eq!(g.ins(ins).operands.len(), 2);
    }

    #[test]
    fn test_isconcrete_folds_both_ways() {
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let conc = b.push(entry, Op::IsConcrete, vec![reg(1, 0), reg(2, 0)]);
        let typeobj = b.push(entry, Op::IsConcrete, vec![reg(3, 0), reg(4, 0)]);
        let unknown = b.push(entry, Op::IsConcrete, vec![reg(5, 0), reg(6, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts {
            flags: FactFlags::CONCRETE,
            ..Facts::default()
        });
        b.set_facts(RegRef::new(4, 0), Facts {
            flags: FactFlags::TYPEOBJ,
            ..Facts::default()
        });
        let mut g = b.finish();

        optimize_isconcrete(&mut g, conc);
        optimize_isconcrete(&mut g, typeobj);
        optimize_isconcrete(&mut g, unknown);

        assert_eq!(g.ins(conc).operands[1], Operand::LitI16(1));
        assert_eq!(g.ins(typeobj).operands[1], Operand::LitI16(0));
        // Neither concreteness flag known: no rewrite.
        assert_eq!(g.ins(unknown).op, Op::IsConcrete);
    }

    #[test]
    fn test_hllize_same_hll_becomes_set() {
        let st = STable::new(ReprId::Opaque, hll()).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::Hllize, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_type(st));
        let mut g = b.finish();

        optimize_hllize(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::Set);
        assert!(g
            .facts_direct(RegRef::new(1, 0))
            .flags
            .contains(FactFlags::KNOWN_TYPE));
    }

    #[test]
    fn test_hllize_foreign_hll_kept() {
        let st = STable::new(ReprId::Opaque, HllId(9)).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::Hllize, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_type(st));
        let mut g = b.finish();

        optimize_hllize(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::Hllize);
    }

    #[test]
    fn test_decont_of_deconted_becomes_set() {
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::Decont, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts {
            flags: FactFlags::DECONTED,
            ..Facts::default()
        });
        let mut g = b.finish();

        optimize_decont(&mut g, entry, ins);
        assert_eq!(g.ins(ins).op, Op::Set);
    }

    #[test]
    fn test_decont_propagates_decont_facts() {
        let inner_t = STable::new(ReprId::Int, hll()).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::Decont, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts {
            flags: FactFlags::KNOWN_DECONT_TYPE | FactFlags::DECONT_CONCRETE,
            decont_type: Some(inner_t.clone()),
            ..Facts::default()
        });
        let mut g = b.finish();

        optimize_decont(&mut g, entry, ins);
        assert_eq!(g.ins(ins).op, Op::Decont);
        let rf = g.facts_direct(RegRef::new(1, 0));
        assert!(rf.flags.contains(FactFlags::KNOWN_TYPE));
        assert!(rf.flags.contains(FactFlags::CONCRETE));
        assert!(rf.type_.as_ref().is_some_and(|t| std::rc::Rc::ptr_eq(t, &inner_t)));
    }

    #[test]
    fn test_assertparamcheck_known_pass_deleted() {
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        b.push(entry, Op::ConstI64_16, vec![reg(1, 0), Operand::LitI16(1)]);
        let check = b.push(entry, Op::AssertParamCheck, vec![reg(1, 0)]);
        b.set_facts(RegRef::new(1, 0), Facts::known_value(Value::Int(1)));
        let mut g = b.finish();
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).usages, 1);

        optimize_assertparamcheck(&mut g, entry, check);
        assert_eq!(g.block_ins(entry).len(), 1);
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).usages, 0);
    }

    #[test]
    fn test_coerce_in_of_known_int_loads_float() {
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::CoerceIn, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), Facts::known_value(Value::Int(3)));
        let mut g = b.finish();

        optimize_coerce(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::ConstN64);
        assert_eq!(g.ins(ins).operands[1], Operand::LitN64(3.0));
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).value, Some(Value::Num(3.0)));
        assert_eq!(g.facts_direct(RegRef::new(2, 0)).usages, 0);
    }

    #[test]
    fn test_can_resolves_through_cache() {
        let meth_st = STable::new(ReprId::Code, hll()).into_ref();
        let meth = VmObject::instance(meth_st, ObjBody::Empty);
        let st = {
            let mut st = STable::new(ReprId::Opaque, hll());
            let mut cache = FxHashMap::default();
            cache.insert(VmString::from("greet"), meth);
            st.method_cache = Some(cache);
            st.into_ref()
        };
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let name = b.add_string("greet");
        let ins = b.push(entry, Op::Can, vec![reg(1, 0), reg(2, 0), Operand::LitStr(name)]);
        b.set_facts(RegRef::new(2, 0), known_concrete(st));
        let mut g = b.finish();

        optimize_can_op(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::ConstI64_16);
        assert_eq!(g.ins(ins).operands[1], Operand::LitI16(1));
        assert_eq!(g.facts_direct(RegRef::new(2, 0)).usages, 0);
    }

    #[test]
    fn test_can_without_cache_bails() {
        let st = STable::new(ReprId::Opaque, hll()).into_ref();
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let name = b.add_string("greet");
        let ins = b.push(entry, Op::Can, vec![reg(1, 0), reg(2, 0), Operand::LitStr(name)]);
        b.set_facts(RegRef::new(2, 0), known_concrete(st));
        let mut g = b.finish();

        optimize_can_op(&mut g, ins);
        assert_eq!(g.ins(ins).op, Op::Can);
    }

    #[test]
    fn test_repr_op_calls_hook() {
        fn hook(_st: &StRef, g: &mut SpeshGraph, _bb: BlockId, ins: InsId) {
            // A representation would normally lower to a direct access op;
            // flip the opcode so the call is observable.
            g.ins_mut(ins).op = Op::Set;
        }
        let st = {
            let mut st = STable::new(ReprId::Opaque, hll());
            st.repr_spesh = Some(hook);
            st.into_ref()
        };
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let ins = b.push(entry, Op::Elems, vec![reg(1, 0), reg(2, 0)]);
        b.set_facts(RegRef::new(2, 0), known_concrete(st));
        let mut g = b.finish();

        optimize_repr_op(&mut g, entry, ins, 1);
        assert_eq!(g.ins(ins).op, Op::Set);
    }

    #[test]
    fn test_getlex_known_rewrites_from_log() {
        let st = STable::new(ReprId::Opaque, hll()).into_ref();
        let logged = VmObject::instance(st, ObjBody::Empty);
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let name = b.add_string("$*FOO");
        let lookup = b.push(entry, Op::GetLexStaticO, vec![reg(1, 0), Operand::LitStr(name)]);
        let log = b.push(entry, Op::SpLog, vec![reg(1, 0), Operand::LitI16(0)]);
        b.push(entry, Op::ReturnO, vec![reg(1, 0)]);
        b.set_log_slot(0, logged.clone());
        let mut g = b.finish();
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).usages, 2);

        optimize_getlex_known(&mut g, entry, lookup);

        assert_eq!(g.ins(lookup).op, Op::SpGetSpeshSlot);
        let slot = g.ins(lookup).operands[1].lit_i16();
        assert!(g.spesh_slots[slot as usize].is_some());
        // The log instruction is gone and its read was given back.
        assert!(!g.block_ins(entry).contains(&log));
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).usages, 1);
        let f = g.facts_direct(RegRef::new(1, 0));
        assert!(f.flags.contains(FactFlags::KNOWN_TYPE | FactFlags::KNOWN_VALUE));
        assert!(f.flags.contains(FactFlags::CONCRETE));
        assert!(f.flags.contains(FactFlags::DECONTED));
        assert_eq!(f.value, Some(Value::Obj(logged)));
    }

    #[test]
    fn test_getlex_without_logged_value_kept() {
        let mut b = GraphBuilder::new(hll());
        let entry = b.entry();
        let name = b.add_string("$*FOO");
        let lookup = b.push(entry, Op::GetLexStaticO, vec![reg(1, 0), Operand::LitStr(name)]);
        b.push(entry, Op::SpLog, vec![reg(1, 0), Operand::LitI16(0)]);
        let mut g = b.finish();

        optimize_getlex_known(&mut g, entry, lookup);
        assert_eq!(g.ins(lookup).op, Op::GetLexStaticO);
    }
}
