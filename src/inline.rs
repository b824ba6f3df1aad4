//! Splices a callee's specialized graph into a caller.
//!
//! The callee graph arrives as a clone of the one recorded on the matched
//! specialization candidate. Its registers, strings, callsites, spesh slots
//! and blocks are renumbered into the caller's arenas; the invoke's block is
//! split, with the tail moved to a resume block; parameter-receive
//! instructions become copies from the tracked argument registers; returns
//! become copies into the invoke's result register plus a jump to the resume
//! block. Every spliced block is marked inlined so unreachable-block
//! elimination leaves it alone (deopt may enter it without a graph edge).

use hashbrown::HashMap;
use smallvec::smallvec;

use crate::call_opt::{CallInfo, MAX_ARGS_FOR_OPT};
use crate::graph::{LogGuard, SpeshGraph};
use crate::ir::{BlockId, FactFlags, InsId, Op, Operand};
use crate::manipulate::{delete_ins, insert_ins_after};
use crate::model::SpeshCandidate;
use crate::rewrite::dec_usage;

/// Obtains a graph to inline for the candidate, when one was recorded and it
/// is small enough to be worth splicing.
pub(crate) fn try_get_graph(cand: &SpeshCandidate, max_size: usize) -> Option<SpeshGraph> {
    let graph = cand.inline_graph.as_ref()?;
    if graph.ins_count() > max_size {
        return None;
    }
    Some((**graph).clone())
}

fn remap_operand(
    op: Op,
    idx: usize,
    operand: &Operand,
    reg_offset: u16,
    str_offset: u32,
    cs_offset: u32,
    ss_offset: i16,
    bb_map: &HashMap<u32, BlockId>,
) -> Operand {
    match operand {
        Operand::Reg(r) => Operand::Reg(crate::ir::RegRef::new(r.orig + reg_offset, r.version)),
        Operand::LitStr(s) => Operand::LitStr(s + str_offset),
        Operand::Callsite(c) => Operand::Callsite(c + cs_offset),
        Operand::Target(t) => Operand::Target(bb_map[&t.0]),
        Operand::LitI16(v) => {
            // Slot-index literals move with the spesh slot table.
            let is_slot_ref = matches!(
                (op, idx),
                (Op::SpGetSpeshSlot, 1) | (Op::SpFindMeth, 3)
            );
            if is_slot_ref {
                Operand::LitI16(v + ss_offset)
            } else {
                Operand::LitI16(*v)
            }
        }
        other => other.clone(),
    }
}

/// Splices `callee` in place of the invoke instruction.
pub(crate) fn inline(
    g: &mut SpeshGraph,
    info: &CallInfo,
    bb: BlockId,
    invoke: InsId,
    callee_idx: usize,
    callee: SpeshGraph,
) {
    let reg_offset = g.facts.len() as u16;
    let str_offset = g.strings.len() as u32;
    let cs_offset = g.callsites.len() as u32;
    let ss_offset = g.spesh_slots.len() as i16;
    let guard_offset = g.log_guards.len();

    // Merge the side tables, keeping log-guard linkage consistent.
    g.strings.extend(callee.strings.iter().cloned());
    g.callsites.extend(callee.callsites.iter().cloned());
    for slot in &callee.spesh_slots {
        g.add_spesh_slot(slot.clone());
    }
    for versions in &callee.facts {
        let mut row = versions.clone();
        for f in &mut row {
            if f.flags.contains(FactFlags::FROM_LOG_GUARD) {
                f.log_guard += guard_offset;
            }
        }
        g.facts.push(row);
    }

    // Renumber the callee's blocks and instructions into the caller arenas.
    let callee_blocks = callee.linear_blocks();
    let mut bb_map: HashMap<u32, BlockId> = HashMap::new();
    for &cb in &callee_blocks {
        bb_map.insert(cb.0, g.add_bb());
    }
    let mut ins_map: HashMap<u32, InsId> = HashMap::new();
    for &cb in &callee_blocks {
        let nb = bb_map[&cb.0];
        let mut prev: Option<InsId> = None;
        for old_id in callee.block_ins(cb) {
            let old = callee.ins(old_id);
            let operands: Vec<Operand> = old
                .operands
                .iter()
                .enumerate()
                .map(|(i, o)| {
                    remap_operand(old.op, i, o, reg_offset, str_offset, cs_offset, ss_offset, &bb_map)
                })
                .collect();
            let new_id = g.add_ins(old.op, operands);
            ins_map.insert(old_id.0, new_id);
            match prev {
                Some(p) => {
                    g.ins_mut(p).next = Some(new_id);
                    g.ins_mut(new_id).prev = Some(p);
                }
                None => g.bb_mut(nb).first_ins = Some(new_id),
            }
            g.bb_mut(nb).last_ins = Some(new_id);
            prev = Some(new_id);
        }
    }
    for &cb in &callee_blocks {
        let nb = bb_map[&cb.0];
        let src = callee.bb(cb);
        let succ = src.succ.iter().map(|s| bb_map[&s.0]).collect();
        let pred = src.pred.iter().map(|p| bb_map[&p.0]).collect();
        let children = src.children.iter().map(|c| bb_map[&c.0]).collect();
        let nb_mut = g.bb_mut(nb);
        nb_mut.succ = succ;
        nb_mut.pred = pred;
        nb_mut.children = children;
        nb_mut.inlined = true;
    }
    for pair in callee_blocks.windows(2) {
        g.bb_mut(bb_map[&pair[0].0]).linear_next = Some(bb_map[&pair[1].0]);
    }
    for lg in &callee.log_guards {
        if let Some(&ins) = ins_map.get(&lg.ins.0) {
            g.log_guards.push(LogGuard {
                ins,
                bb: bb_map[&lg.bb.0],
                used: lg.used,
            });
        }
    }

    // Split the call block: everything after the invoke moves to a resume
    // block, which inherits the call block's successors.
    let resume = g.add_bb();
    let tail = g.ins(invoke).next;
    g.ins_mut(invoke).next = None;
    let old_last = g.bb(bb).last_ins;
    g.bb_mut(bb).last_ins = Some(invoke);
    if let Some(t) = tail {
        g.ins_mut(t).prev = None;
        g.bb_mut(resume).first_ins = Some(t);
        g.bb_mut(resume).last_ins = old_last;
    }
    let old_succ = std::mem::take(&mut g.bb_mut(bb).succ);
    for &s in &old_succ {
        for p in g.bb_mut(s).pred.iter_mut() {
            if *p == bb {
                *p = resume;
            }
        }
    }
    let bb_linear_next = g.bb(bb).linear_next;
    g.bb_mut(resume).succ = old_succ;
    g.bb_mut(resume).linear_next = bb_linear_next;

    let first_new = bb_map[&callee.entry.0];
    let last_new = bb_map[&callee_blocks.last().unwrap().0];
    g.bb_mut(bb).linear_next = Some(first_new);
    g.bb_mut(last_new).linear_next = Some(resume);
    g.bb_mut(bb).succ = smallvec![first_new];
    g.bb_mut(first_new).pred.push(bb);

    // Parameter receives become copies (or constant loads) from the tracked
    // argument instructions; returns feed the invoke's result register and
    // jump to the resume block.
    let invoke_op = g.ins(invoke).op;
    let result_operand =
        (invoke_op != Op::InvokeV).then(|| g.ins(invoke).operands[0].clone());
    let mut returns: Vec<(BlockId, InsId)> = Vec::new();
    for &cb in &callee_blocks {
        let nb = bb_map[&cb.0];
        for ins_id in g.block_ins(nb) {
            match g.ins(ins_id).op {
                Op::ParamRpI | Op::ParamRpN | Op::ParamRpS | Op::ParamRpO => {
                    let param_idx = g.ins(ins_id).operands[1].lit_i16() as usize;
                    if param_idx >= MAX_ARGS_FOR_OPT {
                        continue;
                    }
                    let Some(arg_ins_id) = info.arg_ins[param_idx] else {
                        continue;
                    };
                    let arg = g.ins(arg_ins_id).clone();
                    let dst = g.ins(ins_id).operands[0].clone();
                    match arg.op {
                        Op::ArgI | Op::ArgN | Op::ArgS | Op::ArgO => {
                            let src = arg.operands[1].reg();
                            g.facts_direct_mut(src).usages += 1;
                            let ins = g.ins_mut(ins_id);
                            ins.op = Op::Set;
                            ins.operands = smallvec![dst, Operand::Reg(src)];
                        }
                        Op::ArgConstI => {
                            let ins = g.ins_mut(ins_id);
                            ins.op = Op::ConstI64;
                            ins.operands = smallvec![dst, arg.operands[1].clone()];
                        }
                        Op::ArgConstN => {
                            let ins = g.ins_mut(ins_id);
                            ins.op = Op::ConstN64;
                            ins.operands = smallvec![dst, arg.operands[1].clone()];
                        }
                        Op::ArgConstS => {
                            let ins = g.ins_mut(ins_id);
                            ins.op = Op::ConstS;
                            ins.operands = smallvec![dst, arg.operands[1].clone()];
                        }
                        _ => {}
                    }
                }
                Op::ReturnV | Op::ReturnI | Op::ReturnN | Op::ReturnS | Op::ReturnO => {
                    returns.push((nb, ins_id));
                }
                _ => {}
            }
        }
    }
    for (nb, rid) in returns {
        let rop = g.ins(rid).op;
        if rop == Op::ReturnV {
            let ins = g.ins_mut(rid);
            ins.op = Op::Goto;
            ins.operands = smallvec![Operand::Target(resume)];
        } else {
            let src = g.ins(rid).operands[0].reg();
            match &result_operand {
                Some(result) => {
                    let ins = g.ins_mut(rid);
                    ins.op = Op::Set;
                    ins.operands = smallvec![result.clone(), Operand::Reg(src)];
                    let goto = g.add_ins(Op::Goto, vec![Operand::Target(resume)]);
                    insert_ins_after(g, nb, Some(rid), goto);
                }
                None => {
                    // A void invoke discards the returned value.
                    dec_usage(g, src);
                    let ins = g.ins_mut(rid);
                    ins.op = Op::Goto;
                    ins.operands = smallvec![Operand::Target(resume)];
                }
            }
        }
        g.bb_mut(nb).succ.push(resume);
        g.bb_mut(resume).pred.push(nb);
    }

    // The call sequence itself is gone now.
    let callee_reg = g.ins(invoke).operands[callee_idx].reg();
    dec_usage(g, callee_reg);
    delete_ins(g, bb, invoke);
    for i in 0..MAX_ARGS_FOR_OPT {
        if let Some(arg_ins_id) = info.arg_ins[i] {
            let arg = g.ins(arg_ins_id).clone();
            if matches!(arg.op, Op::ArgI | Op::ArgN | Op::ArgS | Op::ArgO) {
                dec_usage(g, arg.operands[1].reg());
            }
            delete_ins(g, bb, arg_ins_id);
        }
    }
    if let Some(prepargs) = info.prepargs_ins {
        delete_ins(g, bb, prepargs);
    }

    // Traversal-tree fixup: the inlinee entry and the resume block hang off
    // the call block; the call block's former children move to resume.
    let old_children = std::mem::take(&mut g.bb_mut(bb).children);
    g.bb_mut(resume).children = old_children;
    g.bb_mut(bb).children = vec![first_new, resume];
}
