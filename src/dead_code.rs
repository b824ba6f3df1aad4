//! Cleanup passes run after the dominator-order rewrite walk.
//!
//! Dead-instruction elimination iterates to a fixed point: deleting a pure
//! instruction gives back the reads it performed, which can push its
//! producers' usage counts to zero in turn. Unreachable-block elimination
//! marks everything reachable from the entry and unlinks the rest, except
//! blocks spliced in by the inliner. Finally, log-guard instructions whose
//! facts nothing consumed are dropped.

use tracing::debug;

use crate::graph::SpeshGraph;
use crate::ir::{Op, OperandKind};
use crate::manipulate::delete_ins;

/// Removes pure instructions (and PHIs) whose results are never used,
/// cascading until nothing more dies.
pub(crate) fn eliminate_dead_ins(g: &mut SpeshGraph) {
    let mut death = true;
    while death {
        death = false;
        for bb in g.linear_blocks() {
            // Back to front, so a consumer dies before its producer is
            // examined within the same sweep.
            let mut cur = g.bb(bb).last_ins;
            while let Some(ins_id) = cur {
                let prev = g.ins(ins_id).prev;
                let (op, operands) = {
                    let ins = g.ins(ins_id);
                    (ins.op, ins.operands.clone())
                };
                if op == Op::Phi {
                    if g.facts_mut(operands[0].reg()).usages == 0 {
                        for operand in operands.iter().skip(1) {
                            let f = g.facts_mut(operand.reg());
                            f.usages = f.usages.saturating_sub(1);
                        }
                        delete_ins(g, bb, ins_id);
                        death = true;
                    }
                } else if op.is_pure()
                    && op.descriptor().operands.first() == Some(&OperandKind::WriteReg)
                    && g.facts_mut(operands[0].reg()).usages == 0
                {
                    for (i, operand) in operands.iter().enumerate().skip(1) {
                        if op.operand_kind(i) == OperandKind::ReadReg {
                            let f = g.facts_mut(operand.reg());
                            f.usages = f.usages.saturating_sub(1);
                        }
                    }
                    delete_ins(g, bb, ins_id);
                    death = true;
                }
                cur = prev;
            }
        }
    }
}

/// Unlinks blocks no edge reaches, keeping inlined blocks regardless, then
/// renumbers if anything was dropped.
pub(crate) fn eliminate_dead_bbs(g: &mut SpeshGraph) {
    let orig_bbs = g.num_bbs;
    let mut death = true;
    while death {
        // Mark the entry block and every successor target.
        let mut seen = vec![false; g.bbs.len()];
        seen[g.bb(g.entry).idx as usize] = true;
        for bb in g.linear_blocks() {
            for &succ in &g.bb(bb).succ {
                seen[g.bb(succ).idx as usize] = true;
            }
        }

        // Unlink anything unmarked.
        death = false;
        let mut cur = g.entry;
        while let Some(next) = g.bb(cur).linear_next {
            if !seen[g.bb(next).idx as usize] && !g.bb(next).inlined {
                let skip_to = g.bb(next).linear_next;
                g.bb_mut(cur).linear_next = skip_to;
                g.num_bbs -= 1;
                death = true;
            }
            match g.bb(cur).linear_next {
                Some(next) => cur = next,
                None => break,
            }
        }
    }

    if g.num_bbs != orig_bbs {
        debug!(removed = orig_bbs - g.num_bbs, "dropped unreachable blocks");
        let mut new_idx = 0;
        for bb in g.linear_blocks() {
            g.bb_mut(bb).idx = new_idx;
            new_idx += 1;
        }
    }
}

/// Deletes log-guard instructions whose facts no optimization consumed.
pub(crate) fn eliminate_unused_log_guards(g: &mut SpeshGraph) {
    for i in 0..g.log_guards.len() {
        if !g.log_guards[i].used {
            let (bb, ins) = (g.log_guards[i].bb, g.log_guards[i].ins);
            crate::rewrite::delete_ins_propagating_reads(g, bb, ins);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::ir::{Operand, RegRef};
    use crate::model::HllId;

    fn reg(orig: u16, version: u16) -> Operand {
        Operand::Reg(RegRef::new(orig, version))
    }

    #[test]
    fn test_dead_ins_cascade() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        b.push(entry, Op::ConstI64_16, vec![reg(1, 0), Operand::LitI16(1)]);
        b.push(entry, Op::Set, vec![reg(2, 0), reg(1, 0)]);
        b.push(entry, Op::Set, vec![reg(3, 0), reg(2, 0)]);
        let mut g = b.finish();
        assert_eq!(g.facts_direct(RegRef::new(3, 0)).usages, 0);

        eliminate_dead_ins(&mut g);
        assert!(g.block_ins(entry).is_empty());
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).usages, 0);
    }

    #[test]
    fn test_dead_ins_cascades_across_blocks() {
        // The producer sits in an earlier block than its dead consumer; the
        // fixed point reaches it on the next sweep regardless of visit order.
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let next = b.add_block();
        b.succ(entry, next);
        b.push(entry, Op::ConstI64_16, vec![reg(1, 0), Operand::LitI16(1)]);
        b.push(next, Op::Set, vec![reg(2, 0), reg(1, 0)]);
        let mut g = b.finish();

        eliminate_dead_ins(&mut g);
        assert!(g.block_ins(entry).is_empty());
        assert!(g.block_ins(next).is_empty());
    }

    #[test]
    fn test_dead_ins_keeps_used_results() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        b.push(entry, Op::ConstI64_16, vec![reg(1, 0), Operand::LitI16(1)]);
        b.push(entry, Op::ReturnI, vec![reg(1, 0)]);
        let mut g = b.finish();

        eliminate_dead_ins(&mut g);
        assert_eq!(g.block_ins(entry).len(), 2);
    }

    #[test]
    fn test_dead_ins_keeps_impure_writers() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        // An invoke writes a result nobody reads, but it has effects.
        b.push(entry, Op::InvokeO, vec![reg(1, 0), reg(2, 0)]);
        let mut g = b.finish();

        eliminate_dead_ins(&mut g);
        assert_eq!(g.block_ins(entry).len(), 1);
    }

    #[test]
    fn test_dead_phi_propagates_nonusage() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let next = b.add_block();
        b.succ(entry, next);
        b.push(entry, Op::ConstI64_16, vec![reg(0, 0), Operand::LitI16(1)]);
        b.push(entry, Op::ConstI64_16, vec![reg(0, 1), Operand::LitI16(2)]);
        b.push(next, Op::Phi, vec![reg(0, 2), reg(0, 0), reg(0, 1)]);
        let mut g = b.finish();

        eliminate_dead_ins(&mut g);
        assert!(g.block_ins(next).is_empty());
        // With the PHI gone, both versions died too.
        assert!(g.block_ins(entry).is_empty());
    }

    #[test]
    fn test_unreachable_block_dropped_and_renumbered() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let orphan = b.add_block();
        let tail = b.add_block();
        b.succ(entry, tail);
        b.push(orphan, Op::ReturnV, vec![]);
        let mut g = b.finish();
        assert_eq!(g.num_bbs, 3);

        eliminate_dead_bbs(&mut g);
        assert_eq!(g.num_bbs, 2);
        let blocks = g.linear_blocks();
        assert_eq!(blocks, vec![entry, tail]);
        assert_eq!(g.bb(tail).idx, 1);
    }

    #[test]
    fn test_unreachable_inlined_block_survives() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let spliced = b.add_block();
        let mut g = b.finish();
        g.bb_mut(spliced).inlined = true;

        eliminate_dead_bbs(&mut g);
        assert_eq!(g.linear_blocks(), vec![entry, spliced]);
    }

    #[test]
    fn test_unreachable_chain_needs_fixed_point() {
        // a -> b -> c where only a is reachable; dropping b exposes c.
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let mid = b.add_block();
        let last = b.add_block();
        b.succ(mid, last);
        let mut g = b.finish();

        eliminate_dead_bbs(&mut g);
        assert_eq!(g.linear_blocks(), vec![entry]);
        assert_eq!(g.num_bbs, 1);
    }

    #[test]
    fn test_unused_log_guard_deleted() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let kept = b.push(entry, Op::SpGuard, vec![reg(0, 0), Operand::LitI16(0)]);
        let dropped = b.push(entry, Op::SpGuard, vec![reg(1, 0), Operand::LitI16(1)]);
        let g0 = b.add_log_guard(entry, kept);
        b.add_log_guard(entry, dropped);
        let mut g = b.finish();
        g.log_guards[g0].used = true;

        eliminate_unused_log_guards(&mut g);
        assert_eq!(g.block_ins(entry), vec![kept]);
    }
}
