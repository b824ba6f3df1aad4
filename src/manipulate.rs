//! Primitives for rewriting the graph in place.
//!
//! `delete_ins` unlinks an instruction from its block but leaves the removed
//! node's own `prev`/`next` intact, so a caller iterating the block may keep
//! walking from the deleted instruction. No usage counters are touched here;
//! callers propagate usage themselves.

use crate::graph::SpeshGraph;
use crate::ir::{BlockId, InsId, Op};

/// Unlinks `ins` from `bb`'s instruction list.
pub fn delete_ins(g: &mut SpeshGraph, bb: BlockId, ins: InsId) {
    let (prev, next) = {
        let node = g.ins(ins);
        (node.prev, node.next)
    };
    match prev {
        Some(p) => g.ins_mut(p).next = next,
        None => g.bb_mut(bb).first_ins = next,
    }
    match next {
        Some(n) => g.ins_mut(n).prev = prev,
        None => g.bb_mut(bb).last_ins = prev,
    }
}

/// Splices `ins` into `bb` after `after`; `None` prepends at the block head.
pub fn insert_ins_after(g: &mut SpeshGraph, bb: BlockId, after: Option<InsId>, ins: InsId) {
    let next = match after {
        Some(a) => g.ins(a).next,
        None => g.bb(bb).first_ins,
    };
    g.ins_mut(ins).prev = after;
    g.ins_mut(ins).next = next;
    match after {
        Some(a) => g.ins_mut(a).next = Some(ins),
        None => g.bb_mut(bb).first_ins = Some(ins),
    }
    match next {
        Some(n) => g.ins_mut(n).prev = Some(ins),
        None => g.bb_mut(bb).last_ins = Some(ins),
    }
}

/// Drops the `bb -> succ` edge, along with the PHI inputs in `succ` keyed by
/// that predecessor position. The edge must exist.
pub fn remove_successor(g: &mut SpeshGraph, bb: BlockId, succ: BlockId) {
    let succ_pos = g
        .bb(bb)
        .succ
        .iter()
        .position(|s| *s == succ)
        .unwrap_or_else(|| panic!("no successor edge BB{} -> BB{}", g.bb(bb).idx, g.bb(succ).idx));
    g.bb_mut(bb).succ.remove(succ_pos);

    let pred_pos = match g.bb(succ).pred.iter().position(|p| *p == bb) {
        Some(pos) => pos,
        None => return,
    };
    g.bb_mut(succ).pred.remove(pred_pos);

    // PHI operand 1 + i corresponds to predecessor i.
    for ins_id in g.block_ins(succ) {
        if g.ins(ins_id).op != Op::Phi {
            break;
        }
        let operand_idx = 1 + pred_pos;
        if operand_idx < g.ins(ins_id).operands.len() {
            let removed = g.ins_mut(ins_id).operands.remove(operand_idx);
            let f = g.facts_mut(removed.reg());
            f.usages = f.usages.saturating_sub(1);
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
    fn test_delete_middle_ins_keeps_own_links() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let i0 = b.push(entry, Op::ConstI64_16, vec![reg(0, 0), Operand::LitI16(1)]);
        let i1 = b.push(entry, Op::Set, vec![reg(1, 0), reg(0, 0)]);
        let i2 = b.push(entry, Op::Set, vec![reg(2, 0), reg(1, 0)]);
        let mut g = b.finish();

        delete_ins(&mut g, entry, i1);
        assert_eq!(g.ins(i0).next, Some(i2));
        assert_eq!(g.ins(i2).prev, Some(i0));
        // Deleted node still points onward, so iteration may continue from it.
        assert_eq!(g.ins(i1).next, Some(i2));
        assert_eq!(g.block_ins(entry), vec![i0, i2]);
    }

    #[test]
    fn test_delete_first_and_last() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let i0 = b.push(entry, Op::ConstI64_16, vec![reg(0, 0), Operand::LitI16(1)]);
        let i1 = b.push(entry, Op::Set, vec![reg(1, 0), reg(0, 0)]);
        let mut g = b.finish();

        delete_ins(&mut g, entry, i0);
        assert_eq!(g.bb(entry).first_ins, Some(i1));
        delete_ins(&mut g, entry, i1);
        assert_eq!(g.bb(entry).first_ins, None);
        assert_eq!(g.bb(entry).last_ins, None);
    }

    #[test]
    fn test_insert_after_and_prepend() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let i0 = b.push(entry, Op::ConstI64_16, vec![reg(0, 0), Operand::LitI16(1)]);
        let mut g = b.finish();

        let before = g.add_ins(Op::ConstI64_16, vec![reg(1, 0), Operand::LitI16(2)]);
        insert_ins_after(&mut g, entry, None, before);
        let after = g.add_ins(Op::ConstI64_16, vec![reg(2, 0), Operand::LitI16(3)]);
        insert_ins_after(&mut g, entry, Some(i0), after);

        assert_eq!(g.block_ins(entry), vec![before, i0, after]);
        assert_eq!(g.bb(entry).last_ins, Some(after));
    }

    #[test]
    fn test_remove_successor_drops_phi_input() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let left = b.add_block();
        let join = b.add_block();
        b.succ(entry, left);
        b.succ(entry, join);
        b.succ(left, join);
        // join's PHI merges (entry, left) in predecessor order.
        b.push(join, Op::Phi, vec![reg(0, 2), reg(0, 0), reg(0, 1)]);
        let mut g = b.finish();
        assert_eq!(g.facts_direct(RegRef::new(0, 1)).usages, 1);

        remove_successor(&mut g, left, join);
        let phi = g.block_ins(join)[0];
        assert_eq!(g.ins(phi).operands.len(), 2);
        assert_eq!(g.facts_direct(RegRef::new(0, 1)).usages, 0);
        assert!(!g.bb(left).succ.contains(&join));
        assert!(!g.bb(join).pred.contains(&left));
    }
}
