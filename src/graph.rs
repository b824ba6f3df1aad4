//! The specialization graph: basic blocks, the instruction arena, per-register
//! facts, spesh slots, guards, and the dominator tree.
//!
//! Blocks and instructions live in arenas owned by the graph and refer to each
//! other by index, so the cyclic structure (successor edges, dominator edges,
//! instruction links, PHI inputs) needs no shared ownership. Unlinking an
//! instruction leaves its arena slot in place; everything is released together
//! when the graph is dropped.

use std::sync::Arc;

use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};
use smallvec::SmallVec;

use crate::callsite::Callsite;
use crate::ir::{
    BlockId, CallsiteIdx, FactFlags, Facts, Ins, InsId, Op, Operand, OperandKind, RegRef, StrIdx,
};
use crate::model::{ArgGuard, HllId, ObjRef, VmString};

/// Number of runs a log slot aggregates; logged values are strided by this.
pub const LOG_RUNS: usize = 8;

/// A log-guard record: the guard instruction and whether any optimization
/// consumed the fact it establishes.
#[derive(Debug, Clone)]
pub struct LogGuard {
    pub ins: InsId,
    pub bb: BlockId,
    pub used: bool,
}

/// A basic block: a doubly-linked instruction list plus its place in the
/// linear chain and the dominator tree.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub idx: u32,
    pub first_ins: Option<InsId>,
    pub last_ins: Option<InsId>,
    pub succ: SmallVec<[BlockId; 2]>,
    pub pred: SmallVec<[BlockId; 2]>,
    /// Dominator-tree children.
    pub children: Vec<BlockId>,
    pub linear_next: Option<BlockId>,
    /// Spliced in by the inliner; shields the block from unreachable-block
    /// elimination, since deopt may enter it without a graph edge.
    pub inlined: bool,
}

impl BasicBlock {
    fn new(idx: u32) -> Self {
        BasicBlock {
            idx,
            first_ins: None,
            last_ins: None,
            succ: SmallVec::new(),
            pred: SmallVec::new(),
            children: Vec::new(),
            linear_next: None,
            inlined: false,
        }
    }
}

/// Per-routine, per-candidate specialization graph.
#[derive(Debug, Clone)]
pub struct SpeshGraph {
    pub bbs: Vec<BasicBlock>,
    pub entry: BlockId,
    ins_arena: Vec<Ins>,
    /// Facts indexed by register origin, then SSA version.
    pub facts: Vec<Vec<Facts>>,
    /// Constants the rewritten code refers to by 16-bit index. Slots are GC
    /// roots for as long as the candidate lives.
    pub spesh_slots: Vec<Option<ObjRef>>,
    /// Values recorded by logging runs, strided by `LOG_RUNS`.
    pub log_slots: Vec<Option<ObjRef>>,
    pub log_guards: Vec<LogGuard>,
    /// Guards the candidate imposes on the entry arguments.
    pub arg_guards: Vec<ArgGuard>,
    pub strings: Vec<VmString>,
    pub callsites: Vec<Arc<Callsite>>,
    pub hll: HllId,
    pub num_bbs: usize,
}

impl SpeshGraph {
    /// A graph with just an entry block.
    pub fn new(hll: HllId) -> Self {
        SpeshGraph {
            bbs: vec![BasicBlock::new(0)],
            entry: BlockId(0),
            ins_arena: Vec::new(),
            facts: Vec::new(),
            spesh_slots: Vec::new(),
            log_slots: Vec::new(),
            log_guards: Vec::new(),
            arg_guards: Vec::new(),
            strings: Vec::new(),
            callsites: Vec::new(),
            hll,
            num_bbs: 1,
        }
    }

    pub fn bb(&self, id: BlockId) -> &BasicBlock {
        &self.bbs[id.0 as usize]
    }

    pub fn bb_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.bbs[id.0 as usize]
    }

    pub fn ins(&self, id: InsId) -> &Ins {
        &self.ins_arena[id.0 as usize]
    }

    pub fn ins_mut(&mut self, id: InsId) -> &mut Ins {
        &mut self.ins_arena[id.0 as usize]
    }

    /// Allocates an unlinked instruction in the graph arena.
    pub fn add_ins(&mut self, op: Op, operands: Vec<Operand>) -> InsId {
        let id = InsId(self.ins_arena.len() as u32);
        self.ins_arena.push(Ins {
            op,
            operands: SmallVec::from_vec(operands),
            prev: None,
            next: None,
        });
        id
    }

    /// Allocates a block at the end of the arena; the caller wires it into
    /// the linear chain and the CFG.
    pub fn add_bb(&mut self) -> BlockId {
        let id = BlockId(self.bbs.len() as u32);
        self.bbs.push(BasicBlock::new(id.0));
        self.num_bbs += 1;
        id
    }

    /// Direct facts access, with no implication the value is being used.
    pub fn facts_direct(&self, r: RegRef) -> &Facts {
        &self.facts[r.orig as usize][r.version as usize]
    }

    pub fn facts_direct_mut(&mut self, r: RegRef) -> &mut Facts {
        &mut self.facts[r.orig as usize][r.version as usize]
    }

    /// Facts access that records a use: if the facts came from a log guard,
    /// that guard is now load-bearing and must survive guard elimination.
    pub fn facts_mut(&mut self, r: RegRef) -> &mut Facts {
        let guard = {
            let f = &self.facts[r.orig as usize][r.version as usize];
            f.flags
                .contains(FactFlags::FROM_LOG_GUARD)
                .then_some(f.log_guard)
        };
        if let Some(idx) = guard {
            self.log_guards[idx].used = true;
        }
        &mut self.facts[r.orig as usize][r.version as usize]
    }

    /// Copies flags, types, value and log-guard linkage; usage counts belong
    /// to the destination register and are left alone.
    pub fn copy_facts(&mut self, to: RegRef, from: RegRef) {
        let src = self.facts_direct(from).clone();
        let dst = self.facts_direct_mut(to);
        dst.flags = src.flags;
        dst.type_ = src.type_;
        dst.decont_type = src.decont_type;
        dst.value = src.value;
        dst.log_guard = src.log_guard;
    }

    /// Appends a value to the spesh slot table and returns its index.
    /// Growth is chunked by 8 to amortize reallocation.
    pub fn add_spesh_slot(&mut self, obj: Option<ObjRef>) -> i16 {
        if self.spesh_slots.len() == self.spesh_slots.capacity() {
            self.spesh_slots.reserve_exact(8);
        }
        let idx = self.spesh_slots.len() as i16;
        self.spesh_slots.push(obj);
        idx
    }

    pub fn string(&self, idx: StrIdx) -> &VmString {
        &self.strings[idx as usize]
    }

    pub fn callsite(&self, idx: CallsiteIdx) -> &Arc<Callsite> {
        &self.callsites[idx as usize]
    }

    /// Blocks in linear order, from the entry.
    pub fn linear_blocks(&self) -> Vec<BlockId> {
        let mut out = Vec::with_capacity(self.num_bbs);
        let mut cur = Some(self.entry);
        while let Some(id) = cur {
            out.push(id);
            cur = self.bb(id).linear_next;
        }
        out
    }

    /// Instruction ids of a block, first to last.
    pub fn block_ins(&self, bb: BlockId) -> Vec<InsId> {
        let mut out = Vec::new();
        let mut cur = self.bb(bb).first_ins;
        while let Some(id) = cur {
            out.push(id);
            cur = self.ins(id).next;
        }
        out
    }

    /// Count of instructions still linked into blocks.
    pub fn ins_count(&self) -> usize {
        self.linear_blocks()
            .iter()
            .map(|&bb| self.block_ins(bb).len())
            .sum()
    }

    /// Whether this candidate guards the invocant slot; some rewrites only
    /// fire when the specialization pinned down argument 0.
    pub fn specialized_on_invocant(&self) -> bool {
        self.arg_guards.iter().any(|g| g.slot == 0)
    }

    /// Rebuilds dominator-tree children from the successor edges. Upstream
    /// analysis normally supplies the tree; the builder (and tests) use this.
    pub fn compute_dominators(&mut self) {
        let blocks = self.linear_blocks();
        let mut node_of: Vec<Option<NodeIndex>> = vec![None; self.bbs.len()];
        let mut dg: DiGraph<BlockId, ()> = DiGraph::new();
        for &bb in &blocks {
            node_of[bb.0 as usize] = Some(dg.add_node(bb));
        }
        for &bb in &blocks {
            let from = node_of[bb.0 as usize].unwrap();
            for &succ in &self.bb(bb).succ {
                if let Some(to) = node_of[succ.0 as usize] {
                    dg.add_edge(from, to, ());
                }
            }
        }
        let doms = dominators::simple_fast(&dg, node_of[self.entry.0 as usize].unwrap());
        for &bb in &blocks {
            self.bb_mut(bb).children.clear();
        }
        for &bb in &blocks {
            if bb == self.entry {
                continue;
            }
            let node = node_of[bb.0 as usize].unwrap();
            if let Some(idom) = doms.immediate_dominator(node) {
                let parent = dg[idom];
                self.bb_mut(parent).children.push(bb);
            }
        }
    }

    /// Recomputes every register version's usage count from the live read
    /// references in the graph.
    pub fn recount_usages(&mut self) {
        for versions in &mut self.facts {
            for f in versions {
                f.usages = 0;
            }
        }
        for bb in self.linear_blocks() {
            for ins_id in self.block_ins(bb) {
                let (op, operands) = {
                    let ins = self.ins(ins_id);
                    (ins.op, ins.operands.clone())
                };
                for (i, operand) in operands.iter().enumerate() {
                    if op.operand_kind(i) == OperandKind::ReadReg {
                        self.facts_direct_mut(operand.reg()).usages += 1;
                    }
                }
            }
        }
    }

    /// Renders the graph for debugging and for structural comparisons in
    /// tests.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for bb_id in self.linear_blocks() {
            let bb = self.bb(bb_id);
            let succ: Vec<String> = bb.succ.iter().map(|s| self.bb(*s).idx.to_string()).collect();
            let _ = writeln!(
                out,
                "BB {}{} (succ: {}):",
                bb.idx,
                if bb.inlined { " [inlined]" } else { "" },
                succ.join(", ")
            );
            for ins_id in self.block_ins(bb_id) {
                let ins = self.ins(ins_id);
                let ops: Vec<String> = ins.operands.iter().map(|o| self.dump_operand(o)).collect();
                let _ = writeln!(out, "  {} {}", ins.op, ops.join(", "));
            }
        }
        out
    }

    fn dump_operand(&self, o: &Operand) -> String {
        match o {
            Operand::Reg(r) => format!("r{}({})", r.orig, r.version),
            Operand::LitI16(v) => format!("liti16({})", v),
            Operand::LitI64(v) => format!("liti64({})", v),
            Operand::LitN64(v) => format!("litn64({})", v),
            Operand::LitStr(idx) => format!("lits({:?})", &*self.strings[*idx as usize]),
            Operand::Callsite(idx) => format!("callsite({})", idx),
            Operand::Target(bb) => format!("BB({})", self.bb(*bb).idx),
        }
    }
}

/// Convenience constructor standing in for the upstream analysis pass: wires
/// blocks and instructions, seeds facts, then derives the dominator tree and
/// usage counts.
pub struct GraphBuilder {
    g: SpeshGraph,
}

impl GraphBuilder {
    pub fn new(hll: HllId) -> Self {
        GraphBuilder {
            g: SpeshGraph::new(hll),
        }
    }

    pub fn entry(&self) -> BlockId {
        self.g.entry
    }

    /// Appends a block at the end of the linear chain.
    pub fn add_block(&mut self) -> BlockId {
        let id = self.g.add_bb();
        let mut tail = self.g.entry;
        while let Some(next) = self.g.bb(tail).linear_next {
            tail = next;
        }
        self.g.bb_mut(tail).linear_next = Some(id);
        id
    }

    /// Appends an instruction to a block.
    pub fn push(&mut self, bb: BlockId, op: Op, operands: Vec<Operand>) -> InsId {
        for operand in &operands {
            if let Operand::Reg(r) = operand {
                self.ensure_reg(*r);
            }
        }
        let id = self.g.add_ins(op, operands);
        let last = self.g.bb(bb).last_ins;
        match last {
            Some(last_id) => {
                self.g.ins_mut(last_id).next = Some(id);
                self.g.ins_mut(id).prev = Some(last_id);
            }
            None => self.g.bb_mut(bb).first_ins = Some(id),
        }
        self.g.bb_mut(bb).last_ins = Some(id);
        id
    }

    /// Adds a CFG edge.
    pub fn succ(&mut self, from: BlockId, to: BlockId) {
        self.g.bb_mut(from).succ.push(to);
        self.g.bb_mut(to).pred.push(from);
    }

    pub fn add_string(&mut self, s: &str) -> StrIdx {
        let idx = self.g.strings.len() as StrIdx;
        self.g.strings.push(VmString::from(s));
        idx
    }

    pub fn add_callsite(&mut self, cs: Arc<Callsite>) -> CallsiteIdx {
        let idx = self.g.callsites.len() as CallsiteIdx;
        self.g.callsites.push(cs);
        idx
    }

    pub fn set_facts(&mut self, r: RegRef, facts: Facts) {
        self.ensure_reg(r);
        self.g.facts[r.orig as usize][r.version as usize] = facts;
    }

    pub fn set_log_slot(&mut self, idx: usize, obj: ObjRef) {
        if self.g.log_slots.len() <= idx {
            self.g.log_slots.resize(idx + 1, None);
        }
        self.g.log_slots[idx] = Some(obj);
    }

    pub fn add_log_guard(&mut self, bb: BlockId, ins: InsId) -> usize {
        self.g.log_guards.push(LogGuard {
            ins,
            bb,
            used: false,
        });
        self.g.log_guards.len() - 1
    }

    pub fn add_arg_guard(&mut self, guard: ArgGuard) {
        self.g.arg_guards.push(guard);
    }

    fn ensure_reg(&mut self, r: RegRef) {
        let orig = r.orig as usize;
        if self.g.facts.len() <= orig {
            self.g.facts.resize_with(orig + 1, Vec::new);
        }
        let versions = &mut self.g.facts[orig];
        if versions.len() <= r.version as usize {
            versions.resize_with(r.version as usize + 1, Facts::default);
        }
    }

    /// Derives the dominator tree and usage counts, yielding the graph ready
    /// for optimization.
    pub fn finish(mut self) -> SpeshGraph {
        self.g.compute_dominators();
        self.g.recount_usages();
        self.g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_links_instructions() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let i0 = b.push(entry, Op::ConstI64_16, vec![
            Operand::Reg(RegRef::new(0, 0)),
            Operand::LitI16(1),
        ]);
        let i1 = b.push(entry, Op::Set, vec![
            Operand::Reg(RegRef::new(1, 0)),
            Operand::Reg(RegRef::new(0, 0)),
        ]);
        let g = b.finish();
        assert_eq!(g.bb(entry).first_ins, Some(i0));
        assert_eq!(g.bb(entry).last_ins, Some(i1));
        assert_eq!(g.ins(i0).next, Some(i1));
        assert_eq!(g.ins(i1).prev, Some(i0));
    }

    #[test]
    fn test_finish_counts_usages() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        b.push(entry, Op::ConstI64_16, vec![
            Operand::Reg(RegRef::new(0, 0)),
            Operand::LitI16(1),
        ]);
        b.push(entry, Op::Set, vec![
            Operand::Reg(RegRef::new(1, 0)),
            Operand::Reg(RegRef::new(0, 0)),
        ]);
        b.push(entry, Op::Set, vec![
            Operand::Reg(RegRef::new(2, 0)),
            Operand::Reg(RegRef::new(0, 0)),
        ]);
        let g = b.finish();
        assert_eq!(g.facts_direct(RegRef::new(0, 0)).usages, 2);
        assert_eq!(g.facts_direct(RegRef::new(1, 0)).usages, 0);
    }

    #[test]
    fn test_dominator_children_diamond() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let left = b.add_block();
        let right = b.add_block();
        let join = b.add_block();
        b.succ(entry, left);
        b.succ(entry, right);
        b.succ(left, join);
        b.succ(right, join);
        let g = b.finish();
        // Entry immediately dominates all three of the others.
        assert_eq!(g.bb(entry).children, vec![left, right, join]);
        assert!(g.bb(left).children.is_empty());
    }

    #[test]
    fn test_spesh_slot_growth_is_chunked() {
        let mut g = SpeshGraph::new(HllId(0));
        for i in 0..=8 {
            assert_eq!(g.add_spesh_slot(None), i as i16);
        }
        assert_eq!(g.spesh_slots.len(), 9);
        assert!(g.spesh_slots.capacity() >= 16);
    }

    #[test]
    fn test_facts_use_marks_log_guard() {
        let mut b = GraphBuilder::new(HllId(0));
        let entry = b.entry();
        let r = RegRef::new(0, 0);
        let guard_ins = b.push(entry, Op::SpGuard, vec![
            Operand::Reg(r),
            Operand::LitI16(0),
        ]);
        let guard = b.add_log_guard(entry, guard_ins);
        b.set_facts(r, Facts {
            flags: FactFlags::FROM_LOG_GUARD,
            log_guard: guard,
            ..Facts::default()
        });
        let mut g = b.finish();
        assert!(!g.log_guards[guard].used);
        let _ = g.facts_mut(r);
        assert!(g.log_guards[guard].used);
    }
}
