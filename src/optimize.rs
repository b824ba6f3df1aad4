//! The optimization driver.
//!
//! Blocks are visited in dominator-tree order, so facts a block establishes
//! reach every block it dominates before that block is processed, letting
//! rewrites cascade within a single pass. After the walk, the cleanup passes
//! run once each: dead instructions to a fixed point, unreachable blocks to a
//! fixed point, then unused log guards.

use tracing::debug;

use crate::call_opt::{optimize_call, CallInfo, MAX_ARGS_FOR_OPT};
use crate::dead_code;
use crate::graph::SpeshGraph;
use crate::ir::{BlockId, Op};
use crate::rewrite;
use crate::Result;

/// Knobs for the optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Rewrite `can`/`can_s` through the method cache. Off by default:
    /// deleting the lookup interacts badly with handler-range fix-up, so the
    /// rule stays gated until that is proven correct.
    pub optimize_can_ops: bool,
    /// Allow inlining of matched specializations.
    pub inline: bool,
    /// Refuse to inline callee graphs above this instruction count.
    pub max_inline_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            optimize_can_ops: false,
            inline: true,
            max_inline_size: 192,
        }
    }
}

/// Runs the rewrite walk and cleanup passes over specialization graphs.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new() -> Self {
        Optimizer::default()
    }

    pub fn with_config(config: OptimizerConfig) -> Self {
        Optimizer { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Optimizes the graph in place.
    pub fn optimize(&self, g: &mut SpeshGraph) -> Result<()> {
        let before = g.ins_count();
        self.optimize_bb(g, g.entry)?;
        dead_code::eliminate_dead_ins(g);
        dead_code::eliminate_dead_bbs(g);
        dead_code::eliminate_unused_log_guards(g);
        debug!(before, after = g.ins_count(), "optimized graph");
        Ok(())
    }

    /// Processes one block's instructions left to right, then recurses over
    /// its dominator children.
    fn optimize_bb(&self, g: &mut SpeshGraph, bb: BlockId) -> Result<()> {
        let mut call_info = CallInfo::default();
        let mut cur = g.bb(bb).first_ins;
        while let Some(ins_id) = cur {
            match g.ins(ins_id).op {
                Op::Set => {
                    let dst = g.ins(ins_id).operands[0].reg();
                    let src = g.ins(ins_id).operands[1].reg();
                    g.copy_facts(dst, src);
                }
                Op::IfI | Op::UnlessI | Op::IfN | Op::UnlessN | Op::IfO | Op::UnlessO => {
                    rewrite::optimize_iffy(g, bb, ins_id);
                }
                Op::PrepArgs => {
                    let cs = g.callsite(g.ins(ins_id).operands[0].callsite_idx()).clone();
                    call_info.reset(cs, ins_id);
                }
                Op::ArgI | Op::ArgN | Op::ArgS | Op::ArgO => {
                    let idx = g.ins(ins_id).operands[0].lit_i16() as usize;
                    if idx < MAX_ARGS_FOR_OPT {
                        let reg = g.ins(ins_id).operands[1].reg();
                        // Reading the facts here counts as a use of them.
                        let _ = g.facts_mut(reg);
                        call_info.record_arg(idx, reg, ins_id);
                    }
                }
                Op::ArgConstI | Op::ArgConstN | Op::ArgConstS => {
                    let idx = g.ins(ins_id).operands[0].lit_i16() as usize;
                    if idx < MAX_ARGS_FOR_OPT {
                        call_info.record_const_arg(idx, ins_id);
                    }
                }
                Op::CoerceIn => rewrite::optimize_coerce(g, ins_id),
                Op::InvokeV => optimize_call(g, bb, ins_id, 0, &call_info, &self.config)?,
                Op::InvokeI | Op::InvokeN | Op::InvokeS | Op::InvokeO => {
                    optimize_call(g, bb, ins_id, 1, &call_info, &self.config)?;
                }
                Op::IsList | Op::IsHash | Op::IsInt | Op::IsNum | Op::IsStr => {
                    rewrite::optimize_is_reprid(g, ins_id);
                }
                Op::FindMeth => rewrite::optimize_method_lookup(g, ins_id),
                Op::Can | Op::CanS => {
                    if self.config.optimize_can_ops {
                        rewrite::optimize_can_op(g, ins_id);
                    }
                }
                Op::Create => rewrite::optimize_repr_op(g, bb, ins_id, 1),
                Op::IsConcrete => rewrite::optimize_isconcrete(g, ins_id),
                Op::IsType => rewrite::optimize_istype(g, ins_id),
                Op::BindAttrI | Op::BindAttrN | Op::BindAttrS | Op::BindAttrO => {
                    rewrite::optimize_repr_op(g, bb, ins_id, 0);
                }
                Op::GetAttrI | Op::GetAttrN | Op::GetAttrS | Op::GetAttrO => {
                    rewrite::optimize_repr_op(g, bb, ins_id, 1);
                }
                Op::BoxI | Op::BoxN | Op::BoxS => rewrite::optimize_repr_op(g, bb, ins_id, 2),
                Op::UnboxI | Op::UnboxN | Op::UnboxS => {
                    rewrite::optimize_repr_op(g, bb, ins_id, 1);
                }
                Op::Elems => rewrite::optimize_repr_op(g, bb, ins_id, 1),
                Op::Hllize => rewrite::optimize_hllize(g, ins_id),
                Op::Decont => rewrite::optimize_decont(g, bb, ins_id),
                Op::AssertParamCheck => rewrite::optimize_assertparamcheck(g, bb, ins_id),
                Op::GetLexStaticO => rewrite::optimize_getlex_known(g, bb, ins_id),
                Op::GetLexPerInvTypeO => {
                    if g.specialized_on_invocant() {
                        rewrite::optimize_getlex_known(g, bb, ins_id);
                    }
                }
                Op::SpLog | Op::SpOsrFinalize => {
                    // Leftovers analysis should have consumed; drop them.
                    rewrite::delete_ins_propagating_reads(g, bb, ins_id);
                }
                _ => {}
            }
            cur = g.ins(ins_id).next;
        }

        let children = g.bb(bb).children.clone();
        for child in children {
            self.optimize_bb(g, child)?;
        }
        Ok(())
    }
}
