//! In-crate fixture builder used by this crate's own `#[cfg(test)]` modules, analogous to how
//! `hir-transform`'s tests build small HIR functions by hand rather than parsing real programs.
//!
//! Exposes a minimal [`TargetHooks`] implementation (`TestHooks`) over this crate's own
//! [`MachineFunction`] model, plus a handful of named fixtures corresponding to the concrete
//! scenarios this crate's test suite exercises (S1/S2/S4/S6).

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::{
    Block, Instruction, MachineFunction, Operand, OperandKind, Register, RegisterClass,
    target::{BranchInfo, TargetHooks},
};

const BR_UNCOND: u32 = 0;
const BR_COND: u32 = 1;
const STORE: u32 = 2;
const OP: u32 = 3;
const BR_INDIRECT: u32 = 4;

/// A `TargetHooks` implementation over this crate's own opaque instruction encoding, used only by
/// this crate's tests.
#[derive(Debug, Default)]
pub(crate) struct TestHooks;

impl TargetHooks for TestHooks {
    fn analyze_branch(&self, func: &MachineFunction, block: Block) -> Result<BranchInfo, ()> {
        let succs = func.succs(block);
        match succs.len() {
            0 => Ok(BranchInfo { true_target: None, false_target: None, condition: SmallVec::new() }),
            1 => Ok(BranchInfo::unconditional(succs[0])),
            2 => {
                let condition = func
                    .instructions(block)
                    .last()
                    .map(|instr| instr.uses().map(Operand::use_).collect())
                    .unwrap_or_default();
                Ok(BranchInfo { true_target: Some(succs[0]), false_target: Some(succs[1]), condition })
            }
            _ => Err(()),
        }
    }

    fn remove_branch(&self, func: &mut MachineFunction, block: Block) -> usize {
        let instrs = &mut func.block_mut(block).instructions;
        let mut removed = 0;
        while matches!(instrs.last().map(|i| i.kind), Some(crate::cfg::InstructionKind::Opaque(_))) {
            instrs.pop();
            removed += 1;
        }
        removed
    }

    fn insert_branch(
        &self,
        func: &mut MachineFunction,
        block: Block,
        true_target: Block,
        false_target: Option<Block>,
        condition: &[Operand],
    ) {
        let _ = true_target;
        let code = if false_target.is_some() { BR_COND } else { BR_UNCOND };
        func.push_instruction(block, Instruction::opaque(code, condition.iter().copied()));
    }

    fn reverse_branch_condition(&self, _condition: &mut [Operand]) {}

    fn is_unconditional_branch(&self, instr: &Instruction) -> bool {
        matches!(instr.kind, crate::cfg::InstructionKind::Opaque(o) if o.code == BR_UNCOND)
    }

    fn is_conditional_branch(&self, instr: &Instruction) -> bool {
        matches!(instr.kind, crate::cfg::InstructionKind::Opaque(o) if o.code == BR_COND)
    }

    fn is_indirect_branch(&self, instr: &Instruction) -> bool {
        matches!(instr.kind, crate::cfg::InstructionKind::Opaque(o) if o.code == BR_INDIRECT)
    }

    fn can_fall_through(&self, _func: &MachineFunction, _block: Block) -> bool {
        false
    }

    fn get_fall_through(&self, _func: &MachineFunction, _block: Block) -> Option<Block> {
        None
    }

    fn constant_time_leakage(&self, instr: &Instruction) -> SmallVec<[usize; 2]> {
        instr
            .operands
            .iter()
            .enumerate()
            .filter(|(_, o)| o.kind.is_use())
            .map(|(i, _)| i)
            .collect()
    }

    fn is_persistent_store(&self, instr: &Instruction) -> bool {
        matches!(instr.kind, crate::cfg::InstructionKind::Opaque(o) if o.code == STORE)
    }

    fn create_virtual_register(&self, func: &mut MachineFunction, _class: RegisterClass) -> Register {
        func.fresh_virtual_register()
    }
}

pub(crate) fn op_instr(uses: impl IntoIterator<Item = Register>, defs: impl IntoIterator<Item = Register>) -> Instruction {
    let mut operands: Vec<Operand> = defs.into_iter().map(Operand::def).collect();
    operands.extend(uses.into_iter().map(Operand::use_));
    Instruction::opaque(OP, operands)
}

pub(crate) fn store_instr(src: Register) -> Instruction {
    Instruction::opaque(STORE, [Operand::use_(src)])
}

/// S1: `entry -> A*; A -(t)-> B; A -(f)-> C; B -> D; C -> D`.
pub(crate) struct DiamondBlocks {
    pub entry: Block,
    pub a: Block,
    pub b: Block,
    pub c: Block,
    pub d: Block,
}

pub(crate) fn diamond_with_secret_branch() -> (MachineFunction, TestHooks, Register, DiamondBlocks) {
    let mut func = MachineFunction::new("s1_diamond");
    let entry = func.entry();
    let a = func.create_block();
    let b = func.create_block();
    let c = func.create_block();
    let d = func.create_block();

    func.add_edge(entry, a);
    func.add_edge(a, b);
    func.add_edge(a, c);
    func.add_edge(b, d);
    func.add_edge(c, d);

    let secret = func.fresh_virtual_register();
    func.push_instruction(entry, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(a, Instruction::opaque(BR_COND, [Operand::use_(secret)]));
    func.push_instruction(b, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(c, Instruction::opaque(BR_UNCOND, []));

    (func, TestHooks, secret, DiamondBlocks { entry, a, b, c, d })
}

/// S6: S1 with a persistent store `store reg_x, [addr]` placed in block `B`.
pub(crate) fn diamond_with_persistent_store() -> (MachineFunction, TestHooks, Register, Register, DiamondBlocks) {
    let (mut func, hooks, secret, blocks) = diamond_with_secret_branch();
    let reg_x = func.fresh_virtual_register();
    // `reg_x` is defined in A (before the branch) so that it also counts as a leaking operand
    // reaching a use outside the region, matching PersistencyAnalysis's def-use walk.
    func.insert_instruction_before(blocks.a, 0, op_instr([], [reg_x]));
    let store_index = func.instructions(blocks.b).len().saturating_sub(1);
    func.insert_instruction_before(blocks.b, store_index, store_instr(reg_x));
    (func, hooks, secret, reg_x, blocks)
}

/// S2: `entry -> A*; A -(t)-> D; A -(f)-> B; B -> D` (one arm empty).
pub(crate) struct AsymmetricBlocks {
    pub entry: Block,
    pub a: Block,
    pub b: Block,
    pub d: Block,
}

pub(crate) fn asymmetric_diamond() -> (MachineFunction, TestHooks, Register, AsymmetricBlocks) {
    let mut func = MachineFunction::new("s2_asymmetric");
    let entry = func.entry();
    let a = func.create_block();
    let b = func.create_block();
    let d = func.create_block();

    func.add_edge(entry, a);
    func.add_edge(a, d);
    func.add_edge(a, b);
    func.add_edge(b, d);

    let secret = func.fresh_virtual_register();
    func.push_instruction(entry, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(a, Instruction::opaque(BR_COND, [Operand::use_(secret)]));
    func.push_instruction(b, Instruction::opaque(BR_UNCOND, []));

    (func, TestHooks, secret, AsymmetricBlocks { entry, a, b, d })
}

/// S3: a diamond on `A*` whose true arm `B` itself contains a nested diamond on `B*`.
pub(crate) struct NestedBlocks {
    pub entry: Block,
    pub a: Block,
    pub b: Block,
    pub b_then: Block,
    pub b_else: Block,
    pub b_merge: Block,
    pub c: Block,
    pub d: Block,
}

pub(crate) fn nested_secret_branches() -> (MachineFunction, TestHooks, Register, Register, NestedBlocks) {
    let mut func = MachineFunction::new("s3_nested");
    let entry = func.entry();
    let a = func.create_block();
    let b = func.create_block();
    let b_then = func.create_block();
    let b_else = func.create_block();
    let b_merge = func.create_block();
    let c = func.create_block();
    let d = func.create_block();

    func.add_edge(entry, a);
    func.add_edge(a, b);
    func.add_edge(a, c);
    func.add_edge(b, b_then);
    func.add_edge(b, b_else);
    func.add_edge(b_then, b_merge);
    func.add_edge(b_else, b_merge);
    func.add_edge(b_merge, d);
    func.add_edge(c, d);

    let outer_secret = func.fresh_virtual_register();
    let inner_secret = func.fresh_virtual_register();
    func.push_instruction(entry, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(a, Instruction::opaque(BR_COND, [Operand::use_(outer_secret)]));
    func.push_instruction(b, Instruction::opaque(BR_COND, [Operand::use_(inner_secret)]));
    func.push_instruction(b_then, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(b_else, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(b_merge, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(c, Instruction::opaque(BR_UNCOND, []));

    (
        func,
        TestHooks,
        outer_secret,
        inner_secret,
        NestedBlocks { entry, a, b, b_then, b_else, b_merge, c, d },
    )
}

/// S4: `entry -> H; H -> body; body -(t*)-> exit1; body -(f)-> exit2; exit2 -> H (back-edge)`.
///
/// `body`'s terminator is a binary conditional branch, matching [`TestHooks::analyze_branch`]'s
/// two-successor requirement; the loop's continuation (normally drawn straight out of `body` in
/// the informal `body -> H` shorthand) is instead carried by `exit2`, the secret branch's
/// "continue" arm, which is what actually closes the loop here.
pub(crate) struct LoopBlocks {
    pub entry: Block,
    pub header: Block,
    pub body: Block,
    pub exit1: Block,
    pub exit2: Block,
}

pub(crate) fn loop_with_secret_branch() -> (MachineFunction, TestHooks, Register, LoopBlocks) {
    let mut func = MachineFunction::new("s4_loop");
    let entry = func.entry();
    let header = func.create_block();
    let body = func.create_block();
    let exit1 = func.create_block();
    let exit2 = func.create_block();

    func.add_edge(entry, header);
    func.add_edge(header, body);
    func.add_edge(body, exit1);
    func.add_edge(body, exit2);
    func.add_edge(exit2, header);

    let secret = func.fresh_virtual_register();
    func.push_instruction(entry, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(header, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(body, Instruction::opaque(BR_COND, [Operand::use_(secret)]));
    func.push_instruction(exit2, Instruction::opaque(BR_UNCOND, []));

    (func, TestHooks, secret, LoopBlocks { entry, header, body, exit1, exit2 })
}

/// S7: `A*`'s unconditional arm `B` has a successor `X` also reachable directly from `A`'s
/// activating arm `E`, so `X` does not belong to the region rooted at `B` -- leaving `B` itself as
/// an exiting block with two successors (`X` outside the region, `Y` inside it), which is not a
/// simple SESE shape.
pub(crate) struct UnsupportedBlocks {
    pub entry: Block,
    pub a: Block,
    pub b: Block,
    pub e: Block,
    pub x: Block,
    pub y: Block,
    pub j: Block,
}

pub(crate) fn sese_irreducible_region() -> (MachineFunction, TestHooks, Register, UnsupportedBlocks) {
    let mut func = MachineFunction::new("s7_irreducible");
    let entry = func.entry();
    let a = func.create_block();
    let b = func.create_block();
    let e = func.create_block();
    let x = func.create_block();
    let y = func.create_block();
    let j = func.create_block();

    func.add_edge(entry, a);
    func.add_edge(a, b);
    func.add_edge(a, e);
    func.add_edge(b, x);
    func.add_edge(b, y);
    func.add_edge(e, x);
    func.add_edge(x, j);
    func.add_edge(y, j);

    let secret = func.fresh_virtual_register();
    func.push_instruction(entry, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(a, Instruction::opaque(BR_COND, [Operand::use_(secret)]));
    func.push_instruction(b, Instruction::opaque(BR_COND, []));
    func.push_instruction(e, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(x, Instruction::opaque(BR_UNCOND, []));
    func.push_instruction(y, Instruction::opaque(BR_UNCOND, []));

    (func, TestHooks, secret, UnsupportedBlocks { entry, a, b, e, x, y, j })
}
