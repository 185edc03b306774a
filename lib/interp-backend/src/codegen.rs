//! Lowers validated function bodies into the flat [`Op`] form: structured
//! control flow becomes resolved jumps, and every branch site records the
//! stack fixup (`drop`/`keep`) of the label it targets.
//!
//! The input already passed validation, so the simulated stack heights here
//! are trusted; dead code after an unconditional transfer is skipped rather
//! than lowered.

use crate::ops::{BranchTarget, Op};
use wavm_runtime_core::{
    error::{CompileError, CompileResult},
    module::ModuleInfo,
    structures::TypedIndex,
    types::{FuncIndex, SigIndex},
};
use wasmparser::{BlockType, FunctionBody, Operator};

/// One lowered function body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoweredFunction {
    /// Parameter count of the signature.
    pub num_params: u32,
    /// Declared locals beyond the parameters; zero-initialized at entry.
    pub num_locals: u32,
    /// The flat body.
    pub ops: Vec<Op>,
}

enum FrameKind {
    Block,
    Loop { head_pc: u32 },
    If { else_jump: usize, else_seen: bool },
}

enum FixupSlot {
    Single,
    Table(usize),
    TableDefault,
}

struct ControlFrame {
    kind: FrameKind,
    /// Stack height below the frame's parameters.
    base_height: usize,
    params: u32,
    results: u32,
    /// Forward branches waiting for this frame's end pc.
    end_fixups: Vec<(usize, FixupSlot)>,
    /// The rest of this frame is dead code.
    dead: bool,
}

impl ControlFrame {
    fn label_arity(&self) -> u32 {
        match self.kind {
            FrameKind::Loop { .. } => self.params,
            _ => self.results,
        }
    }
}

fn validation_error(msg: impl std::fmt::Display) -> CompileError {
    CompileError::ValidationError {
        msg: format!("{}", msg),
    }
}

fn unsupported(feature: &str) -> CompileError {
    CompileError::UnsupportedFeature {
        feature: feature.to_string(),
    }
}

fn block_arity(info: &ModuleInfo, ty: BlockType) -> (u32, u32) {
    match ty {
        BlockType::Empty => (0, 0),
        BlockType::Type(_) => (0, 1),
        BlockType::FuncType(index) => {
            let sig = &info.signatures[SigIndex::new(index as usize)];
            (sig.params().len() as u32, sig.returns().len() as u32)
        }
    }
}

fn func_arity(info: &ModuleInfo, func_index: u32) -> (u32, u32) {
    let sig_index = info.func_assoc[FuncIndex::new(func_index as usize)];
    let sig = &info.signatures[sig_index];
    (sig.params().len() as u32, sig.returns().len() as u32)
}

/// Lowers one function body. `func_index` is the flat index of the function
/// inside the module, used to find its signature.
pub fn lower_function(
    info: &ModuleInfo,
    func_index: FuncIndex,
    body: &FunctionBody,
) -> CompileResult<LoweredFunction> {
    let sig = &info.signatures[info.func_assoc[func_index]];
    let num_params = sig.params().len() as u32;
    let num_results = sig.returns().len() as u32;

    let mut num_locals = 0u32;
    let locals_reader = body.get_locals_reader().map_err(validation_error)?;
    for local in locals_reader {
        let (count, _ty) = local.map_err(validation_error)?;
        num_locals += count;
    }

    let mut ops: Vec<Op> = Vec::new();
    let mut height: usize = 0;
    let mut frames: Vec<ControlFrame> = vec![ControlFrame {
        kind: FrameKind::Block,
        base_height: 0,
        params: 0,
        results: num_results,
        end_fixups: Vec::new(),
        dead: false,
    }];

    macro_rules! emit {
        ($op:expr) => {
            ops.push($op)
        };
    }

    // Builds the fixup-or-resolved target for a branch depth, registering a
    // forward fixup with the frame when its end pc is not yet known.
    macro_rules! branch_target {
        ($depth:expr, $op_index:expr, $slot:expr, $height:expr) => {{
            let depth = $depth as usize;
            if depth >= frames.len() {
                return Err(validation_error(format!("branch depth {} out of range", depth)));
            }
            let frame_index = frames.len() - 1 - depth;
            let frame = &mut frames[frame_index];
            let keep = frame.label_arity();
            let drop = ($height - frame.base_height) as u32 - keep;
            let pc = match frame.kind {
                FrameKind::Loop { head_pc } => head_pc,
                _ => {
                    frame.end_fixups.push(($op_index, $slot));
                    u32::max_value()
                }
            };
            BranchTarget { pc, drop, keep }
        }};
    }

    let operators = body.get_operators_reader().map_err(validation_error)?;
    for operator in operators {
        let operator = operator.map_err(validation_error)?;

        // In dead code only the control structure is tracked.
        if frames.last().map(|frame| frame.dead).unwrap_or(false) {
            match operator {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                    frames.push(ControlFrame {
                        kind: FrameKind::Block,
                        base_height: height,
                        params: 0,
                        results: 0,
                        end_fixups: Vec::new(),
                        dead: true,
                    });
                }
                Operator::Else => {
                    let frame = frames.last_mut().expect("frame stack underflow");
                    if let FrameKind::If {
                        else_jump,
                        else_seen,
                    } = &mut frame.kind
                    {
                        if !*else_seen {
                            *else_seen = true;
                            let else_pc = ops.len() as u32;
                            patch(&mut ops, *else_jump, FixupSlot::Single, else_pc);
                            height = frame.base_height + frame.params as usize;
                            frame.dead = false;
                        }
                    }
                }
                Operator::End => {
                    let frame = frames.pop().expect("frame stack underflow");
                    let end_pc = ops.len() as u32;

                    // The false-condition path of an if without an else
                    // lands just past the frame even when the then arm went
                    // dead.
                    let mut resumes = !frame.end_fixups.is_empty();
                    if let FrameKind::If {
                        else_jump,
                        else_seen: false,
                    } = frame.kind
                    {
                        patch(&mut ops, else_jump, FixupSlot::Single, end_pc);
                        resumes = true;
                    }

                    if frames.is_empty() {
                        // Function end inside dead code: nothing falls
                        // through, but branches may still land here.
                        for (op_index, slot) in frame.end_fixups {
                            patch(&mut ops, op_index, slot, end_pc);
                        }
                        emit!(Op::Return {
                            drop: 0,
                            keep: num_results,
                        });
                        break;
                    }
                    for (op_index, slot) in frame.end_fixups {
                        patch(&mut ops, op_index, slot, end_pc);
                    }
                    if resumes {
                        // A branch lands just past the frame: code is live
                        // again with the label arity on the stack.
                        height = frame.base_height + frame.results as usize;
                        if let Some(parent) = frames.last_mut() {
                            parent.dead = false;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        match operator {
            Operator::Unreachable => {
                emit!(Op::Unreachable);
                frames.last_mut().expect("frame stack underflow").dead = true;
            }
            Operator::Nop => {}
            Operator::Block { blockty } => {
                let (params, results) = block_arity(info, blockty);
                frames.push(ControlFrame {
                    kind: FrameKind::Block,
                    base_height: height - params as usize,
                    params,
                    results,
                    end_fixups: Vec::new(),
                    dead: false,
                });
            }
            Operator::Loop { blockty } => {
                let (params, results) = block_arity(info, blockty);
                frames.push(ControlFrame {
                    kind: FrameKind::Loop {
                        head_pc: ops.len() as u32,
                    },
                    base_height: height - params as usize,
                    params,
                    results,
                    end_fixups: Vec::new(),
                    dead: false,
                });
            }
            Operator::If { blockty } => {
                let (params, results) = block_arity(info, blockty);
                height -= 1; // condition
                let else_jump = ops.len();
                emit!(Op::JumpIfZero {
                    pc: u32::max_value(),
                });
                frames.push(ControlFrame {
                    kind: FrameKind::If {
                        else_jump,
                        else_seen: false,
                    },
                    base_height: height - params as usize,
                    params,
                    results,
                    end_fixups: Vec::new(),
                    dead: false,
                });
            }
            Operator::Else => {
                let frame = frames.last_mut().expect("frame stack underflow");
                let (else_jump, params, base_height) = match &mut frame.kind {
                    FrameKind::If {
                        else_jump,
                        else_seen,
                    } => {
                        *else_seen = true;
                        (*else_jump, frame.params, frame.base_height)
                    }
                    _ => return Err(validation_error("else outside if")),
                };
                // The then arm jumps over the else arm to the frame's end.
                let skip_jump = ops.len();
                emit!(Op::Jump {
                    pc: u32::max_value(),
                });
                frames
                    .last_mut()
                    .expect("frame stack underflow")
                    .end_fixups
                    .push((skip_jump, FixupSlot::Single));
                let else_pc = ops.len() as u32;
                patch(&mut ops, else_jump, FixupSlot::Single, else_pc);
                height = base_height + params as usize;
            }
            Operator::End => {
                let frame = frames.pop().expect("frame stack underflow");
                let end_pc = ops.len() as u32;

                // An if without an else falls through its head jump to the
                // end.
                if let FrameKind::If {
                    else_jump,
                    else_seen: false,
                } = frame.kind
                {
                    patch(&mut ops, else_jump, FixupSlot::Single, end_pc);
                }

                for (op_index, slot) in frame.end_fixups {
                    patch(&mut ops, op_index, slot, end_pc);
                }

                if frames.is_empty() {
                    emit!(Op::Return {
                        drop: 0,
                        keep: num_results,
                    });
                    break;
                }
                height = frame.base_height + frame.results as usize;
            }
            Operator::Br { relative_depth } => {
                let op_index = ops.len();
                let target = branch_target!(relative_depth, op_index, FixupSlot::Single, height);
                emit!(Op::Br(target));
                frames.last_mut().expect("frame stack underflow").dead = true;
            }
            Operator::BrIf { relative_depth } => {
                height -= 1; // condition
                let op_index = ops.len();
                let target = branch_target!(relative_depth, op_index, FixupSlot::Single, height);
                emit!(Op::BrIf(target));
            }
            Operator::BrTable { targets } => {
                height -= 1; // index
                let op_index = ops.len();
                // Reserve the slot so fixups reference a real index.
                emit!(Op::Unreachable);
                let mut resolved = Vec::with_capacity(targets.len() as usize);
                for (slot, depth) in targets.targets().enumerate() {
                    let depth = depth.map_err(validation_error)?;
                    let target =
                        branch_target!(depth, op_index, FixupSlot::Table(slot), height);
                    resolved.push(target);
                }
                let default = branch_target!(
                    targets.default(),
                    op_index,
                    FixupSlot::TableDefault,
                    height
                );
                ops[op_index] = Op::BrTable {
                    targets: resolved.into_boxed_slice(),
                    default,
                };
                frames.last_mut().expect("frame stack underflow").dead = true;
            }
            Operator::Return => {
                let keep = num_results;
                let drop = height as u32 - keep;
                emit!(Op::Return { drop, keep });
                frames.last_mut().expect("frame stack underflow").dead = true;
            }
            Operator::Call { function_index } => {
                let (params, results) = func_arity(info, function_index);
                height = height - params as usize + results as usize;
                emit!(Op::Call {
                    func_index: function_index,
                });
            }
            Operator::CallIndirect {
                type_index,
                table_index,
                ..
            } => {
                let sig = &info.signatures[SigIndex::new(type_index as usize)];
                height = height - 1 - sig.params().len() + sig.returns().len();
                emit!(Op::CallIndirect {
                    sig_index: type_index,
                    table_index,
                });
            }
            Operator::Drop => {
                height -= 1;
                emit!(Op::Drop);
            }
            Operator::Select => {
                height -= 2;
                emit!(Op::Select);
            }
            Operator::LocalGet { local_index } => {
                height += 1;
                emit!(Op::LocalGet { index: local_index });
            }
            Operator::LocalSet { local_index } => {
                height -= 1;
                emit!(Op::LocalSet { index: local_index });
            }
            Operator::LocalTee { local_index } => {
                emit!(Op::LocalTee { index: local_index });
            }
            Operator::GlobalGet { global_index } => {
                height += 1;
                emit!(Op::GlobalGet {
                    index: global_index,
                });
            }
            Operator::GlobalSet { global_index } => {
                height -= 1;
                emit!(Op::GlobalSet {
                    index: global_index,
                });
            }

            Operator::I32Load { memarg } => lower_load(&mut ops, &mut height, Op::I32Load { offset: memarg.offset as u32 }),
            Operator::I64Load { memarg } => lower_load(&mut ops, &mut height, Op::I64Load { offset: memarg.offset as u32 }),
            Operator::F32Load { memarg } => lower_load(&mut ops, &mut height, Op::F32Load { offset: memarg.offset as u32 }),
            Operator::F64Load { memarg } => lower_load(&mut ops, &mut height, Op::F64Load { offset: memarg.offset as u32 }),
            Operator::I32Load8S { memarg } => lower_load(&mut ops, &mut height, Op::I32Load8S { offset: memarg.offset as u32 }),
            Operator::I32Load8U { memarg } => lower_load(&mut ops, &mut height, Op::I32Load8U { offset: memarg.offset as u32 }),
            Operator::I32Load16S { memarg } => lower_load(&mut ops, &mut height, Op::I32Load16S { offset: memarg.offset as u32 }),
            Operator::I32Load16U { memarg } => lower_load(&mut ops, &mut height, Op::I32Load16U { offset: memarg.offset as u32 }),
            Operator::I64Load8S { memarg } => lower_load(&mut ops, &mut height, Op::I64Load8S { offset: memarg.offset as u32 }),
            Operator::I64Load8U { memarg } => lower_load(&mut ops, &mut height, Op::I64Load8U { offset: memarg.offset as u32 }),
            Operator::I64Load16S { memarg } => lower_load(&mut ops, &mut height, Op::I64Load16S { offset: memarg.offset as u32 }),
            Operator::I64Load16U { memarg } => lower_load(&mut ops, &mut height, Op::I64Load16U { offset: memarg.offset as u32 }),
            Operator::I64Load32S { memarg } => lower_load(&mut ops, &mut height, Op::I64Load32S { offset: memarg.offset as u32 }),
            Operator::I64Load32U { memarg } => lower_load(&mut ops, &mut height, Op::I64Load32U { offset: memarg.offset as u32 }),

            Operator::I32Store { memarg } => lower_store(&mut ops, &mut height, Op::I32Store { offset: memarg.offset as u32 }),
            Operator::I64Store { memarg } => lower_store(&mut ops, &mut height, Op::I64Store { offset: memarg.offset as u32 }),
            Operator::F32Store { memarg } => lower_store(&mut ops, &mut height, Op::F32Store { offset: memarg.offset as u32 }),
            Operator::F64Store { memarg } => lower_store(&mut ops, &mut height, Op::F64Store { offset: memarg.offset as u32 }),
            Operator::I32Store8 { memarg } => lower_store(&mut ops, &mut height, Op::I32Store8 { offset: memarg.offset as u32 }),
            Operator::I32Store16 { memarg } => lower_store(&mut ops, &mut height, Op::I32Store16 { offset: memarg.offset as u32 }),
            Operator::I64Store8 { memarg } => lower_store(&mut ops, &mut height, Op::I64Store8 { offset: memarg.offset as u32 }),
            Operator::I64Store16 { memarg } => lower_store(&mut ops, &mut height, Op::I64Store16 { offset: memarg.offset as u32 }),
            Operator::I64Store32 { memarg } => lower_store(&mut ops, &mut height, Op::I64Store32 { offset: memarg.offset as u32 }),

            Operator::MemorySize { .. } => {
                height += 1;
                emit!(Op::MemorySize);
            }
            Operator::MemoryGrow { .. } => {
                emit!(Op::MemoryGrow);
            }

            Operator::I32Const { value } => {
                height += 1;
                emit!(Op::I32Const(value));
            }
            Operator::I64Const { value } => {
                height += 1;
                emit!(Op::I64Const(value));
            }
            Operator::F32Const { value } => {
                height += 1;
                emit!(Op::F32Const(value.bits()));
            }
            Operator::F64Const { value } => {
                height += 1;
                emit!(Op::F64Const(value.bits()));
            }

            // One-operand operators: pop one, push one.
            Operator::I32Eqz => lower_unop(&mut ops, Op::I32Eqz),
            Operator::I32Clz => lower_unop(&mut ops, Op::I32Clz),
            Operator::I32Ctz => lower_unop(&mut ops, Op::I32Ctz),
            Operator::I32Popcnt => lower_unop(&mut ops, Op::I32Popcnt),
            Operator::I64Eqz => lower_unop(&mut ops, Op::I64Eqz),
            Operator::I64Clz => lower_unop(&mut ops, Op::I64Clz),
            Operator::I64Ctz => lower_unop(&mut ops, Op::I64Ctz),
            Operator::I64Popcnt => lower_unop(&mut ops, Op::I64Popcnt),
            Operator::F32Abs => lower_unop(&mut ops, Op::F32Abs),
            Operator::F32Neg => lower_unop(&mut ops, Op::F32Neg),
            Operator::F32Ceil => lower_unop(&mut ops, Op::F32Ceil),
            Operator::F32Floor => lower_unop(&mut ops, Op::F32Floor),
            Operator::F32Trunc => lower_unop(&mut ops, Op::F32Trunc),
            Operator::F32Nearest => lower_unop(&mut ops, Op::F32Nearest),
            Operator::F32Sqrt => lower_unop(&mut ops, Op::F32Sqrt),
            Operator::F64Abs => lower_unop(&mut ops, Op::F64Abs),
            Operator::F64Neg => lower_unop(&mut ops, Op::F64Neg),
            Operator::F64Ceil => lower_unop(&mut ops, Op::F64Ceil),
            Operator::F64Floor => lower_unop(&mut ops, Op::F64Floor),
            Operator::F64Trunc => lower_unop(&mut ops, Op::F64Trunc),
            Operator::F64Nearest => lower_unop(&mut ops, Op::F64Nearest),
            Operator::F64Sqrt => lower_unop(&mut ops, Op::F64Sqrt),
            Operator::I32WrapI64 => lower_unop(&mut ops, Op::I32WrapI64),
            Operator::I32TruncF32S => lower_unop(&mut ops, Op::I32TruncF32S),
            Operator::I32TruncF32U => lower_unop(&mut ops, Op::I32TruncF32U),
            Operator::I32TruncF64S => lower_unop(&mut ops, Op::I32TruncF64S),
            Operator::I32TruncF64U => lower_unop(&mut ops, Op::I32TruncF64U),
            Operator::I64ExtendI32S => lower_unop(&mut ops, Op::I64ExtendI32S),
            Operator::I64ExtendI32U => lower_unop(&mut ops, Op::I64ExtendI32U),
            Operator::I64TruncF32S => lower_unop(&mut ops, Op::I64TruncF32S),
            Operator::I64TruncF32U => lower_unop(&mut ops, Op::I64TruncF32U),
            Operator::I64TruncF64S => lower_unop(&mut ops, Op::I64TruncF64S),
            Operator::I64TruncF64U => lower_unop(&mut ops, Op::I64TruncF64U),
            Operator::F32ConvertI32S => lower_unop(&mut ops, Op::F32ConvertI32S),
            Operator::F32ConvertI32U => lower_unop(&mut ops, Op::F32ConvertI32U),
            Operator::F32ConvertI64S => lower_unop(&mut ops, Op::F32ConvertI64S),
            Operator::F32ConvertI64U => lower_unop(&mut ops, Op::F32ConvertI64U),
            Operator::F32DemoteF64 => lower_unop(&mut ops, Op::F32DemoteF64),
            Operator::F64ConvertI32S => lower_unop(&mut ops, Op::F64ConvertI32S),
            Operator::F64ConvertI32U => lower_unop(&mut ops, Op::F64ConvertI32U),
            Operator::F64ConvertI64S => lower_unop(&mut ops, Op::F64ConvertI64S),
            Operator::F64ConvertI64U => lower_unop(&mut ops, Op::F64ConvertI64U),
            Operator::F64PromoteF32 => lower_unop(&mut ops, Op::F64PromoteF32),
            Operator::I32ReinterpretF32 => lower_unop(&mut ops, Op::I32ReinterpretF32),
            Operator::I64ReinterpretF64 => lower_unop(&mut ops, Op::I64ReinterpretF64),
            Operator::F32ReinterpretI32 => lower_unop(&mut ops, Op::F32ReinterpretI32),
            Operator::F64ReinterpretI64 => lower_unop(&mut ops, Op::F64ReinterpretI64),
            Operator::I32Extend8S => lower_unop(&mut ops, Op::I32Extend8S),
            Operator::I32Extend16S => lower_unop(&mut ops, Op::I32Extend16S),
            Operator::I64Extend8S => lower_unop(&mut ops, Op::I64Extend8S),
            Operator::I64Extend16S => lower_unop(&mut ops, Op::I64Extend16S),
            Operator::I64Extend32S => lower_unop(&mut ops, Op::I64Extend32S),
            Operator::I32TruncSatF32S => lower_unop(&mut ops, Op::I32TruncSatF32S),
            Operator::I32TruncSatF32U => lower_unop(&mut ops, Op::I32TruncSatF32U),
            Operator::I32TruncSatF64S => lower_unop(&mut ops, Op::I32TruncSatF64S),
            Operator::I32TruncSatF64U => lower_unop(&mut ops, Op::I32TruncSatF64U),
            Operator::I64TruncSatF32S => lower_unop(&mut ops, Op::I64TruncSatF32S),
            Operator::I64TruncSatF32U => lower_unop(&mut ops, Op::I64TruncSatF32U),
            Operator::I64TruncSatF64S => lower_unop(&mut ops, Op::I64TruncSatF64S),
            Operator::I64TruncSatF64U => lower_unop(&mut ops, Op::I64TruncSatF64U),

            // Two-operand operators: pop two, push one.
            Operator::I32Eq => lower_binop(&mut ops, &mut height, Op::I32Eq),
            Operator::I32Ne => lower_binop(&mut ops, &mut height, Op::I32Ne),
            Operator::I32LtS => lower_binop(&mut ops, &mut height, Op::I32LtS),
            Operator::I32LtU => lower_binop(&mut ops, &mut height, Op::I32LtU),
            Operator::I32GtS => lower_binop(&mut ops, &mut height, Op::I32GtS),
            Operator::I32GtU => lower_binop(&mut ops, &mut height, Op::I32GtU),
            Operator::I32LeS => lower_binop(&mut ops, &mut height, Op::I32LeS),
            Operator::I32LeU => lower_binop(&mut ops, &mut height, Op::I32LeU),
            Operator::I32GeS => lower_binop(&mut ops, &mut height, Op::I32GeS),
            Operator::I32GeU => lower_binop(&mut ops, &mut height, Op::I32GeU),
            Operator::I32Add => lower_binop(&mut ops, &mut height, Op::I32Add),
            Operator::I32Sub => lower_binop(&mut ops, &mut height, Op::I32Sub),
            Operator::I32Mul => lower_binop(&mut ops, &mut height, Op::I32Mul),
            Operator::I32DivS => lower_binop(&mut ops, &mut height, Op::I32DivS),
            Operator::I32DivU => lower_binop(&mut ops, &mut height, Op::I32DivU),
            Operator::I32RemS => lower_binop(&mut ops, &mut height, Op::I32RemS),
            Operator::I32RemU => lower_binop(&mut ops, &mut height, Op::I32RemU),
            Operator::I32And => lower_binop(&mut ops, &mut height, Op::I32And),
            Operator::I32Or => lower_binop(&mut ops, &mut height, Op::I32Or),
            Operator::I32Xor => lower_binop(&mut ops, &mut height, Op::I32Xor),
            Operator::I32Shl => lower_binop(&mut ops, &mut height, Op::I32Shl),
            Operator::I32ShrS => lower_binop(&mut ops, &mut height, Op::I32ShrS),
            Operator::I32ShrU => lower_binop(&mut ops, &mut height, Op::I32ShrU),
            Operator::I32Rotl => lower_binop(&mut ops, &mut height, Op::I32Rotl),
            Operator::I32Rotr => lower_binop(&mut ops, &mut height, Op::I32Rotr),
            Operator::I64Eq => lower_binop(&mut ops, &mut height, Op::I64Eq),
            Operator::I64Ne => lower_binop(&mut ops, &mut height, Op::I64Ne),
            Operator::I64LtS => lower_binop(&mut ops, &mut height, Op::I64LtS),
            Operator::I64LtU => lower_binop(&mut ops, &mut height, Op::I64LtU),
            Operator::I64GtS => lower_binop(&mut ops, &mut height, Op::I64GtS),
            Operator::I64GtU => lower_binop(&mut ops, &mut height, Op::I64GtU),
            Operator::I64LeS => lower_binop(&mut ops, &mut height, Op::I64LeS),
            Operator::I64LeU => lower_binop(&mut ops, &mut height, Op::I64LeU),
            Operator::I64GeS => lower_binop(&mut ops, &mut height, Op::I64GeS),
            Operator::I64GeU => lower_binop(&mut ops, &mut height, Op::I64GeU),
            Operator::I64Add => lower_binop(&mut ops, &mut height, Op::I64Add),
            Operator::I64Sub => lower_binop(&mut ops, &mut height, Op::I64Sub),
            Operator::I64Mul => lower_binop(&mut ops, &mut height, Op::I64Mul),
            Operator::I64DivS => lower_binop(&mut ops, &mut height, Op::I64DivS),
            Operator::I64DivU => lower_binop(&mut ops, &mut height, Op::I64DivU),
            Operator::I64RemS => lower_binop(&mut ops, &mut height, Op::I64RemS),
            Operator::I64RemU => lower_binop(&mut ops, &mut height, Op::I64RemU),
            Operator::I64And => lower_binop(&mut ops, &mut height, Op::I64And),
            Operator::I64Or => lower_binop(&mut ops, &mut height, Op::I64Or),
            Operator::I64Xor => lower_binop(&mut ops, &mut height, Op::I64Xor),
            Operator::I64Shl => lower_binop(&mut ops, &mut height, Op::I64Shl),
            Operator::I64ShrS => lower_binop(&mut ops, &mut height, Op::I64ShrS),
            Operator::I64ShrU => lower_binop(&mut ops, &mut height, Op::I64ShrU),
            Operator::I64Rotl => lower_binop(&mut ops, &mut height, Op::I64Rotl),
            Operator::I64Rotr => lower_binop(&mut ops, &mut height, Op::I64Rotr),
            Operator::F32Eq => lower_binop(&mut ops, &mut height, Op::F32Eq),
            Operator::F32Ne => lower_binop(&mut ops, &mut height, Op::F32Ne),
            Operator::F32Lt => lower_binop(&mut ops, &mut height, Op::F32Lt),
            Operator::F32Gt => lower_binop(&mut ops, &mut height, Op::F32Gt),
            Operator::F32Le => lower_binop(&mut ops, &mut height, Op::F32Le),
            Operator::F32Ge => lower_binop(&mut ops, &mut height, Op::F32Ge),
            Operator::F32Add => lower_binop(&mut ops, &mut height, Op::F32Add),
            Operator::F32Sub => lower_binop(&mut ops, &mut height, Op::F32Sub),
            Operator::F32Mul => lower_binop(&mut ops, &mut height, Op::F32Mul),
            Operator::F32Div => lower_binop(&mut ops, &mut height, Op::F32Div),
            Operator::F32Min => lower_binop(&mut ops, &mut height, Op::F32Min),
            Operator::F32Max => lower_binop(&mut ops, &mut height, Op::F32Max),
            Operator::F32Copysign => lower_binop(&mut ops, &mut height, Op::F32Copysign),
            Operator::F64Eq => lower_binop(&mut ops, &mut height, Op::F64Eq),
            Operator::F64Ne => lower_binop(&mut ops, &mut height, Op::F64Ne),
            Operator::F64Lt => lower_binop(&mut ops, &mut height, Op::F64Lt),
            Operator::F64Gt => lower_binop(&mut ops, &mut height, Op::F64Gt),
            Operator::F64Le => lower_binop(&mut ops, &mut height, Op::F64Le),
            Operator::F64Ge => lower_binop(&mut ops, &mut height, Op::F64Ge),
            Operator::F64Add => lower_binop(&mut ops, &mut height, Op::F64Add),
            Operator::F64Sub => lower_binop(&mut ops, &mut height, Op::F64Sub),
            Operator::F64Mul => lower_binop(&mut ops, &mut height, Op::F64Mul),
            Operator::F64Div => lower_binop(&mut ops, &mut height, Op::F64Div),
            Operator::F64Min => lower_binop(&mut ops, &mut height, Op::F64Min),
            Operator::F64Max => lower_binop(&mut ops, &mut height, Op::F64Max),
            Operator::F64Copysign => lower_binop(&mut ops, &mut height, Op::F64Copysign),

            other => {
                return Err(unsupported(&format!("operator {:?}", other)));
            }
        }
    }

    Ok(LoweredFunction {
        num_params,
        num_locals,
        ops,
    })
}

fn lower_unop(ops: &mut Vec<Op>, op: Op) {
    ops.push(op);
}

fn lower_binop(ops: &mut Vec<Op>, height: &mut usize, op: Op) {
    *height -= 1;
    ops.push(op);
}

fn lower_load(ops: &mut Vec<Op>, _height: &mut usize, op: Op) {
    ops.push(op);
}

fn lower_store(ops: &mut Vec<Op>, height: &mut usize, op: Op) {
    *height -= 2;
    ops.push(op);
}

fn patch(ops: &mut [Op], op_index: usize, slot: FixupSlot, pc: u32) {
    match (&mut ops[op_index], slot) {
        (Op::Br(target), FixupSlot::Single) => target.pc = pc,
        (Op::BrIf(target), FixupSlot::Single) => target.pc = pc,
        (Op::Jump { pc: slot_pc }, FixupSlot::Single) => *slot_pc = pc,
        (Op::JumpIfZero { pc: slot_pc }, FixupSlot::Single) => *slot_pc = pc,
        (Op::BrTable { targets, .. }, FixupSlot::Table(index)) => targets[index].pc = pc,
        (Op::BrTable { default, .. }, FixupSlot::TableDefault) => default.pc = pc,
        (op, _) => unreachable!("fixup against unexpected op {:?}", op),
    }
}
