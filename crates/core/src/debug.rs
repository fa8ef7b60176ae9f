//! Chunk disassembler, used by `--dump` and `--trace`.

use std::io::Write;

use crate::chunk::{Chunk, OpCode};
use crate::gc::Heap;

/// Dump a whole chunk under a header line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str, out: &mut dyn Write) {
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, out);
    }
}

/// Print one instruction and return the offset of the next.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.get_line(offset) == chunk.get_line(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.get_line(offset));
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        let _ = writeln!(out, "Unknown opcode {}", byte);
        return offset + 1;
    };

    match op {
        OpCode::Constant => constant_instruction(heap, "OP_CONSTANT", chunk, offset, out),
        OpCode::Nil => simple_instruction("OP_NIL", offset, out),
        OpCode::True => simple_instruction("OP_TRUE", offset, out),
        OpCode::False => simple_instruction("OP_FALSE", offset, out),
        OpCode::Pop => simple_instruction("OP_POP", offset, out),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction(heap, "OP_GET_GLOBAL", chunk, offset, out),
        OpCode::GetGlobalI => byte_instruction("OP_GET_GLOBAL_I", chunk, offset, out),
        OpCode::DefineGlobal => {
            constant_instruction(heap, "OP_DEFINE_GLOBAL", chunk, offset, out)
        }
        OpCode::SetGlobal => constant_instruction(heap, "OP_SET_GLOBAL", chunk, offset, out),
        OpCode::SetGlobalI => byte_instruction("OP_SET_GLOBAL_I", chunk, offset, out),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, out),
        OpCode::GetProperty => constant_instruction(heap, "OP_GET_PROPERTY", chunk, offset, out),
        OpCode::SetProperty => constant_instruction(heap, "OP_SET_PROPERTY", chunk, offset, out),
        OpCode::GetIndex => simple_instruction("OP_GET_INDEX", offset, out),
        OpCode::SetIndex => simple_instruction("OP_SET_INDEX", offset, out),
        OpCode::GetSuper => constant_instruction(heap, "OP_GET_SUPER", chunk, offset, out),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset, out),
        OpCode::Greater => simple_instruction("OP_GREATER", offset, out),
        OpCode::Less => simple_instruction("OP_LESS", offset, out),
        OpCode::LessC => constant_instruction(heap, "OP_LESS_C", chunk, offset, out),
        OpCode::Add => simple_instruction("OP_ADD", offset, out),
        OpCode::AddC => constant_instruction(heap, "OP_ADD_C", chunk, offset, out),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset, out),
        OpCode::SubtractC => constant_instruction(heap, "OP_SUBTRACT_C", chunk, offset, out),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset, out),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset, out),
        OpCode::Modulo => simple_instruction("OP_MODULO", offset, out),
        OpCode::Not => simple_instruction("OP_NOT", offset, out),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset, out),
        OpCode::Print => simple_instruction("OP_PRINT", offset, out),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::PjmpIfFalse => jump_instruction("OP_PJMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, out),
        OpCode::Invoke => invoke_instruction(heap, "OP_INVOKE", chunk, offset, out),
        OpCode::SuperInvoke => invoke_instruction(heap, "OP_SUPER_INVOKE", chunk, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset, out),
        OpCode::ListInit => simple_instruction("OP_LIST_INIT", offset, out),
        OpCode::ListData => byte_instruction("OP_LIST_DATA", chunk, offset, out),
        OpCode::MapInit => simple_instruction("OP_MAP_INIT", offset, out),
        OpCode::MapData => byte_instruction("OP_MAP_DATA", chunk, offset, out),
        OpCode::Return => simple_instruction("OP_RETURN", offset, out),
        OpCode::Class => constant_instruction(heap, "OP_CLASS", chunk, offset, out),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset, out),
        OpCode::Method => constant_instruction(heap, "OP_METHOD", chunk, offset, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut dyn Write) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn constant_instruction(
    heap: &Heap,
    name: &str,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let _ = writeln!(
        out,
        "{:<16} {:4} '{}'",
        name,
        constant,
        heap.format_value(chunk.constants[constant])
    );
    offset + 2
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(
    name: &str,
    sign: i32,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let jump = (u16::from(chunk.code[offset + 1]) << 8) | u16::from(chunk.code[offset + 2]);
    let target = offset as i64 + 3 + i64::from(sign) * i64::from(jump);
    let _ = writeln!(out, "{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    name: &str,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    let _ = writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        name,
        arg_count,
        constant,
        heap.format_value(chunk.constants[constant])
    );
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset] as usize;
    offset += 1;
    let _ = writeln!(
        out,
        "{:<16} {:4} {}",
        "OP_CLOSURE",
        constant,
        heap.format_value(chunk.constants[constant])
    );

    let function = match chunk.constants[constant].as_obj() {
        Some(handle) => heap.function(handle),
        None => return offset,
    };
    for _ in 0..function.upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
