//! Instruction encoding for the stack machine.
//!
//! Every instruction is a single `u32` word: the opcode sits in the top
//! [`OPCODE_BITS`] bits, the operand fills the rest. Branch operands are
//! two's complement offsets relative to the branch instruction itself.
use core::{fmt, ops::Range};

pub const OPCODE_BITS: u32 = 5;
pub const OPERAND_BITS: u32 = u32::BITS - OPCODE_BITS;
pub const MAX_OPERAND: u32 = (1 << OPERAND_BITS) - 1;

const MAX_OFFSET: i32 = (1 << (OPERAND_BITS - 1)) - 1;
const MIN_OFFSET: i32 = -(1 << (OPERAND_BITS - 1));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// pop 1, discard
    Drop = 0,
    /// push local[base + arg]
    Local,
    /// pop -> local[base + arg]
    SetLocal,
    /// push *foreign[arg]
    Foreign,
    /// pop -> *foreign[arg]
    SetForeign,
    /// push global[arg]
    Global,
    /// pop -> global[arg]
    SetGlobal,
    /// push a closure over the template in global[arg]
    Closure,
    /// pop callee, call it with the `arg` values below it
    Call,
    /// pop return value, unwind the frame
    Ret,
    /// pc += arg (signed)
    Branch,
    /// pop, pc += arg (signed) when the value tests false
    BranchIfFalse,
}

impl Opcode {
    const ALL: [Opcode; 12] = [
        Opcode::Drop,
        Opcode::Local,
        Opcode::SetLocal,
        Opcode::Foreign,
        Opcode::SetForeign,
        Opcode::Global,
        Opcode::SetGlobal,
        Opcode::Closure,
        Opcode::Call,
        Opcode::Ret,
        Opcode::Branch,
        Opcode::BranchIfFalse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Drop => "DROP",
            Opcode::Local => "LOCAL",
            Opcode::SetLocal => "SET_LOCAL",
            Opcode::Foreign => "FOREIGN",
            Opcode::SetForeign => "SET_FOREIGN",
            Opcode::Global => "GLOBAL",
            Opcode::SetGlobal => "SET_GLOBAL",
            Opcode::Closure => "CLOSURE",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::Branch => "BRANCH",
            Opcode::BranchIfFalse => "BRANCH_IF_FALSE",
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::BranchIfFalse)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(raw)).copied().ok_or(raw)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An instruction that cannot be represented in one word.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{op} operand {arg} does not fit an instruction")]
    OperandTooLarge { op: Opcode, arg: usize },
    #[error("branch offset {0} out of range")]
    OffsetOutOfRange(i64),
}

pub fn encode(op: Opcode, arg: u32) -> u32 {
    assert!(arg <= MAX_OPERAND, "operand {arg} does not fit an instruction");
    (op as u32) << OPERAND_BITS | arg
}

/// Splits a word into its raw opcode and operand.
///
/// The opcode is returned as `Err(raw)` if it is not one we know about;
/// the evaluator treats that as a broken invariant.
pub fn decode(word: u32) -> (Result<Opcode, u8>, u32) {
    let raw = (word >> OPERAND_BITS) as u8;
    (Opcode::try_from(raw), word & MAX_OPERAND)
}

pub fn encode_offset(offset: i64) -> Result<u32, EncodeError> {
    let offset = i32::try_from(offset)
        .ok()
        .filter(|offset| (MIN_OFFSET..=MAX_OFFSET).contains(offset))
        .ok_or(EncodeError::OffsetOutOfRange(offset))?;
    Ok((offset as u32) & MAX_OPERAND)
}

pub fn decode_offset(arg: u32) -> i32 {
    // sign-extend from OPERAND_BITS
    ((arg << OPCODE_BITS) as i32) >> OPCODE_BITS
}

/// An append-only instruction buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Code {
    words: Vec<u32>,
}

impl Code {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Emits an instruction and returns its position.
    pub fn emit(&mut self, op: Opcode, arg: usize) -> Result<usize, EncodeError> {
        let arg = u32::try_from(arg)
            .ok()
            .filter(|arg| *arg <= MAX_OPERAND)
            .ok_or(EncodeError::OperandTooLarge { op, arg })?;
        let pos = self.words.len();
        self.words.push(encode(op, arg));
        Ok(pos)
    }

    /// Emits a branch whose target is not known yet, see [`Self::patch_branch`].
    pub fn emit_forward_branch(&mut self, op: Opcode) -> usize {
        debug_assert!(op.is_branch());
        let pos = self.words.len();
        self.words.push(encode(op, 0));
        pos
    }

    /// Emits a branch to an already emitted position.
    pub fn emit_branch_to(&mut self, op: Opcode, target: usize) -> Result<usize, EncodeError> {
        debug_assert!(op.is_branch());
        let pos = self.words.len();
        let arg = encode_offset(relative(pos, target))?;
        self.words.push(encode(op, arg));
        Ok(pos)
    }

    /// Points the branch at `pos` to the next instruction to be emitted.
    pub fn patch_branch(&mut self, pos: usize) -> Result<(), EncodeError> {
        let (Ok(op), _) = decode(self.words[pos]) else {
            unreachable!("patching a non-instruction at {pos}");
        };
        assert!(op.is_branch(), "patching {op} at {pos}");
        let arg = encode_offset(relative(pos, self.words.len()))?;
        self.words[pos] = encode(op, arg);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_raw(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn fetch(&self, pc: usize) -> (Result<Opcode, u8>, u32) {
        decode(self.words[pc])
    }

    /// Moves all instructions of `other` to the end of this buffer and
    /// returns the offset the first one landed at.
    pub fn append(&mut self, mut other: Code) -> usize {
        let offset = self.words.len();
        self.words.append(&mut other.words);
        offset
    }

    /// Drops everything from `len` on.
    pub fn truncate(&mut self, len: usize) {
        self.words.truncate(len);
    }

    pub fn instructions(&self) -> impl Iterator<Item = (usize, Opcode, u32)> + '_ {
        self.words.iter().enumerate().filter_map(|(pc, word)| {
            let (op, arg) = decode(*word);
            op.ok().map(|op| (pc, op, arg))
        })
    }

    /// Counts emitted instructions with the given opcode.
    pub fn count(&self, op: Opcode) -> usize {
        self.instructions().filter(|(_, o, _)| *o == op).count()
    }
}

fn relative(from: usize, to: usize) -> i64 {
    to as i64 - from as i64
}

/// A disassembly of part of a [`Code`] buffer, positions kept absolute.
pub struct Listing<'a> {
    code: &'a Code,
    range: Range<usize>,
}

impl Code {
    pub fn listing(&self, range: Range<usize>) -> Listing<'_> {
        Listing { code: self, range }
    }

    /// The body of the function starting at `offset`, up to and including
    /// its RET.
    pub fn function_listing(&self, offset: usize) -> Listing<'_> {
        let end = self.words[offset..]
            .iter()
            .position(|word| decode(*word).0 == Ok(Opcode::Ret))
            .map_or(self.words.len(), |ret| offset + ret + 1);
        self.listing(offset..end)
    }
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pc in self.range.clone() {
            match decode(self.code.words[pc]) {
                (Ok(op), arg) if op.is_branch() => {
                    let offset = decode_offset(arg);
                    writeln!(
                        f,
                        "{pc:04} {op} {offset:+} ; -> {:04}",
                        pc as i64 + i64::from(offset)
                    )?;
                }
                (Ok(op @ (Opcode::Drop | Opcode::Ret)), _) => writeln!(f, "{pc:04} {op}")?,
                (Ok(op), arg) => writeln!(f, "{pc:04} {op} {arg}")?,
                (Err(raw), arg) => writeln!(f, "{pc:04} ??{raw} {arg}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.listing(0..self.len()), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    #[test]
    fn encoding_keeps_opcode_and_operand() {
        for op in Opcode::ALL {
            let (decoded, arg) = decode(encode(op, MAX_OPERAND));
            check!(decoded == Ok(op));
            check!(arg == MAX_OPERAND);
        }
    }

    #[test]
    fn unknown_opcodes_are_reported() {
        let word = 31u32 << OPERAND_BITS | 7;
        let_assert!((Err(raw), 7) = decode(word));
        check!(raw == 31);
    }

    #[test]
    fn offsets_sign_extend() {
        arbtest(|u| {
            let offset = u.int_in_range(MIN_OFFSET..=MAX_OFFSET)?;
            let_assert!(Ok(arg) = encode_offset(offset.into()));
            check!(decode_offset(arg) == offset);
            Ok(())
        });
    }

    #[test]
    fn forward_and_backward_branches() {
        let mut code = Code::new();
        let_assert!(Ok(start) = code.emit(Opcode::Global, 0));
        let exit = code.emit_forward_branch(Opcode::BranchIfFalse);
        let_assert!(Ok(_) = code.emit(Opcode::Drop, 0));
        let_assert!(Ok(_) = code.emit_branch_to(Opcode::Branch, start));
        let_assert!(Ok(()) = code.patch_branch(exit));
        let_assert!(Ok(_) = code.emit(Opcode::Ret, 0));

        let_assert!((Ok(Opcode::BranchIfFalse), arg) = code.fetch(exit));
        check!(decode_offset(arg) == 3);
        let_assert!((Ok(Opcode::Branch), arg) = code.fetch(3));
        check!(decode_offset(arg) == -3);
    }

    #[test]
    fn appended_code_reports_its_offset() {
        let mut segment = Code::new();
        let_assert!(Ok(_) = segment.emit(Opcode::Ret, 0));
        let mut function = Code::new();
        let_assert!(Ok(_) = function.emit(Opcode::Local, 0));
        let_assert!(Ok(_) = function.emit(Opcode::Ret, 0));
        check!(segment.append(function) == 1);
        check!(segment.len() == 3);
        check!(segment.to_string() == "0000 RET\n0001 LOCAL 0\n0002 RET\n");
        check!(segment.function_listing(1).to_string() == "0001 LOCAL 0\n0002 RET\n");
        check!(segment.function_listing(0).to_string() == "0000 RET\n");
    }

    #[test]
    fn oversized_operands_are_refused() {
        let mut code = Code::new();
        let_assert!(Ok(_) = code.emit(Opcode::Global, MAX_OPERAND as usize));
        let_assert!(
            Err(EncodeError::OperandTooLarge { op: Opcode::Global, arg }) =
                code.emit(Opcode::Global, MAX_OPERAND as usize + 1)
        );
        check!(arg == MAX_OPERAND as usize + 1);
        check!(code.len() == 1);

        let_assert!(Err(EncodeError::OffsetOutOfRange(_)) = code.emit_branch_to(Opcode::Branch, 1 << 30));
        let_assert!(Err(EncodeError::OffsetOutOfRange(_)) = encode_offset(i64::from(MIN_OFFSET) - 1));
        check!(code.len() == 1);
    }
}
