//! 45GS02 call-instruction opcode table.
//!
//! Used by the control engine to recognize subroutine calls (`JSR`/`BSR`)
//! so a step-over can set a transient breakpoint on the return address
//! instead of single-stepping through the callee.

/// The mnemonic of a call-family opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mnemonic {
    Illegal,
    Bsr,
    Jsr,
}

/// Addressing mode, which determines instruction length in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressingMode {
    Absolute,
    AbsoluteIndirect,
    AbsoluteIndirectX,
    RelativeWord,
}

impl AddressingMode {
    /// Total instruction length including the opcode byte.
    #[must_use]
    pub fn instruction_len(self) -> u16 {
        match self {
            AddressingMode::Absolute
            | AddressingMode::AbsoluteIndirect
            | AddressingMode::AbsoluteIndirectX
            | AddressingMode::RelativeWord => 3,
        }
    }
}

/// A single table entry: opcode byte, mnemonic, addressing mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Opcode {
    pub code: u8,
    pub mnemonic: Mnemonic,
    pub mode: AddressingMode,
}

const ILLEGAL: Opcode = Opcode {
    code: 0x00,
    mnemonic: Mnemonic::Illegal,
    mode: AddressingMode::Absolute,
};

/// The call-family opcode table, in ascending-code order as in the
/// reference implementation (illegal sentinel first).
pub const OPCODES: [Opcode; 5] = [
    ILLEGAL,
    Opcode {
        code: 0x20,
        mnemonic: Mnemonic::Jsr,
        mode: AddressingMode::Absolute,
    },
    Opcode {
        code: 0x22,
        mnemonic: Mnemonic::Jsr,
        mode: AddressingMode::AbsoluteIndirect,
    },
    Opcode {
        code: 0x23,
        mnemonic: Mnemonic::Jsr,
        mode: AddressingMode::AbsoluteIndirectX,
    },
    Opcode {
        code: 0x63,
        mnemonic: Mnemonic::Bsr,
        mode: AddressingMode::RelativeWord,
    },
];

/// Returns every table entry matching `mnemonic`.
#[must_use]
pub fn opcodes_for(mnemonic: Mnemonic) -> Vec<Opcode> {
    OPCODES.iter().filter(|o| o.mnemonic == mnemonic).copied().collect()
}

/// Counts entries matching `mnemonic`.
#[must_use]
pub fn num_opcodes(mnemonic: Mnemonic) -> usize {
    OPCODES.iter().filter(|o| o.mnemonic == mnemonic).count()
}

/// Counts entries matching any of `mnemonics`.
#[must_use]
pub fn num_opcodes_any(mnemonics: &[Mnemonic]) -> usize {
    mnemonics.iter().map(|m| num_opcodes(*m)).sum()
}

/// Looks up the table entry for `code`, or the illegal sentinel if none match.
#[must_use]
pub fn opcode_at(code: u8) -> Opcode {
    OPCODES.iter().find(|o| o.code == code).copied().unwrap_or(ILLEGAL)
}

/// Returns true if `code` begins a subroutine call (`JSR`/`BSR`) instruction.
#[must_use]
pub fn is_call(code: u8) -> bool {
    !matches!(opcode_at(code).mnemonic, Mnemonic::Illegal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_bsr_opcodes() {
        let result = opcodes_for(Mnemonic::Bsr);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].mnemonic, Mnemonic::Bsr);
        assert_eq!(result[0].code, 0x63);
    }

    #[test]
    fn get_jsr_opcodes() {
        let result = opcodes_for(Mnemonic::Jsr);
        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|o| o.mnemonic == Mnemonic::Jsr));
    }

    #[test]
    fn num_opcodes_matches_table() {
        assert_eq!(num_opcodes(Mnemonic::Jsr), 3);
        assert_eq!(num_opcodes(Mnemonic::Bsr), 1);
        assert_eq!(num_opcodes_any(&[Mnemonic::Jsr, Mnemonic::Bsr]), 4);
    }

    #[test]
    fn opcode_at_unknown_code_is_illegal() {
        assert_eq!(opcode_at(0xEA).mnemonic, Mnemonic::Illegal);
        assert!(!is_call(0xEA));
        assert!(is_call(0x20));
    }
}
