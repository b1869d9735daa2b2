//! Opcode constants and instruction-length tables.
//!
//! The constants cover the full standard set plus the reserved internal
//! range 0xCB-0xDF: fast variants the interpreter rewrites resolved
//! instructions into, and `CUSTOMCODE`, whose body is a host callback.
//! Reserved opcodes must never appear in a classfile on disk.
//!
//! The length helpers are shared by the attribute parser (to scan code
//! for reserved opcodes), the interpreter (to advance `ip`), and the
//! stack-map scanner (to step symbolically between map entries).

/// Opcode constants.
pub mod opcode {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_M1: u8 = 0x02;
    pub const ICONST_0: u8 = 0x03;
    pub const ICONST_1: u8 = 0x04;
    pub const ICONST_2: u8 = 0x05;
    pub const ICONST_3: u8 = 0x06;
    pub const ICONST_4: u8 = 0x07;
    pub const ICONST_5: u8 = 0x08;
    pub const LCONST_0: u8 = 0x09;
    pub const LCONST_1: u8 = 0x0A;
    pub const FCONST_0: u8 = 0x0B;
    pub const FCONST_1: u8 = 0x0C;
    pub const FCONST_2: u8 = 0x0D;
    pub const DCONST_0: u8 = 0x0E;
    pub const DCONST_1: u8 = 0x0F;
    pub const BIPUSH: u8 = 0x10;
    pub const SIPUSH: u8 = 0x11;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const ILOAD: u8 = 0x15;
    pub const LLOAD: u8 = 0x16;
    pub const FLOAD: u8 = 0x17;
    pub const DLOAD: u8 = 0x18;
    pub const ALOAD: u8 = 0x19;
    pub const ILOAD_0: u8 = 0x1A;
    pub const ILOAD_1: u8 = 0x1B;
    pub const ILOAD_2: u8 = 0x1C;
    pub const ILOAD_3: u8 = 0x1D;
    pub const LLOAD_0: u8 = 0x1E;
    pub const LLOAD_1: u8 = 0x1F;
    pub const LLOAD_2: u8 = 0x20;
    pub const LLOAD_3: u8 = 0x21;
    pub const FLOAD_0: u8 = 0x22;
    pub const FLOAD_1: u8 = 0x23;
    pub const FLOAD_2: u8 = 0x24;
    pub const FLOAD_3: u8 = 0x25;
    pub const DLOAD_0: u8 = 0x26;
    pub const DLOAD_1: u8 = 0x27;
    pub const DLOAD_2: u8 = 0x28;
    pub const DLOAD_3: u8 = 0x29;
    pub const ALOAD_0: u8 = 0x2A;
    pub const ALOAD_1: u8 = 0x2B;
    pub const ALOAD_2: u8 = 0x2C;
    pub const ALOAD_3: u8 = 0x2D;
    pub const IALOAD: u8 = 0x2E;
    pub const LALOAD: u8 = 0x2F;
    pub const FALOAD: u8 = 0x30;
    pub const DALOAD: u8 = 0x31;
    pub const AALOAD: u8 = 0x32;
    pub const BALOAD: u8 = 0x33;
    pub const CALOAD: u8 = 0x34;
    pub const SALOAD: u8 = 0x35;
    pub const ISTORE: u8 = 0x36;
    pub const LSTORE: u8 = 0x37;
    pub const FSTORE: u8 = 0x38;
    pub const DSTORE: u8 = 0x39;
    pub const ASTORE: u8 = 0x3A;
    pub const ISTORE_0: u8 = 0x3B;
    pub const ISTORE_1: u8 = 0x3C;
    pub const ISTORE_2: u8 = 0x3D;
    pub const ISTORE_3: u8 = 0x3E;
    pub const LSTORE_0: u8 = 0x3F;
    pub const LSTORE_1: u8 = 0x40;
    pub const LSTORE_2: u8 = 0x41;
    pub const LSTORE_3: u8 = 0x42;
    pub const FSTORE_0: u8 = 0x43;
    pub const FSTORE_1: u8 = 0x44;
    pub const FSTORE_2: u8 = 0x45;
    pub const FSTORE_3: u8 = 0x46;
    pub const DSTORE_0: u8 = 0x47;
    pub const DSTORE_1: u8 = 0x48;
    pub const DSTORE_2: u8 = 0x49;
    pub const DSTORE_3: u8 = 0x4A;
    pub const ASTORE_0: u8 = 0x4B;
    pub const ASTORE_1: u8 = 0x4C;
    pub const ASTORE_2: u8 = 0x4D;
    pub const ASTORE_3: u8 = 0x4E;
    pub const IASTORE: u8 = 0x4F;
    pub const LASTORE: u8 = 0x50;
    pub const FASTORE: u8 = 0x51;
    pub const DASTORE: u8 = 0x52;
    pub const AASTORE: u8 = 0x53;
    pub const BASTORE: u8 = 0x54;
    pub const CASTORE: u8 = 0x55;
    pub const SASTORE: u8 = 0x56;
    pub const POP: u8 = 0x57;
    pub const POP2: u8 = 0x58;
    pub const DUP: u8 = 0x59;
    pub const DUP_X1: u8 = 0x5A;
    pub const DUP_X2: u8 = 0x5B;
    pub const DUP2: u8 = 0x5C;
    pub const DUP2_X1: u8 = 0x5D;
    pub const DUP2_X2: u8 = 0x5E;
    pub const SWAP: u8 = 0x5F;
    pub const IADD: u8 = 0x60;
    pub const LADD: u8 = 0x61;
    pub const FADD: u8 = 0x62;
    pub const DADD: u8 = 0x63;
    pub const ISUB: u8 = 0x64;
    pub const LSUB: u8 = 0x65;
    pub const FSUB: u8 = 0x66;
    pub const DSUB: u8 = 0x67;
    pub const IMUL: u8 = 0x68;
    pub const LMUL: u8 = 0x69;
    pub const FMUL: u8 = 0x6A;
    pub const DMUL: u8 = 0x6B;
    pub const IDIV: u8 = 0x6C;
    pub const LDIV: u8 = 0x6D;
    pub const FDIV: u8 = 0x6E;
    pub const DDIV: u8 = 0x6F;
    pub const IREM: u8 = 0x70;
    pub const LREM: u8 = 0x71;
    pub const FREM: u8 = 0x72;
    pub const DREM: u8 = 0x73;
    pub const INEG: u8 = 0x74;
    pub const LNEG: u8 = 0x75;
    pub const FNEG: u8 = 0x76;
    pub const DNEG: u8 = 0x77;
    pub const ISHL: u8 = 0x78;
    pub const LSHL: u8 = 0x79;
    pub const ISHR: u8 = 0x7A;
    pub const LSHR: u8 = 0x7B;
    pub const IUSHR: u8 = 0x7C;
    pub const LUSHR: u8 = 0x7D;
    pub const IAND: u8 = 0x7E;
    pub const LAND: u8 = 0x7F;
    pub const IOR: u8 = 0x80;
    pub const LOR: u8 = 0x81;
    pub const IXOR: u8 = 0x82;
    pub const LXOR: u8 = 0x83;
    pub const IINC: u8 = 0x84;
    pub const I2L: u8 = 0x85;
    pub const I2F: u8 = 0x86;
    pub const I2D: u8 = 0x87;
    pub const L2I: u8 = 0x88;
    pub const L2F: u8 = 0x89;
    pub const L2D: u8 = 0x8A;
    pub const F2I: u8 = 0x8B;
    pub const F2L: u8 = 0x8C;
    pub const F2D: u8 = 0x8D;
    pub const D2I: u8 = 0x8E;
    pub const D2L: u8 = 0x8F;
    pub const D2F: u8 = 0x90;
    pub const I2B: u8 = 0x91;
    pub const I2C: u8 = 0x92;
    pub const I2S: u8 = 0x93;
    pub const LCMP: u8 = 0x94;
    pub const FCMPL: u8 = 0x95;
    pub const FCMPG: u8 = 0x96;
    pub const DCMPL: u8 = 0x97;
    pub const DCMPG: u8 = 0x98;
    pub const IFEQ: u8 = 0x99;
    pub const IFNE: u8 = 0x9A;
    pub const IFLT: u8 = 0x9B;
    pub const IFGE: u8 = 0x9C;
    pub const IFGT: u8 = 0x9D;
    pub const IFLE: u8 = 0x9E;
    pub const IF_ICMPEQ: u8 = 0x9F;
    pub const IF_ICMPNE: u8 = 0xA0;
    pub const IF_ICMPLT: u8 = 0xA1;
    pub const IF_ICMPGE: u8 = 0xA2;
    pub const IF_ICMPGT: u8 = 0xA3;
    pub const IF_ICMPLE: u8 = 0xA4;
    pub const IF_ACMPEQ: u8 = 0xA5;
    pub const IF_ACMPNE: u8 = 0xA6;
    pub const GOTO: u8 = 0xA7;
    pub const JSR: u8 = 0xA8;
    pub const RET: u8 = 0xA9;
    pub const TABLESWITCH: u8 = 0xAA;
    pub const LOOKUPSWITCH: u8 = 0xAB;
    pub const IRETURN: u8 = 0xAC;
    pub const LRETURN: u8 = 0xAD;
    pub const FRETURN: u8 = 0xAE;
    pub const DRETURN: u8 = 0xAF;
    pub const ARETURN: u8 = 0xB0;
    pub const RETURN: u8 = 0xB1;
    pub const GETSTATIC: u8 = 0xB2;
    pub const PUTSTATIC: u8 = 0xB3;
    pub const GETFIELD: u8 = 0xB4;
    pub const PUTFIELD: u8 = 0xB5;
    pub const INVOKEVIRTUAL: u8 = 0xB6;
    pub const INVOKESPECIAL: u8 = 0xB7;
    pub const INVOKESTATIC: u8 = 0xB8;
    pub const INVOKEINTERFACE: u8 = 0xB9;
    pub const NEW: u8 = 0xBB;
    pub const NEWARRAY: u8 = 0xBC;
    pub const ANEWARRAY: u8 = 0xBD;
    pub const ARRAYLENGTH: u8 = 0xBE;
    pub const ATHROW: u8 = 0xBF;
    pub const CHECKCAST: u8 = 0xC0;
    pub const INSTANCEOF: u8 = 0xC1;
    pub const MONITORENTER: u8 = 0xC2;
    pub const MONITOREXIT: u8 = 0xC3;
    pub const WIDE: u8 = 0xC4;
    pub const MULTIANEWARRAY: u8 = 0xC5;
    pub const IFNULL: u8 = 0xC6;
    pub const IFNONNULL: u8 = 0xC7;
    pub const GOTO_W: u8 = 0xC8;
    pub const JSR_W: u8 = 0xC9;
    pub const BREAKPOINT: u8 = 0xCA;

    // Reserved internal range. Rewritten at run time; corrupt on disk.
    pub const GETFIELD_FAST: u8 = 0xCB;
    pub const GETFIELDP_FAST: u8 = 0xCC;
    pub const GETFIELD2_FAST: u8 = 0xCD;
    pub const PUTFIELD_FAST: u8 = 0xCE;
    pub const PUTFIELD2_FAST: u8 = 0xCF;
    pub const GETSTATIC_FAST: u8 = 0xD0;
    pub const GETSTATICP_FAST: u8 = 0xD1;
    pub const GETSTATIC2_FAST: u8 = 0xD2;
    pub const PUTSTATIC_FAST: u8 = 0xD3;
    pub const PUTSTATIC2_FAST: u8 = 0xD4;
    pub const INVOKEVIRTUAL_FAST: u8 = 0xD6;
    pub const INVOKESPECIAL_FAST: u8 = 0xD7;
    pub const INVOKESTATIC_FAST: u8 = 0xD8;
    pub const INVOKEINTERFACE_FAST: u8 = 0xD9;
    pub const NEW_FAST: u8 = 0xDA;
    pub const ANEWARRAY_FAST: u8 = 0xDB;
    pub const MULTIANEWARRAY_FAST: u8 = 0xDC;
    pub const CHECKCAST_FAST: u8 = 0xDD;
    pub const INSTANCEOF_FAST: u8 = 0xDE;
    pub const CUSTOMCODE: u8 = 0xDF;
}

use opcode::*;

/// Whether an opcode belongs to the reserved internal range (0xCB-0xDF).
#[must_use]
pub fn is_reserved(op: u8) -> bool {
    (GETFIELD_FAST..=CUSTOMCODE).contains(&op)
}

/// Number of fixed operand bytes following an opcode; `None` for the
/// variable-length instructions (`tableswitch`, `lookupswitch`, `wide`).
#[must_use]
pub fn operand_length(op: u8) -> Option<usize> {
    let length = match op {
        BIPUSH | LDC | ILOAD | LLOAD | FLOAD | DLOAD | ALOAD | ISTORE | LSTORE | FSTORE
        | DSTORE | ASTORE | RET | NEWARRAY => 1,
        SIPUSH | LDC_W | LDC2_W | IINC | IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE | IF_ICMPEQ
        | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE | IF_ACMPEQ | IF_ACMPNE
        | GOTO | JSR | GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD | INVOKEVIRTUAL
        | INVOKESPECIAL | INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF | IFNULL
        | IFNONNULL => 2,
        MULTIANEWARRAY => 3,
        INVOKEINTERFACE | GOTO_W | JSR_W => 4,
        TABLESWITCH | LOOKUPSWITCH | WIDE => return None,
        // Fast variants carry a rewritten two-byte operand except for
        // the interface and multianewarray forms, which keep the
        // original operand width.
        GETFIELD_FAST | GETFIELDP_FAST | GETFIELD2_FAST | PUTFIELD_FAST | PUTFIELD2_FAST
        | GETSTATIC_FAST | GETSTATICP_FAST | GETSTATIC2_FAST | PUTSTATIC_FAST
        | PUTSTATIC2_FAST | INVOKEVIRTUAL_FAST | INVOKESPECIAL_FAST | INVOKESTATIC_FAST
        | NEW_FAST | ANEWARRAY_FAST | CHECKCAST_FAST | INSTANCEOF_FAST => 2,
        INVOKEINTERFACE_FAST => 4,
        MULTIANEWARRAY_FAST => 3,
        _ => 0,
    };
    Some(length)
}

/// Total length in bytes of the instruction at `offset`, including the
/// opcode and any switch padding. Unknown opcodes report 1 so scans
/// always make progress.
#[must_use]
pub fn instruction_length(code: &[u8], offset: usize) -> usize {
    let op = code[offset];
    match op {
        WIDE => {
            // wide <op> <u16 index> [+ <u16 const> for iinc]
            match code.get(offset + 1) {
                Some(&IINC) => 6,
                _ => 4,
            }
        }
        TABLESWITCH => {
            let pad = 3 - (offset % 4);
            let base = offset + 1 + pad;
            let low = read_i32(code, base + 4);
            let high = read_i32(code, base + 8);
            let entries = (high.wrapping_sub(low).max(-1) + 1) as usize;
            1 + pad + 12 + entries * 4
        }
        LOOKUPSWITCH => {
            let pad = 3 - (offset % 4);
            let base = offset + 1 + pad;
            let pairs = read_i32(code, base + 4).max(0) as usize;
            1 + pad + 8 + pairs * 8
        }
        _ => 1 + operand_length(op).unwrap_or(0),
    }
}

fn read_i32(code: &[u8], offset: usize) -> i32 {
    let bytes = [
        *code.get(offset).unwrap_or(&0),
        *code.get(offset + 1).unwrap_or(&0),
        *code.get(offset + 2).unwrap_or(&0),
        *code.get(offset + 3).unwrap_or(&0),
    ];
    i32::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_lengths() {
        assert_eq!(operand_length(NOP), Some(0));
        assert_eq!(operand_length(BIPUSH), Some(1));
        assert_eq!(operand_length(SIPUSH), Some(2));
        assert_eq!(operand_length(MULTIANEWARRAY), Some(3));
        assert_eq!(operand_length(INVOKEINTERFACE), Some(4));
        assert_eq!(operand_length(TABLESWITCH), None);
        assert_eq!(operand_length(WIDE), None);
        assert_eq!(operand_length(INVOKEVIRTUAL_FAST), Some(2));
        assert_eq!(operand_length(INVOKEINTERFACE_FAST), Some(4));
    }

    #[test]
    fn test_reserved_range() {
        assert!(!is_reserved(BREAKPOINT));
        assert!(is_reserved(GETFIELD_FAST));
        assert!(is_reserved(CUSTOMCODE));
        assert!(!is_reserved(0xE0));
    }

    #[test]
    fn test_wide_lengths() {
        let code = [WIDE, ILOAD, 0x01, 0x00];
        assert_eq!(instruction_length(&code, 0), 4);
        let code = [WIDE, IINC, 0x01, 0x00, 0x00, 0x05];
        assert_eq!(instruction_length(&code, 0), 6);
    }

    #[test]
    fn test_tableswitch_length() {
        // tableswitch at offset 0: 3 pad bytes, default, low=0, high=1,
        // two 4-byte offsets.
        let mut code = vec![TABLESWITCH, 0, 0, 0];
        code.extend_from_slice(&0i32.to_be_bytes()); // default
        code.extend_from_slice(&0i32.to_be_bytes()); // low
        code.extend_from_slice(&1i32.to_be_bytes()); // high
        code.extend_from_slice(&[0; 8]); // entries
        assert_eq!(instruction_length(&code, 0), code.len());
    }

    #[test]
    fn test_lookupswitch_length() {
        let mut code = vec![LOOKUPSWITCH, 0, 0, 0];
        code.extend_from_slice(&0i32.to_be_bytes()); // default
        code.extend_from_slice(&2i32.to_be_bytes()); // npairs
        code.extend_from_slice(&[0; 16]); // match/offset pairs
        assert_eq!(instruction_length(&code, 0), code.len());
    }
}
