//! Precise root finding: pointer maps and the register-mask scanner.
//!
//! Each verified method carries `(offset, pointer-bitmap)` entries at
//! its basic-block boundaries. [`register_mask`] reconstructs the exact
//! bitmap for any instruction: it loads the nearest preceding entry (or
//! derives the entry-point mask from the method signature) and then
//! symbolically steps the bytecodes up to the target, applying each
//! opcode's deterministic effect on slot pointer-ness. Storing a bitmap
//! per instruction would bloat method metadata severalfold; stepping
//! between saved points is small and fast.
//!
//! The scanner only ever crosses instructions that have executed, so
//! field and invoke sites it steps over are already resolved; an
//! unresolved entry here means the maps are inconsistent with the code,
//! which is fatal.

use crate::error::Error::Fatal;
use crate::error::Result;
use crate::klass::{MethodId, PointerMap, PointerMapEntry, StackMaps};
use crate::pool::RtConstant;
use crate::registry::ClassRegistry;
use crate::string_table::{for_each_parameter, StringTable};
use kelvin_classfile::bytecode::opcode::*;
use kelvin_classfile::VerificationType;

/// Largest stack size expressible in a short-form entry.
const SHORT_MAX_STACK: usize = 15;
/// Largest offset expressible in a short-form entry.
const SHORT_MAX_OFFSET: u16 = 0x0FFF;

// ----- bitmap helpers ----------------------------------------------------

fn bit_set(map: &mut [u8], bit: usize) {
    map[bit >> 3] |= 1 << (bit & 7);
}

fn bit_clear(map: &mut [u8], bit: usize) {
    map[bit >> 3] &= !(1 << (bit & 7));
}

fn bit_get(map: &[u8], bit: usize) -> bool {
    map[bit >> 3] & (1 << (bit & 7)) != 0
}

fn get_bits(map: &[u8], bit: usize, count: usize, values: &mut [bool]) {
    for (index, value) in values.iter_mut().enumerate().take(count) {
        *value = bit_get(map, bit + index);
    }
}

fn set_bits(map: &mut [u8], bit: usize, count: usize, values: &[bool]) {
    for (index, &value) in values.iter().enumerate().take(count) {
        if value {
            bit_set(map, bit + index);
        } else {
            bit_clear(map, bit + index);
        }
    }
}

// ----- rewriting ---------------------------------------------------------

/// Rewrite a method's verifier stack maps into the compact pointer-map
/// form. Runs exactly once, as the final step of verification; the
/// verifier form is dropped afterwards.
///
/// # Errors
/// Fatal on inconsistent map data.
pub fn rewrite_verifier_maps(
    registry: &mut ClassRegistry,
    strings: &mut StringTable,
    method_id: MethodId,
) -> Result<()> {
    let method = registry.method(method_id);
    let Some(body) = method.java_body() else {
        return Ok(());
    };
    let locals_count = usize::from(body.frame_size);
    let max_stack = usize::from(body.max_stack);

    let frames = match &body.stack_maps {
        StackMaps::Verifier(frames) => frames.clone(),
        _ => return Ok(()),
    };

    // Decide the storage form over all entries, the way a single
    // nEntries flag governs the whole table.
    let mut use_long = false;
    for frame in &frames {
        let stack_slots: usize = frame.stack.iter().map(VerificationType::slots).sum();
        if stack_slots > SHORT_MAX_STACK
            || frame.offset > SHORT_MAX_OFFSET
            || locals_count + stack_slots > 16
        {
            use_long = true;
            break;
        }
    }

    let map_bytes = (locals_count + max_stack + 7) / 8 + 1;
    let mut entries = Vec::with_capacity(frames.len());
    for frame in &frames {
        let mut map = vec![0u8; map_bytes];
        let mut slot = 0usize;
        for local in &frame.locals {
            if local.is_reference() {
                bit_set(&mut map, slot);
            }
            slot += local.slots();
        }
        if slot > locals_count {
            return Err(Fatal("verifier map has more locals than the frame".to_string()));
        }
        let mut stack_slots = 0usize;
        for entry in &frame.stack {
            if entry.is_reference() {
                bit_set(&mut map, locals_count + stack_slots);
            }
            stack_slots += entry.slots();
        }

        if use_long {
            // Trailing zero bytes are trimmed, keeping at least one.
            let mut length = map.len();
            while length > 1 && map[length - 1] == 0 {
                length -= 1;
            }
            let map_key = strings.intern_bytes(&map[..length])?;
            entries.push(PointerMapEntry::Long {
                offset: frame.offset,
                stack_size: stack_slots as u8,
                map_key,
            });
        } else {
            let bits = u16::from(map[0]) | (u16::from(map[1]) << 8);
            entries.push(PointerMapEntry::Short {
                offset: frame.offset,
                stack_size: stack_slots as u8,
                bits,
            });
        }
    }
    entries.sort_by_key(PointerMapEntry::offset);

    let body = registry
        .method_mut(method_id)
        .java_body_mut()
        .ok_or_else(|| Fatal("method body vanished during rewrite".to_string()))?;
    body.stack_maps = StackMaps::Pointer(PointerMap { entries });
    Ok(())
}

// ----- the scanner -------------------------------------------------------

/// Load the starting bitmap for the largest recorded offset at or
/// below `target`, or derive the entry-point mask from the method
/// signature. Returns `(actual_offset, stack_size)`.
fn initial_register_mask(
    registry: &ClassRegistry,
    strings: &StringTable,
    method_id: MethodId,
    target: usize,
    map: &mut [u8],
) -> Result<(usize, usize)> {
    let method = registry.method(method_id);
    let body = method
        .java_body()
        .ok_or_else(|| Fatal("register mask for a non-Java method".to_string()))?;
    map.fill(0);

    if let StackMaps::Pointer(pointer_map) = &body.stack_maps {
        let mut best: Option<&PointerMapEntry> = None;
        for entry in &pointer_map.entries {
            if usize::from(entry.offset()) <= target {
                best = Some(entry);
            } else {
                break;
            }
        }
        if let Some(entry) = best {
            match *entry {
                PointerMapEntry::Short {
                    offset,
                    stack_size,
                    bits,
                } => {
                    map[0] = (bits & 0xFF) as u8;
                    map[1] = (bits >> 8) as u8;
                    return Ok((usize::from(offset), usize::from(stack_size)));
                }
                PointerMapEntry::Long {
                    offset,
                    stack_size,
                    map_key,
                } => {
                    let bytes = strings.get_bytes(map_key);
                    map[..bytes.len()].copy_from_slice(bytes);
                    return Ok((usize::from(offset), usize::from(stack_size)));
                }
            }
        }
    }

    // No usable entry: the method signature describes offset 0.
    if !method.is_static() {
        bit_set(map, 0);
    }
    let mut slot = usize::from(!method.is_static());
    let signature = strings.get_bytes(method.type_key).to_vec();
    for_each_parameter(&signature, |is_pointer, slots| {
        if is_pointer {
            bit_set(map, slot);
        }
        slot += slots;
    })?;
    Ok((0, 0))
}

/// Produce the register bitmap for `method_id` paused before the
/// instruction at `target_ip`: the first `frame_size` bits describe the
/// locals, the following bits the operand stack. Returns the operand
/// stack depth.
///
/// # Errors
/// Fatal on map/code inconsistency (corrupt stack maps are not
/// recoverable).
pub fn register_mask(
    registry: &ClassRegistry,
    strings: &StringTable,
    method_id: MethodId,
    target_ip: usize,
    map: &mut Vec<u8>,
) -> Result<usize> {
    let method = registry.method(method_id);
    let class_id = method.class_id;
    let body = method
        .java_body()
        .ok_or_else(|| Fatal("register mask for a non-Java method".to_string()))?;
    let locals_count = usize::from(body.frame_size);
    let max_stack = usize::from(body.max_stack);
    map.clear();
    map.resize((locals_count + max_stack + 7) / 8 + 1, 0);

    let (mut ip, stack) = initial_register_mask(registry, strings, method_id, target_ip, map)?;
    // Calculations are simpler if the stack cursor includes the locals.
    let mut stack_size = stack + locals_count;

    let code = &registry
        .method(method_id)
        .java_body()
        .ok_or_else(|| Fatal("method body vanished".to_string()))?
        .code;
    let pool = &registry.class(class_id).pool;
    let mut dup_values = [false; 6];

    while ip < target_ip {
        let token = code[ip];
        ip += 1;

        // Effect helpers expressed as closures over the map would fight
        // the borrow checker; a small state machine keeps it flat.
        enum Effect {
            None,
            PushInt,
            PushDouble,
            PushPointer,
            StoreInt(usize),
            StoreDouble(usize),
            StorePointer(usize),
        }
        let mut effect = Effect::None;

        match token {
            ISTORE | FSTORE => {
                effect = Effect::StoreInt(usize::from(code[ip]));
                ip += 1;
            }
            ASTORE => {
                effect = Effect::StorePointer(usize::from(code[ip]));
                ip += 1;
            }
            LSTORE | DSTORE => {
                effect = Effect::StoreDouble(usize::from(code[ip]));
                ip += 1;
            }
            ISTORE_0..=ISTORE_3 => effect = Effect::StoreInt(usize::from(token - ISTORE_0)),
            LSTORE_0..=LSTORE_3 => effect = Effect::StoreDouble(usize::from(token - LSTORE_0)),
            FSTORE_0..=FSTORE_3 => effect = Effect::StoreInt(usize::from(token - FSTORE_0)),
            DSTORE_0..=DSTORE_3 => effect = Effect::StoreDouble(usize::from(token - DSTORE_0)),
            ASTORE_0..=ASTORE_3 => effect = Effect::StorePointer(usize::from(token - ASTORE_0)),

            // These leave pointers as pointers and ints as ints.
            GETFIELDP_FAST | IINC | CHECKCAST | CHECKCAST_FAST => ip += 2,
            NOP | INEG | LNEG | FNEG | DNEG | I2F | L2D | F2I | D2L | I2B | I2C | I2S => {}

            // Push one non-pointer.
            SIPUSH | GETSTATIC_FAST => {
                ip += 2;
                effect = Effect::PushInt;
            }
            ILOAD | FLOAD | BIPUSH => {
                ip += 1;
                effect = Effect::PushInt;
            }
            ACONST_NULL => effect = Effect::PushPointer,
            ICONST_M1 | ICONST_0 | ICONST_1 | ICONST_2 | ICONST_3 | ICONST_4 | ICONST_5
            | FCONST_0 | FCONST_1 | FCONST_2 | ILOAD_0 | ILOAD_1 | ILOAD_2 | ILOAD_3 | FLOAD_0
            | FLOAD_1 | FLOAD_2 | FLOAD_3 | I2L | I2D | F2L | F2D => effect = Effect::PushInt,

            // Push two non-pointers.
            GETSTATIC2_FAST | LDC2_W => {
                ip += 2;
                effect = Effect::PushDouble;
            }
            LLOAD | DLOAD => {
                ip += 1;
                effect = Effect::PushDouble;
            }
            LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 | LLOAD_0 | LLOAD_1 | LLOAD_2 | LLOAD_3
            | DLOAD_0 | DLOAD_1 | DLOAD_2 | DLOAD_3 => effect = Effect::PushDouble,

            // Push one pointer.
            NEW | NEW_FAST | GETSTATICP_FAST => {
                ip += 2;
                effect = Effect::PushPointer;
            }
            ALOAD => {
                ip += 1;
                effect = Effect::PushPointer;
            }
            ALOAD_0 | ALOAD_1 | ALOAD_2 | ALOAD_3 => effect = Effect::PushPointer,

            // Pop one.
            IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE | IFNULL | IFNONNULL | PUTSTATIC_FAST => {
                ip += 2;
                stack_size -= 1;
            }
            POP | IADD | FADD | ISUB | FSUB | IMUL | FMUL | IDIV | FDIV | IREM | FREM | ISHL
            | LSHL | ISHR | LSHR | IUSHR | LUSHR | IAND | IOR | IXOR | L2I | L2F | D2I | D2F
            | FCMPL | FCMPG | MONITORENTER | MONITOREXIT | AALOAD => {
                // AALOAD: Ptr Int => Ptr; the slot below keeps its bit.
                stack_size -= 1;
            }

            // Pop one, push a pointer.
            ANEWARRAY | ANEWARRAY_FAST => {
                ip += 2;
                stack_size -= 1;
                effect = Effect::PushPointer;
            }
            NEWARRAY => {
                ip += 1;
                stack_size -= 1;
                effect = Effect::PushPointer;
            }

            // Pop one, push an int.
            INSTANCEOF | INSTANCEOF_FAST | GETFIELD_FAST => {
                ip += 2;
                stack_size -= 1;
                effect = Effect::PushInt;
            }
            ARRAYLENGTH => {
                stack_size -= 1;
                effect = Effect::PushInt;
            }

            // Pop a pointer, push two non-pointers.
            GETFIELD2_FAST => {
                ip += 2;
                stack_size -= 1;
                effect = Effect::PushDouble;
            }

            // Pop two.
            IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE | IF_ACMPEQ
            | IF_ACMPNE | PUTFIELD_FAST | PUTSTATIC2_FAST => {
                ip += 2;
                stack_size -= 2;
            }
            POP2 | LADD | DADD | LSUB | DSUB | LMUL | DMUL | LDIV | DDIV | LREM | DREM | LAND
            | LOR | LXOR => stack_size -= 2,

            // Pop two, push one non-pointer.
            IALOAD | FALOAD | BALOAD | CALOAD | SALOAD => {
                stack_size -= 2;
                effect = Effect::PushInt;
            }

            // Pop two, push two non-pointers.
            DALOAD | LALOAD => {
                stack_size -= 2;
                effect = Effect::PushDouble;
            }

            // Pop three.
            PUTFIELD2_FAST => {
                ip += 2;
                stack_size -= 3;
            }
            IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE | LCMP | DCMPL | DCMPG => {
                stack_size -= 3;
            }

            // Pop four.
            LASTORE | DASTORE => stack_size -= 4,

            LDC | LDC_W => {
                let index = if token == LDC {
                    let index = u16::from(code[ip]);
                    ip += 1;
                    index
                } else {
                    let index = (u16::from(code[ip]) << 8) | u16::from(code[ip + 1]);
                    ip += 2;
                    index
                };
                effect = match pool.get(index) {
                    RtConstant::String { .. } | RtConstant::StringResolved(_) => {
                        Effect::PushPointer
                    }
                    _ => Effect::PushInt,
                };
            }

            DUP => {
                get_bits(map, stack_size - 1, 1, &mut dup_values);
                effect = if dup_values[0] {
                    Effect::PushPointer
                } else {
                    Effect::PushInt
                };
            }
            DUP_X1 => {
                let mut shifted = [false; 3];
                get_bits(map, stack_size - 2, 2, &mut shifted[1..]);
                shifted[0] = shifted[2];
                set_bits(map, stack_size - 2, 3, &shifted);
                stack_size += 1;
            }
            DUP_X2 => {
                let mut shifted = [false; 4];
                get_bits(map, stack_size - 3, 3, &mut shifted[1..]);
                shifted[0] = shifted[3];
                set_bits(map, stack_size - 3, 4, &shifted);
                stack_size += 1;
            }
            DUP2 => {
                get_bits(map, stack_size - 2, 2, &mut dup_values);
                let pair = [dup_values[0], dup_values[1]];
                set_bits(map, stack_size, 2, &pair);
                stack_size += 2;
            }
            DUP2_X1 => {
                let mut shifted = [false; 5];
                get_bits(map, stack_size - 3, 3, &mut shifted[2..]);
                shifted[0] = shifted[3];
                shifted[1] = shifted[4];
                set_bits(map, stack_size - 3, 5, &shifted);
                stack_size += 2;
            }
            DUP2_X2 => {
                let mut shifted = [false; 6];
                get_bits(map, stack_size - 4, 4, &mut shifted[2..]);
                shifted[0] = shifted[4];
                shifted[1] = shifted[5];
                set_bits(map, stack_size - 4, 6, &shifted);
                stack_size += 2;
            }
            SWAP => {
                let mut pair = [false; 3];
                get_bits(map, stack_size - 2, 2, &mut pair[1..]);
                pair[0] = pair[2];
                set_bits(map, stack_size - 2, 2, &pair);
            }

            GETFIELD | GETSTATIC => {
                if token == GETFIELD {
                    stack_size -= 1;
                }
                let index = (u16::from(code[ip]) << 8) | u16::from(code[ip + 1]);
                ip += 2;
                let RtConstant::FieldResolved(field_id) = pool.get(index) else {
                    return Err(Fatal("stack map crossed an unresolved field".to_string()));
                };
                let field = registry.field(field_id);
                effect = if field.is_pointer {
                    Effect::PushPointer
                } else if field.is_double {
                    Effect::PushDouble
                } else {
                    Effect::PushInt
                };
            }
            PUTFIELD | PUTSTATIC => {
                if token == PUTFIELD {
                    stack_size -= 1;
                }
                let index = (u16::from(code[ip]) << 8) | u16::from(code[ip + 1]);
                ip += 2;
                let RtConstant::FieldResolved(field_id) = pool.get(index) else {
                    return Err(Fatal("stack map crossed an unresolved field".to_string()));
                };
                stack_size -= if registry.field(field_id).is_double { 2 } else { 1 };
            }

            MULTIANEWARRAY | MULTIANEWARRAY_FAST => {
                stack_size -= usize::from(code[ip + 2]);
                ip += 3;
                effect = Effect::PushPointer;
            }

            WIDE => {
                let wide_token = code[ip];
                ip += 1;
                let index = usize::from((u16::from(code[ip]) << 8) | u16::from(code[ip + 1]));
                ip += 2;
                match wide_token {
                    ILOAD | FLOAD => effect = Effect::PushInt,
                    LLOAD | DLOAD => effect = Effect::PushDouble,
                    ALOAD => effect = Effect::PushPointer,
                    LSTORE | DSTORE => effect = Effect::StoreDouble(index),
                    ISTORE | FSTORE => effect = Effect::StoreInt(index),
                    ASTORE => effect = Effect::StorePointer(index),
                    IINC => ip += 2,
                    _ => return Err(Fatal("unexpected wide bytecode in stack map".to_string())),
                }
            }

            INVOKEVIRTUAL_FAST | INVOKEINTERFACE_FAST | INVOKESPECIAL_FAST | INVOKESTATIC_FAST
            | INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                let index = (u16::from(code[ip]) << 8) | u16::from(code[ip + 1]);
                ip += if token == INVOKEINTERFACE || token == INVOKEINTERFACE_FAST {
                    4
                } else {
                    2
                };
                let target = match token {
                    INVOKEVIRTUAL_FAST | INVOKEINTERFACE_FAST => {
                        let body = registry
                            .method(method_id)
                            .java_body()
                            .ok_or_else(|| Fatal("method body vanished".to_string()))?;
                        body.inline_caches
                            .get(usize::from(index))
                            .map(|cache| cache.target)
                            .ok_or_else(|| Fatal("stack map crossed a bad inline cache".to_string()))?
                    }
                    _ => {
                        let RtConstant::MethodResolved(target) = pool.get(index) else {
                            return Err(Fatal(
                                "stack map crossed an unresolved method".to_string(),
                            ));
                        };
                        target
                    }
                };
                let target = registry.method(target);
                stack_size -= usize::from(target.arg_slots);
                if stack_size < locals_count {
                    return Err(Fatal("argument popping underflowed the frame".to_string()));
                }
                effect = match (target.return_slots, target.return_is_pointer) {
                    (0, _) => Effect::None,
                    (2, _) => Effect::PushDouble,
                    (_, true) => Effect::PushPointer,
                    _ => Effect::PushInt,
                };
            }

            _ => return Err(Fatal(format!("unexpected bytecode {token:#04x} in stack map"))),
        }

        match effect {
            Effect::None => {}
            Effect::PushInt => {
                bit_clear(map, stack_size);
                stack_size += 1;
            }
            Effect::PushDouble => {
                bit_clear(map, stack_size);
                stack_size += 1;
                bit_clear(map, stack_size);
                stack_size += 1;
            }
            Effect::PushPointer => {
                bit_set(map, stack_size);
                stack_size += 1;
            }
            Effect::StoreInt(index) => {
                bit_clear(map, index);
                stack_size -= 1;
            }
            Effect::StoreDouble(index) => {
                bit_clear(map, index);
                bit_clear(map, index + 1);
                stack_size -= 2;
            }
            Effect::StorePointer(index) => {
                bit_set(map, index);
                stack_size -= 1;
            }
        }

        if stack_size < locals_count {
            return Err(Fatal("stack map stepping underflowed the frame".to_string()));
        }
    }

    if ip > target_ip {
        return Err(Fatal("stack map stepping overshot the target".to_string()));
    }
    Ok(stack_size - locals_count)
}

/// Read one bit of a computed register mask.
#[must_use]
pub fn mask_bit(map: &[u8], bit: usize) -> bool {
    bit_get(map, bit)
}
