mod common;

use common::real_mode;
use pcx_cpu_core::flags::{FlagOp, Flags, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
use pcx_cpu_core::fpu::{FpuBackend, Native, Rounding, SoftFloat, F80, FSW_TOP_SHIFT};
use pcx_cpu_core::mmx::{packsswb, packuswb};
use pcx_cpu_core::regs::{Gprs, EAX, EBX};
use pcx_cpu_core::{CpuConfig, CpuModel, NoInterrupts, Width};
use proptest::prelude::*;

const ARITH_FLAGS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

fn common_flags(result: u16) -> u32 {
    let mut f = 0;
    if result == 0 {
        f |= FLAG_ZF;
    }
    if result & 0x8000 != 0 {
        f |= FLAG_SF;
    }
    if (result as u8).count_ones() % 2 == 0 {
        f |= FLAG_PF;
    }
    f
}

fn add_flags(a: u16, b: u16) -> (u16, u32) {
    let (r, carry) = a.overflowing_add(b);
    let mut f = common_flags(r);
    if carry {
        f |= FLAG_CF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        f |= FLAG_AF;
    }
    if (!(a ^ b) & (a ^ r)) & 0x8000 != 0 {
        f |= FLAG_OF;
    }
    (r, f)
}

fn sub_flags(a: u16, b: u16) -> (u16, u32) {
    let (r, borrow) = a.overflowing_sub(b);
    let mut f = common_flags(r);
    if borrow {
        f |= FLAG_CF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        f |= FLAG_AF;
    }
    if ((a ^ b) & (a ^ r)) & 0x8000 != 0 {
        f |= FLAG_OF;
    }
    (r, f)
}

fn run_alu(code: &[u8], a: u16, b: u16) -> (u16, u32) {
    let mut cpu = real_mode(CpuConfig::default(), code);
    cpu.state.gprs.set(EAX, a as u32);
    cpu.state.gprs.set(EBX, b as u32);
    cpu.step(&mut NoInterrupts).unwrap();
    (
        cpu.state.gprs.get(EAX) as u16,
        cpu.state.flags.eflags() & ARITH_FLAGS,
    )
}

fn word(v: u64, i: usize) -> i16 {
    (v >> (16 * i)) as u16 as i16
}

fn byte(v: u64, i: usize) -> u8 {
    (v >> (8 * i)) as u8
}

/// Runs `<op> AX, BX` (0F xx D8) and returns (AX, CF).
fn run_bit_op(opcode: u8, value: u16, index: u16) -> (u16, bool) {
    let mut cpu = real_mode(CpuConfig::default(), &[0x0f, opcode, 0xd8]);
    cpu.state.gprs.set(EAX, value as u32);
    cpu.state.gprs.set(EBX, index as u32);
    cpu.step(&mut NoInterrupts).unwrap();
    (cpu.state.gprs.get(EAX) as u16, cpu.state.flags.cf())
}

proptest! {
    #[test]
    fn byte_write_preserves_upper_bits(initial in any::<u32>(), value in any::<u8>(), idx in 0u8..4) {
        let mut gprs = Gprs::new();
        gprs.set(idx, initial);
        gprs.write(Width::Byte, idx, value as u32);
        prop_assert_eq!(gprs.get(idx), (initial & !0xff) | value as u32);

        gprs.set(idx, initial);
        gprs.write(Width::Byte, idx + 4, value as u32);
        prop_assert_eq!(gprs.get(idx), (initial & !0xff00) | (value as u32) << 8);
    }

    #[test]
    fn flags_rebuild_is_idempotent(a in any::<u32>(), b in any::<u32>(), sub in any::<bool>()) {
        let mut flags = Flags::new();
        if sub {
            flags.record(FlagOp::Sub, Width::Dword, a, b, a.wrapping_sub(b));
        } else {
            flags.record(FlagOp::Add, Width::Dword, a, b, a.wrapping_add(b));
        }
        let lazy = flags.eflags();
        flags.rebuild();
        let once = flags.eflags();
        flags.rebuild();
        prop_assert_eq!(lazy, once);
        prop_assert_eq!(once, flags.eflags());
    }

    #[test]
    fn bit_test_family_semantics(value in any::<u16>(), index in any::<u16>()) {
        let bit = 1u16 << (index & 15);
        let was_set = value & bit != 0;
        prop_assert_eq!(run_bit_op(0xa3, value, index), (value, was_set));
        prop_assert_eq!(run_bit_op(0xab, value, index), (value | bit, was_set));
        prop_assert_eq!(run_bit_op(0xb3, value, index), (value & !bit, was_set));
        prop_assert_eq!(run_bit_op(0xbb, value, index), (value ^ bit, was_set));
    }

    #[test]
    fn packs_clamp_instead_of_wrapping(a in any::<u64>(), b in any::<u64>()) {
        let signed = packsswb(a, b);
        let unsigned = packuswb(a, b);
        for i in 0..8 {
            let src = if i < 4 { word(a, i) } else { word(b, i - 4) };
            prop_assert_eq!(byte(signed, i) as i8, src.clamp(-128, 127) as i8);
            prop_assert_eq!(byte(unsigned, i), src.clamp(0, 255) as u8);
        }
    }

    #[test]
    fn backends_agree_on_exact_operands(a in -(1i64 << 31)..(1i64 << 31), b in -32768i64..32768) {
        let (x, y) = (F80::from_i64(a), F80::from_i64(b));
        let rc = Rounding::Nearest;
        prop_assert_eq!(SoftFloat.add(x, y, rc).0, Native.add(x, y, rc).0);
        prop_assert_eq!(SoftFloat.sub(x, y, rc).0, Native.sub(x, y, rc).0);
        prop_assert_eq!(SoftFloat.mul(x, y, rc).0, Native.mul(x, y, rc).0);
        prop_assert_eq!(SoftFloat.add(x, y, rc).0, F80::from_i64(a + b));
    }

    #[test]
    fn add_ax_bx_matches_reference_flags(a in any::<u16>(), b in any::<u16>()) {
        // ADD AX, BX
        prop_assert_eq!(run_alu(&[0x01, 0xd8], a, b), add_flags(a, b));
    }

    #[test]
    fn sub_ax_bx_matches_reference_flags(a in any::<u16>(), b in any::<u16>()) {
        // SUB AX, BX
        prop_assert_eq!(run_alu(&[0x29, 0xd8], a, b), sub_flags(a, b));
    }

    #[test]
    fn first_mmx_instruction_resets_stack_state(tag in any::<u16>(), top in 0u16..8) {
        // PXOR MM0, MM0
        let mut cpu = real_mode(CpuConfig::for_model(CpuModel::PentiumMmx), &[0x0f, 0xef, 0xc0]);
        cpu.state.fpu.set_tag_word(tag);
        cpu.state.fpu.set_status_word(top << FSW_TOP_SHIFT);
        cpu.step(&mut NoInterrupts).unwrap();
        prop_assert_eq!(cpu.state.fpu.tag_word(), 0);
        prop_assert_eq!(cpu.state.fpu.top(), 0);
        prop_assert_eq!(cpu.state.fpu.as_mmx(0), 0);
    }
}
