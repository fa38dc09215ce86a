//! Cross-checks the interpreter's instruction lengths against iced-x86.

mod common;

use common::{real_mode, CODE_BASE};
use iced_x86::{Decoder, DecoderOptions};
use pcx_cpu_core::{CpuConfig, CpuModel, NoInterrupts};

fn reference_len(bytes: &[u8]) -> u32 {
    let mut decoder = Decoder::with_ip(16, bytes, CODE_BASE as u64, DecoderOptions::NONE);
    decoder.decode().len() as u32
}

fn assert_lengths(model: CpuModel, encodings: &[&[u8]]) {
    for bytes in encodings {
        let mut cpu = real_mode(CpuConfig::for_model(model), bytes);
        cpu.step(&mut NoInterrupts).unwrap();
        let advanced = cpu.state.eip - CODE_BASE;
        assert_eq!(
            advanced,
            reference_len(bytes),
            "length mismatch for {bytes:02x?} on {model:?}"
        );
    }
}

#[test]
fn integer_forms_match_reference_decoder() {
    assert_lengths(
        CpuModel::I486,
        &[
            &[0x01, 0x06, 0x00, 0x20],
            &[0x66, 0x05, 0x78, 0x56, 0x34, 0x12],
            &[0x8d, 0x40, 0x04],
            &[0x0f, 0xb6, 0xc3],
            &[0xc7, 0x06, 0x00, 0x20, 0x34, 0x12],
            &[0x67, 0x8b, 0x04, 0x24],
            &[0x67, 0x8b, 0x84, 0x48, 0x00, 0x10, 0x00, 0x00],
            &[0x69, 0xc3, 0x10, 0x00],
            &[0x6b, 0xc3, 0x05],
            &[0xf6, 0xd8],
            &[0xc1, 0xe0, 0x03],
            &[0x0f, 0xba, 0xe0, 0x03],
            &[0x80, 0x3e, 0x00, 0x20, 0x7f],
            &[0x26, 0x66, 0x89, 0x1e, 0x00, 0x20],
        ],
    );
}

#[test]
fn system_and_fpu_forms_match_reference_decoder() {
    assert_lengths(
        CpuModel::I486,
        &[
            &[0x0f, 0x01, 0xe0],
            &[0x0f, 0x20, 0xc0],
            &[0xd9, 0xe8],
            &[0xdd, 0x06, 0x00, 0x20],
            &[0xdf, 0xe0],
        ],
    );
}

#[test]
fn mmx_forms_match_reference_decoder() {
    assert_lengths(
        CpuModel::PentiumMmx,
        &[
            &[0x0f, 0xfc, 0xc1],
            &[0x0f, 0x71, 0xd0, 0x02],
            &[0x0f, 0x6f, 0x06, 0x00, 0x20],
            &[0x0f, 0x77],
        ],
    );
}
