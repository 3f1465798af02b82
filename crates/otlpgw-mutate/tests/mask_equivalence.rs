//! 标量与分道掩码写入器的逐字节等价性，以及按模式选择写入器的结果。

use std::sync::Arc;

use otlpgw_mutate::{
    InplaceMaskOp, LaneMaskWriter, MaskWriter, MaskWriterMode, ScalarMaskWriter,
    select_mask_writer,
};
use proptest::prelude::*;

#[derive(Clone, Debug)]
struct Case {
    buffer: Vec<u8>,
    offset: u32,
    length: u32,
    mask_byte: u8,
    token: Option<Vec<u8>>,
}

fn cases() -> impl Strategy<Value = Case> {
    (1usize..512, any::<u8>(), any::<u64>(), any::<u64>(), 0u8..4)
        .prop_flat_map(|(size, mask_byte, a, b, token_kind)| {
            let offset = (a % size as u64) as u32;
            let length = (b % (size as u64 - u64::from(offset) + 1)) as u32;
            let token = match token_kind {
                0 => Just(None).boxed(),
                1 => any::<u8>().prop_map(|byte| Some(vec![byte])).boxed(),
                2 => prop::collection::vec(any::<u8>(), length as usize)
                    .prop_map(Some)
                    .boxed(),
                _ => prop::collection::vec(any::<u8>(), 2..8).prop_map(Some).boxed(),
            };
            (prop::collection::vec(any::<u8>(), size), token).prop_map(move |(buffer, token)| Case {
                buffer,
                offset,
                length,
                mask_byte,
                token,
            })
        })
}

fn op(case: &Case) -> InplaceMaskOp {
    InplaceMaskOp::new(case.offset, case.length, case.mask_byte)
        .with_token(case.token.as_deref().map(Arc::from))
}

proptest! {
    #[test]
    fn scalar_and_lane_writers_agree(case in cases()) {
        let op = op(&case);
        let mut scalar = case.buffer.clone();
        let mut lanes = case.buffer.clone();
        ScalarMaskWriter.mask(&mut scalar, &op).expect("in bounds");
        LaneMaskWriter.mask(&mut lanes, &op).expect("in bounds");
        prop_assert_eq!(&scalar, &lanes);

        let start = case.offset as usize;
        let end = start + case.length as usize;
        prop_assert_eq!(&scalar[..start], &case.buffer[..start]);
        prop_assert_eq!(&scalar[end..], &case.buffer[end..]);
    }

    #[test]
    fn out_of_range_ops_fail_identically(size in 0usize..64, offset in 0u32..96, length in 1u32..96) {
        prop_assume!(offset as usize + length as usize > size);
        let op = InplaceMaskOp::new(offset, length, b'#');
        let mut scalar = vec![0u8; size];
        let mut lanes = vec![0u8; size];
        let scalar_err = ScalarMaskWriter.mask(&mut scalar, &op).unwrap_err();
        let lane_err = LaneMaskWriter.mask(&mut lanes, &op).unwrap_err();
        prop_assert_eq!(scalar_err, lane_err);
        prop_assert!(scalar.iter().all(|&b| b == 0));
    }
}

#[test]
fn long_token_copy_crosses_lane_boundaries() {
    let token: Vec<u8> = (0..100u8).collect();
    let op = InplaceMaskOp::new(3, 100, b'*').with_token(Some(Arc::from(token.as_slice())));
    let mut buffer = vec![0xEEu8; 110];
    LaneMaskWriter.mask(&mut buffer, &op).expect("in bounds");
    assert_eq!(&buffer[3..103], token.as_slice());
    assert_eq!(&buffer[..3], &[0xEE; 3]);
    assert_eq!(&buffer[103..], &[0xEE; 7]);
}

#[test]
fn selection_follows_mode() {
    assert_eq!(select_mask_writer(MaskWriterMode::Off).effective, "scalar");
    assert_eq!(select_mask_writer(MaskWriterMode::On).effective, "lanes");
    let auto = select_mask_writer(MaskWriterMode::parse("bogus"));
    assert_eq!(auto.requested, MaskWriterMode::Auto);
    assert_eq!(auto.writer.name(), "lanes");
    assert!(auto.lanes_available);
}
