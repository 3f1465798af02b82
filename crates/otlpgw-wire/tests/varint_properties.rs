use otlpgw_wire::varint::{
    decode_varint32_strict, decode_varint64, encode_varint32, varint_size, varint_size64,
};
use otlpgw_wire::{FastWireCursor, WireCursor};
use proptest::prelude::*;

proptest! {
    #[test]
    fn encoded_length_matches_size_table(value in any::<u32>()) {
        let mut buf = [0u8; 5];
        let written = encode_varint32(value, &mut buf).expect("five bytes always fit");
        prop_assert_eq!(written, varint_size(value));
        prop_assert_eq!(decode_varint32_strict(&buf[..written], 0), Ok((value, written)));
    }

    #[test]
    fn varint_field_is_read_back_through_the_cursor(field in 1u32..(1 << 20), value in any::<u64>()) {
        let mut bytes = Vec::new();
        let mut tag = u64::from(field << 3);
        while tag >= 0x80 {
            bytes.push((tag as u8 & 0x7F) | 0x80);
            tag >>= 7;
        }
        bytes.push(tag as u8);
        let value_start = bytes.len();
        let mut remaining = value;
        while remaining >= 0x80 {
            bytes.push((remaining as u8 & 0x7F) | 0x80);
            remaining >>= 7;
        }
        bytes.push(remaining as u8);

        prop_assert_eq!(bytes.len() - value_start, varint_size64(value));
        let mut cursor = FastWireCursor::new(&bytes);
        prop_assert!(cursor.next_field().expect("well formed"));
        prop_assert_eq!(cursor.field_number(), field);
        prop_assert_eq!(cursor.read_varint64(), Ok(value));
        prop_assert_eq!(decode_varint64(cursor.slice_value(), value_start), Ok((value, varint_size64(value))));
    }

    #[test]
    fn arbitrary_bytes_never_panic_the_cursor(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut cursor = FastWireCursor::new(&bytes);
        for _ in 0..bytes.len() + 1 {
            match cursor.next_field() {
                Ok(true) => {
                    let _ = cursor.enter_message();
                }
                Ok(false) => {
                    if cursor.leave_message().is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
}
