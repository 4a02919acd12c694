//! Property-based tests for the payload codec
//!
//! Uses proptest to check that anything which fits the region decodes back to
//! the same values, and that oversized payloads fail cleanly.

use opfs_bridge::bridge::config::{ByteOrder, MAX_PATHNAME};
use opfs_bridge::{BridgeError, Codec, Value};
use proptest::prelude::*;

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan()).prop_map(Value::F64),
        any::<i64>().prop_map(Value::I64),
        any::<bool>().prop_map(Value::Bool),
        "[a-zA-Z0-9/._-]{0,64}".prop_map(Value::Str),
        "\\PC{0,16}".prop_map(Value::Str),
    ]
}

fn order() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::Little), Just(ByteOrder::Big)]
}

fn encoded_len(values: &[Value]) -> usize {
    1 + values.len()
        + values
            .iter()
            .map(|v| match v {
                Value::F64(_) | Value::I64(_) => 8,
                Value::Bool(_) => 4,
                Value::Str(s) => 4 + s.len(),
            })
            .sum::<usize>()
}

proptest! {
    #[test]
    fn prop_round_trip_when_it_fits(
        values in prop::collection::vec(value(), 1..24),
        order in order(),
    ) {
        let codec = Codec::new(order);
        let mut region = vec![0u8; 2 * MAX_PATHNAME];
        let fits = encoded_len(&values) <= region.len();

        match codec.serialize(&mut region, &values) {
            Ok(()) => {
                prop_assert!(fits);
                let decoded = codec.deserialize(&mut region, true).unwrap();
                prop_assert_eq!(decoded, Some(values));
                // cleared: a second read sees nothing
                prop_assert_eq!(codec.deserialize(&mut region, false).unwrap(), None);
            }
            Err(e) => {
                prop_assert!(!fits);
                prop_assert!(matches!(e, BridgeError::Codec(_)));
            }
        }
    }

    #[test]
    fn prop_region_size_bounds_payload(
        values in prop::collection::vec(value(), 1..8),
        size in 1usize..96,
    ) {
        let codec = Codec::new(ByteOrder::native());
        let mut region = vec![0u8; size];
        let result = codec.serialize(&mut region, &values);
        prop_assert_eq!(result.is_ok(), encoded_len(&values) <= size);
    }

    #[test]
    fn prop_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 1..256)) {
        let codec = Codec::new(ByteOrder::native());
        let mut region = bytes;
        let _ = codec.deserialize(&mut region, false);
    }
}

#[test]
fn test_empty_list_decodes_as_none() {
    let codec = Codec::new(ByteOrder::native());
    let mut region = vec![0xAAu8; 32];
    codec.serialize(&mut region, &[]).unwrap();
    assert_eq!(region[0], 0);
    assert_eq!(codec.deserialize(&mut region, true).unwrap(), None);
}

#[test]
fn test_byte_orders_disagree_on_wire() {
    let mut little = vec![0u8; 16];
    let mut big = vec![0u8; 16];
    Codec::new(ByteOrder::Little)
        .serialize(&mut little, &[Value::I64(1)])
        .unwrap();
    Codec::new(ByteOrder::Big)
        .serialize(&mut big, &[Value::I64(1)])
        .unwrap();
    assert_eq!(little[..2], big[..2]);
    assert_ne!(little[2..10], big[2..10]);
}
