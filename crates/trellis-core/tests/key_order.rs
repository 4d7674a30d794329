// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Property tests for the composite key encoding: byte order must agree
//! with value order for every tag, both directions, including the
//! inverted string terminator.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use trellis_core::{Direction, KeyWriter, NodeId, Value};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Number),
        ".{0,24}".prop_map(Value::from),
        // Strings with embedded NULs exercise the escape path.
        proptest::collection::vec(0_u8..=3, 0..12)
            .prop_map(|b| Value::String(b.iter().map(|&c| char::from(c)).collect())),
    ]
}

fn encode(value: &Value, dir: Direction) -> Vec<u8> {
    let mut w = KeyWriter::new();
    w.push_value(value, dir);
    w.finish().as_bytes().to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn ascending_bytes_order_like_values(a in value_strategy(), b in value_strategy()) {
        let (ka, kb) = (encode(&a, Direction::Asc), encode(&b, Direction::Asc));
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn descending_bytes_order_reversed(a in value_strategy(), b in value_strategy()) {
        let (ka, kb) = (encode(&a, Direction::Desc), encode(&b, Direction::Desc));
        prop_assert_eq!(a.cmp(&b), kb.cmp(&ka));
    }

    #[test]
    fn id_tail_makes_keys_unique(v in value_strategy(), x in 1_u64..1000, y in 1_u64..1000) {
        prop_assume!(x != y);
        let mut a = KeyWriter::new();
        a.push_value(&v, Direction::Asc);
        a.push_node_id(NodeId::from_raw(x));
        let mut b = KeyWriter::new();
        b.push_value(&v, Direction::Asc);
        b.push_node_id(NodeId::from_raw(y));
        let (ka, kb) = (a.finish(), b.finish());
        prop_assert_ne!(&ka, &kb);
        prop_assert_eq!(x.cmp(&y), ka.cmp(&kb));
    }

    #[test]
    fn multi_field_keys_order_lexicographically(
        a1 in any::<i64>(), a2 in ".{0,8}",
        b1 in any::<i64>(), b2 in ".{0,8}",
    ) {
        let make = |i: i64, s: &str| {
            let mut w = KeyWriter::new();
            w.push_value(&Value::Int(i), Direction::Asc);
            w.push_value(&Value::from(s), Direction::Desc);
            w.finish()
        };
        let (ka, kb) = (make(a1, &a2), make(b1, &b2));
        let expected = a1.cmp(&b1).then(b2.as_str().cmp(&a2));
        prop_assert_eq!(expected, ka.cmp(&kb));
    }
}

#[test]
fn prefix_freedom_of_string_fields() {
    // "ab" vs "abc" in a two-field key: the terminator must keep the
    // shorter string's key below regardless of what follows.
    let make = |s: &str, n: i64| {
        let mut w = KeyWriter::new();
        w.push_value(&Value::from(s), Direction::Asc);
        w.push_value(&Value::Int(n), Direction::Asc);
        w.finish()
    };
    assert!(make("ab", i64::MAX) < make("abc", i64::MIN));
}
