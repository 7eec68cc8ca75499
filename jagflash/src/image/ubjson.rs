//! Minimal UBJSON encoder for device configuration documents.
//!
//! Only the encoding side is needed: the device firmware decodes the config
//! region at boot. Values come in as [`serde_json::Value`]; object keys keep
//! their insertion order.
//!
//! | Value            | Encoding                                   |
//! |------------------|--------------------------------------------|
//! | null             | `Z`                                        |
//! | bool             | `T` / `F`                                  |
//! | integer          | smallest of `i`, `U`, `I`, `l`, `L`        |
//! | float            | `D` + big-endian f64                       |
//! | string           | `S` + length (integer) + UTF-8 bytes       |
//! | array            | `[` values `]`                             |
//! | object           | `{` (length + key bytes, value)... `}`     |

use serde_json::{Number, Value};

/// Encode a JSON value as UBJSON.
pub fn to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(b'Z'),
        Value::Bool(true) => out.push(b'T'),
        Value::Bool(false) => out.push(b'F'),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => {
            out.push(b'S');
            write_str(out, s);
        },
        Value::Array(items) => {
            out.push(b'[');
            for item in items {
                write_value(out, item);
            }
            out.push(b']');
        },
        Value::Object(map) => {
            out.push(b'{');
            for (key, item) in map {
                write_str(out, key);
                write_value(out, item);
            }
            out.push(b'}');
        },
    }
}

fn write_number(out: &mut Vec<u8>, n: &Number) {
    if let Some(i) = n.as_i64() {
        write_int(out, i);
    } else if let Some(u) = n.as_u64() {
        // Beyond int64: high-precision decimal string.
        out.push(b'H');
        write_str(out, &u.to_string());
    } else {
        out.push(b'D');
        out.extend_from_slice(
            &n.as_f64()
                .unwrap_or_default()
                .to_be_bytes(),
        );
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    // Lengths of in-memory strings always fit in i64.
    write_int(out, i64::try_from(s.len()).unwrap_or(i64::MAX));
    out.extend_from_slice(s.as_bytes());
}

fn write_int(out: &mut Vec<u8>, value: i64) {
    if let Ok(v) = i8::try_from(value) {
        out.push(b'i');
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = u8::try_from(value) {
        out.push(b'U');
        out.push(v);
    } else if let Ok(v) = i16::try_from(value) {
        out.push(b'I');
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = i32::try_from(value) {
        out.push(b'l');
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.push(b'L');
        out.extend_from_slice(&value.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(to_vec(&Value::Null), b"Z");
        assert_eq!(to_vec(&json!(true)), b"T");
        assert_eq!(to_vec(&json!(false)), b"F");
    }

    #[test]
    fn test_integer_markers() {
        assert_eq!(to_vec(&json!(5)), [b'i', 5]);
        assert_eq!(to_vec(&json!(-128)), [b'i', 0x80]);
        assert_eq!(to_vec(&json!(200)), [b'U', 200]);
        assert_eq!(to_vec(&json!(-129)), [b'I', 0xFF, 0x7F]);
        assert_eq!(to_vec(&json!(1000)), [b'I', 0x03, 0xE8]);
        assert_eq!(to_vec(&json!(70000)), [b'l', 0x00, 0x01, 0x11, 0x70]);
        assert_eq!(to_vec(&json!(1_i64 << 40))[0], b'L');
        assert_eq!(to_vec(&json!(u64::MAX))[0], b'H');
    }

    #[test]
    fn test_float() {
        let bytes = to_vec(&json!(1.5));
        assert_eq!(bytes[0], b'D');
        assert_eq!(&bytes[1..], 1.5f64.to_be_bytes());
    }

    #[test]
    fn test_string_uses_short_length() {
        assert_eq!(to_vec(&json!("ab")), b"Si\x02ab");

        let long = "x".repeat(300);
        let bytes = to_vec(&json!(long));
        assert_eq!(&bytes[..4], [b'S', b'I', 0x01, 0x2C]);
        assert_eq!(bytes.len(), 4 + 300);
    }

    #[test]
    fn test_object_keys_have_no_marker_and_keep_order() {
        let value = json!({"name": "a", "id": "b"});
        assert_eq!(to_vec(&value), b"{i\x04nameSi\x01ai\x02idSi\x01b}");
    }

    #[test]
    fn test_array() {
        assert_eq!(to_vec(&json!([1, "x", null])), b"[i\x01Si\x01xZ]");
    }
}
