//! Tests for the stateless HPACK encoding primitives

use h2_mux::hpack::{
    encode_indexed_header, encode_integer, encode_literal_header_values, encode_literal_header_without_indexing,
    encode_literal_header_without_indexing_new_name, encode_string_literals, static_index, static_name_index,
};
use h2_mux::{H2Header, HpackDecoder};

#[test]
fn test_integer_prefix_encoding() {
    // RFC 7541 C.1.1 / C.1.2
    let mut dest = Vec::new();
    encode_integer(10, 5, 0, &mut dest);
    assert_eq!(dest, vec![0x0a]);

    let mut dest = Vec::new();
    encode_integer(1337, 5, 0, &mut dest);
    assert_eq!(dest, vec![0x1f, 0x9a, 0x0a]);
}

#[test]
fn test_static_name_index() {
    assert_eq!(static_name_index(":authority"), Some(1));
    assert_eq!(static_name_index(":method"), Some(2));
    assert_eq!(static_name_index("cookie"), Some(static_index::COOKIE));
    assert_eq!(static_name_index("www-authenticate"), Some(61));
    assert_eq!(static_name_index("x-custom"), None);
}

#[test]
fn test_encode_indexed_header() {
    let mut dest = Vec::new();
    encode_indexed_header(static_index::METHOD_GET, &mut dest);
    assert_eq!(dest, vec![0x82]);
}

#[test]
fn test_literal_without_indexing_leaves_dynamic_table_empty() {
    let mut dest = Vec::new();
    encode_literal_header_without_indexing(static_index::AUTHORITY, b"example.com", &mut dest);
    assert_eq!(dest[0], 0x01);

    let mut decoder = HpackDecoder::new();
    assert_eq!(
        decoder.decode_block(&dest).unwrap(),
        vec![H2Header::new(":authority", "example.com")]
    );
    // Nothing was added, so index 62 is still invalid.
    assert!(decoder.decode_block(&[0xbe]).is_err());
}

#[test]
fn test_literal_new_name() {
    let mut dest = Vec::new();
    encode_literal_header_without_indexing_new_name(b"x-trace", b"abc", &mut dest);
    assert_eq!(
        HpackDecoder::new().decode_block(&dest).unwrap(),
        vec![H2Header::new("x-trace", "abc")]
    );
}

#[test]
fn test_multi_value_literal_uses_static_name() {
    let mut dest = Vec::new();
    encode_literal_header_values(b"accept", &[b"text/html", b"application/json"], b", ", &mut dest);
    assert_eq!(dest[0], 0x0f, "Index 19 needs the 4-bit prefix continuation");
    assert_eq!(
        HpackDecoder::new().decode_block(&dest).unwrap(),
        vec![H2Header::new("accept", "text/html, application/json")]
    );
}

#[test]
fn test_multi_value_literal_new_name() {
    let mut dest = Vec::new();
    encode_literal_header_values(b"x-list", &[b"a", b"b", b"c"], b",", &mut dest);
    assert_eq!(
        HpackDecoder::new().decode_block(&dest).unwrap(),
        vec![H2Header::new("x-list", "a,b,c")]
    );
}

#[test]
fn test_string_literals_long_value() {
    let value = vec![b'v'; 300];
    let mut dest = Vec::new();
    encode_integer(static_index::COOKIE, 4, 0, &mut dest);
    encode_string_literals(&[&value, b"k=1"], b"; ", &mut dest);

    let headers = HpackDecoder::new().decode_block(&dest).unwrap();
    assert_eq!(headers[0].name, "cookie");
    assert_eq!(headers[0].value.len(), 305);
    assert!(headers[0].value.ends_with("; k=1"));
}
