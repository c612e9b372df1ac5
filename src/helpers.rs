use nom::number::Endianness;
use nom_derive::Parse;

/// Reads a NUL-terminated string. A missing terminator takes the rest of the input.
pub fn string_upto_null_terminator(bytes: &[u8]) -> nom::IResult<&[u8], String> {
    match nom::bytes::complete::take_until::<&str, &[u8], nom::error::Error<&[u8]>>("\0")(bytes) {
        Ok((rest, name_bytes)) => Ok((&rest[1..], String::from_utf8_lossy(name_bytes).into_owned())),
        Err(_) => Ok((&[], String::from_utf8_lossy(bytes).into_owned())),
    }
}

/// Parses a fixed 16-byte, NUL-padded Mach-O name field.
pub fn fixed_name(bytes: &[u8]) -> nom::IResult<&[u8], String> {
    let (bytes, raw) = nom::bytes::complete::take(16usize)(bytes)?;
    let (_, name) = string_upto_null_terminator(raw)?;
    Ok((bytes, name))
}

/// Parses a derived record in the given byte order.
pub fn parse_endian<'a, T>(bytes: &'a [u8], endian: Endianness) -> nom::IResult<&'a [u8], T>
where
    T: Parse<&'a [u8]>,
{
    match native(endian) {
        Endianness::Big => T::parse_be(bytes),
        _ => T::parse_le(bytes),
    }
}

/// Resolves `Native` to the concrete host byte order.
pub fn native(endian: Endianness) -> Endianness {
    match endian {
        Endianness::Native if cfg!(target_endian = "big") => Endianness::Big,
        Endianness::Native => Endianness::Little,
        other => other,
    }
}

pub fn read_u32(bytes: &[u8], endian: Endianness) -> Option<u32> {
    let word: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(match native(endian) {
        Endianness::Big => u32::from_be_bytes(word),
        _ => u32::from_le_bytes(word),
    })
}

pub fn read_u64(bytes: &[u8], endian: Endianness) -> Option<u64> {
    let word: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(match native(endian) {
        Endianness::Big => u64::from_be_bytes(word),
        _ => u64::from_le_bytes(word),
    })
}

/// Lowercase hex without separators, as shown in the machine code column.
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Escapes control characters so a literal fits on one listing line.
pub fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_upto_null_terminator() {
        let (rest, s) = string_upto_null_terminator(b"__text\0\0__TEXT").unwrap();
        assert_eq!(s, "__text");
        assert_eq!(rest, b"\0__TEXT");

        let (rest, s) = string_upto_null_terminator(b"unterminated").unwrap();
        assert_eq!(s, "unterminated");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_read_u32_both_orders() {
        let bytes = [0xfe, 0xed, 0xfa, 0xce];
        assert_eq!(read_u32(&bytes, Endianness::Big), Some(0xfeedface));
        assert_eq!(read_u32(&bytes, Endianness::Little), Some(0xcefaedfe));
        assert_eq!(read_u32(&bytes[..3], Endianness::Big), None);
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("a\tb\n"), "a\\tb\\n");
        assert_eq!(escape_literal("say \"hi\""), "say \\\"hi\\\"");
    }
}
