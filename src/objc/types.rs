//! Decoding of Objective-C runtime type encodings into C-like names.

/// Decodes the first type in `encoding`, returning it and the unparsed rest.
pub fn decode_type(encoding: &str) -> (String, &str) {
    let mut chars = encoding.char_indices();
    let Some((_, c)) = chars.next() else {
        return (String::new(), encoding);
    };
    let rest = &encoding[c.len_utf8()..];

    let simple = match c {
        'c' => Some("char"),
        'i' => Some("int"),
        's' => Some("short"),
        'l' => Some("long"),
        'q' => Some("long long"),
        'C' => Some("unsigned char"),
        'I' => Some("unsigned int"),
        'S' => Some("unsigned short"),
        'L' => Some("unsigned long"),
        'Q' => Some("unsigned long long"),
        'f' => Some("float"),
        'd' => Some("double"),
        'B' => Some("bool"),
        'v' => Some("void"),
        '*' => Some("char*"),
        '#' => Some("Class"),
        ':' => Some("SEL"),
        '?' => Some("UNKNOWN"),
        _ => None,
    };
    if let Some(name) = simple {
        return (name.to_string(), rest);
    }

    match c {
        '@' => match rest.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (format!("{}*", &quoted[..end]), &quoted[end + 1..]),
                None => ("id".to_string(), rest),
            },
            None => ("id".to_string(), rest),
        },
        '^' => {
            let (pointee, rest) = decode_type(rest);
            (format!("{}*", pointee), rest)
        }
        'r' => prefixed("const", rest),
        'n' => prefixed("in", rest),
        'N' => prefixed("inout", rest),
        'o' => prefixed("out", rest),
        'O' => prefixed("bycopy", rest),
        'R' => prefixed("byref", rest),
        'V' => prefixed("oneway", rest),
        'b' => {
            let (bits, rest) = split_digits(rest);
            (format!("bitfield:{}", bits), rest)
        }
        '[' => {
            let (count, rest) = split_digits(rest);
            let (element, rest) = decode_type(rest);
            let rest = rest.strip_prefix(']').unwrap_or(rest);
            (format!("{}[{}]", element, count), rest)
        }
        '{' => aggregate("struct", '{', '}', rest),
        '(' => aggregate("union", '(', ')', rest),
        _ => (c.to_string(), rest),
    }
}

fn prefixed<'a>(qualifier: &str, rest: &'a str) -> (String, &'a str) {
    let (inner, rest) = decode_type(rest);
    (format!("{} {}", qualifier, inner), rest)
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

/// `{name=...}` decodes to `struct name`; the member list is skipped with
/// nesting taken into account.
fn aggregate<'a>(keyword: &str, open: char, close: char, rest: &'a str) -> (String, &'a str) {
    let mut depth = 1;
    let mut end = rest.len();
    for (i, c) in rest.char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                end = i;
                break;
            }
        }
    }

    let body = &rest[..end];
    let name = body.split('=').next().unwrap_or("");
    let remaining = rest.get(end + 1..).unwrap_or("");
    let name = if name.is_empty() || name == "?" {
        "?".to_string()
    } else {
        name.to_string()
    };
    (format!("{} {}", keyword, name), remaining)
}

pub fn type_name(encoding: &str) -> String {
    decode_type(encoding).0
}

/// Method encodings start with the return type, followed by frame offsets.
pub fn method_return_type(types: &str) -> String {
    type_name(types)
}
