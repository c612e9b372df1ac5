//! Itanium C++ ABI demangling for symbol display.
//!
//! Handles the subset produced for ordinary functions and methods: nested
//! names, constructors and destructors, common operators, builtin and
//! qualified parameter types, simple templates and substitutions. Anything
//! else leaves the symbol as it was.

/// Demangles a Mach-O symbol, which carries one extra leading underscore.
pub fn demangle(symbol: &str) -> Option<String> {
    let name = symbol.strip_suffix("$stub").unwrap_or(symbol);
    let name = name.strip_suffix("$non_lazy_ptr").unwrap_or(name);
    let mangled = name.strip_prefix('_').filter(|n| n.starts_with("_Z"))?;
    Demangler::new(&mangled[2..]).encoding()
}

pub fn demangle_or_original(symbol: &str) -> String {
    demangle(symbol).unwrap_or_else(|| symbol.to_string())
}

struct Demangler<'a> {
    input: &'a str,
    pos: usize,
    substitutions: Vec<String>,
    const_method: bool,
}

impl<'a> Demangler<'a> {
    fn new(input: &'a str) -> Self {
        Demangler {
            input,
            pos: 0,
            substitutions: Vec::new(),
            const_method: false,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.input[self.pos..].starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.input.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(())
    }

    fn encoding(&mut self) -> Option<String> {
        let (name, is_template) = self.name()?;
        if self.pos == self.input.len() {
            return Some(name);
        }
        let qualifier = if self.const_method { " const" } else { "" };
        // template functions encode their return type first
        if is_template {
            self.type_()?;
        }
        let mut params = Vec::new();
        while self.pos < self.input.len() {
            params.push(self.type_()?);
        }
        if params == ["void"] {
            params.clear();
        }
        Some(format!("{}({}){}", name, params.join(", "), qualifier))
    }

    fn number(&mut self) -> Option<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.input[start..self.pos].parse().ok()
    }

    fn source_name(&mut self) -> Option<String> {
        let len = self.number()?;
        let name = self.input.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(name.to_string())
    }

    /// Returns the name and whether it ends in template arguments.
    fn name(&mut self) -> Option<(String, bool)> {
        if self.eat("N") {
            return self.nested_name();
        }
        let mut name = if self.eat("St") {
            format!("std::{}", self.unqualified_name(None)?)
        } else if self.peek() == Some(b'S') {
            self.substitution()?
        } else {
            self.unqualified_name(None)?
        };
        if self.peek() == Some(b'I') {
            self.substitutions.push(name.clone());
            name.push_str(&self.template_args()?);
            return Some((name, true));
        }
        Some((name, false))
    }

    fn nested_name(&mut self) -> Option<(String, bool)> {
        if self.eat("K") {
            self.const_method = true;
        }
        let mut parts: Vec<String> = Vec::new();
        let mut is_template = false;

        while !self.eat("E") {
            is_template = false;
            match self.peek()? {
                b'S' if parts.is_empty() => {
                    let sub = if self.eat("St") { "std".to_string() } else { self.substitution()? };
                    parts.push(sub);
                    continue;
                }
                b'I' => {
                    let args = self.template_args()?;
                    let last = parts.last_mut()?;
                    last.push_str(&args);
                    is_template = true;
                }
                _ => {
                    let class = parts.last().map(|p| p.split('<').next().unwrap_or(p).to_string());
                    parts.push(self.unqualified_name(class.as_deref())?);
                }
            }
            if self.peek() != Some(b'E') {
                self.substitutions.push(parts.join("::"));
            }
        }

        Some((parts.join("::"), is_template))
    }

    fn unqualified_name(&mut self, class: Option<&str>) -> Option<String> {
        match self.peek()? {
            b'0'..=b'9' => self.source_name(),
            b'C' => {
                self.skip(2)?;
                class.map(str::to_string)
            }
            b'D' => {
                self.skip(2)?;
                class.map(|c| format!("~{}", c))
            }
            _ => self.operator_name(),
        }
    }

    fn operator_name(&mut self) -> Option<String> {
        const OPERATORS: &[(&str, &str)] = &[
            ("nw", "new"),
            ("na", "new[]"),
            ("dl", "delete"),
            ("da", "delete[]"),
            ("pl", "+"),
            ("mi", "-"),
            ("ml", "*"),
            ("dv", "/"),
            ("rm", "%"),
            ("an", "&"),
            ("or", "|"),
            ("eo", "^"),
            ("aS", "="),
            ("pL", "+="),
            ("mI", "-="),
            ("eq", "=="),
            ("ne", "!="),
            ("lt", "<"),
            ("gt", ">"),
            ("le", "<="),
            ("ge", ">="),
            ("nt", "!"),
            ("ls", "<<"),
            ("rs", ">>"),
            ("pp", "++"),
            ("mm", "--"),
            ("ix", "[]"),
            ("cl", "()"),
            ("pt", "->"),
        ];
        let code = self.input.get(self.pos..self.pos + 2)?;
        let (_, op) = OPERATORS.iter().find(|(c, _)| *c == code)?;
        self.skip(2)?;
        Some(format!("operator{}", op))
    }

    fn substitution(&mut self) -> Option<String> {
        if !self.eat("S") {
            return None;
        }
        let special = match self.peek()? {
            b'a' => Some("std::allocator"),
            b'b' => Some("std::basic_string"),
            b's' => Some("std::string"),
            b'i' => Some("std::istream"),
            b'o' => Some("std::ostream"),
            b'd' => Some("std::iostream"),
            _ => None,
        };
        if let Some(special) = special {
            self.pos += 1;
            return Some(special.to_string());
        }

        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            self.pos += 1;
        }
        let seq = &self.input[start..self.pos];
        if !self.eat("_") {
            return None;
        }
        let index = if seq.is_empty() {
            0
        } else {
            usize::from_str_radix(seq, 36).ok()? + 1
        };
        self.substitutions.get(index).cloned()
    }

    fn template_args(&mut self) -> Option<String> {
        if !self.eat("I") {
            return None;
        }
        let mut args = Vec::new();
        while !self.eat("E") {
            if self.eat("L") {
                let ty = self.type_()?;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != b'E') {
                    self.pos += 1;
                }
                let value = self.input[start..self.pos].replace('n', "-");
                self.eat("E");
                args.push(if ty == "bool" {
                    (if value == "0" { "false" } else { "true" }).to_string()
                } else {
                    value
                });
            } else {
                args.push(self.type_()?);
            }
        }
        let joined = args.join(", ");
        Some(if joined.ends_with('>') {
            format!("<{} >", joined)
        } else {
            format!("<{}>", joined)
        })
    }

    fn type_(&mut self) -> Option<String> {
        let c = self.peek()?;
        let builtin = match c {
            b'v' => Some("void"),
            b'w' => Some("wchar_t"),
            b'b' => Some("bool"),
            b'c' => Some("char"),
            b'a' => Some("signed char"),
            b'h' => Some("unsigned char"),
            b's' => Some("short"),
            b't' => Some("unsigned short"),
            b'i' => Some("int"),
            b'j' => Some("unsigned int"),
            b'l' => Some("long"),
            b'm' => Some("unsigned long"),
            b'x' => Some("long long"),
            b'y' => Some("unsigned long long"),
            b'f' => Some("float"),
            b'd' => Some("double"),
            b'e' => Some("long double"),
            b'z' => Some("..."),
            _ => None,
        };
        if let Some(builtin) = builtin {
            self.pos += 1;
            return Some(builtin.to_string());
        }

        let ty = match c {
            b'P' | b'R' | b'K' => {
                self.pos += 1;
                let inner = self.type_()?;
                match c {
                    b'P' => format!("{}*", inner),
                    b'R' => format!("{}&", inner),
                    _ => format!("{} const", inner),
                }
            }
            b'S' if !self.input[self.pos..].starts_with("St") => {
                let sub = self.substitution()?;
                if self.peek() == Some(b'I') {
                    format!("{}{}", sub, self.template_args()?)
                } else {
                    return Some(sub);
                }
            }
            b'0'..=b'9' | b'N' | b'S' => self.name()?.0,
            _ => return None,
        };
        self.substitutions.push(ty.clone());
        Some(ty)
    }
}
