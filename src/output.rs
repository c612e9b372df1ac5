//! Laying out the final listing: padded or tab-aligned fields, data
//! section dumps and the trailing checksum.

use std::io::{self, Write};

use md5::{Digest, Md5};

use crate::helpers::hex_bytes;
use crate::sections::SectionInfo;

const TAB_STOP: usize = 8;
const DUMP_BYTES_PER_LINE: usize = 16;

/// The columns of one annotated instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeFields {
    /// `+N` from the start of the function.
    pub offset: Option<String>,
    pub address: String,
    pub code: String,
    pub mnemonic: String,
    pub operands: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Text(String),
    Code(CodeFields),
}

/// Widest value of each column, spaces between fields excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldWidths {
    pub offset: usize,
    pub address: usize,
    pub code: usize,
    pub mnemonic: usize,
    pub operands: usize,
}

impl FieldWidths {
    pub fn measure<'a, I>(lines: I) -> FieldWidths
    where
        I: IntoIterator<Item = &'a OutputLine>,
    {
        let mut widths = FieldWidths::default();
        for line in lines {
            if let OutputLine::Code(fields) = line {
                widths.offset = widths.offset.max(fields.offset.as_ref().map_or(0, String::len));
                widths.address = widths.address.max(fields.address.len());
                widths.code = widths.code.max(fields.code.len());
                widths.mnemonic = widths.mnemonic.max(fields.mnemonic.len());
                widths.operands = widths.operands.max(fields.operands.len());
            }
        }
        widths
    }

    /// Stretches every field so the next one starts on a tab stop.
    pub fn tab_aligned(&self) -> FieldWidths {
        let round = |w: usize| if w == 0 { 0 } else { (w / TAB_STOP + 1) * TAB_STOP - 1 };
        FieldWidths {
            offset: round(self.offset),
            address: round(self.address),
            code: round(self.code),
            mnemonic: round(self.mnemonic),
            operands: round(self.operands),
        }
    }
}

pub fn format_line(line: &OutputLine, widths: &FieldWidths) -> String {
    let fields = match line {
        OutputLine::Text(text) => return text.clone(),
        OutputLine::Code(fields) => fields,
    };

    let mut out = String::new();
    if widths.offset > 0 {
        let offset = fields.offset.as_deref().unwrap_or("");
        out.push_str(&format!("{:<w$} ", offset, w = widths.offset));
    }
    out.push_str(&format!("{:<w$} ", fields.address, w = widths.address));
    out.push_str(&format!("{:<w$} ", fields.code, w = widths.code));
    out.push_str(&format!("{:<w$} ", fields.mnemonic, w = widths.mnemonic));
    match &fields.comment {
        Some(comment) => {
            out.push_str(&format!("{:<w$} ", fields.operands, w = widths.operands));
            out.push_str(comment);
        }
        None => out.push_str(&fields.operands),
    }
    out.trim_end().to_string()
}

/// Replaces runs of two or more spaces that reach a tab stop with tabs.
pub fn entab(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut column = 0;
    let mut pending = 0;

    for c in line.chars() {
        if c == ' ' {
            pending += 1;
            column += 1;
            if column % TAB_STOP == 0 {
                if pending > 1 {
                    out.push('\t');
                } else {
                    out.push(' ');
                }
                pending = 0;
            }
            continue;
        }
        out.extend(std::iter::repeat(' ').take(pending));
        pending = 0;
        if c == '\t' {
            column = (column / TAB_STOP + 1) * TAB_STOP;
        } else {
            column += 1;
        }
        out.push(c);
    }
    out
}

/// Hex dump of a data section, one line per sixteen bytes.
pub fn hex_dump(info: &SectionInfo) -> Vec<OutputLine> {
    let mut lines = vec![OutputLine::Text(format!(
        "({},{}) section",
        info.section.segname, info.section.sectname
    ))];
    for (i, chunk) in info.contents.chunks(DUMP_BYTES_PER_LINE).enumerate() {
        let address = info.addr().wrapping_add((i * DUMP_BYTES_PER_LINE) as u32);
        let words: Vec<String> = chunk.chunks(4).map(hex_bytes).collect();
        lines.push(OutputLine::Text(format!("{:08x}\t{}", address, words.join(" "))));
    }
    lines
}

pub fn md5_line(file: &[u8]) -> String {
    format!("md5: {}", hex_bytes(&Md5::digest(file)))
}

/// Writes `lines`, each laid out to the widest field in the whole listing.
pub fn write_listing<W: Write>(out: &mut W, lines: &[OutputLine], entab_output: bool) -> io::Result<()> {
    let widths = FieldWidths::measure(lines);
    let widths = if entab_output { widths.tab_aligned() } else { widths };
    for line in lines {
        let text = format_line(line, &widths);
        if entab_output {
            writeln!(out, "{}", entab(&text))?;
        } else {
            writeln!(out, "{}", text)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::tests::section_info;

    fn code(offset: &str, mnemonic: &str, operands: &str, comment: Option<&str>) -> OutputLine {
        OutputLine::Code(CodeFields {
            offset: Some(offset.to_string()),
            address: "00001f80".to_string(),
            code: "55".to_string(),
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            comment: comment.map(str::to_string),
        })
    }

    #[test]
    fn test_padded_fields() {
        let lines = vec![
            code("+0", "pushl", "%ebp", None),
            code("+12", "calll", "0x00001fa0", Some("_puts")),
        ];
        let widths = FieldWidths::measure(&lines);
        assert_eq!(widths.offset, 3);
        assert_eq!(format_line(&lines[0], &widths), "+0  00001f80 55 pushl %ebp");
        assert_eq!(
            format_line(&lines[1], &widths),
            "+12 00001f80 55 calll 0x00001fa0 _puts"
        );
        assert_eq!(format_line(&OutputLine::Text("_main:".into()), &widths), "_main:");
    }

    #[test]
    fn test_entab() {
        assert_eq!(entab("abc     def"), "abc\tdef");
        assert_eq!(entab("abcdefg h"), "abcdefg h");
        assert_eq!(entab("a               b"), "a\t\tb");
        assert_eq!(entab("a  b"), "a  b");

        let lines = vec![code("+0", "pushl", "%ebp", Some("x"))];
        let widths = FieldWidths::measure(&lines).tab_aligned();
        assert_eq!(entab(&format_line(&lines[0], &widths)), "+0\t00001f80\t55\tpushl\t%ebp\tx");
    }

    #[test]
    fn test_hex_dump() {
        let info = section_info("__DATA", "__data", 0x3000, (0u8..20).collect());
        let lines = hex_dump(&info);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], OutputLine::Text("(__DATA,__data) section".into()));
        assert_eq!(
            lines[1],
            OutputLine::Text("00003000\t00010203 04050607 08090a0b 0c0d0e0f".into())
        );
        assert_eq!(lines[2], OutputLine::Text("00003010\t10111213".into()));
    }

    #[test]
    fn test_md5_line() {
        assert_eq!(md5_line(b""), "md5: d41d8cd98f00b204e9800998ecf8427e");
    }
}
