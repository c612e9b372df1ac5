//! The two listings of a text section, kept index-aligned: position `i` in
//! the symbolic list and position `i` in the plain list always describe the
//! same instruction, so either side is the other's fallback.

use std::ops::Range;

use crate::options::LineChoicePolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineInfo {
    pub address: u32,
    /// Machine code as lowercase hex.
    pub code: String,
    /// False for section headers, labels and blank lines.
    pub is_code: bool,
    /// True on the first instruction of a function.
    pub is_function: bool,
}

impl LineInfo {
    pub fn code_bytes(&self) -> Vec<u8> {
        self.code
            .as_bytes()
            .chunks(2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
            .collect()
    }

    /// The code as one big-endian word, as PPC instructions are stored.
    pub fn code_word(&self) -> Option<u32> {
        let bytes = self.code_bytes();
        let word: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(word))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub info: LineInfo,
}

impl Line {
    /// Classifies one line of disassembler output. Code lines start with an
    /// eight digit hex address.
    pub fn parse(text: &str) -> Line {
        let text = text.trim_end_matches(['\r', '\n']);
        let address = text
            .split(|c: char| c.is_ascii_whitespace())
            .next()
            .filter(|tok| tok.len() == 8 && tok.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|tok| u32::from_str_radix(tok, 16).ok());

        Line {
            text: text.to_string(),
            info: LineInfo {
                address: address.unwrap_or(0),
                is_code: address.is_some(),
                ..Default::default()
            },
        }
    }

    /// A non-code line such as a function label or a blank separator.
    pub fn text(text: impl Into<String>) -> Line {
        Line {
            text: text.into(),
            info: LineInfo::default(),
        }
    }

    pub fn is_label(&self) -> bool {
        !self.info.is_code && self.text.trim_end().ends_with(':')
    }

    /// Mnemonic and operand text of a code line, without trailing
    /// disassembler remarks.
    pub fn instruction(&self) -> Option<(&str, &str)> {
        if !self.info.is_code {
            return None;
        }
        let rest = self.text.get(8..)?.trim_start();
        let rest = match rest.find(['#', ';']) {
            Some(i) => &rest[..i],
            None => rest,
        };
        let rest = rest.trim();
        match rest.find(|c: char| c.is_ascii_whitespace()) {
            Some(i) => Some((&rest[..i], rest[i..].trim())),
            None => Some((rest, "")),
        }
    }

    pub fn mnemonic(&self) -> Option<&str> {
        self.instruction().map(|(m, _)| m)
    }
}

/// Both listings of one section.
#[derive(Debug, Clone, Default)]
pub struct LineList {
    verbose: Vec<Line>,
    plain: Vec<Line>,
}

impl LineList {
    pub fn new() -> LineList {
        LineList::default()
    }

    /// Parses both listings and aligns them. A line present in only one
    /// stream is mirrored into the other, and code lines pair up by address.
    pub fn from_listings(verbose: &str, plain: &str) -> LineList {
        let verbose: Vec<Line> = verbose.lines().map(Line::parse).collect();
        let plain: Vec<Line> = plain.lines().map(Line::parse).collect();
        Self::align(verbose, plain)
    }

    pub fn align(verbose: Vec<Line>, plain: Vec<Line>) -> LineList {
        let mut list = LineList {
            verbose: Vec::with_capacity(verbose.len().max(plain.len())),
            plain: Vec::with_capacity(verbose.len().max(plain.len())),
        };
        let mut v = verbose.into_iter().peekable();
        let mut p = plain.into_iter().peekable();

        loop {
            let take_verbose = match (v.peek(), p.peek()) {
                (None, None) => break,
                (Some(_), None) => Some(true),
                (None, Some(_)) => Some(false),
                (Some(a), Some(b)) => match (a.info.is_code, b.info.is_code) {
                    (false, false) => None,
                    (false, true) => Some(true),
                    (true, false) => Some(false),
                    (true, true) if a.info.address == b.info.address => None,
                    (true, true) => Some(a.info.address < b.info.address),
                },
            };

            match take_verbose {
                None => {
                    if let (Some(a), Some(b)) = (v.next(), p.next()) {
                        list.verbose.push(a);
                        list.plain.push(b);
                    }
                }
                Some(true) => {
                    if let Some(a) = v.next() {
                        list.plain.push(a.clone());
                        list.verbose.push(a);
                    }
                }
                Some(false) => {
                    if let Some(b) = p.next() {
                        list.verbose.push(b.clone());
                        list.plain.push(b);
                    }
                }
            }
        }

        list
    }

    pub fn len(&self) -> usize {
        self.verbose.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbose.is_empty()
    }

    pub fn verbose(&self, index: usize) -> Option<&Line> {
        self.verbose.get(index)
    }

    pub fn plain(&self, index: usize) -> Option<&Line> {
        self.plain.get(index)
    }

    /// The metadata shared by both siblings at `index`.
    pub fn info(&self, index: usize) -> Option<&LineInfo> {
        self.verbose.get(index).map(|line| &line.info)
    }

    pub fn infos(&self) -> impl Iterator<Item = &LineInfo> {
        self.verbose.iter().map(|line| &line.info)
    }

    /// Applies the same metadata change to both siblings.
    pub fn update_info<F: Fn(&mut LineInfo)>(&mut self, index: usize, f: F) {
        if let Some(line) = self.verbose.get_mut(index) {
            f(&mut line.info);
        }
        if let Some(line) = self.plain.get_mut(index) {
            f(&mut line.info);
        }
    }

    pub fn insert_before(&mut self, index: usize, line: Line) {
        let index = index.min(self.len());
        self.plain.insert(index, line.clone());
        self.verbose.insert(index, line);
    }

    pub fn insert_after(&mut self, index: usize, line: Line) {
        self.insert_before(index.saturating_add(1), line);
    }

    pub fn replace(&mut self, index: usize, line: Line) {
        self.replace_pair(index, line.clone(), line);
    }

    /// Replaces both siblings. The new pair must describe the same address.
    pub fn replace_pair(&mut self, index: usize, verbose: Line, plain: Line) {
        if index < self.len() && verbose.info.address == plain.info.address {
            self.verbose[index] = verbose;
            self.plain[index] = plain;
        }
    }

    pub fn delete_range(&mut self, range: Range<usize>) {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        self.verbose.drain(start..end);
        self.plain.drain(start..end);
    }

    pub fn delete_lines_before(&mut self, index: usize) {
        self.delete_range(0..index);
    }

    /// Merges the siblings at `index` into the line used for output.
    /// `keeps_verbose` says whether the symbolic operand can be trusted for
    /// this instruction under the branch-target policy.
    pub fn choose_line<F>(&self, index: usize, policy: LineChoicePolicy, keeps_verbose: F) -> Option<Line>
    where
        F: Fn(&Line) -> bool,
    {
        let verbose = self.verbose.get(index)?;
        let plain = self.plain.get(index)?;
        if !verbose.info.is_code {
            return Some(verbose.clone());
        }

        let chosen = match policy {
            LineChoicePolicy::PreferVerbose => verbose,
            LineChoicePolicy::PreferPlain => plain,
            LineChoicePolicy::BranchTargets if keeps_verbose(plain) => verbose,
            LineChoicePolicy::BranchTargets => plain,
        };
        Some(chosen.clone())
    }

    /// Equal lengths and matching addresses for every code pair.
    pub fn is_consistent(&self) -> bool {
        self.verbose.len() == self.plain.len()
            && self.verbose.iter().zip(&self.plain).all(|(v, p)| {
                v.info.is_code == p.info.is_code && v.info.address == p.info.address
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VERBOSE: &str = "(__TEXT,__text) section\n\
        _main:\n\
        00001f00\tpushl\t%ebp\n\
        00001f01\tmovl\t%esp,%ebp\n\
        00001f03\tcalll\t_helper\n\
        00001f08\tleave\n";
    const PLAIN: &str = "(__TEXT,__text) section\n\
        00001f00\tpushl\t%ebp\n\
        00001f01\tmovl\t%esp,%ebp\n\
        00001f03\tcalll\t0x00001f10\n\
        00001f08\tleave\n\
        00001f09\tret\n";

    #[test]
    fn test_parse_line() {
        let line = Line::parse("00001f03\tcalll\t0x00001f10\t## symbol stub for: _puts");
        assert!(line.info.is_code);
        assert_eq!(line.info.address, 0x1f03);
        assert_eq!(line.instruction(), Some(("calll", "0x00001f10")));

        let label = Line::parse("_main:");
        assert!(!label.info.is_code);
        assert!(label.is_label());
        assert_eq!(Line::parse("00001f08\tleave").instruction(), Some(("leave", "")));
    }

    #[test]
    fn test_align_mirrors_missing_lines() {
        let list = LineList::from_listings(VERBOSE, PLAIN);
        assert!(list.is_consistent());
        assert_eq!(list.len(), 7);
        assert_eq!(list.plain(1).unwrap().text, "_main:");
        assert_eq!(list.verbose(6).unwrap().info.address, 0x1f09);
        assert_eq!(list.verbose(4).unwrap().info.address, 0x1f03);
    }

    #[test]
    fn test_choose_line() {
        let list = LineList::from_listings(VERBOSE, PLAIN);
        let is_call = |line: &Line| line.mnemonic() == Some("calll");

        let call = list.choose_line(4, LineChoicePolicy::BranchTargets, is_call).unwrap();
        assert!(call.text.ends_with("_helper"));
        let mov = list.choose_line(3, LineChoicePolicy::BranchTargets, is_call).unwrap();
        assert_eq!(mov.text, "00001f01\tmovl\t%esp,%ebp");
        let plain = list.choose_line(4, LineChoicePolicy::PreferPlain, is_call).unwrap();
        assert!(plain.text.ends_with("0x00001f10"));
    }

    #[test]
    fn test_mutations() {
        let mut list = LineList::from_listings(VERBOSE, PLAIN);
        list.delete_lines_before(1);
        assert_eq!(list.verbose(0).unwrap().text, "_main:");

        list.insert_after(0, Line::text(""));
        list.replace(0, Line::text("-[Foo bar]:"));
        list.update_info(2, |info| info.is_function = true);
        assert!(list.plain(2).unwrap().info.is_function);
        assert!(list.is_consistent());

        // a replacement pair with mismatched addresses is refused
        let mut wrong = list.plain(2).unwrap().clone();
        wrong.info.address += 1;
        list.replace_pair(2, list.verbose(2).unwrap().clone(), wrong);
        assert!(list.is_consistent());
    }

    #[derive(Debug, Clone)]
    enum Op {
        InsertBefore(usize),
        InsertAfter(usize),
        Replace(usize),
        Delete(usize, usize),
        DeleteBefore(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..12).prop_map(Op::InsertBefore),
            (0usize..12).prop_map(Op::InsertAfter),
            (0usize..12).prop_map(Op::Replace),
            (0usize..12, 0usize..12).prop_map(|(a, b)| Op::Delete(a.min(b), a.max(b))),
            (0usize..4).prop_map(Op::DeleteBefore),
        ]
    }

    proptest! {
        #[test]
        fn mutations_keep_lists_aligned(ops in prop::collection::vec(op(), 0..40)) {
            let mut list = LineList::from_listings(VERBOSE, PLAIN);
            for op in ops {
                match op {
                    Op::InsertBefore(i) => list.insert_before(i, Line::text("; inserted")),
                    Op::InsertAfter(i) => list.insert_after(i, Line::text("")),
                    Op::Replace(i) => list.replace(i, Line::text("label:")),
                    Op::Delete(a, b) => list.delete_range(a..b),
                    Op::DeleteBefore(i) => list.delete_lines_before(i),
                }
                prop_assert!(list.is_consistent());
            }
        }
    }
}
