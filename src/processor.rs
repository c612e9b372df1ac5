//! One processing session: a loaded image, its tables, and the passes that
//! turn a pair of raw listings into the annotated one.

use std::fs;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::arch::{specifics_for, ArchSpecifics, Context, ThunkInfo};
use crate::command::Nlist;
use crate::comments::{Commenter, LineComment};
use crate::deobfuscate::{self, NopList};
use crate::disasm::Disassembler;
use crate::error::{ProcessError, ProcessResult};
use crate::helpers::hex_bytes;
use crate::lines::{Line, LineList};
use crate::machine::Arch;
use crate::macho::MachO;
use crate::objc::ObjcInfo;
use crate::options::ProcOptions;
use crate::output::{hex_dump, md5_line, write_listing, CodeFields, OutputLine};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::search::find_symbol_by_address;
use crate::sections::{function_symbols, SectionInfo, SectionKind, SectionTable, DUMPED_DATA};
use crate::state::{FunctionInfo, GPRegisterInfo, MachineState};

/// Passes over a function before block states are taken as settled.
const MAX_PASSES: usize = 2;
/// Longest i386 instruction.
const MAX_INSTRUCTION_LENGTH: u32 = 15;

pub struct Processor {
    path: PathBuf,
    file: Vec<u8>,
    macho: MachO,
    sections: SectionTable,
    objc: ObjcInfo,
    symbols: Vec<Nlist>,
    options: ProcOptions,
    specifics: Box<dyn ArchSpecifics>,
}

impl Processor {
    pub fn open(path: &Path, arch: Option<Arch>, options: ProcOptions) -> ProcessResult<Processor> {
        let file = fs::read(path)?;
        Self::from_bytes(path, file, arch, options)
    }

    /// `path` is only handed to the disassembler; the image comes from `file`.
    pub fn from_bytes(path: &Path, file: Vec<u8>, arch: Option<Arch>, options: ProcOptions) -> ProcessResult<Processor> {
        let macho = MachO::parse(&file, arch)?;
        let sections = SectionTable::load(&macho);
        let module_info = sections
            .get(SectionKind::ObjcModuleInfo)
            .map(|info| (info.addr(), info.size()));
        let objc = ObjcInfo::load(&macho, module_info);
        let symbols = function_symbols(&macho);
        let specifics = specifics_for(macho.arch);
        info!(
            "loaded {} ({}): {} function symbols",
            path.display(),
            macho.arch,
            symbols.len()
        );

        Ok(Processor {
            path: path.to_path_buf(),
            file,
            macho,
            sections,
            objc,
            symbols,
            options,
            specifics,
        })
    }

    pub fn arch(&self) -> Arch {
        self.macho.arch
    }

    pub fn macho(&self) -> &MachO {
        &self.macho
    }

    pub fn verify_nops(&self) -> ProcessResult<NopList> {
        deobfuscate::verify_nops(&self.macho)
    }

    pub fn fix_nops(&self, nops: &NopList, dest: &Path) -> ProcessResult<()> {
        deobfuscate::fix_nops(&self.file, &self.macho, nops, dest)
    }

    /// Runs every pass and writes the listing to `dest`. Nothing is
    /// written unless the whole run succeeds.
    pub fn process_to_file(
        &self,
        disassembler: &dyn Disassembler,
        progress: &dyn ProgressReporter,
        dest: &Path,
    ) -> ProcessResult<()> {
        let write_err = |source| ProcessError::Write {
            path: dest.to_path_buf(),
            source,
        };
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        self.process(disassembler, progress, &mut tmp)?;
        tmp.flush().map_err(write_err)?;
        tmp.persist(dest).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    pub fn process<W: Write>(
        &self,
        disassembler: &dyn Disassembler,
        progress: &dyn ProgressReporter,
        out: &mut W,
    ) -> ProcessResult<()> {
        progress.report(ProgressEvent::Indeterminate);
        progress.report(ProgressEvent::Description("Loading executable".to_string()));

        let text_sections = self.sections.text_sections();
        let mut listings = Vec::with_capacity(text_sections.len());
        for (_, info) in &text_sections {
            let (seg, sect) = (&info.section.segname, &info.section.sectname);
            progress.report(ProgressEvent::Description(format!("Disassembling ({},{})", seg, sect)));
            let verbose = disassembler.disassemble(&self.path, self.arch(), seg, sect, true)?;
            let plain = disassembler.disassemble(&self.path, self.arch(), seg, sect, false)?;
            listings.push((*info, verbose, plain));
        }

        let mut output = vec![OutputLine::Text(format!("{}:", self.path.display()))];
        let mut anon_count = 0;
        let total = listings.len().max(1) as f64;
        for (i, (info, verbose, plain)) in listings.iter().enumerate() {
            progress.report(ProgressEvent::Description(format!(
                "Generating ({},{})",
                info.section.segname, info.section.sectname
            )));
            output.extend(self.annotate_section(info, verbose, plain, &mut anon_count));
            progress.report(ProgressEvent::Value((i + 1) as f64 / total * 100.0));
        }

        if self.options.data_sections {
            for kind in DUMPED_DATA {
                if let Some(info) = self.sections.get(kind) {
                    output.push(OutputLine::Text(String::new()));
                    output.extend(hex_dump(info));
                }
            }
        }

        if self.options.checksum {
            output.push(OutputLine::Text(String::new()));
            output.push(OutputLine::Text(md5_line(&self.file)));
        }

        progress.report(ProgressEvent::Description("Writing file".to_string()));
        write_listing(out, &output, self.options.entab_output)?;
        debug!("wrote {} lines", output.len());
        Ok(())
    }

    /// All passes over one text section.
    pub fn annotate_section(
        &self,
        info: &SectionInfo,
        verbose: &str,
        plain: &str,
        anon_count: &mut u32,
    ) -> Vec<OutputLine> {
        let mut lines = LineList::from_listings(verbose, plain);
        strip_non_code(&mut lines);
        fill_code_bytes(&mut lines, info, self.arch());

        let thunks = self.find_thunks(&lines, info);
        let mut functions = self.find_functions(&mut lines, anon_count);
        debug!(
            "({},{}): {} lines, {} functions, {} thunks",
            info.section.segname,
            info.section.sectname,
            lines.len(),
            functions.len(),
            thunks.len()
        );

        let mut output = vec![
            OutputLine::Text(String::new()),
            OutputLine::Text(format!("({},{}) section", info.section.segname, info.section.sectname)),
        ];
        let ctx = Context::new(&self.macho, &thunks);
        for (func, range) in &mut functions {
            self.find_blocks(func, &lines, range.clone());
            let comments = self.simulate(func, &lines, range.clone(), &ctx);
            self.emit_function(func, &lines, range.clone(), &comments, &mut output);
        }
        output
    }

    /// Position independent code helpers, found ahead of the main pass so
    /// calls to them can be resolved wherever they sit.
    fn find_thunks(&self, lines: &LineList, info: &SectionInfo) -> Vec<ThunkInfo> {
        lines
            .infos()
            .filter(|li| li.is_code)
            .filter_map(|li| {
                let code = info.bytes_at(li.address, 4)?;
                self.specifics.check_thunk(li.address, code)
            })
            .collect()
    }

    fn commenter(&self) -> Commenter<'_> {
        Commenter {
            sections: &self.sections,
            objc: &self.objc,
            mem: &self.macho,
            symbols: &self.symbols,
            options: &self.options,
        }
    }

    fn method_receiver(&self, address: u32) -> Option<GPRegisterInfo> {
        let method = self.objc.method_from_address(address)?;
        let class = method.class?;
        if method.is_instance {
            Some(GPRegisterInfo::object(class, method.category))
        } else {
            let meta = self.objc.metaclass_from_class(class).map_or(class, |m| m.addr);
            Some(GPRegisterInfo::object(meta, method.category))
        }
    }

    /// Marks function starts and splits the list into one range per function.
    fn find_functions(&self, lines: &mut LineList, anon_count: &mut u32) -> Vec<(FunctionInfo, Range<usize>)> {
        let mut starts = Vec::new();
        for i in 0..lines.len() {
            let Some(address) = lines.info(i).filter(|li| li.is_code).map(|li| li.address) else {
                continue;
            };
            let named = find_symbol_by_address(&self.symbols, address).is_some()
                || self.objc.method_from_address(address).is_some();
            if starts.is_empty() || named || self.specifics.starts_function(lines, i) {
                starts.push((i, address, named));
            }
        }

        let mut functions = Vec::with_capacity(starts.len());
        for (n, &(index, address, named)) in starts.iter().enumerate() {
            lines.update_info(index, |li| li.is_function = true);
            let end = starts.get(n + 1).map_or(lines.len(), |next| next.0);
            let mut func = FunctionInfo::new(address);
            if !named {
                *anon_count += 1;
                func.anon_index = Some(*anon_count);
            }
            functions.push((func, index..end));
        }
        functions
    }

    /// Branch targets inside the function, and whatever follows an
    /// instruction that never falls through, start blocks.
    fn find_blocks(&self, func: &mut FunctionInfo, lines: &LineList, range: Range<usize>) {
        let Some((first, last)) = address_span(lines, range.clone()) else {
            return;
        };
        let mut after_transfer = false;
        for i in range {
            let Some(line) = lines.plain(i).filter(|l| l.info.is_code) else {
                continue;
            };
            if after_transfer {
                func.add_block(line.info.address);
            }
            let flow = self.specifics.flow(line);
            if let Some(target) = flow.block_target() {
                if (first..=last).contains(&target) {
                    func.add_block(target);
                }
            }
            after_transfer = !flow.falls_through();
        }
    }

    /// Walks the function with the register simulator, commenting each line
    /// from the state before it executes. A back edge that changes a saved
    /// block state triggers another pass.
    fn simulate(
        &self,
        func: &mut FunctionInfo,
        lines: &LineList,
        range: Range<usize>,
        ctx: &Context,
    ) -> Vec<LineComment> {
        let commenter = self.commenter();
        let arch = self.specifics.as_ref();
        let receiver = self.method_receiver(func.address);
        let mut state = MachineState::new(arch.register_count());
        let mut comments = Vec::new();

        for pass in 0..MAX_PASSES {
            arch.enter_function(&mut state, receiver);
            comments.clear();
            let mut fell_through = true;
            let mut back_edge_changed = false;

            for i in range.clone() {
                let Some(line) = lines.plain(i) else {
                    comments.push(LineComment::default());
                    continue;
                };
                if !line.info.is_code {
                    comments.push(LineComment::default());
                    continue;
                }
                let address = line.info.address;
                if address != func.address {
                    func.restore_registers(address, &mut state, fell_through);
                }

                let comment = commenter.comment_line(arch, &state, line);
                arch.update_registers(&mut state, line, ctx);
                if let Some(returned) = comment.returned {
                    state.set(arch.return_register(), returned);
                }

                let flow = arch.flow(line);
                if let Some(target) = flow.block_target() {
                    if func.is_block_start(target) && func.save_block_state(target, &state) && target <= address {
                        back_edge_changed = true;
                    }
                }
                fell_through = flow.falls_through();
                comments.push(comment);
            }

            if !back_edge_changed {
                break;
            }
            debug!("function 0x{:08x}: pass {} changed a loop state", func.address, pass + 1);
        }
        comments
    }

    fn function_label(&self, func: &FunctionInfo, commenter: &Commenter) -> String {
        if let Some(method) = self.objc.method_from_address(func.address) {
            return commenter.method_label(method);
        }
        if let Some(sym) = find_symbol_by_address(&self.symbols, func.address) {
            return commenter.display_name(&sym.name);
        }
        format!("Anon{}", func.anon_index.unwrap_or(0))
    }

    fn emit_function(
        &self,
        func: &FunctionInfo,
        lines: &LineList,
        range: Range<usize>,
        comments: &[LineComment],
        output: &mut Vec<OutputLine>,
    ) {
        let commenter = self.commenter();
        output.push(OutputLine::Text(String::new()));
        output.push(OutputLine::Text(format!("{}:", self.function_label(func, &commenter))));

        for (n, i) in range.enumerate() {
            let keeps_verbose = |line: &Line| self.specifics.keeps_verbose(line);
            let Some(line) = lines.choose_line(i, self.options.line_choice, keeps_verbose) else {
                continue;
            };
            if !line.info.is_code {
                output.push(OutputLine::Text(line.text));
                continue;
            }
            let address = line.info.address;
            if self.options.separate_logical_blocks && address != func.address && func.is_block_start(address) {
                output.push(OutputLine::Text(String::new()));
            }

            let (mnemonic, operands) = line.instruction().unwrap_or(("", ""));
            let comment = comments
                .get(n)
                .and_then(|c| c.annotation.as_ref())
                .map(|a| a.to_string());
            output.push(OutputLine::Code(CodeFields {
                offset: self
                    .options
                    .local_offsets
                    .then(|| format!("+{}", address.wrapping_sub(func.address))),
                address: format!("{:08x}", address),
                code: line.info.code.clone(),
                mnemonic: mnemonic.to_string(),
                operands: operands.to_string(),
                comment,
            }));
        }
    }
}

/// Drops the disassembler's file and section headers and its labels; labels
/// are regenerated from what the image itself says.
fn strip_non_code(lines: &mut LineList) {
    let mut i = lines.len();
    while i > 0 {
        i -= 1;
        if lines.info(i).is_some_and(|li| !li.is_code) {
            let mut start = i;
            while start > 0 && lines.info(start - 1).is_some_and(|li| !li.is_code) {
                start -= 1;
            }
            lines.delete_range(start..i + 1);
            i = start;
        }
    }
}

/// Copies each instruction's bytes out of the section: everything up to the
/// next instruction's address.
fn fill_code_bytes(lines: &mut LineList, info: &SectionInfo, arch: Arch) {
    let addresses: Vec<(usize, u32)> = lines
        .infos()
        .enumerate()
        .filter(|(_, li)| li.is_code)
        .map(|(i, li)| (i, li.address))
        .collect();

    for (n, &(index, address)) in addresses.iter().enumerate() {
        let len = match arch {
            Arch::Ppc => 4,
            Arch::I386 => {
                let next = addresses.get(n + 1).map_or(info.end(), |&(_, next)| next);
                next.saturating_sub(address).min(MAX_INSTRUCTION_LENGTH)
            }
        };
        let Some(bytes) = info.bytes_at(address, len as usize) else {
            continue;
        };
        let code = hex_bytes(bytes);
        lines.update_info(index, |li| li.code = code.clone());
    }
}

fn address_span(lines: &LineList, range: Range<usize>) -> Option<(u32, u32)> {
    let mut addresses = range
        .filter_map(|i| lines.info(i))
        .filter(|li| li.is_code)
        .map(|li| li.address);
    let first = addresses.next()?;
    let last = addresses.last().unwrap_or(first);
    Some((first, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::tests::section_info;

    #[test]
    fn test_strip_non_code() {
        let mut lines = LineList::from_listings(
            "a.out:\n(__TEXT,__text) section\n_main:\n00001000\tnop\n_f:\n00001001\tret\n",
            "a.out:\n(__TEXT,__text) section\n00001000\tnop\n00001001\tret\n",
        );
        strip_non_code(&mut lines);
        assert_eq!(lines.len(), 2);
        assert!(lines.is_consistent());
        assert_eq!(lines.info(1).map(|li| li.address), Some(0x1001));
    }

    #[test]
    fn test_fill_code_bytes() {
        let mut lines = LineList::from_listings(
            "00001000\tpushl\t%ebp\n00001001\tmovl\t%esp,%ebp\n00001003\tret\n",
            "00001000\tpushl\t%ebp\n00001001\tmovl\t%esp,%ebp\n00001003\tret\n",
        );
        let info = section_info("__TEXT", "__text", 0x1000, vec![0x55, 0x89, 0xe5, 0xc3]);
        fill_code_bytes(&mut lines, &info, Arch::I386);
        let codes: Vec<&str> = lines.infos().map(|li| li.code.as_str()).collect();
        assert_eq!(codes, ["55", "89e5", "c3"]);
        assert_eq!(lines.verbose(1).map(|l| l.info.code.as_str()), Some("89e5"));
    }
}
