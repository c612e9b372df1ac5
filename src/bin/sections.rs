use otx::command::segment::Protection;
use otx::command::LoadCommand;
use otx::header::MachHeader;
use otx::sections::{SectionKind, SectionTable};
use otx::{Arch, MachO, ProcessResult};
use std::{env, fs, str::FromStr};

fn main() -> ProcessResult<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <file_path> [ppc|i386]", args[0]);
        return Ok(());
    }

    let buffer = fs::read(&args[1])?;
    let arch = match args.get(2) {
        Some(name) => match Arch::from_str(name) {
            Ok(arch) => Some(arch),
            Err(_) => {
                eprintln!("Unknown architecture {}", name);
                return Ok(());
            }
        },
        None => None,
    };

    for cputype in MachO::archs_in(&buffer)? {
        println!("slice: {}", cputype);
    }

    let macho = MachO::parse(&buffer, arch)?;
    print_header(&macho.header);
    print_load_commands(&macho);
    print_sections(&SectionTable::load(&macho));
    Ok(())
}

fn print_header(hdr: &MachHeader) {
    println!(
        "{:?} - {} - {} commands ({} bytes) - {:?}{}",
        hdr.file_type(),
        hdr.cputype,
        hdr.ncmds,
        hdr.sizeofcmds,
        hdr.flags,
        if hdr.swapped() { " (swapped)" } else { "" }
    );
}

fn print_load_commands(macho: &MachO) {
    macho.load_commands.iter().enumerate().for_each(|(i, lc)| {
        print!("{:03}: ", i);
        match lc {
            LoadCommand::Segment(seg) => {
                println!(
                    "LC_SEGMENT  addr=0x{:08x}-0x{:08x} off=0x{:08x}-0x{:08x} sz=0x{:06x} ({}/{}) {}",
                    seg.vmaddr,
                    seg.vmaddr.wrapping_add(seg.vmsize),
                    seg.fileoff,
                    seg.fileoff.wrapping_add(seg.filesize),
                    seg.filesize,
                    protection_to_string(seg.initprot),
                    protection_to_string(seg.maxprot),
                    seg.segname,
                );
                for sect in &seg.sections {
                    println!(
                        "      addr=0x{:08x}-0x{:08x} off=0x{:08x}-0x{:08x} sz=0x{:06x} {}",
                        sect.addr,
                        sect.addr.wrapping_add(sect.size),
                        sect.offset,
                        sect.offset.wrapping_add(sect.size),
                        sect.size,
                        sect.sectname,
                    );
                }
            }
            LoadCommand::Symtab(symtab) => println!(
                "LC_SYMTAB  off=0x{:08x} nsyms={} stroff=0x{:08x}",
                symtab.symoff, symtab.nsyms, symtab.stroff
            ),
            LoadCommand::Dysymtab(dysymtab) => println!(
                "LC_DYSYMTAB  nlocals={} nextdefs={} nundefs={} nindirects={}",
                dysymtab.nlocalsym, dysymtab.nextdefsym, dysymtab.nundefsym, dysymtab.nindirectsyms
            ),
            LoadCommand::Other(base) => println!("cmd=0x{:x} size={}", base.cmd, base.cmdsize),
        }
    });
    println!("symbols: {}", macho.symbols.len());
}

fn print_sections(table: &SectionTable) {
    let kinds = [
        SectionKind::Text,
        SectionKind::CoalescedText,
        SectionKind::CoalescedTextNt,
        SectionKind::ConstText,
        SectionKind::CString,
        SectionKind::Literal4,
        SectionKind::Literal8,
        SectionKind::Data,
        SectionKind::CoalescedData,
        SectionKind::CoalescedDataNt,
        SectionKind::ConstData,
        SectionKind::Dyld,
        SectionKind::CFString,
        SectionKind::NonLazySymbolPointers,
        SectionKind::ImportPointers,
        SectionKind::ObjcClass,
        SectionKind::ObjcMetaClass,
        SectionKind::ObjcInstanceVars,
        SectionKind::ObjcModuleInfo,
        SectionKind::ObjcSymbols,
        SectionKind::ObjcCategory,
        SectionKind::ObjcStringObject,
        SectionKind::ObjcMessageRefs,
        SectionKind::ObjcClassRefs,
    ];
    for kind in kinds {
        if let Some(info) = table.get(kind) {
            println!(
                "{:<24} ({},{}) 0x{:08x}-0x{:08x}",
                format!("{:?}", kind),
                info.section.segname,
                info.section.sectname,
                info.addr(),
                info.end()
            );
        }
    }
}

fn protection_to_string(prot: Protection) -> String {
    let mut s = String::new();
    s.push(if prot.contains(Protection::READ) { 'r' } else { '-' });
    s.push(if prot.contains(Protection::WRITE) { 'w' } else { '-' });
    s.push(if prot.contains(Protection::EXECUTE) { 'x' } else { '-' });
    s
}
