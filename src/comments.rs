//! Inline comments for code lines, built from the section a reference lands
//! in and from the simulated register file.

use std::fmt;

use tracing::trace;

use crate::arch::{ArchSpecifics, DataRef, Flow, SendKind};
use crate::command::Nlist;
use crate::demangle::demangle;
use crate::helpers::escape_literal;
use crate::lines::Line;
use crate::macho::AddressSpace;
use crate::objc::structs::{read_record, ObjcModule};
use crate::objc::types::{method_return_type, type_name};
use crate::objc::{MethodInfo, ObjcInfo};
use crate::options::ProcOptions;
use crate::search::find_symbol_by_address;
use crate::sections::{SectionKind, SectionTable};
use crate::state::{GPRegisterInfo, MachineState};
use crate::syscalls::syscall_name;

/// Offset of the characters pointer in a `__cfstring` entry.
const CFSTRING_CHARS_OFFSET: u32 = 8;
/// Offset of the characters pointer in an `(__OBJC,__string_object)` entry.
const NSSTRING_CHARS_OFFSET: u32 = 4;

/// Selector prefixes whose result is an object of the receiver's class.
const RETAINED_FAMILIES: &[&str] = &["alloc", "init", "new", "copy", "mutableCopy"];

#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    CString(String),
    PString(String),
    /// `__cfstring` or `__string_object` constant.
    ObjcString(String),
    Float(f32),
    Double(f64),
    Data { section: &'static str, value: u32 },
    Dyld(&'static str),
    NonLazySymbol(String),
    ImportPointer(String),
    ObjcClass(String),
    ObjcModule(String),
    Selector(String),
    Function(String),
    MessageSend(String),
    SystemCall(String),
    Ivar { name: String, type_name: Option<String> },
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::CString(s) | Annotation::PString(s) => write!(f, "\"{}\"", escape_literal(s)),
            Annotation::ObjcString(s) => write!(f, "@\"{}\"", escape_literal(s)),
            Annotation::Float(v) => write!(f, "{}", v),
            Annotation::Double(v) => write!(f, "{}", v),
            Annotation::Data { section, value } => write!(f, "{} 0x{:08x}", section, value),
            Annotation::Dyld(name) => f.write_str(name),
            Annotation::NonLazySymbol(name)
            | Annotation::ImportPointer(name)
            | Annotation::ObjcClass(name)
            | Annotation::ObjcModule(name)
            | Annotation::Selector(name)
            | Annotation::Function(name)
            | Annotation::MessageSend(name)
            | Annotation::SystemCall(name) => f.write_str(name),
            Annotation::Ivar {
                name,
                type_name: Some(ty),
            } => write!(f, "({}){}", ty, name),
            Annotation::Ivar { name, .. } => f.write_str(name),
        }
    }
}

/// The comment for one line plus what a message send leaves in the
/// return register.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineComment {
    pub annotation: Option<Annotation>,
    pub returned: Option<GPRegisterInfo>,
}

pub struct Commenter<'a> {
    pub sections: &'a SectionTable,
    pub objc: &'a ObjcInfo,
    pub mem: &'a dyn AddressSpace,
    pub symbols: &'a [Nlist],
    pub options: &'a ProcOptions,
}

impl<'a> Commenter<'a> {
    /// Comments `line` using the state in effect before it executes.
    pub fn comment_line(&self, arch: &dyn ArchSpecifics, state: &MachineState, line: &Line) -> LineComment {
        if let Flow::Call(Some(target)) = arch.flow(line) {
            let name = self.callee_name(target);
            let kind = arch
                .special_send(target)
                .or_else(|| name.as_deref().and_then(SendKind::from_symbol));
            if let Some(kind) = kind {
                let (receiver, selector) = arch.send_arguments(state, kind);
                return self
                    .describe_send(kind, receiver, selector, arch.receiver_name(kind))
                    .map(|(text, returned)| LineComment {
                        annotation: Some(Annotation::MessageSend(text)),
                        returned,
                    })
                    .unwrap_or_default();
            }
            return LineComment {
                annotation: name.map(|n| Annotation::Function(self.display_name(&n))),
                returned: None,
            };
        }

        if let Some(number) = arch.syscall_number(state, line) {
            let annotation = syscall_name(number).map(|name| Annotation::SystemCall(name.to_string()));
            return LineComment {
                annotation,
                returned: None,
            };
        }

        let annotation = match arch.data_reference(state, line) {
            Some(DataRef::Address(addr)) => self.describe_address(addr),
            Some(DataRef::Ivar { object, offset }) => self.describe_ivar(object, offset),
            None => None,
        };
        LineComment {
            annotation,
            returned: None,
        }
    }

    /// Name of a call target: imported stub, symbol, or Objective-C method.
    pub fn callee_name(&self, target: u32) -> Option<String> {
        if let Some(name) = self.sections.imported_symbol(target) {
            return Some(name.to_string());
        }
        if let Some(sym) = find_symbol_by_address(self.symbols, target) {
            return Some(sym.name.clone());
        }
        self.objc
            .method_from_address(target)
            .map(|method| self.method_label(method))
    }

    pub fn display_name(&self, symbol: &str) -> String {
        if self.options.demangle_cpp_names {
            if let Some(name) = demangle(symbol) {
                return name;
            }
        }
        symbol.to_string()
    }

    /// `-[Class(Category) selector]`, or with return types
    /// `-(type)[Class(Category) selector]`.
    pub fn method_label(&self, method: &MethodInfo) -> String {
        let sign = if method.is_instance { '-' } else { '+' };
        let class = method
            .class
            .and_then(|c| self.objc.class(c))
            .map(|c| c.name.as_str())
            .or_else(|| {
                method
                    .category
                    .and_then(|c| self.objc.category(c))
                    .map(|c| c.class_name.as_str())
            })
            .unwrap_or("?");
        let owner = match method.category.and_then(|c| self.objc.category(c)) {
            Some(cat) => format!("{}({})", class, cat.name),
            None => class.to_string(),
        };
        if self.options.return_types && !method.types.is_empty() {
            format!("{}({})[{} {}]", sign, method_return_type(&method.types), owner, method.selector)
        } else {
            format!("{}[{} {}]", sign, owner, method.selector)
        }
    }

    /// A C string from the copied sections, or from the image itself.
    fn string_at(&self, addr: u32) -> Option<String> {
        self.sections
            .find(addr)
            .and_then(|(_, info)| info.cstring_at(addr))
            .or_else(|| self.mem.read_cstring(addr))
    }

    pub fn describe_address(&self, addr: u32) -> Option<Annotation> {
        let Some((kind, info)) = self.sections.find(addr) else {
            return self
                .sections
                .imported_symbol(addr)
                .map(|name| Annotation::NonLazySymbol(name.to_string()));
        };

        let annotation = match kind {
            SectionKind::CString => Annotation::CString(info.cstring_at(addr)?),
            SectionKind::ConstText => {
                let len = *info.bytes_at(addr, 1)?.first()? as usize;
                let bytes = info.bytes_at(addr + 1, len)?;
                Annotation::PString(String::from_utf8_lossy(bytes).into_owned())
            }
            SectionKind::CFString => {
                let chars = info.read_u32(addr + CFSTRING_CHARS_OFFSET)?;
                Annotation::ObjcString(self.string_at(chars)?)
            }
            SectionKind::ObjcStringObject => {
                let chars = info.read_u32(addr + NSSTRING_CHARS_OFFSET)?;
                Annotation::ObjcString(self.string_at(chars)?)
            }
            SectionKind::Literal4 => Annotation::Float(f32::from_bits(info.read_u32(addr)?)),
            SectionKind::Literal8 => Annotation::Double(f64::from_bits(info.read_u64(addr)?)),
            SectionKind::Data
            | SectionKind::CoalescedData
            | SectionKind::CoalescedDataNt
            | SectionKind::ConstData => {
                let value = info.read_u32(addr)?;
                match self.sections.find(value) {
                    Some((SectionKind::CString, strings)) => Annotation::CString(strings.cstring_at(value)?),
                    _ => Annotation::Data {
                        section: data_section_name(kind),
                        value,
                    },
                }
            }
            SectionKind::Dyld => match addr - info.addr() {
                0 => Annotation::Dyld("dyld_stub_binding_helper"),
                4 => Annotation::Dyld("__dyld_func_lookup"),
                _ => return None,
            },
            SectionKind::NonLazySymbolPointers => {
                Annotation::NonLazySymbol(self.sections.imported_symbol(addr)?.to_string())
            }
            SectionKind::ImportPointers => {
                Annotation::ImportPointer(self.sections.imported_symbol(addr)?.to_string())
            }
            SectionKind::ObjcClass | SectionKind::ObjcMetaClass => {
                Annotation::ObjcClass(self.objc.class_for_pointer(addr)?.name.clone())
            }
            SectionKind::ObjcCategory => {
                let cat = self.objc.category(addr)?;
                Annotation::ObjcClass(format!("{}({})", cat.class_name, cat.name))
            }
            SectionKind::ObjcModuleInfo => {
                let module = read_record::<ObjcModule, dyn AddressSpace>(self.mem, addr, ObjcModule::SIZE)?;
                Annotation::ObjcModule(self.string_at(module.name)?)
            }
            SectionKind::ObjcMessageRefs => {
                Annotation::Selector(self.string_at(info.read_u32(addr)?)?)
            }
            SectionKind::ObjcClassRefs => {
                Annotation::ObjcClass(self.string_at(info.read_u32(addr)?)?)
            }
            SectionKind::Text | SectionKind::CoalescedText | SectionKind::CoalescedTextNt => {
                let name = find_symbol_by_address(self.symbols, addr)
                    .map(|sym| self.display_name(&sym.name))
                    .or_else(|| self.objc.method_from_address(addr).map(|m| self.method_label(m)))?;
                Annotation::Function(name)
            }
            SectionKind::ObjcInstanceVars | SectionKind::ObjcSymbols => return None,
        };
        Some(annotation)
    }

    pub fn describe_ivar(&self, object: GPRegisterInfo, offset: u32) -> Option<Annotation> {
        let ivar = self.objc.find_ivar(object.class?, offset)?;
        let type_name = (self.options.variable_types && !ivar.type_encoding.is_empty())
            .then(|| type_name(&ivar.type_encoding));
        Some(Annotation::Ivar {
            name: ivar.name.clone(),
            type_name,
        })
    }

    /// Formats a message send and works out what it returns.
    pub fn describe_send(
        &self,
        kind: SendKind,
        receiver: GPRegisterInfo,
        selector: GPRegisterInfo,
        receiver_name: &str,
    ) -> Option<(String, Option<GPRegisterInfo>)> {
        let Some(sel) = selector.valid_value().and_then(|v| self.string_at(v)) else {
            trace!("unresolved selector in message send");
            return None;
        };

        if kind.is_super() {
            return Some((format!("-[super {}]", sel), None));
        }

        // (class address, class name, whether the receiver is the class itself)
        let class: Option<(Option<u32>, String, bool)> = if let Some(addr) = receiver.class {
            let is_meta = self.objc.is_metaclass(addr);
            self.objc
                .class_for_pointer(addr)
                .map(|c| (Some(c.addr), c.name.clone(), is_meta))
        } else if let Some(value) = receiver.valid_value() {
            match self.objc.class_for_pointer(value) {
                Some(c) => Some((Some(c.addr), c.name.clone(), true)),
                None => self
                    .string_at(value)
                    .filter(|name| is_identifier(name))
                    .map(|name| {
                        let addr = self.objc.class_from_name(&name).map(|c| c.addr);
                        (addr, name, true)
                    }),
            }
        } else {
            None
        };

        let Some((class_addr, class_name, is_class)) = class else {
            let text = if self.options.verbose_msg_sends {
                format!("-[{} {}]", receiver_name, sel)
            } else {
                sel
            };
            return Some((text, None));
        };

        let sign = if is_class { '+' } else { '-' };
        let return_type = class_addr
            .filter(|_| self.options.return_types)
            .and_then(|addr| self.objc.find_method(addr, &sel, !is_class))
            .filter(|method| !method.types.is_empty())
            .map(|method| format!("({})", method_return_type(&method.types)))
            .unwrap_or_default();
        let text = format!("{}{}[{} {}]", sign, return_type, class_name, sel);

        let returned = class_addr
            .filter(|_| RETAINED_FAMILIES.iter().any(|family| sel.starts_with(family)))
            .map(|addr| GPRegisterInfo::object(addr, None));
        Some((text, returned))
    }
}

fn data_section_name(kind: SectionKind) -> &'static str {
    match kind {
        SectionKind::CoalescedData => "(__DATA,__coalesced_data)",
        SectionKind::CoalescedDataNt => "(__DATA,__datacoal_nt)",
        SectionKind::ConstData => "(__DATA,__const)",
        _ => "(__DATA,__data)",
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ppc::{PpcSpecifics, REGISTER_COUNT};
    use crate::lines::LineInfo;
    use crate::objc::tests::{sample_objc, CONTROL, VIEW};
    use crate::sections::tests::section_info;

    fn table() -> SectionTable {
        let mut table = SectionTable::default();
        let mut cstrings = b"hello\n\0NSString\0".to_vec();
        cstrings.resize(32, 0);
        table.insert(SectionKind::CString, section_info("__TEXT", "__cstring", 0x3000, cstrings));

        let mut literal8 = vec![0u8; 8];
        literal8.copy_from_slice(&1.5f64.to_bits().to_be_bytes());
        table.insert(SectionKind::Literal8, section_info("__TEXT", "__literal8", 0x3100, literal8));

        // a CFString whose characters live in __cstring
        let mut cfstring = vec![0u8; 16];
        cfstring[8..12].copy_from_slice(&0x3000u32.to_be_bytes());
        table.insert(SectionKind::CFString, section_info("__DATA", "__cfstring", 0x3200, cfstring));

        table.insert(SectionKind::Dyld, section_info("__DATA", "__dyld", 0x3300, vec![0; 8]));
        table.insert(
            SectionKind::ConstText,
            section_info("__TEXT", "__const", 0x3400, b"\x03abc".to_vec()),
        );
        table.insert(
            SectionKind::ObjcClass,
            section_info("__OBJC", "__class", VIEW, vec![0; 0x100]),
        );
        table
    }

    fn with_commenter<F: FnOnce(&Commenter)>(options: ProcOptions, f: F) {
        let (mut mem, objc) = sample_objc();
        mem.put_str(0x5a00, "init");
        mem.put_str(0x5a08, "description");
        mem.put_str(0x5a18, "NSString");
        let table = table();
        let commenter = Commenter {
            sections: &table,
            objc: &objc,
            mem: &mem,
            symbols: &[],
            options: &options,
        };
        f(&commenter);
    }

    #[test]
    fn test_describe_address() {
        with_commenter(ProcOptions::default(), |c| {
            assert_eq!(c.describe_address(0x3000).unwrap().to_string(), "\"hello\\n\"");
            assert_eq!(c.describe_address(0x3100), Some(Annotation::Double(1.5)));
            assert_eq!(c.describe_address(0x3200).unwrap().to_string(), "@\"hello\\n\"");
            assert_eq!(c.describe_address(0x3300).unwrap().to_string(), "dyld_stub_binding_helper");
            assert_eq!(c.describe_address(0x3304).unwrap().to_string(), "__dyld_func_lookup");
            assert_eq!(c.describe_address(0x3400), Some(Annotation::PString("abc".into())));
            assert_eq!(c.describe_address(VIEW), Some(Annotation::ObjcClass("View".into())));
            assert_eq!(c.describe_address(0x9000), None);
        });
    }

    #[test]
    fn test_ivar_comment() {
        with_commenter(ProcOptions::default(), |c| {
            let object = GPRegisterInfo::object(CONTROL, None);
            assert_eq!(
                c.describe_ivar(object, 4).unwrap().to_string(),
                "(struct _NSRect)frame"
            );
        });
        let options = ProcOptions {
            variable_types: false,
            ..Default::default()
        };
        with_commenter(options, |c| {
            let object = GPRegisterInfo::object(CONTROL, None);
            assert_eq!(c.describe_ivar(object, 24).unwrap().to_string(), "target");
        });
    }

    #[test]
    fn test_message_sends() {
        with_commenter(ProcOptions::default(), |c| {
            let sel = GPRegisterInfo::known(0x5a00);

            // an instance of a known class
            let (text, returned) = c
                .describe_send(SendKind::Send, GPRegisterInfo::object(VIEW, None), GPRegisterInfo::known(0x5820), "r3")
                .unwrap();
            assert_eq!(text, "-(void)[View drawRect:]");
            assert_eq!(returned, None);

            // a class named through a class reference string
            let (text, _) = c
                .describe_send(SendKind::Send, GPRegisterInfo::known(0x5a18), sel, "r3")
                .unwrap();
            assert_eq!(text, "+[NSString init]");

            // the class object itself: init keeps the class for the result
            let (text, returned) = c
                .describe_send(SendKind::Send, GPRegisterInfo::known(VIEW), sel, "r3")
                .unwrap();
            assert_eq!(text, "+[View init]");
            assert_eq!(returned.and_then(|r| r.class), Some(VIEW));

            let (text, _) = c
                .describe_send(SendKind::SendSuper, GPRegisterInfo::default(), sel, "r3")
                .unwrap();
            assert_eq!(text, "-[super init]");

            let (text, _) = c
                .describe_send(SendKind::Send, GPRegisterInfo::default(), GPRegisterInfo::known(0x5a08), "r3")
                .unwrap();
            assert_eq!(text, "-[r3 description]");

            assert!(c
                .describe_send(SendKind::Send, GPRegisterInfo::default(), GPRegisterInfo::default(), "r3")
                .is_none());
        });
    }

    #[test]
    fn test_comment_line_uses_state() {
        with_commenter(ProcOptions::default(), |c| {
            let ppc = PpcSpecifics;
            let mut state = MachineState::new(REGISTER_COUNT);
            state.set_value(2, 0x3000);
            state.set_value(0, 4);

            // lwz r3,0(r2)
            let load = Line {
                text: "00001000\tlwz\tr3,0(r2)".into(),
                info: LineInfo {
                    address: 0x1000,
                    code: "80620000".into(),
                    is_code: true,
                    is_function: false,
                },
            };
            let comment = c.comment_line(&ppc, &state, &load);
            assert_eq!(comment.annotation, Some(Annotation::CString("hello\n".into())));

            let sc = Line {
                text: "00001004\tsc".into(),
                info: LineInfo {
                    address: 0x1004,
                    code: "44000002".into(),
                    is_code: true,
                    is_function: false,
                },
            };
            let comment = c.comment_line(&ppc, &state, &sc);
            assert_eq!(comment.annotation, Some(Annotation::SystemCall("write".into())));
        });
    }

    #[test]
    fn test_method_labels() {
        with_commenter(ProcOptions::default(), |c| {
            let draw = c.objc.method_from_address(0x2000).unwrap();
            assert_eq!(c.method_label(draw), "-(void)[View drawRect:]");
            let flash = c.objc.method_from_address(0x2200).unwrap();
            assert_eq!(c.method_label(flash), "-(void)[View(Extras) flash]");
        });
        let options = ProcOptions {
            return_types: false,
            ..Default::default()
        };
        with_commenter(options, |c| {
            let alloc = c.objc.method_from_address(0x2100).unwrap();
            assert_eq!(c.method_label(alloc), "+[View alloc]");
        });
    }
}
