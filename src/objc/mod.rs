//! Walks the Objective-C 1 metadata of an image and indexes methods by
//! implementation address. Every lookup returns `None` on a miss.

pub mod structs;
pub mod types;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::macho::AddressSpace;
use crate::search::find_by_address;
use structs::{
    read_ivar_list, read_method_list, read_record, read_symtab, ObjcCategory, ObjcClass,
    ObjcMethod, ObjcModule,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvarInfo {
    pub name: String,
    pub type_encoding: String,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub addr: u32,
    pub name: String,
    pub super_name: Option<String>,
    pub ivars: Vec<IvarInfo>,
    pub raw: ObjcClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryInfo {
    pub addr: u32,
    pub name: String,
    pub class_name: String,
    pub raw: ObjcCategory,
}

/// One method with its owning class or category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method: ObjcMethod,
    pub selector: String,
    pub types: String,
    pub class: Option<u32>,
    pub category: Option<u32>,
    pub is_instance: bool,
}

impl MethodInfo {
    pub fn imp(&self) -> u32 {
        self.method.imp
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjcInfo {
    classes: HashMap<u32, ClassInfo>,
    metaclasses: HashMap<u32, ClassInfo>,
    categories: HashMap<u32, CategoryInfo>,
    class_names: HashMap<String, u32>,
    class_methods: Vec<MethodInfo>,
    cat_methods: Vec<MethodInfo>,
}

impl ObjcInfo {
    /// Walks the modules in `(__OBJC,__module_info)`, given as its address and size.
    pub fn load<M: AddressSpace + ?Sized>(mem: &M, module_info: Option<(u32, u32)>) -> ObjcInfo {
        let mut info = ObjcInfo::default();
        let Some((start, size)) = module_info else {
            return info;
        };

        let mut cat_ptrs = Vec::new();
        let count = size / ObjcModule::SIZE as u32;
        for i in 0..count {
            let addr = start + i * ObjcModule::SIZE as u32;
            let Some(module) = read_record::<ObjcModule, M>(mem, addr, ObjcModule::SIZE) else {
                warn!("unreadable objc module at {:#x}", addr);
                continue;
            };
            let Some((_, classes, categories)) = read_symtab(mem, module.symtab) else {
                continue;
            };
            for class_ptr in classes {
                info.load_class(mem, class_ptr);
            }
            cat_ptrs.extend(categories);
        }

        // categories name their class, so they come after every class is known
        for cat_ptr in cat_ptrs {
            info.load_category(mem, cat_ptr);
        }

        info.class_methods.sort_by_key(|m| m.imp());
        info.cat_methods.sort_by_key(|m| m.imp());
        debug!(
            "objc: {} classes, {} categories, {} class methods, {} category methods",
            info.classes.len(),
            info.categories.len(),
            info.class_methods.len(),
            info.cat_methods.len()
        );
        info
    }

    fn load_class<M: AddressSpace + ?Sized>(&mut self, mem: &M, addr: u32) {
        let Some(raw) = read_record::<ObjcClass, M>(mem, addr, ObjcClass::SIZE) else {
            warn!("unreadable objc class at {:#x}", addr);
            return;
        };
        let name = mem.read_cstring(raw.name).unwrap_or_default();
        let ivars = read_ivar_list(mem, raw.ivars)
            .into_iter()
            .map(|ivar| IvarInfo {
                name: mem.read_cstring(ivar.name).unwrap_or_default(),
                type_encoding: mem.read_cstring(ivar.type_).unwrap_or_default(),
                offset: ivar.offset,
            })
            .collect();

        let methods = read_method_list(mem, raw.method_lists);
        self.push_methods(mem, methods, Some(addr), None, true);

        if let Some(meta) = read_record::<ObjcClass, M>(mem, raw.isa, ObjcClass::SIZE) {
            let methods = read_method_list(mem, meta.method_lists);
            self.push_methods(mem, methods, Some(addr), None, false);
            self.metaclasses.insert(
                addr,
                ClassInfo {
                    addr: raw.isa,
                    name: name.clone(),
                    super_name: mem.read_cstring(meta.super_class),
                    ivars: Vec::new(),
                    raw: meta,
                },
            );
        }

        self.class_names.insert(name.clone(), addr);
        self.classes.insert(
            addr,
            ClassInfo {
                addr,
                name,
                super_name: mem.read_cstring(raw.super_class),
                ivars,
                raw,
            },
        );
    }

    fn load_category<M: AddressSpace + ?Sized>(&mut self, mem: &M, addr: u32) {
        let Some(raw) = read_record::<ObjcCategory, M>(mem, addr, ObjcCategory::SIZE) else {
            warn!("unreadable objc category at {:#x}", addr);
            return;
        };
        let class_name = mem.read_cstring(raw.class_name).unwrap_or_default();
        let class = self.class_names.get(&class_name).copied();

        let instance = read_method_list(mem, raw.instance_methods);
        self.push_methods(mem, instance, class, Some(addr), true);
        let statics = read_method_list(mem, raw.class_methods);
        self.push_methods(mem, statics, class, Some(addr), false);

        self.categories.insert(
            addr,
            CategoryInfo {
                addr,
                name: mem.read_cstring(raw.category_name).unwrap_or_default(),
                class_name,
                raw,
            },
        );
    }

    fn push_methods<M: AddressSpace + ?Sized>(
        &mut self,
        mem: &M,
        methods: Vec<ObjcMethod>,
        class: Option<u32>,
        category: Option<u32>,
        is_instance: bool,
    ) {
        let target = if category.is_some() {
            &mut self.cat_methods
        } else {
            &mut self.class_methods
        };
        target.extend(methods.into_iter().map(|method| MethodInfo {
            selector: mem.read_cstring(method.name).unwrap_or_default(),
            types: mem.read_cstring(method.types).unwrap_or_default(),
            method,
            class,
            category,
            is_instance,
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.categories.is_empty()
    }

    pub fn find_class_method(&self, imp: u32) -> Option<&MethodInfo> {
        find_by_address(&self.class_methods, imp, MethodInfo::imp)
    }

    pub fn find_cat_method(&self, imp: u32) -> Option<&MethodInfo> {
        find_by_address(&self.cat_methods, imp, MethodInfo::imp)
    }

    /// Class methods take precedence over category methods at the same address.
    pub fn method_from_address(&self, imp: u32) -> Option<&MethodInfo> {
        self.find_class_method(imp)
            .or_else(|| self.find_cat_method(imp))
    }

    pub fn class_ptr_from_method(&self, imp: u32) -> Option<u32> {
        self.method_from_address(imp).and_then(|m| m.class)
    }

    pub fn cat_ptr_from_method(&self, imp: u32) -> Option<u32> {
        self.find_cat_method(imp).and_then(|m| m.category)
    }

    pub fn class(&self, addr: u32) -> Option<&ClassInfo> {
        self.classes.get(&addr)
    }

    pub fn category(&self, addr: u32) -> Option<&CategoryInfo> {
        self.categories.get(&addr)
    }

    pub fn class_from_name(&self, name: &str) -> Option<&ClassInfo> {
        self.class_names.get(name).and_then(|addr| self.classes.get(addr))
    }

    pub fn metaclass_from_class(&self, class_addr: u32) -> Option<&ClassInfo> {
        self.metaclasses.get(&class_addr)
    }

    /// The ivar at `offset` in the class or, failing that, its superclasses.
    pub fn find_ivar(&self, class_addr: u32, offset: u32) -> Option<&IvarInfo> {
        let mut class = self.classes.get(&class_addr);
        let mut hops = 0;
        while let Some(info) = class {
            if let Some(ivar) = info.ivars.iter().find(|ivar| ivar.offset == offset) {
                return Some(ivar);
            }
            hops += 1;
            if hops > self.classes.len() {
                break;
            }
            class = info
                .super_name
                .as_deref()
                .and_then(|name| self.class_from_name(name));
        }
        None
    }

    /// The method a class (or one of its categories or superclasses)
    /// implements for `selector`.
    pub fn find_method(&self, class_addr: u32, selector: &str, is_instance: bool) -> Option<&MethodInfo> {
        let mut class = self.classes.get(&class_addr);
        let mut hops = 0;
        while let Some(info) = class {
            let found = self
                .class_methods
                .iter()
                .chain(&self.cat_methods)
                .find(|m| {
                    m.class == Some(info.addr) && m.is_instance == is_instance && m.selector == selector
                });
            if found.is_some() {
                return found;
            }
            hops += 1;
            if hops > self.classes.len() {
                break;
            }
            class = info
                .super_name
                .as_deref()
                .and_then(|name| self.class_from_name(name));
        }
        None
    }

    pub fn is_metaclass(&self, addr: u32) -> bool {
        self.metaclasses.values().any(|meta| meta.addr == addr)
    }

    /// Looks up a class record by the address of any class or metaclass.
    pub fn class_for_pointer(&self, addr: u32) -> Option<&ClassInfo> {
        self.classes.get(&addr).or_else(|| {
            self.metaclasses
                .iter()
                .find(|(_, meta)| meta.addr == addr)
                .and_then(|(class, _)| self.classes.get(class))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::macho::tests::FlatMemory;
    use nom::number::Endianness;

    pub(crate) const MODULES: u32 = 0x5000;
    pub(crate) const VIEW: u32 = 0x5100;
    pub(crate) const CONTROL: u32 = 0x5180;

    /// Two classes (`Control : View`) and one category on `View`.
    pub(crate) fn sample_objc() -> (FlatMemory, ObjcInfo) {
        let mut mem = FlatMemory::new(0x5000, 0x1000, Endianness::Big);
        // module -> symtab at 0x5020 with 2 classes and 1 category
        mem.put_words(MODULES, &[7, 16, 0, 0x5020]);
        mem.put_words(0x5020, &[0, 0, 0x0002_0001, VIEW, CONTROL, 0x5300]);

        // strings
        mem.put_str(0x5800, "View");
        mem.put_str(0x5808, "Control");
        mem.put_str(0x5810, "NSObject");
        mem.put_str(0x5820, "drawRect:");
        mem.put_str(0x5830, "v20@0:4{_NSRect=ffff}8");
        mem.put_str(0x5850, "alloc");
        mem.put_str(0x5858, "@8@0:4");
        mem.put_str(0x5860, "frame");
        mem.put_str(0x5868, "{_NSRect=ffff}");
        mem.put_str(0x5878, "target");
        mem.put_str(0x5880, "@");
        mem.put_str(0x5888, "Extras");
        mem.put_str(0x5890, "flash");
        mem.put_str(0x5898, "v8@0:4");

        // View: isa=meta at 0x5140, super "NSObject", ivars at 0x5400, methods at 0x5500
        mem.put_words(VIEW, &[0x5140, 0x5810, 0x5800, 0, 1, 24, 0x5400, 0x5500, 0, 0]);
        mem.put_words(0x5140, &[0, 0x5810, 0x5800, 0, 2, 48, 0, 0x5540, 0, 0]);
        // Control: super "View", one ivar
        mem.put_words(CONTROL, &[0, 0x5800, 0x5808, 0, 1, 28, 0x5440, 0, 0, 0]);

        mem.put_words(0x5400, &[1, 0x5860, 0x5868, 4]);
        mem.put_words(0x5440, &[1, 0x5878, 0x5880, 24]);

        mem.put_words(0x5500, &[0, 1, 0x5820, 0x5830, 0x2000]);
        mem.put_words(0x5540, &[0, 1, 0x5850, 0x5858, 0x2100]);

        // category Extras on View with one instance method
        mem.put_words(0x5300, &[0x5888, 0x5800, 0x5580, 0, 0]);
        mem.put_words(0x5580, &[0, 1, 0x5890, 0x5898, 0x2200]);

        let info = ObjcInfo::load(&mem, Some((MODULES, 16)));
        (mem, info)
    }

    #[test]
    fn test_methods_by_address() {
        let (_, info) = sample_objc();

        let draw = info.method_from_address(0x2000).unwrap();
        assert_eq!(draw.selector, "drawRect:");
        assert!(draw.is_instance);
        assert_eq!(draw.class, Some(VIEW));

        let alloc = info.method_from_address(0x2100).unwrap();
        assert!(!alloc.is_instance);
        assert_eq!(info.class_ptr_from_method(0x2100), Some(VIEW));

        assert_eq!(info.cat_ptr_from_method(0x2200), Some(0x5300));
        assert_eq!(info.class_ptr_from_method(0x2200), Some(VIEW));
        assert_eq!(info.category(0x5300).unwrap().name, "Extras");
        assert!(info.method_from_address(0x2004).is_none());
    }

    #[test]
    fn test_class_lookups() {
        let (_, info) = sample_objc();
        assert_eq!(info.class_from_name("Control").unwrap().addr, CONTROL);
        assert_eq!(info.metaclass_from_class(VIEW).unwrap().addr, 0x5140);
        assert_eq!(info.class_for_pointer(0x5140).unwrap().name, "View");
        assert!(info.class_from_name("NSObject").is_none());
    }

    #[test]
    fn test_ivar_walks_superclasses() {
        let (_, info) = sample_objc();
        assert_eq!(info.find_ivar(CONTROL, 24).unwrap().name, "target");
        let inherited = info.find_ivar(CONTROL, 4).unwrap();
        assert_eq!(inherited.name, "frame");
        assert_eq!(inherited.type_encoding, "{_NSRect=ffff}");
        assert!(info.find_ivar(CONTROL, 8).is_none());
    }

    #[test]
    fn test_find_method_by_selector() {
        let (_, info) = sample_objc();
        assert_eq!(info.find_method(CONTROL, "drawRect:", true).unwrap().imp(), 0x2000);
        assert_eq!(info.find_method(CONTROL, "flash", true).unwrap().imp(), 0x2200);
        assert_eq!(info.find_method(VIEW, "alloc", false).unwrap().imp(), 0x2100);
        assert!(info.find_method(VIEW, "alloc", true).is_none());
        assert!(info.is_metaclass(0x5140));
        assert!(!info.is_metaclass(VIEW));
    }

    #[test]
    fn test_no_module_section() {
        let mem = FlatMemory::new(0x1000, 16, Endianness::Big);
        assert!(ObjcInfo::load(&mem, None).is_empty());
    }
}
