//! Objective-C 1 runtime records as laid out in 32-bit images.

use nom_derive::Nom;

use crate::helpers::parse_endian;
use crate::macho::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
pub struct ObjcModule {
    pub version: u32,
    pub size: u32,
    pub name: u32,
    pub symtab: u32,
}

impl ObjcModule {
    pub const SIZE: usize = 16;
}

/// Header of a module's symbol table. `cls_def_cnt` class pointers then
/// `cat_def_cnt` category pointers follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
pub struct ObjcSymtab {
    pub sel_ref_cnt: u32,
    pub refs: u32,
    pub cls_def_cnt: u16,
    pub cat_def_cnt: u16,
}

impl ObjcSymtab {
    pub const SIZE: usize = 12;
}

/// On disk `super_class` holds a pointer to the superclass name, and `isa`
/// of a class points to its metaclass record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Nom)]
pub struct ObjcClass {
    pub isa: u32,
    pub super_class: u32,
    pub name: u32,
    pub version: u32,
    pub info: u32,
    pub instance_size: u32,
    pub ivars: u32,
    pub method_lists: u32,
    pub cache: u32,
    pub protocols: u32,
}

impl ObjcClass {
    pub const SIZE: usize = 40;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Nom)]
pub struct ObjcCategory {
    pub category_name: u32,
    pub class_name: u32,
    pub instance_methods: u32,
    pub class_methods: u32,
    pub protocols: u32,
}

impl ObjcCategory {
    pub const SIZE: usize = 20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Nom)]
pub struct ObjcIvar {
    pub name: u32,
    pub type_: u32,
    pub offset: u32,
}

impl ObjcIvar {
    pub const SIZE: usize = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Nom)]
pub struct ObjcMethod {
    pub name: u32,
    pub types: u32,
    pub imp: u32,
}

impl ObjcMethod {
    pub const SIZE: usize = 12;
}

/// Reads one fixed-size record at `addr`.
pub fn read_record<'a, T, M>(mem: &'a M, addr: u32, size: usize) -> Option<T>
where
    T: nom_derive::Parse<&'a [u8]>,
    M: AddressSpace + ?Sized,
{
    if addr == 0 {
        return None;
    }
    let bytes = mem.bytes_at(addr, size)?;
    parse_endian::<T>(bytes, mem.endian()).ok().map(|(_, rec)| rec)
}

/// Reads a counted array that follows a header of `header_len` bytes whose
/// count word sits at `count_at`.
pub fn read_counted<'a, T, M>(
    mem: &'a M,
    addr: u32,
    count_at: u32,
    header_len: u32,
    size: usize,
) -> Vec<T>
where
    T: nom_derive::Parse<&'a [u8]>,
    M: AddressSpace + ?Sized,
{
    let count = match mem.read_u32(addr.wrapping_add(count_at)) {
        Some(count) if addr != 0 => count,
        _ => return Vec::new(),
    };

    (0..count)
        .map_while(|i| {
            let at = addr
                .checked_add(header_len)?
                .checked_add(i.checked_mul(size as u32)?)?;
            read_record::<T, M>(mem, at, size)
        })
        .collect()
}

pub fn read_method_list<M: AddressSpace + ?Sized>(mem: &M, addr: u32) -> Vec<ObjcMethod> {
    // obsolete word, method count, then the methods
    read_counted(mem, addr, 4, 8, ObjcMethod::SIZE)
}

pub fn read_ivar_list<M: AddressSpace + ?Sized>(mem: &M, addr: u32) -> Vec<ObjcIvar> {
    read_counted(mem, addr, 0, 4, ObjcIvar::SIZE)
}

/// Reads a symtab and splits its definition pointers into classes and categories.
pub fn read_symtab<M: AddressSpace + ?Sized>(
    mem: &M,
    addr: u32,
) -> Option<(ObjcSymtab, Vec<u32>, Vec<u32>)> {
    let symtab: ObjcSymtab = read_record(mem, addr, ObjcSymtab::SIZE)?;
    let defs_at = addr + ObjcSymtab::SIZE as u32;
    let def = |i: u32| mem.read_u32(defs_at + 4 * i);

    let classes = (0..symtab.cls_def_cnt as u32).filter_map(def).collect();
    let categories = (0..symtab.cat_def_cnt as u32)
        .filter_map(|i| def(symtab.cls_def_cnt as u32 + i))
        .collect();
    Some((symtab, classes, categories))
}
