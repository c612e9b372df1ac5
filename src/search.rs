//! Address lookups over tables sorted by address.

use crate::command::Nlist;

/// Binary search over a slice sorted by `key`. With duplicate keys any one
/// of the equal entries may be returned.
pub fn find_by_address<T, F>(items: &[T], addr: u32, key: F) -> Option<&T>
where
    F: Fn(&T) -> u32,
{
    items
        .binary_search_by_key(&addr, |item| key(item))
        .ok()
        .map(|i| &items[i])
}

/// The function symbol starting exactly at `addr`.
pub fn find_symbol_by_address(symbols: &[Nlist], addr: u32) -> Option<&Nlist> {
    find_by_address(symbols, addr, |sym| sym.n_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::symtab::NlistType;
    use proptest::prelude::*;

    fn sym(addr: u32) -> Nlist {
        Nlist {
            name: format!("_f{:x}", addr),
            n_type: NlistType::from_raw(0x0f),
            n_sect: 1,
            n_desc: 0,
            n_value: addr,
        }
    }

    proptest! {
        #[test]
        fn symbol_search_hits_exactly_the_starts(
            addrs in prop::collection::btree_set(0u32..0x10000, 1..64),
            target in 0u32..0x10000,
        ) {
            let table: Vec<Nlist> = addrs.iter().map(|a| sym(*a)).collect();
            for a in &addrs {
                prop_assert_eq!(find_symbol_by_address(&table, *a).map(|s| s.n_value), Some(*a));
            }
            let found = find_symbol_by_address(&table, target).is_some();
            prop_assert_eq!(found, addrs.contains(&target));
        }
    }
}
