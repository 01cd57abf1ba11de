use std::fmt::{Debug, Formatter};

use derive_more::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Position of a table in the query's table list.
pub type TableNo = usize;

/// Most tables a single query may join.
pub const MAX_TABLES: usize = 64;

/// Set of query tables, one bit per [`TableNo`].
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Default, BitAnd, BitAndAssign, BitOr, BitOrAssign, Not,
)]
pub struct TableMap(u64);

impl TableMap {
    pub const EMPTY: TableMap = TableMap(0);

    pub fn of(table: TableNo) -> Self {
        debug_assert!(table < MAX_TABLES);
        TableMap(1 << table)
    }

    /// The first `count` tables.
    pub fn first(count: usize) -> Self {
        if count >= MAX_TABLES {
            TableMap(u64::MAX)
        } else {
            TableMap((1 << count) - 1)
        }
    }

    pub fn from_tables<I: IntoIterator<Item = TableNo>>(tables: I) -> Self {
        tables
            .into_iter()
            .fold(TableMap::EMPTY, |acc, t| acc | TableMap::of(t))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, table: TableNo) -> bool {
        table < MAX_TABLES && self.0 & (1 << table) != 0
    }

    pub fn is_subset_of(&self, other: TableMap) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersects(&self, other: TableMap) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, table: TableNo) {
        self.0 |= 1 << table;
    }

    pub fn remove(&mut self, table: TableNo) {
        self.0 &= !(1 << table);
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = TableNo> {
        let bits = self.0;
        (0..MAX_TABLES).filter(move |t| bits & (1 << t) != 0)
    }
}

impl Debug for TableMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::table_map::TableMap;

    #[test]
    fn test_set_operations() {
        let a = TableMap::from_tables([0, 2]);
        let b = TableMap::of(2) | TableMap::of(3);

        assert!((a & b).contains(2));
        assert!(!(a & b).contains(0));
        assert!(TableMap::of(0).is_subset_of(a));
        assert!(!b.is_subset_of(a));
        assert_eq!(vec![0, 2, 3], (a | b).iter().collect::<Vec<_>>());
        assert_eq!(TableMap::from_tables([0, 1, 2]), TableMap::first(3));
        assert!((!a & b).contains(3));
    }
}
