//! Named counting semaphores, server-side. A semaphore springs into
//! existence on first touch with value 1 (mutex-like); waits and posts
//! adjust it from there.

use crate::proto::Name;
use hashbrown::HashMap;

pub type SemId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sem {
    pub id: SemId,
    pub value: u32,
}

pub struct SemTable {
    sems: HashMap<Name, Sem>,
    next_id: SemId,
}

impl SemTable {
    pub fn new() -> SemTable {
        SemTable { sems: HashMap::new(), next_id: 1 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sems.len()
    }

    /// Looks the semaphore up, creating it with value 1 if unknown.
    pub fn get_or_create(&mut self, name: Name) -> &mut Sem {
        let next_id = &mut self.next_id;

        self.sems.entry(name).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            Sem { id, value: 1 }
        })
    }

    pub fn get(&self, name: &Name) -> Option<&Sem> {
        self.sems.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_with_value_one() {
        let mut tab = SemTable::new();
        let sem = tab.get_or_create(Name::new("sum"));
        assert_eq!(sem.value, 1);
    }

    #[test]
    fn test_lookup_is_stable() {
        let mut tab = SemTable::new();
        let id = tab.get_or_create(Name::new("sum")).id;
        tab.get_or_create(Name::new("sum")).value += 5;

        let sem = tab.get(&Name::new("sum")).unwrap();
        assert_eq!(sem.id, id);
        assert_eq!(sem.value, 6);
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn test_distinct_names_distinct_ids() {
        let mut tab = SemTable::new();
        let a = tab.get_or_create(Name::new("a")).id;
        let b = tab.get_or_create(Name::new("b")).id;
        assert_ne!(a, b);
        assert_eq!(tab.len(), 2);
    }
}
