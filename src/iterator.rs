// File: src/iterator.rs
//
// Iterators for the Panda `for-in` loop: arrays, objects, strings, and
// numeric ranges, plus the bounded per-kind pools they are rented from.

use crate::value::{ObjectMap, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Maximum number of parked iterators per kind.
pub const MAX_POOL_SIZE: usize = 32;

/// A rented iterator. `next` yields values; `next_kv` yields (key, value)
/// pairs, where the key is the element index for arrays, strings, and ranges.
pub enum ValueIter {
    Array(ArrayIter),
    Object(ObjectIter),
    Str(StringIter),
    Range(RangeIter),
}

pub struct ArrayIter {
    source: Rc<RefCell<Vec<Value>>>,
    index: usize,
}

/// Object iteration snapshots the key list at reset time so the loop
/// tolerates mutation; values are read live when each key is visited.
pub struct ObjectIter {
    source: Rc<RefCell<ObjectMap>>,
    keys: Vec<String>,
    index: usize,
}

pub struct StringIter {
    chars: Vec<char>,
    index: usize,
}

pub struct RangeIter {
    next: f64,
    end: f64,
    step: f64,
    index: usize,
}

impl RangeIter {
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self {
            next: start,
            end,
            step,
            index: 0,
        }
    }
}

impl ValueIter {
    pub fn has_next(&self) -> bool {
        match self {
            ValueIter::Array(it) => it.index < it.source.borrow().len(),
            ValueIter::Object(it) => it.index < it.keys.len(),
            ValueIter::Str(it) => it.index < it.chars.len(),
            ValueIter::Range(it) => {
                if it.step > 0.0 {
                    it.next < it.end
                } else {
                    it.next > it.end
                }
            }
        }
    }

    pub fn next(&mut self) -> Value {
        match self {
            ValueIter::Array(it) => {
                let value = it
                    .source
                    .borrow()
                    .get(it.index)
                    .cloned()
                    .unwrap_or(Value::Null);
                it.index += 1;
                value
            }
            ValueIter::Object(it) => {
                let key = &it.keys[it.index];
                let value = it.source.borrow().get(key).cloned().unwrap_or(Value::Null);
                it.index += 1;
                value
            }
            ValueIter::Str(it) => {
                let value = Value::str(it.chars[it.index].to_string());
                it.index += 1;
                value
            }
            ValueIter::Range(it) => {
                let value = Value::Number(it.next);
                it.next += it.step;
                it.index += 1;
                value
            }
        }
    }

    pub fn next_kv(&mut self) -> (Value, Value) {
        match self {
            ValueIter::Object(it) => {
                let key = it.keys[it.index].clone();
                let value = it.source.borrow().get(&key).cloned().unwrap_or(Value::Null);
                it.index += 1;
                (Value::str(key), value)
            }
            ValueIter::Array(_) | ValueIter::Str(_) | ValueIter::Range(_) => {
                let index = match self {
                    ValueIter::Array(it) => it.index,
                    ValueIter::Str(it) => it.index,
                    ValueIter::Range(it) => it.index,
                    ValueIter::Object(_) => unreachable!(),
                };
                (Value::Number(index as f64), self.next())
            }
        }
    }
}

/// Bounded free lists, one per iterator kind. Renting resets a parked
/// iterator in place; returning parks it unless the pool is full or the
/// iterator is still shared.
#[derive(Default)]
pub struct IteratorPool {
    arrays: Vec<Rc<RefCell<ValueIter>>>,
    objects: Vec<Rc<RefCell<ValueIter>>>,
    strings: Vec<Rc<RefCell<ValueIter>>>,
    ranges: Vec<Rc<RefCell<ValueIter>>>,
}

impl IteratorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rent_array(&mut self, source: Rc<RefCell<Vec<Value>>>) -> Rc<RefCell<ValueIter>> {
        let state = ValueIter::Array(ArrayIter { source, index: 0 });
        Self::rent(&mut self.arrays, state)
    }

    pub fn rent_object(&mut self, source: Rc<RefCell<ObjectMap>>) -> Rc<RefCell<ValueIter>> {
        let keys: Vec<String> = source.borrow().keys().cloned().collect();
        let state = ValueIter::Object(ObjectIter {
            source,
            keys,
            index: 0,
        });
        Self::rent(&mut self.objects, state)
    }

    pub fn rent_string(&mut self, source: &str) -> Rc<RefCell<ValueIter>> {
        let state = ValueIter::Str(StringIter {
            chars: source.chars().collect(),
            index: 0,
        });
        Self::rent(&mut self.strings, state)
    }

    pub fn rent_range(&mut self, start: f64, end: f64, step: f64) -> Rc<RefCell<ValueIter>> {
        let state = ValueIter::Range(RangeIter::new(start, end, step));
        Self::rent(&mut self.ranges, state)
    }

    fn rent(
        pool: &mut Vec<Rc<RefCell<ValueIter>>>,
        state: ValueIter,
    ) -> Rc<RefCell<ValueIter>> {
        match pool.pop() {
            Some(parked) => {
                *parked.borrow_mut() = state;
                parked
            }
            None => Rc::new(RefCell::new(state)),
        }
    }

    /// Return an iterator to its kind's pool. Shared or surplus iterators are
    /// simply dropped.
    pub fn give_back(&mut self, iter: Rc<RefCell<ValueIter>>) {
        if Rc::strong_count(&iter) != 1 {
            return;
        }
        let pool = match &*iter.borrow() {
            ValueIter::Array(_) => &mut self.arrays,
            ValueIter::Object(_) => &mut self.objects,
            ValueIter::Str(_) => &mut self.strings,
            ValueIter::Range(_) => &mut self.ranges,
        };
        if pool.len() < MAX_POOL_SIZE {
            pool.push(iter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_iterates_half_open() {
        let mut it = ValueIter::Range(RangeIter::new(0.0, 3.0, 1.0));
        let mut seen = Vec::new();
        while it.has_next() {
            seen.push(it.next().as_number().unwrap());
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn range_supports_negative_steps() {
        let mut it = ValueIter::Range(RangeIter::new(3.0, 0.0, -1.0));
        let mut seen = Vec::new();
        while it.has_next() {
            seen.push(it.next().as_number().unwrap());
        }
        assert_eq!(seen, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn array_kv_pairs_carry_indices() {
        let source = Rc::new(RefCell::new(vec![Value::str("a"), Value::str("b")]));
        let mut pool = IteratorPool::new();
        let it = pool.rent_array(source);
        let (k0, v0) = it.borrow_mut().next_kv();
        assert_eq!(k0.as_number(), Some(0.0));
        assert_eq!(v0.to_display_string(), "a");
        let (k1, _) = it.borrow_mut().next_kv();
        assert_eq!(k1.as_number(), Some(1.0));
    }

    #[test]
    fn object_iteration_tolerates_mutation() {
        let mut map = ObjectMap::new();
        map.insert("a".to_string(), Value::Number(1.0));
        map.insert("b".to_string(), Value::Number(2.0));
        let source = Rc::new(RefCell::new(map));

        let mut pool = IteratorPool::new();
        let it = pool.rent_object(source.clone());

        let (k, _) = it.borrow_mut().next_kv();
        assert_eq!(k.to_display_string(), "a");

        // Removing the not-yet-visited key leaves the snapshot valid; the
        // missing value reads as null.
        source.borrow_mut().shift_remove("b");
        assert!(it.borrow().has_next());
        let (k, v) = it.borrow_mut().next_kv();
        assert_eq!(k.to_display_string(), "b");
        assert!(matches!(v, Value::Null));
    }

    #[test]
    fn pool_reuses_returned_iterators() {
        let mut pool = IteratorPool::new();
        let it = pool.rent_string("hi");
        let first = Rc::as_ptr(&it);
        pool.give_back(it);
        let again = pool.rent_string("other");
        assert_eq!(first, Rc::as_ptr(&again));
    }

    #[test]
    fn pool_discards_beyond_capacity() {
        let mut pool = IteratorPool::new();
        let mut rented = Vec::new();
        for _ in 0..(MAX_POOL_SIZE + 8) {
            rented.push(pool.rent_range(0.0, 1.0, 1.0));
        }
        for it in rented {
            pool.give_back(it);
        }
        assert_eq!(pool.ranges.len(), MAX_POOL_SIZE);
    }

    #[test]
    fn shared_iterators_are_not_pooled() {
        let mut pool = IteratorPool::new();
        let it = pool.rent_string("x");
        let extra = it.clone();
        pool.give_back(it);
        assert!(pool.strings.is_empty());
        drop(extra);
    }
}
