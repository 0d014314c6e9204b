use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{MapError, SharedMap};

/// Capacity of the map under test. Small enough that random action
/// sequences reach full-map states and collision chains regularly.
const CAPACITY: u32 = 8;
const KEY_UNITS: u32 = 4;
const VALUE_UNITS: u32 = 8;

/// Keys are drawn from a 9-element space over a capacity-8 map, so inserts
/// collide and fill the map often.
#[derive(Debug, Clone)]
struct Key(String);

impl Arbitrary for Key {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        "[abc][xy]?".prop_map(Key).boxed()
    }
}

#[derive(Debug, Clone)]
struct Value(String);

impl Arbitrary for Value {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        "[a-z]{0,6}".prop_map(Value).boxed()
    }
}

/// Actions applied to both the map and the model.
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Insert(Key, Value),
    Get(Key),
    Remove(Key),
    Clear,
}

struct Test {
    map: SharedMap,
    model: BTreeMap<String, String>,
}

impl Test {
    fn new() -> Self {
        Self {
            map: SharedMap::new(CAPACITY, KEY_UNITS, VALUE_UNITS).unwrap(),
            model: BTreeMap::new(),
        }
    }

    fn apply(&mut self, action: &Action) {
        match action {
            Action::Insert(Key(key), Value(value)) => {
                let replacing = self.model.contains_key(key);
                match self.map.set(key, value) {
                    Ok(()) => {
                        self.model.insert(key.clone(), value.clone());
                    }
                    Err(MapError::CapacityExceeded) => {
                        // Only a fresh key into a full map may be refused.
                        assert!(!replacing, "replace refused for present key {:?}", key);
                        assert_eq!(self.model.len(), CAPACITY as usize);
                    }
                    Err(other) => panic!("unexpected set error: {}", other),
                }
            }
            Action::Get(Key(key)) => {
                assert_eq!(self.map.get(key), self.model.get(key).cloned());
                assert_eq!(self.map.contains_key(key), self.model.contains_key(key));
            }
            Action::Remove(Key(key)) => match self.model.remove(key) {
                Some(_) => self.map.remove(key).unwrap(),
                None => assert_eq!(self.map.remove(key), Err(MapError::KeyNotFound)),
            },
            Action::Clear => {
                self.map.clear();
                self.model.clear();
            }
        }
    }

    fn check(&self) {
        self.map.raw().check_invariants();
        assert_eq!(self.map.len(), self.model.len());

        for (key, value) in &self.model {
            assert_eq!(self.map.get(key).as_ref(), Some(value));
        }

        let mut keys: Vec<String> = self.map.keys().collect();
        keys.sort();
        let model_keys: Vec<String> = self.model.keys().cloned().collect();
        assert_eq!(keys, model_keys);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Random action sequences leave the map agreeing with a BTreeMap model
    /// and structurally sound after every step.
    #[test]
    fn behaves_like_model(actions: Vec<Action>) {
        let mut test = Test::new();
        for action in &actions {
            test.apply(action);
            test.check();
        }
    }

    /// Inserting distinct keys up to the capacity always succeeds in any
    /// order, and every key stays retrievable.
    #[test]
    fn distinct_keys_fill_to_capacity(
        shuffle in Just((0..8).map(|i| format!("k{}", i)).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let map = SharedMap::new(8, 4, 8).unwrap();
        for (i, key) in shuffle.iter().enumerate() {
            map.set(key, &i.to_string()).unwrap();
        }
        prop_assert_eq!(map.len(), 8);
        for (i, key) in shuffle.iter().enumerate() {
            prop_assert_eq!(map.get(key), Some(i.to_string()));
        }
        map.raw().check_invariants();
    }
}
