use std::collections::HashMap;
use std::hash::Hash;

/// A record that can start a fresh window: same identity, zero counters.
pub trait Renew {
    fn renew(&self) -> Self;
}

/// Two generations of rows: `current` is what readers see, `next` is what
/// merges and lifecycle events mutate.
///
/// Rotation flips an index, then clears the old `current` container and
/// reseeds it from the new `current` keys, reusing its allocation.
#[derive(Debug)]
pub struct Window<K, R> {
    generations: [HashMap<K, R>; 2],
    current: usize,
}

impl<K, R> Default for Window<K, R> {
    fn default() -> Self {
        Self {
            generations: [HashMap::new(), HashMap::new()],
            current: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, R: Renew> Window<K, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &HashMap<K, R> {
        &self.generations[self.current]
    }

    #[cfg(test)]
    pub fn next(&self) -> &HashMap<K, R> {
        &self.generations[self.current ^ 1]
    }

    pub fn next_mut(&mut self) -> &mut HashMap<K, R> {
        &mut self.generations[self.current ^ 1]
    }

    /// Promotes `next` to `current` and seeds a new `next` holding the same
    /// keys with renewed rows.
    pub fn rotate(&mut self) {
        self.current ^= 1;
        let [first, second] = &mut self.generations;
        let (current, next) = if self.current == 0 {
            (&*first, second)
        } else {
            (&*second, first)
        };
        next.clear();
        next.extend(current.iter().map(|(k, row)| (k.clone(), row.renew())));
    }
}
