use std::hash::Hash;

use rustc_hash::FxHashSet;


/// A set that remembers only the `capacity` most recently inserted distinct values, evicting the
///  oldest insertion when it is full. Re-inserting a value that is still present does not
///  refresh its position.
///
/// Membership is all this is good for: it carries no ordering guarantees to callers.
pub struct RecencySet<T: Copy + Eq + Hash> {
    members: FxHashSet<T>,
    buf: Buffer<T>,
    capacity: usize,
}

impl <T: Copy + Eq + Hash> RecencySet<T> {
    pub fn new(capacity: usize) -> RecencySet<T> {
        assert!(capacity > 0, "a recency set needs a capacity of at least 1");

        RecencySet {
            members: FxHashSet::default(),
            buf: Buffer::Growing(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns `true` if the value was newly inserted
    pub fn add(&mut self, value: T) -> bool {
        if self.members.contains(&value) {
            return false;
        }

        if let Some(evicted) = self.buf.add_value(value, self.capacity) {
            self.members.remove(&evicted);
        }
        self.members.insert(value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}


enum Buffer<T> {
    Growing(Vec<T>),
    Ring {
        buf: Vec<T>,
        next: usize,
    },
}
impl <T: Copy> Buffer<T> {
    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: T, capacity: usize) -> Option<T> {
        match self {
            Buffer::Growing(buf) => {
                buf.push(value);
                if buf.len() == capacity {
                    let buf = std::mem::take(buf);
                    *self = Buffer::Ring { buf, next: 0 };
                }
                None
            }
            Buffer::Ring { buf, next } => {
                let evicted = std::mem::replace(&mut buf[*next], value);
                *next = (*next + 1) % buf.len();
                Some(evicted)
            }
        }
    }
}
