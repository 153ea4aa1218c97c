use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A 16 bit wrap-around sequence number: 0 follows after FFFF.
///
/// Ordering uses serial arithmetic - the sign of the wrapping difference decides which value
///  is newer. That relation is only transitive while all compared values lie within half the
///  sequence space of each other, which the send window and receive buffer bounds guarantee.
///  At exactly half the range the order is undefined; live state never spans that far.
///
/// There is deliberately no `Ord` impl: the numeric order of the raw values is meaningless
///  once the sequence has wrapped, and handing it to a sorted collection would corrupt the
///  buffers silently. Use [Seq::serial_cmp] (or [SeqMap]) instead.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Seq(u16);

impl Display for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq {
    pub const ZERO: Seq = Seq(0);
    pub const MAX: Seq = Seq(u16::MAX);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// the following sequence number, wrapping at the end of the sequence space
    pub fn next(&self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    pub fn serial_cmp(&self, other: &Seq) -> Ordering {
        (self.0.wrapping_sub(other.0) as i16).cmp(&0)
    }

    pub fn is_greater(&self, other: Seq) -> bool {
        self.serial_cmp(&other) == Ordering::Greater
    }

    pub fn is_greater_or_equal(&self, other: Seq) -> bool {
        self.serial_cmp(&other) != Ordering::Less
    }
}

/// A map from [Seq] to some value, kept sorted by the serial comparator.
///
/// A `BTreeMap` cannot do this job: serial order is cyclic over the full domain, so there is
///  no lawful `Ord`. A sorted vec with binary search is correct as long as the live keys span
///  less than half the sequence space - the same precondition [Seq::serial_cmp] has - and the
///  entry counts here are small (bounded by window and buffer sizes), so it is fast too.
pub struct SeqMap<V> {
    entries: Vec<(Seq, V)>,
}

impl<V> SeqMap<V> {
    pub fn new() -> SeqMap<V> {
        SeqMap { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: Seq) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.serial_cmp(&key))
    }

    /// insert, keeping serial order; a duplicate key leaves the map unchanged (the new value
    ///  is dropped) and returns false
    pub fn insert(&mut self, key: Seq, value: V) -> bool {
        match self.position(key) {
            Ok(_) => false,
            Err(idx) => {
                self.entries.insert(idx, (key, value));
                true
            }
        }
    }

    pub fn contains_key(&self, key: Seq) -> bool {
        self.position(key).is_ok()
    }

    pub fn get(&self, key: Seq) -> Option<&V> {
        self.position(key).ok().map(|idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, key: Seq) -> Option<&mut V> {
        match self.position(key) {
            Ok(idx) => Some(&mut self.entries[idx].1),
            Err(_) => None,
        }
    }

    pub fn remove(&mut self, key: Seq) -> Option<V> {
        match self.position(key) {
            Ok(idx) => Some(self.entries.remove(idx).1),
            Err(_) => None,
        }
    }

    pub fn first(&self) -> Option<(Seq, &V)> {
        self.entries.first().map(|(k, v)| (*k, v))
    }

    /// the entries in serial order, for scans
    pub fn entries(&self) -> &[(Seq, V)] {
        &self.entries
    }

    /// remove and yield the first `n` entries in serial order
    pub fn drain_front(&mut self, n: usize) -> std::vec::Drain<'_, (Seq, V)> {
        self.entries.drain(0..n)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
