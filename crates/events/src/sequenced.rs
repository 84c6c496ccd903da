/// Messages that belong to a keyed stream with a per-key sequence number.
///
/// The sequence is assigned by the producer from an authoritative counter
/// (for inventory, the row version), so consumers can discard duplicates and
/// detect gaps without any ordering help from the transport. Nothing is
/// promised across different keys.
pub trait Sequenced {
    type Key: Clone + Eq + core::hash::Hash + core::fmt::Debug + Send + Sync + 'static;

    fn stream_key(&self) -> Self::Key;

    fn sequence(&self) -> u64;
}
