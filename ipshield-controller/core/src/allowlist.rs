use std::collections::BTreeSet;

/// A set of address ranges as carried in a route's allowlist annotation.
///
/// The wire form is a space-delimited list of tokens. Decoding and encoding
/// are total: empty tokens are dropped and the empty set encodes to the empty
/// string. Token order on the wire is not significant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddrSet(BTreeSet<String>);

impl AddrSet {
    /// Parses a space-delimited allowlist value.
    pub fn decode(raw: &str) -> Self {
        raw.split(' ')
            .filter(|tok| !tok.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// Renders the set back to its annotation form.
    pub fn encode(&self) -> String {
        self.0.iter().cloned().collect::<Vec<_>>().join(" ")
    }

    /// Returns the union of the two sets.
    pub fn merge(&self, other: &Self) -> Self {
        self.0.union(&other.0).cloned().collect()
    }

    /// Returns the elements of `self` not present in `other`.
    pub fn diff(&self, other: &Self) -> Self {
        self.0.difference(&other.0).cloned().collect()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.0.contains(addr)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl std::iter::FromIterator<String> for AddrSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().filter(|tok| !tok.is_empty()).collect())
    }
}

impl std::iter::FromIterator<&'static str> for AddrSet {
    fn from_iter<T: IntoIterator<Item = &'static str>>(iter: T) -> Self {
        iter.into_iter().map(ToString::to_string).collect()
    }
}

impl<'a> std::iter::FromIterator<&'a String> for AddrSet {
    fn from_iter<T: IntoIterator<Item = &'a String>>(iter: T) -> Self {
        iter.into_iter().cloned().collect()
    }
}

impl std::fmt::Display for AddrSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_drops_empty_tokens() {
        let set = AddrSet::decode(" 10.0.0.1   10.0.0.2 ");
        assert_eq!(set, AddrSet::from_iter(["10.0.0.1", "10.0.0.2"]));
    }

    #[test]
    fn decode_encode_roundtrip() {
        let set = AddrSet::from_iter(["10.0.0.1", "192.168.10.32/27", "fd00::1"]);
        assert_eq!(AddrSet::decode(&set.encode()), set);
        assert_eq!(AddrSet::default().encode(), "");
        assert_eq!(AddrSet::decode(""), AddrSet::default());
    }

    #[test]
    fn merge_laws() {
        let a = AddrSet::from_iter(["10.0.0.1", "10.0.0.2"]);
        let b = AddrSet::from_iter(["10.0.0.2", "10.0.0.3"]);
        let c = AddrSet::from_iter(["10.0.0.4"]);

        // Commutative, associative, idempotent.
        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        assert_eq!(a.merge(&a), a);

        // The union contains both operands.
        let union = a.merge(&b);
        assert!(union.diff(&a).diff(&b).is_empty());
        assert!(a.diff(&union).is_empty());
        assert!(b.diff(&union).is_empty());
    }

    #[test]
    fn diff_of_merge() {
        let a = AddrSet::from_iter(["10.0.0.1", "10.0.0.2"]);
        let b = AddrSet::from_iter(["10.0.0.2", "10.0.0.3"]);
        assert_eq!(a.merge(&b).diff(&b), a.diff(&b));
        assert_eq!(a.merge(&b).diff(&b), AddrSet::from_iter(["10.0.0.1"]));
    }
}
