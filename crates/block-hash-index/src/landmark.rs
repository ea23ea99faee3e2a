use bytes::Bytes;

/// The first key of every range, in range order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Landmarks {
    keys: Vec<Bytes>,
}

impl Landmarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_keys(keys: Vec<Bytes>) -> Self {
        Self { keys }
    }

    pub(crate) fn push(&mut self, key: Bytes) {
        self.keys.push(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn last(&self) -> Option<&Bytes> {
        self.keys.last()
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.keys.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.keys.iter()
    }

    /// The range owning `key`: the last landmark that is `<= key`.
    ///
    /// `None` when the key sorts before every landmark.
    pub fn route(&self, key: &[u8]) -> Option<usize> {
        self.keys
            .partition_point(|landmark| landmark.as_ref() <= key)
            .checked_sub(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn landmarks(keys: &[&str]) -> Landmarks {
        Landmarks::from_keys(keys.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect())
    }

    #[test]
    fn route_by_upper_bound() {
        let l = landmarks(&["b", "d", "f"]);
        assert_eq!(l.route(b"a"), None);
        assert_eq!(l.route(b"b"), Some(0));
        assert_eq!(l.route(b"c"), Some(0));
        assert_eq!(l.route(b"d"), Some(1));
        assert_eq!(l.route(b"e"), Some(1));
        assert_eq!(l.route(b"f"), Some(2));
        assert_eq!(l.route(b"zzz"), Some(2));
        assert_eq!(l.route(b""), None);
    }

    #[test]
    fn empty_table_routes_nowhere() {
        assert_eq!(Landmarks::new().route(b"anything"), None);
    }
}
