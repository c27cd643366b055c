//! Stable entity ids for the map arena.

/// Unique identifier of a keyframe within a map.
///
/// Ids are assigned monotonically at insertion and never reused, which makes
/// them safe to keep across culling: a stale id simply fails to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier of a landmark within a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_ids_as_map_keys() {
        let mut m: HashMap<KeyFrameId, &str> = HashMap::new();
        m.insert(KeyFrameId(1), "first");
        assert_eq!(m.get(&KeyFrameId(1)), Some(&"first"));
        assert_eq!(m.get(&KeyFrameId(2)), None);
    }

    #[test]
    fn test_id_ordering() {
        assert!(KeyFrameId(3) < KeyFrameId(10));
        assert_eq!(format!("{}", MapPointId(7)), "MP7");
    }
}
