//! Static LED channel → pole identifier mapping

use std::collections::BTreeMap;

/// Ordered mapping from microcontroller LED channel index to pole id.
///
/// Fixed at startup. Iteration order is ascending channel index, which is
/// the order the reset burst is emitted in.
#[derive(Debug, Clone, PartialEq)]
pub struct PoleMapping {
    poles: BTreeMap<u32, String>,
}

impl Default for PoleMapping {
    fn default() -> Self {
        Self::from_pairs([(0, "P-01"), (1, "P-02"), (2, "P-03")])
    }
}

impl PoleMapping {
    pub fn new(poles: BTreeMap<u32, String>) -> Self {
        Self { poles }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self { poles: pairs.into_iter().map(|(idx, id)| (idx, id.into())).collect() }
    }

    /// Look up the pole wired to `index`
    pub fn pole_id(&self, index: u32) -> Option<&str> {
        self.poles.get(&index).map(String::as_str)
    }

    /// Pole ids in channel order
    pub fn pole_ids(&self) -> impl Iterator<Item = &str> {
        self.poles.values().map(String::as_str)
    }

    /// First pole in channel order, used for the connect-time baseline
    pub fn first(&self) -> Option<&str> {
        self.pole_ids().next()
    }

    pub fn len(&self) -> usize {
        self.poles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mapping() {
        let mapping = PoleMapping::default();
        assert_eq!(mapping.pole_id(0), Some("P-01"));
        assert_eq!(mapping.pole_id(2), Some("P-03"));
        assert_eq!(mapping.pole_id(9), None);
        assert_eq!(mapping.len(), 3);
    }

    #[test]
    fn test_order_follows_index_not_insertion() {
        let mapping = PoleMapping::from_pairs([(5, "P-06"), (1, "P-02"), (3, "P-04")]);
        let ids: Vec<&str> = mapping.pole_ids().collect();
        assert_eq!(ids, vec!["P-02", "P-04", "P-06"]);
        assert_eq!(mapping.first(), Some("P-02"));
    }
}
