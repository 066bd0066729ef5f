use std::fmt::Display;
use std::str::FromStr;

use rusty_ulid::{DecodingError, Ulid};

/// Lexicographically sortable id used for rebuild sessions and temp file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eid(Ulid);

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(Ulid::generate())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Eid {
    type Err = DecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Eid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique_and_sortable() {
        let a = Eid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Eid::new();
        assert_ne!(a, b);
        assert!(a.to_string() < b.to_string());
        assert_eq!(a.to_string().len(), 26);
    }

    #[test]
    fn test_round_trips_through_str() {
        let id = Eid::new();
        let parsed: Eid = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("not-a-ulid".parse::<Eid>().is_err());
    }
}
