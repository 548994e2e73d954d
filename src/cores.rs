// CORE SETS
// ORDERED SET OF CORE INDICES AS A BITMASK. BIT N = CORE N.
// 4-CORE MACHINE: CORE 0 BELONGS TO THE CACHE SERVICE.

use std::fmt;
use std::str::FromStr;

pub const NR_CORES: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoreSet(u8);

impl CoreSet {
    pub const EMPTY: CoreSet = CoreSet(0);

    pub fn of(cores: &[u8]) -> Self {
        let mut mask = 0u8;
        for &c in cores {
            debug_assert!((c as usize) < NR_CORES);
            mask |= 1 << c;
        }
        Self(mask)
    }

    pub fn contains(self, core: u8) -> bool {
        (core as usize) < NR_CORES && self.0 & (1 << core) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..NR_CORES as u8).filter(move |&c| self.0 & (1 << c) != 0)
    }

    // "2,3" -- THE FORMAT cpuset.cpus AND taskset -c ACCEPT
    pub fn to_cpulist(self) -> String {
        self.iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_cpulist())
    }
}

impl fmt::Debug for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for CoreSet {
    type Err = String;

    // ACCEPTS "[2,3]", "[]" AND THE BARE "2,3"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s.trim();
        let inner = inner
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .unwrap_or(inner);
        let mut mask = 0u8;
        for part in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let core: u8 = part
                .parse()
                .map_err(|_| format!("bad core index {:?}", part))?;
            if core as usize >= NR_CORES {
                return Err(format!("core {} out of range (0..{})", core, NR_CORES));
            }
            mask |= 1 << core;
        }
        Ok(Self(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_regardless_of_input_order() {
        let set = CoreSet::of(&[3, 1, 2]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(set.to_string(), "[1,2,3]");
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn empty_set_formats_as_brackets() {
        assert_eq!(CoreSet::EMPTY.to_string(), "[]");
        assert!(CoreSet::EMPTY.is_empty());
        assert_eq!("[]".parse::<CoreSet>().unwrap(), CoreSet::EMPTY);
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!("[0,4]".parse::<CoreSet>().is_err());
        assert!("[x]".parse::<CoreSet>().is_err());
    }

    #[test]
    fn parse_bare_list() {
        assert_eq!("2,3".parse::<CoreSet>().unwrap(), CoreSet::of(&[2, 3]));
    }

    #[test]
    fn contains_out_of_range_is_false() {
        assert!(!CoreSet::of(&[0, 1]).contains(7));
        assert!(CoreSet::of(&[0, 1]).contains(1));
    }
}
