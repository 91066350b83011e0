//! Fixed datacenter tables and endpoint selection.

use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datacenter {
    pub id: u32,
    pub ipv4: &'static str,
    pub ipv6: &'static str,
    pub port: u16,
}

impl Datacenter {
    pub fn address(&self, prefer_ipv6: bool) -> &'static str {
        if prefer_ipv6 {
            self.ipv6
        } else {
            self.ipv4
        }
    }
}

pub const PRODUCTION: [Datacenter; 5] = [
    Datacenter { id: 1, ipv4: "149.154.175.50", ipv6: "2001:b28:f23d:f001::a", port: 443 },
    Datacenter { id: 2, ipv4: "149.154.167.51", ipv6: "2001:67c:4e8:f002::a", port: 443 },
    Datacenter { id: 3, ipv4: "149.154.175.100", ipv6: "2001:b28:f23d:f003::a", port: 443 },
    Datacenter { id: 4, ipv4: "149.154.167.91", ipv6: "2001:67c:4e8:f004::a", port: 443 },
    Datacenter { id: 5, ipv4: "91.108.56.180", ipv6: "2001:b28:f23f:f005::a", port: 443 },
];

pub const TEST: [Datacenter; 3] = [
    Datacenter { id: 1, ipv4: "149.154.175.40", ipv6: "2001:b28:f23d:f001::e", port: 80 },
    Datacenter { id: 2, ipv4: "149.154.167.40", ipv6: "2001:67c:4e8:f002::e", port: 80 },
    Datacenter { id: 3, ipv4: "149.154.175.117", ipv6: "2001:b28:f23d:f003::e", port: 80 },
];

pub fn pool(test_mode: bool) -> &'static [Datacenter] {
    if test_mode {
        &TEST
    } else {
        &PRODUCTION
    }
}

/// `dc == 0` draws from the pool; anything else must name a pool entry.
pub fn select<R: Rng + ?Sized>(dc: u32, test_mode: bool, rng: &mut R) -> Result<Datacenter> {
    let pool = pool(test_mode);
    if dc == 0 {
        return Ok(pool[rng.gen_range(0..pool.len())]);
    }
    pool.get(dc as usize - 1).copied().ok_or_else(|| {
        Error::Configuration(format!(
            "{}datacenter id must be between 1 and {}, got {dc}",
            if test_mode { "test " } else { "" },
            pool.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_explicit_selection() {
        let mut rng = StdRng::seed_from_u64(1);
        let dc = select(4, false, &mut rng).unwrap();
        assert_eq!(dc.address(false), "149.154.167.91");
        assert_eq!(dc.port, 443);

        let dc = select(3, true, &mut rng).unwrap();
        assert_eq!(dc.address(false), "149.154.175.117");
        assert_eq!(dc.port, 80);
    }

    #[test]
    fn test_out_of_range_is_configuration_error() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(select(6, false, &mut rng), Err(Error::Configuration(_))));
        assert!(matches!(select(4, true, &mut rng), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_seeded_random_choice_is_repeatable() {
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            select(0, false, &mut rng).unwrap()
        };
        for seed in 0..16 {
            assert_eq!(pick(seed), pick(seed));
            assert!(PRODUCTION.contains(&pick(seed)));
        }
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..32 {
            assert!(TEST.contains(&select(0, true, &mut rng).unwrap()));
        }
    }

    #[test]
    fn test_addresses_parse() {
        for dc in PRODUCTION.iter().chain(TEST.iter()) {
            dc.ipv4.parse::<Ipv4Addr>().unwrap();
            dc.ipv6.parse::<Ipv6Addr>().unwrap();
        }
        let full: Ipv6Addr = "2001:0b28:f23d:f001:0000:0000:0000:000a".parse().unwrap();
        assert_eq!(PRODUCTION[0].ipv6.parse::<Ipv6Addr>().unwrap(), full);
    }
}
