//! Synthetic event generator
//!
//! Produces per-domain bursts of delivered/bounced events for load testing
//! a cluster:
//!
//! - random domain names `<14 letters>.<net|com|org|io|gov>`
//! - up to 2,500 events per domain
//! - 35% of a domain's events are bounces, spread evenly through the burst
//! - every 25th domain has no bounces at all (the catch-all domains)

use crate::model::DomainEntry;
use rand::{seq::SliceRandom, Rng};

const ALPHA: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const TLDS: &[&str] = &["net", "com", "org", "io", "gov"];

pub const MAX_EVENTS_PER_DOMAIN: usize = 2_500;
pub const BOUNCE_SHARE: f64 = 0.35;
pub const CATCH_ALL_EVERY: usize = 25;

pub fn random_domain_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let label: String = (0..14)
        .map(|_| ALPHA[rng.gen_range(0..ALPHA.len())] as char)
        .collect();
    let tld = TLDS.choose(rng).copied().unwrap_or("com");
    format!("{}.{}", label, tld)
}

/// Events for one domain
#[derive(Debug, Clone)]
pub struct DomainBurst {
    pub domain: String,
    pub events: Vec<DomainEntry>,
}

impl DomainBurst {
    pub fn bounces(&self) -> usize {
        self.events.iter().filter(|e| e.is_bounce).count()
    }
}

/// Build the burst for the `iteration`-th generated domain
pub fn generate_burst<R: Rng + ?Sized>(rng: &mut R, iteration: usize) -> DomainBurst {
    let domain = random_domain_name(rng);
    let max = rng.gen_range(0..MAX_EVENTS_PER_DOMAIN);
    let burst_events = burst_events(&domain, max, iteration % CATCH_ALL_EVERY == 0);
    DomainBurst { domain, events: burst_events }
}

fn burst_events(domain: &str, max: usize, catch_all: bool) -> Vec<DomainEntry> {
    let bounce_every = if catch_all {
        0
    } else {
        (BOUNCE_SHARE * max as f64) as usize
    };

    (0..max)
        .map(|i| {
            if bounce_every != 0 && i % bounce_every == 0 {
                DomainEntry::bounced(domain)
            } else {
                DomainEntry::delivered(domain)
            }
        })
        .collect()
}
