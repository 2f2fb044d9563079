//! Policy Property Tests
//!
//! Rule selection, candidate pruning, address matching and lifetime
//! normalization, checked on examples and with proptest.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use fynx_iked::policy::lifetime::{
    MAX_P2_LIFETIME_KB, MAX_P2_LIFETIME_SECS, MINDIFF_KB, MINDIFF_SECS, MIN_P2_LIFETIME_HARD_KB,
    MIN_P2_LIFETIME_HARD_SECS, MIN_P2_LIFETIME_IDLE_SECS, SECS_TO_KB,
};
use fynx_iked::policy::{
    address_match, normalize_lifetimes, AddrRange, AddressSpec, P2Lifetimes, Rule, RuleQuery,
    Rulebase,
};
use proptest::prelude::*;

fn v4(n: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(n))
}

fn sock(n: u32) -> SocketAddr {
    SocketAddr::new(v4(n), 500)
}

//
// Rule selection
//

#[test]
fn test_first_match_beats_cookie_rule() {
    let mut rulebase: Rulebase = [
        Rule::new("R1").with_addresses(
            AddressSpec::parse("10.0.0.0/24").unwrap(),
            AddressSpec::parse("0.0.0.0/0").unwrap(),
        ),
        Rule::new("R2")
            .with_cookie(7)
            .with_addresses(
                AddressSpec::parse("10.0.0.5").unwrap(),
                AddressSpec::parse("0.0.0.0/0").unwrap(),
            ),
    ]
    .into_iter()
    .collect();

    let local: SocketAddr = "10.0.0.5:500".parse().unwrap();
    let remote: SocketAddr = "192.0.2.1:500".parse().unwrap();
    let original = rulebase.clone();

    let selected = rulebase.select_rule(&RuleQuery::new(&local, &remote)).unwrap();
    assert_eq!(selected.label, "R1");
    assert_eq!(rulebase.len(), 2);

    // The cookie picks R2 instead
    let mut by_cookie = original.clone();
    let query = RuleQuery {
        cookie: Some(7),
        ..RuleQuery::new(&local, &remote)
    };
    assert_eq!(by_cookie.select_rule(&query).unwrap().label, "R2");

    // Selection works on a clone; the shared rulebase is untouched
    assert_eq!(original.len(), 2);
}

#[test]
fn test_non_matching_rules_pruned() {
    let mut rulebase: Rulebase = [
        Rule::new("other-site").with_addresses(
            AddressSpec::parse("172.16.0.0/12").unwrap(),
            AddressSpec::any(),
        ),
        Rule::new("site").with_addresses(
            AddressSpec::parse("10.0.0.0/8").unwrap(),
            AddressSpec::parse("192.0.2.0/24").unwrap(),
        ),
        Rule::new("wrong-peer").with_addresses(
            AddressSpec::parse("10.0.0.0/8").unwrap(),
            AddressSpec::parse("198.51.100.0/24").unwrap(),
        ),
    ]
    .into_iter()
    .collect();

    let local: SocketAddr = "10.1.2.3:500".parse().unwrap();
    let remote: SocketAddr = "192.0.2.9:500".parse().unwrap();
    let selected = rulebase.select_rule(&RuleQuery::new(&local, &remote)).unwrap();
    assert_eq!(selected.label, "site");
    assert_eq!(rulebase.len(), 1);
    assert!(rulebase.find_by_label("other-site").is_none());
}

#[test]
fn test_prune_or_keep_index_delta() {
    let mut rulebase: Rulebase = ["a", "b", "c"].into_iter().map(Rule::new).collect();
    assert_eq!(rulebase.prune_or_keep(1, false), 0);
    assert_eq!(rulebase.get(1).unwrap().label, "c");
    assert_eq!(rulebase.prune_or_keep(0, true), 1);
    assert_eq!(rulebase.prune_or_keep(5, false), 1);
    assert_eq!(rulebase.len(), 2);
}

proptest! {
    /// Survivors keep their relative order and every matching rule survives
    #[test]
    fn prop_selection_preserves_order(matching in proptest::collection::vec(any::<bool>(), 1..16)) {
        let local = sock(0x0a00_0001);
        let remote = sock(0xc000_0201);
        let mut rulebase: Rulebase = matching
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                let local_spec = if m {
                    AddressSpec::new(vec![AddrRange::single(local.ip())])
                } else {
                    AddressSpec::new(vec![AddrRange::single(v4(0xac10_0001))])
                };
                Rule::new(format!("rule-{}", i)).with_addresses(local_spec, AddressSpec::any())
            })
            .collect();

        let selected = rulebase.select_rule(&RuleQuery::new(&local, &remote));

        let expected: Vec<String> = matching
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(i, _)| format!("rule-{}", i))
            .collect();
        let survivors: Vec<String> = rulebase.iter().map(|r| r.label.clone()).collect();
        prop_assert_eq!(&survivors, &expected);
        prop_assert_eq!(selected.map(|r| r.label.clone()), expected.first().cloned());
    }

    /// [A, A] matches A and nothing else
    #[test]
    fn prop_single_range_reflexive(a in any::<u32>(), b in any::<u32>()) {
        let spec = AddressSpec::new(vec![AddrRange::single(v4(a))]);
        prop_assert!(address_match(&sock(a), &spec));
        prop_assert_eq!(address_match(&sock(b), &spec), a == b);
    }

    /// Widening a range never loses an address it matched
    #[test]
    fn prop_widening_monotone(
        start in any::<u32>(),
        len in 0u32..1 << 16,
        probe in any::<u32>(),
        grow_low in 0u32..1 << 16,
        grow_high in 0u32..1 << 16,
    ) {
        let end = start.saturating_add(len);
        let narrow = AddressSpec::new(vec![AddrRange::new(v4(start), v4(end)).unwrap()]);
        let wide = AddressSpec::new(vec![AddrRange::new(
            v4(start.saturating_sub(grow_low)),
            v4(end.saturating_add(grow_high)),
        )
        .unwrap()]);
        if address_match(&sock(probe), &narrow) {
            prop_assert!(address_match(&sock(probe), &wide));
        }
    }

    #[test]
    fn prop_normalize_idempotent_and_bounded(
        hard_secs in 0u32..800_000,
        soft_secs in 0u32..800_000,
        idle_secs in 0u32..800_000,
        hard_kb in 0u32..(1 << 31),
        soft_kb in 0u32..(1 << 31),
    ) {
        let once = normalize_lifetimes(P2Lifetimes {
            hard_secs,
            soft_secs,
            idle_secs,
            hard_kb,
            soft_kb,
        });
        prop_assert_eq!(normalize_lifetimes(once), once);

        prop_assert!(once.hard_secs >= MIN_P2_LIFETIME_HARD_SECS);
        prop_assert!(once.hard_secs <= MAX_P2_LIFETIME_SECS);
        prop_assert!(once.soft_secs <= once.hard_secs);
        prop_assert!(
            once.soft_secs == once.hard_secs || once.hard_secs - once.soft_secs >= MINDIFF_SECS
        );
        prop_assert!(once.idle_secs >= MIN_P2_LIFETIME_IDLE_SECS);
        prop_assert!(once.soft_secs - once.idle_secs >= MINDIFF_SECS);

        prop_assert!(once.hard_kb >= MIN_P2_LIFETIME_HARD_KB);
        prop_assert!(once.hard_kb <= MAX_P2_LIFETIME_KB);
        prop_assert!(once.soft_kb <= once.hard_kb);
        prop_assert!(once.soft_kb == once.hard_kb || once.hard_kb - once.soft_kb >= MINDIFF_KB);
    }
}

#[test]
fn test_two_day_lifetime_scenario() {
    let lt = normalize_lifetimes(P2Lifetimes::hard(172_800, 0));
    assert_eq!(lt.hard_secs, 172_800);
    assert_eq!(lt.soft_secs, 155_520);
    assert_eq!(lt.idle_secs, 86_400);
    assert_eq!(lt.hard_kb, 172_800 * SECS_TO_KB);
    assert_eq!(lt.soft_kb, 155_520 * SECS_TO_KB);
}
