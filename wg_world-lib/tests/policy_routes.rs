use std::net::Ipv4Addr;

use wg_world_lib::address_set::{AddressSet, Bundle};
use wg_world_lib::key::Key;
use wg_world_lib::network::Network;

fn key(n: u8) -> Key {
    Key::from_parts(format!("pub{n}"), format!("sec{n}"))
}

fn wan(addr: &str) -> Option<Ipv4Addr> {
    Some(addr.parse().expect("wan address"))
}

fn inverted_set() -> AddressSet {
    AddressSet::new("inv", vec!["203.0.113.0/24".into()])
}

fn chain(hosts: &[&str]) -> anyhow::Result<Network> {
    let mut net = Network::new();
    for (i, name) in hosts.iter().enumerate() {
        net.add_host(name, wan(&format!("10.0.0.{}", i + 1)), key(i as u8 + 1))?;
    }
    for (i, pair) in hosts.windows(2).enumerate() {
        net.connect(pair[0], pair[1], &format!("192.10.{}.0/30", i + 1), 51820)?;
    }
    Ok(net)
}

#[test]
fn single_hop_egress_marks_at_the_source_and_nats_at_the_gateway() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b"])?;
    net.output_to_nat_gateway(Bundle::matching(inverted_set()), "a", "b")?;

    let plan_a = net.plan("a")?;
    // the set exists before anything referencing it
    assert_eq!(plan_a[0], "ipset create inv hash:net");
    assert!(plan_a.contains(
        &"iptables -t mangle -A OUTPUT -m set --match-set inv dst -m mark --mark 0 -m state ! --state ESTABLISHED,RELATED -j CONNMARK --set-mark 100"
            .to_string()
    ));
    assert!(plan_a.contains(&"iptables -t mangle -A OUTPUT -m connmark --mark 100 -j MARK --set-mark 100".to_string()));
    assert!(plan_a.contains(&"iptables -t nat -A POSTROUTING -m mark --mark 100 -j SNAT --to-source 192.10.1.1".to_string()));
    assert!(plan_a.contains(&"ip route add default via 192.10.1.2 table 100".to_string()));
    assert!(plan_a.contains(&"ip rule add fwmark 100 table 100".to_string()));

    let plan_b = net.plan("b")?;
    assert!(plan_b.contains(&"spawn any_proxy -l=:3140".to_string()));
    assert!(plan_b.contains(
        &"iptables -t nat -A POSTROUTING -m set --match-set inv dst -m mark --mark 0 -s 192.10.1.1 ! -p tcp -j MASQUERADE"
            .to_string()
    ));
    assert!(plan_b.contains(
        &"iptables -t nat -A PREROUTING -m set --match-set inv dst -m mark --mark 0 -s 192.10.1.1 -p tcp -j REDIRECT --to-ports 3140"
            .to_string()
    ));
    // the gateway routes nothing into a policy table
    assert!(!plan_b.iter().any(|l| l.starts_with("ip rule add")));
    Ok(())
}

#[test]
fn two_hop_egress_gives_the_middle_host_a_transit_role() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b", "c"])?;
    net.output_to_nat_gateway(Bundle::matching(inverted_set()), "a", "c")?;

    // A classifies its own output and routes toward B
    let plan_a = net.plan("a")?;
    assert!(plan_a.contains(&"ip route add default via 192.10.1.2 table 100".to_string()));

    // B re-marks transit traffic from A's tunnel address and routes toward C
    let plan_b = net.plan("b")?;
    assert!(plan_b.contains(
        &"iptables -t mangle -A PREROUTING -m set --match-set inv dst -m mark --mark 0 -s 192.10.1.1 -j MARK --set-mark 100"
            .to_string()
    ));
    assert!(plan_b.contains(&"ip route add default via 192.10.2.2 table 100".to_string()));
    assert!(plan_b.contains(&"ip rule add fwmark 100 table 100".to_string()));

    // C is the terminal NAT hop
    let plan_c = net.plan("c")?;
    assert!(plan_c.contains(&"spawn any_proxy -l=:3140".to_string()));
    assert!(plan_c.iter().any(|l| l.ends_with("-j MASQUERADE")));
    Ok(())
}

#[test]
fn bundle_sets_reach_exactly_the_hosts_on_the_path() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b", "c"])?;
    // D hangs off A but plays no part in the egress path
    net.add_host("d", wan("10.0.0.4"), key(4))?;
    net.connect("a", "d", "192.10.9.0/30", 51820)?;
    net.output_to_nat_gateway(
        Bundle::new(vec![inverted_set()], vec![AddressSet::private()]),
        "a",
        "c",
    )?;

    for host in ["a", "b", "c"] {
        let plan = net.plan(host)?;
        assert!(plan.contains(&"ipset create inv hash:net".to_string()), "{host} misses inv");
        assert!(plan.contains(&"ipset create private hash:net".to_string()), "{host} misses private");
    }
    let plan_d = net.plan("d")?;
    assert!(!plan_d.iter().any(|l| l.starts_with("ipset create")));
    Ok(())
}

#[test]
fn excluded_sets_appear_negated_in_the_predicate() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b"])?;
    net.output_to_nat_gateway(
        Bundle::new(vec![inverted_set()], vec![AddressSet::private()]),
        "a",
        "b",
    )?;

    let plan_a = net.plan("a")?;
    assert!(plan_a.iter().any(|l| l.contains("-m set --match-set inv dst -m set ! --match-set private dst")));
    Ok(())
}

#[test]
fn address_set_loads_are_deduplicated_per_host() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b", "c"])?;
    let bundle = Bundle::matching(inverted_set());
    net.output_to_nat_gateway(bundle.clone(), "a", "c")?;
    net.output_to_nat_gateway(bundle, "b", "c")?;

    for host in ["b", "c"] {
        let creates = net.plan(host)?.into_iter().filter(|l| l == "ipset create inv hash:net").count();
        assert_eq!(creates, 1, "{host} loads the set more than once");
    }
    Ok(())
}

#[test]
fn table_identifiers_stay_distinct_per_host() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b", "c"])?;
    net.output_to_nat_gateway(Bundle::matching(inverted_set()), "a", "b")?;
    net.output_to_nat_gateway(Bundle::matching(inverted_set()), "a", "c")?;

    let plan_a = net.plan("a")?;
    assert!(plan_a.contains(&"ip rule add fwmark 100 table 100".to_string()));
    assert!(plan_a.contains(&"ip rule add fwmark 101 table 101".to_string()));
    Ok(())
}

#[test]
fn repeated_gateway_use_installs_one_proxy() -> anyhow::Result<()> {
    let mut net = chain(&["a", "b", "c"])?;
    net.output_to_nat_gateway(Bundle::matching(inverted_set()), "a", "c")?;
    net.output_to_nat_gateway(Bundle::matching(inverted_set()), "b", "c")?;

    let spawns = net.plan("c")?.into_iter().filter(|l| l == "spawn any_proxy -l=:3140").count();
    assert_eq!(spawns, 1);
    Ok(())
}
