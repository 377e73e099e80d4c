//! Server resolution properties

use proptest::prelude::*;

use podlift::config::{Dependency, Server, Topology};

fn topology_strategy() -> impl Strategy<Value = Topology> {
    prop::collection::btree_map(
        "[a-z]{1,6}",
        prop::collection::vec(("[a-z0-9.]{1,10}", any::<bool>()), 1..4),
        1..4,
    )
    .prop_map(|roles| {
        roles.into_iter().fold(Topology::new(), |topology, (role, hosts)| {
            let servers = hosts
                .into_iter()
                .map(|(host, primary)| {
                    let server = Server::new(host);
                    if primary {
                        server.with_labels(["primary"])
                    } else {
                        server
                    }
                })
                .collect();
            topology.with_role(role, servers)
        })
    })
}

proptest! {
    #[test]
    fn all_servers_covers_every_entry(topology in topology_strategy()) {
        let all = topology.all_servers();
        prop_assert_eq!(all.len(), topology.len());
        for (role, servers) in topology.roles() {
            let in_role: Vec<&Server> = all
                .iter()
                .filter(|s| s.role == role)
                .map(|s| &s.server)
                .collect();
            prop_assert_eq!(in_role, servers.iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn all_servers_is_stable(topology in topology_strategy()) {
        prop_assert_eq!(topology.all_servers(), topology.clone().all_servers());
    }

    #[test]
    fn explicit_host_wins(topology in topology_strategy(), pick in any::<prop::sample::Index>()) {
        let all = topology.all_servers();
        let target = &all[pick.index(all.len())];
        let (other_role, _) = topology.roles().last().unwrap();

        let mut dep = Dependency::new("postgres:16");
        dep.host = Some(target.host().to_string());
        dep.role = Some(other_role.to_string());
        dep.labels = vec!["primary".to_string()];

        let resolved = topology.resolve_dependency_target(&dep).unwrap();
        prop_assert_eq!(resolved.host(), target.host());
    }

    #[test]
    fn unlabelled_dependency_lands_on_primary(topology in topology_strategy()) {
        let dep = Dependency::new("redis:7");
        let resolved = topology.resolve_dependency_target(&dep).unwrap();
        prop_assert_eq!(resolved, topology.primary().unwrap());
    }
}

#[test]
fn test_role_resolves_to_first_server() {
    let topology = Topology::new()
        .with_role("web", vec![Server::new("w1")])
        .with_role("db", vec![Server::new("d1"), Server::new("d2")]);

    let mut dep = Dependency::new("postgres:16");
    dep.role = Some("db".to_string());
    assert_eq!(topology.resolve_dependency_target(&dep).unwrap().host(), "d1");

    dep.role = Some("cache".to_string());
    assert!(topology.resolve_dependency_target(&dep).is_err());
}

#[test]
fn test_primary_label_beats_traversal_order() {
    let topology = Topology::new()
        .with_role("api", vec![Server::new("a1")])
        .with_role("web", vec![Server::new("w1").with_labels(["primary"])]);
    assert_eq!(topology.primary().unwrap().host(), "w1");

    let topology = Topology::new()
        .with_role("web", vec![Server::new("w1")])
        .with_role("api", vec![Server::new("a1")]);
    assert_eq!(topology.primary().unwrap().host(), "a1");
}
