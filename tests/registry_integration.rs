//! Registry behaviour through the public API, including concurrent use.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use common::{client, TestClient};
use rshd::autocomplete::{Autocomplete, PrefixIndex};
use rshd::registry::{ClientConnection, ClientRegistry, RegistryError};

fn registry() -> (ClientRegistry<TestClient>, Arc<PrefixIndex>) {
    let index = Arc::new(PrefixIndex::new());
    (ClientRegistry::new(index.clone()), index)
}

/// Index membership must equal live ids plus live aliases.
fn assert_index_matches(registry: &ClientRegistry<TestClient>, index: &PrefixIndex) {
    let mut expected = BTreeSet::new();
    for (id, aliases) in registry.get_all() {
        expected.insert(id);
        expected.extend(aliases);
    }
    let actual: BTreeSet<String> = index.entries().into_iter().collect();
    assert_eq!(actual, expected);
}

#[test]
fn lookup_by_id_user_and_address() {
    let (registry, index) = registry();
    let (id, user) = registry.add(client("Deploy Bot", "10.1.2.3:5555")).unwrap();
    assert_eq!(user, "deploy.bot");

    for key in [id.as_str(), "deploy.bot", "10.1.2.3:5555"] {
        assert_eq!(registry.get(key).unwrap().addr, "10.1.2.3:5555");
    }
    assert_eq!(index.complete("deploy"), vec!["deploy.bot".to_string()]);
    assert_index_matches(&registry, &index);
}

#[test]
fn ambiguous_alias_lists_every_candidate() {
    let (registry, _) = registry();
    let (a, _) = registry.add(client("host1", "10.0.0.1:1000")).unwrap();
    let (b, _) = registry.add(client("HOST1", "10.0.0.2:2000")).unwrap();

    let err = registry.get("host1").unwrap_err();
    let mut lines = vec![
        format!("{a} (host1 10.0.0.1:1000)"),
        format!("{b} (HOST1 10.0.0.2:2000)"),
    ];
    lines.sort();
    assert_eq!(
        err.to_string(),
        format!("2 connections match alias 'host1'\n{}", lines.join("\n"))
    );

    // Each id still resolves on its own.
    assert_eq!(registry.get(&a).unwrap().user(), "host1");
    assert_eq!(registry.get(&b).unwrap().user(), "HOST1");
}

#[test]
fn unknown_identifier_is_not_found() {
    let (registry, _) = registry();
    registry.add(client("alice", "10.0.0.9:22")).unwrap();
    let err = registry.get("bob").unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(ref s) if s == "bob"));
    assert_eq!(err.to_string(), "bob Not found.");
}

#[test]
fn search_by_glob() {
    let (registry, _) = registry();
    let (web1, _) = registry.add(client("web1", "10.0.1.1:4000")).unwrap();
    let (web2, _) = registry.add(client("web2", "10.0.1.2:4000")).unwrap();
    let (db, _) = registry.add(client("db", "10.0.2.1:4000")).unwrap();

    let web = registry.search("web[0-9]").unwrap();
    assert_eq!(web.len(), 2);
    assert!(web.contains_key(&web1) && web.contains_key(&web2));

    let subnet = registry.search("10.0.2.*").unwrap();
    assert_eq!(subnet.keys().collect::<Vec<_>>(), vec![&db]);

    assert_eq!(registry.search("").unwrap().len(), 3);
    assert!(registry.search("nothing*").unwrap().is_empty());
    assert!(matches!(
        registry.search("web[").unwrap_err(),
        RegistryError::InvalidPattern(_)
    ));
}

#[test]
fn removal_keeps_shared_aliases() {
    let (registry, index) = registry();
    let (a, _) = registry.add(client("ops", "10.0.0.1:1")).unwrap();
    let (b, _) = registry.add(client("ops", "10.0.0.2:2")).unwrap();

    assert!(registry.remove(&a).is_some());
    assert!(registry.remove(&a).is_none());
    assert!(index.contains("ops"));
    assert!(!index.contains("10.0.0.1:1"));
    assert!(!index.contains(&a));
    assert_eq!(registry.get("ops").unwrap().addr, "10.0.0.2:2");
    assert_index_matches(&registry, &index);

    registry.remove(&b);
    assert!(index.is_empty());
    assert!(registry.is_empty());
}

#[test]
fn concurrent_add_and_remove_preserve_invariants() {
    let (registry, index) = registry();

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let registry = registry.clone();
            thread::spawn(move || {
                let mut kept = Vec::new();
                for n in 0..50 {
                    let user = format!("user{}", n % 5);
                    let addr = format!("10.{worker}.0.{n}:22");
                    let (id, _) = registry.add(client(&user, &addr)).unwrap();
                    if n % 3 == 0 {
                        registry.remove(&id);
                    } else {
                        kept.push(id);
                    }
                    let _ = registry.get(&user);
                    let _ = registry.search("user*");
                }
                kept
            })
        })
        .collect();

    let mut kept = Vec::new();
    for w in workers {
        kept.extend(w.join().unwrap());
    }

    assert_eq!(registry.len(), kept.len());
    for id in &kept {
        assert!(registry.get(id).is_ok());
    }
    assert_index_matches(&registry, &index);

    let drained = registry.drain();
    assert_eq!(drained.len(), kept.len());
    assert!(index.is_empty());
}
