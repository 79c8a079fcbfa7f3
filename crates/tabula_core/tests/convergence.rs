//! End-to-end convergence of whole replica sessions through the public API.

use std::sync::Arc;
use std::time::Duration;

use tabula_core::persist::{load_into, save_from};
use tabula_core::{
    Cell, MemoryChannel, MemoryPersister, MergeableStore, SyncConfig, Synchronizer,
};

fn start_synchronizer(broker: &MemoryChannel, id: &str, config: SyncConfig) -> Synchronizer {
    let inbound = broker.register(id);
    let synchronizer =
        Synchronizer::new(MergeableStore::new(id), Arc::new(broker.clone()), config);
    synchronizer.start(inbound);
    synchronizer
}

fn manual_config() -> SyncConfig {
    SyncConfig {
        auto_pull: false,
        auto_push: false,
        ..SyncConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replicas did not converge in time");
}

fn assert_converged(a: &Synchronizer, b: &Synchronizer) {
    assert_eq!(
        a.with_store(|s| s.get_content()),
        b.with_store(|s| s.get_content())
    );
    assert_eq!(
        a.with_store(|s| s.get_content_hashes()),
        b.with_store(|s| s.get_content_hashes())
    );
}

#[tokio::test]
async fn full_session_converges_both_replicas() {
    let broker = MemoryChannel::new();
    let a = start_synchronizer(&broker, "a", manual_config());
    let b = start_synchronizer(&broker, "b", manual_config());

    a.with_store(|s| {
        s.transaction(|s| {
            s.set_cell("pets", "fido", "species", "dog");
            s.set_cell("pets", "fido", "color", "brown");
            s.set_value("open", true);
        })
    });
    b.with_store(|s| {
        s.set_cell("pets", "felix", "species", "cat");
        s.set_value("employees", 3.0);
    });

    b.pull_from("a").await.unwrap();
    a.pull_from("b").await.unwrap();

    assert_converged(&a, &b);
    assert_eq!(
        b.with_store(|s| s.get_cell("pets", "fido", "color").cloned()),
        Some(Cell::from("brown"))
    );
    assert_eq!(
        a.with_store(|s| s.get_value("employees").cloned()),
        Some(Cell::from(3.0))
    );
}

#[tokio::test]
async fn merge_order_does_not_matter() {
    let mut a = MergeableStore::new("a");
    let mut b = MergeableStore::new("b");
    let mut c = MergeableStore::new("c");
    a.set_cell("t", "r", "x", 1.0);
    b.set_cell("t", "r", "x", 2.0);
    c.set_cell("t", "r", "y", 3.0);

    let (da, db, dc) = (
        a.get_mergeable_content(),
        b.get_mergeable_content(),
        c.get_mergeable_content(),
    );

    // Apply the same three change sets in different orders.
    let mut forward = MergeableStore::new("f");
    forward.apply_changes(da.clone());
    forward.apply_changes(db.clone());
    forward.apply_changes(dc.clone());

    let mut reverse = MergeableStore::new("r");
    reverse.apply_changes(dc);
    reverse.apply_changes(db);
    reverse.apply_changes(da);

    assert_eq!(forward.get_content(), reverse.get_content());
    assert_eq!(forward.get_content_hashes(), reverse.get_content_hashes());
    // Exactly one of the conflicting writes survived everywhere.
    let x = forward.get_cell("t", "r", "x").cloned();
    assert!(x == Some(Cell::from(1.0)) || x == Some(Cell::from(2.0)));
}

#[tokio::test]
async fn offline_edits_reconcile_after_reconnect() {
    let broker = MemoryChannel::new();
    let a = start_synchronizer(&broker, "a", manual_config());
    let b = start_synchronizer(&broker, "b", manual_config());

    a.with_store(|s| {
        s.set_cell("notes", "n1", "text", "first");
        s.set_cell("notes", "n2", "text", "second");
    });
    b.pull_from("a").await.unwrap();
    a.pull_from("b").await.unwrap();
    assert_converged(&a, &b);

    // Diverge while "offline": an edit, a new row, and a deletion.
    a.with_store(|s| {
        s.set_cell("notes", "n1", "text", "first, revised");
        s.del_cell("notes", "n2", "text");
    });
    b.with_store(|s| s.set_cell("notes", "n3", "text", "third"));

    b.pull_from("a").await.unwrap();
    a.pull_from("b").await.unwrap();

    assert_converged(&a, &b);
    assert!(!b.with_store(|s| s.has_cell("notes", "n2", "text")));
    assert_eq!(
        b.with_store(|s| s.get_cell("notes", "n1", "text").cloned()),
        Some(Cell::from("first, revised"))
    );
    assert_eq!(
        a.with_store(|s| s.get_cell("notes", "n3", "text").cloned()),
        Some(Cell::from("third"))
    );
}

#[tokio::test]
async fn push_changes_seeds_cold_replica() {
    let broker = MemoryChannel::new();
    let a = start_synchronizer(&broker, "a", manual_config());
    let b = start_synchronizer(&broker, "b", manual_config());

    a.with_store(|s| {
        s.set_cell("pets", "fido", "species", "dog");
        s.set_value("open", true);
    });
    a.push_changes().await.unwrap();

    let (a2, b2) = (a.clone(), b.clone());
    wait_until(move || {
        a2.with_store(|s| s.get_content_hashes()) == b2.with_store(|s| s.get_content_hashes())
    })
    .await;
    assert_converged(&a, &b);
}

#[tokio::test]
async fn auto_sync_session_converges_live() {
    let broker = MemoryChannel::new();
    let a = start_synchronizer(&broker, "a", SyncConfig::default());
    let b = start_synchronizer(&broker, "b", SyncConfig::default());

    a.with_store(|s| s.set_cell("pets", "fido", "species", "dog"));
    b.with_store(|s| s.set_cell("pets", "felix", "species", "cat"));
    a.push().await.unwrap();
    b.push().await.unwrap();

    let (a2, b2) = (a.clone(), b.clone());
    wait_until(move || {
        a2.with_store(|s| s.get_content_hashes()) == b2.with_store(|s| s.get_content_hashes())
    })
    .await;

    // Live edits keep flowing through auto-push.
    a.with_store(|s| s.set_cell("pets", "fido", "color", "brown"));
    let (a2, b2) = (a.clone(), b.clone());
    wait_until(move || b2.with_store(|s| s.has_cell("pets", "fido", "color")) && {
        a2.with_store(|s| s.get_content_hashes())
            == b2.with_store(|s| s.get_content_hashes())
    })
    .await;
    assert_converged(&a, &b);
}

#[tokio::test]
async fn restart_resumes_with_saved_timestamps() {
    let persister = MemoryPersister::new();

    let mut a = MergeableStore::new("a");
    let mut b = MergeableStore::new("b");
    a.set_cell("pets", "fido", "color", "brown");
    a.set_value("open", true);
    save_from(&persister, &a).await.unwrap();
    a.merge(&mut b);
    drop(a);

    // The peer keeps writing while "a" is down; its clock has observed the
    // saved state, so its writes stamp strictly later.
    b.set_cell("pets", "fido", "color", "black");
    b.set_cell("pets", "felix", "species", "cat");

    let mut restarted = MergeableStore::new("a");
    assert!(load_into(&persister, &mut restarted).await.unwrap());
    restarted.merge(&mut b);

    assert_eq!(restarted.get_content(), b.get_content());
    assert_eq!(restarted.get_content_hashes(), b.get_content_hashes());
    // b's write came after the save, so it wins the conflict.
    assert_eq!(
        restarted.get_cell("pets", "fido", "color"),
        Some(&Cell::from("black"))
    );
    assert_eq!(restarted.get_value("open"), Some(&Cell::from(true)));
}

#[tokio::test]
async fn defaults_fill_gaps_without_outranking_peers() {
    let mut a = MergeableStore::new("a");
    let mut b = MergeableStore::new("b");

    b.set_cell("settings", "ui", "theme", "dark");

    // a boots with defaults, then receives b's real write.
    let mut defaults = tabula_core::Tables::new();
    defaults
        .entry("settings".to_string())
        .or_default()
        .entry("ui".to_string())
        .or_default()
        .extend([
            ("theme".to_string(), Cell::from("light")),
            ("lang".to_string(), Cell::from("en")),
        ]);
    a.set_default_content(defaults, tabula_core::Values::new());

    a.merge(&mut b);

    // The real write beats the default; the untouched default stays.
    assert_eq!(
        a.get_cell("settings", "ui", "theme"),
        Some(&Cell::from("dark"))
    );
    assert_eq!(a.get_cell("settings", "ui", "lang"), Some(&Cell::from("en")));
}
