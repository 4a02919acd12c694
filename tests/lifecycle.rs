//! Install, shutdown/restart and helper behavior of an installed bridge

use opfs_bridge::bridge::sanity::{run_sanity_check, SANITY_FILE};
use opfs_bridge::bridge::vfs::random_filename;
use opfs_bridge::{Bridge, BridgeBuilder, BridgeError, BridgeOptions, OpCode, Value};
use std::fs;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn builder(dir: &TempDir, tag: &str) -> BridgeBuilder {
    BridgeBuilder::new()
        .root(dir.path().join("root"))
        .vfs_name(format!("opfs-life-{}-{}", tag, random_filename()))
        .idle_wait(Duration::from_millis(20))
}

fn install(dir: &TempDir, tag: &str) -> Bridge {
    builder(dir, tag).install().unwrap()
}

#[test]
fn test_install_with_sanity_check() {
    let dir = TempDir::new().unwrap();
    let bridge = builder(&dir, "sanity").with_sanity_check().install().unwrap();

    assert!(bridge.is_running());
    assert!(!bridge.root().join(SANITY_FILE).exists());
    let metrics = bridge.client_metrics();
    for op in ["xAccess", "xOpen", "xWrite", "xSync", "xFileSize", "xRead", "xClose", "xDelete"] {
        assert!(metrics.ops.contains_key(op), "missing {}", op);
    }

    // The scenario is repeatable on a live bridge
    run_sanity_check(bridge.vfs(), false).unwrap();
}

#[test]
fn test_sanity_check_fails_on_leftover_file() {
    let dir = TempDir::new().unwrap();
    let leftover = dir.path().join("root").join(SANITY_FILE);
    fs::create_dir_all(dir.path().join("root")).unwrap();
    fs::write(&leftover, b"stale").unwrap();

    match builder(&dir, "leftover").with_sanity_check().install() {
        Err(BridgeError::SanityCheck { stage, .. }) => assert_eq!(stage, "xAccess before open"),
        Err(other) => panic!("expected SanityCheck, got {}", other),
        Ok(_) => panic!("sanity check ignored a leftover file"),
    }
    assert_eq!(fs::read(&leftover).unwrap(), b"stale");
}

#[test]
fn test_sanity_check_clears_leftover_when_allowed() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("root")).unwrap();
    fs::write(dir.path().join("root").join(SANITY_FILE), b"stale").unwrap();

    let bridge = builder(&dir, "cleared")
        .with_sanity_check()
        .clear_sanity_leftover()
        .install()
        .unwrap();
    assert!(bridge.options().sanity_clear_leftover);
    assert!(!bridge.root().join(SANITY_FILE).exists());
}

#[test]
fn test_unusable_root_reports_unavailable() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("not-a-dir");
    fs::write(&file, b"x").unwrap();

    let result = BridgeBuilder::new()
        .root(&file)
        .vfs_name(format!("opfs-life-bad-{}", random_filename()))
        .install();
    match result {
        Err(BridgeError::Unavailable(reasons)) => assert!(!reasons.is_empty()),
        Err(other) => panic!("expected Unavailable, got {}", other),
        Ok(_) => panic!("install over a plain file succeeded"),
    }
}

#[test]
fn test_duplicate_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    let first = install(&dir, "dup");
    let second = BridgeBuilder::new()
        .root(dir.path().join("other"))
        .vfs_name(first.name())
        .install();
    assert!(second.is_err());

    // The first registration is untouched
    assert!(!first.util().entry_exists("nothing.db").unwrap());
}

#[test]
fn test_shutdown_refuses_calls_until_restart() {
    let dir = TempDir::new().unwrap();
    let bridge = install(&dir, "restart");

    bridge.shutdown().unwrap();
    assert!(!bridge.is_running());
    assert!(matches!(
        bridge.util().entry_exists("a.db"),
        Err(BridgeError::Protocol(_))
    ));

    bridge.restart().unwrap();
    assert!(bridge.is_running());
    assert!(!bridge.util().entry_exists("a.db").unwrap());
}

#[test]
fn test_quick_restart_keeps_worker_serving() {
    let dir = TempDir::new().unwrap();
    let bridge = install(&dir, "quick");

    // Both messages can reach the worker within one idle wait
    bridge.shutdown().unwrap();
    bridge.restart().unwrap();
    thread::sleep(Duration::from_millis(100));

    // A caller stranded on a dead wait loop would hang; answer from a helper
    // thread so a regression fails instead.
    let runner = Arc::clone(bridge.vfs().runner());
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(runner.run(OpCode::Sleep, &[Value::from(1)]));
    });
    let rc = match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(rc) => rc.unwrap(),
        Err(_) => {
            // Dropping would wait on the stranded call
            std::mem::forget(bridge);
            panic!("worker stopped answering after restart");
        }
    };
    assert_eq!(rc, 0);
    assert!(!bridge.util().entry_exists("a.db").unwrap());
}

#[test]
fn test_shutdown_op_stops_bridge_until_restart() {
    let dir = TempDir::new().unwrap();
    let bridge = install(&dir, "shutdown-op");

    assert_eq!(bridge.vfs().runner().run(OpCode::Shutdown, &[]).unwrap(), 0);
    assert!(!bridge.is_running());
    assert!(matches!(
        bridge.util().entry_exists("a.db"),
        Err(BridgeError::Protocol(_))
    ));

    bridge.restart().unwrap();
    assert!(bridge.is_running());
    assert!(!bridge.util().entry_exists("a.db").unwrap());
}

#[test]
fn test_worker_and_client_metrics_agree() {
    let dir = TempDir::new().unwrap();
    let bridge = install(&dir, "metrics");
    bridge.reset_metrics().unwrap();

    for _ in 0..3 {
        bridge.util().entry_exists("missing.db").unwrap();
    }
    let client = bridge.client_metrics();
    let worker = bridge.worker_metrics(false).unwrap();
    assert_eq!(client.ops["xAccess"].count, 3);
    assert_eq!(worker.ops["xAccess"].count, 3);
    assert_eq!(bridge.vfs().runner().call_count(OpCode::Access), 3);

    bridge.reset_metrics().unwrap();
    assert_eq!(bridge.client_metrics().total_calls(), 0);
    assert_eq!(bridge.worker_metrics(false).unwrap().total_calls(), 0);
}

#[test]
fn test_util_mkdir_unlink_and_tree() {
    let dir = TempDir::new().unwrap();
    let bridge = install(&dir, "util");
    let util = bridge.util();

    assert!(util.mkdir("a/b/c").unwrap());
    fs::write(bridge.root().join("a/b/c/data.db"), b"1234").unwrap();
    fs::write(bridge.root().join("top.db"), b"").unwrap();

    let tree = util.tree_list().unwrap();
    assert_eq!(tree.name, "/");
    let names: Vec<_> = tree.children.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "top.db"]);
    assert!(tree.children[0].is_dir);
    assert_eq!(tree.children[0].children[0].children[0].children[0].name, "data.db");

    assert!(util.entry_exists("a/b/c/data.db").unwrap());
    assert!(!util.unlink("a", false).unwrap());
    assert!(util.unlink("a", true).unwrap());
    assert!(!bridge.root().join("a").exists());
    assert!(!util.unlink("a", true).unwrap());

    let name = util.random_filename();
    assert_eq!(name.len(), 16);
    assert_eq!(util.root(), bridge.root());
}

#[test]
fn test_options_file_drives_install() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bridge.toml");
    let name = format!("opfs-life-toml-{}", random_filename());
    fs::write(
        &path,
        format!(
            "root = {:?}\nvfs_name = {:?}\nidle_wait_ms = 25\nexception_verbosity = 2\n",
            dir.path().join("from-toml").display().to_string(),
            name
        ),
    )
    .unwrap();

    let options = BridgeOptions::load(&path).unwrap();
    let bridge = BridgeBuilder::from_options(options).install().unwrap();
    assert_eq!(bridge.name(), name);
    assert_eq!(bridge.options().idle_wait_ms, 25);
    assert!(dir.path().join("from-toml").is_dir());
}

#[test]
fn test_drop_unregisters_name() {
    let dir = TempDir::new().unwrap();
    let name = {
        let bridge = install(&dir, "drop");
        bridge.name().to_string()
    };
    // The same name can be installed again once the first bridge is gone
    let again = BridgeBuilder::new()
        .root(dir.path().join("root"))
        .vfs_name(name.clone())
        .install()
        .unwrap();
    assert_eq!(again.name(), name);
}
