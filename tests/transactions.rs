// tests/transactions.rs

//! End-to-end transaction scenarios against a temporary root.

use std::sync::Arc;

use rpmtxn::{
    EngineConfig, FileFlags, FileState, Header, HeaderBuilder, Payload, PayloadEntry, ProblemKind,
    Tag, TransFlags, Transaction,
};
use tempfile::TempDir;

fn digest(content: &[u8]) -> String {
    rpmtxn::fileinfo::digest_bytes(content)
}

fn payload_for(files: &[(&str, &[u8])]) -> Payload {
    let mut p = Payload::new();
    for (path, content) in files {
        p.insert(
            path,
            PayloadEntry {
                content: content.to_vec(),
                mode: 0o100644,
                mtime: 0,
            },
        );
    }
    p
}

fn tool_header(name: &str, version: &str, content: &[u8]) -> Arc<Header> {
    HeaderBuilder::new(name, version, "1")
        .arch("x86_64")
        .file_full(
            &format!("/usr/bin/{}", name),
            0o100755,
            content.len() as u32,
            FileFlags::empty(),
            &digest(content),
            "",
            "",
            0,
        )
        .build()
}

#[test]
fn test_install_with_doc_exclusion_records_skip_state() {
    let tmp = TempDir::new().unwrap();
    let mut config = EngineConfig::new(tmp.path());
    config.exclude_docs = true;

    let h = HeaderBuilder::new("hello", "1.0", "1")
        .file_full(
            "/usr/bin/hello",
            0o100755,
            5,
            FileFlags::empty(),
            &digest(b"hello"),
            "",
            "",
            0,
        )
        .file_full(
            "/usr/share/doc/hello/README",
            0o100644,
            3,
            FileFlags::DOC,
            &digest(b"doc"),
            "",
            "",
            0,
        )
        .build();
    let payload = payload_for(&[
        ("/usr/bin/hello", b"hello"),
        ("/usr/share/doc/hello/README", b"doc"),
    ]);

    let mut ts = Transaction::new(config).unwrap();
    ts.install(h, payload).unwrap();
    let report = ts.run(None).unwrap();

    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert!(tmp.path().join("usr/bin/hello").exists());
    assert!(!tmp.path().join("usr/share/doc/hello/README").exists());

    // The skipped doc is recorded as never installed, not as missing.
    let instance = ts.elements()[0].db_instance;
    assert_eq!(
        ts.db().file_states(instance).unwrap(),
        vec![FileState::Normal, FileState::NotInstalled]
    );
}

#[test]
fn test_upgrade_preserves_modified_noreplace_config() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::new(tmp.path());

    let old_conf = b"shipped v1";
    let old = HeaderBuilder::new("app", "1.0", "1")
        .file_full(
            "/usr/bin/app",
            0o100755,
            2,
            FileFlags::empty(),
            &digest(b"v1"),
            "",
            "",
            0,
        )
        .file_full(
            "/etc/app.conf",
            0o100644,
            old_conf.len() as u32,
            FileFlags::CONFIG | FileFlags::NOREPLACE,
            &digest(old_conf),
            "",
            "",
            0,
        )
        .build();

    // Install v1, then edit the config locally.
    let mut ts = Transaction::new(config.clone()).unwrap();
    ts.install(
        old,
        payload_for(&[("/usr/bin/app", b"v1"), ("/etc/app.conf", old_conf)]),
    )
    .unwrap();
    assert!(ts.run(None).unwrap().is_clean());
    drop(ts);
    std::fs::write(tmp.path().join("etc/app.conf"), b"local edits").unwrap();

    let new_conf = b"shipped v2";
    let new = HeaderBuilder::new("app", "2.0", "1")
        .file_full(
            "/usr/bin/app",
            0o100755,
            2,
            FileFlags::empty(),
            &digest(b"v2"),
            "",
            "",
            0,
        )
        .file_full(
            "/etc/app.conf",
            0o100644,
            new_conf.len() as u32,
            FileFlags::CONFIG | FileFlags::NOREPLACE,
            &digest(new_conf),
            "",
            "",
            0,
        )
        .build();

    let mut ts = Transaction::new(config).unwrap();
    ts.upgrade(
        new,
        payload_for(&[("/usr/bin/app", b"v2"), ("/etc/app.conf", new_conf)]),
    )
    .unwrap();
    let report = ts.run(None).unwrap();
    assert!(report.is_clean(), "problems: {:?}", report.problems);

    // The local edit survives; the incoming config lands beside it.
    assert_eq!(
        std::fs::read(tmp.path().join("etc/app.conf")).unwrap(),
        b"local edits"
    );
    assert_eq!(
        std::fs::read(tmp.path().join("etc/app.conf.rpmnew")).unwrap(),
        new_conf
    );
    assert_eq!(std::fs::read(tmp.path().join("usr/bin/app")).unwrap(), b"v2");

    // Exactly one instance remains.
    let found = ts.db().find_by_name("app").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].1.nevra().unwrap().version, "2.0");
}

#[test]
fn test_erase_with_repackage_spools_archive() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::new(tmp.path());

    let h = tool_header("gone", "1.0", b"bits");
    let mut ts = Transaction::new(config.clone()).unwrap();
    ts.install(h, payload_for(&[("/usr/bin/gone", b"bits")]))
        .unwrap();
    assert!(ts.run(None).unwrap().is_clean());
    drop(ts);

    let mut ts = Transaction::new(config.clone()).unwrap();
    ts.set_flags(TransFlags::REPACKAGE);
    ts.erase("gone").unwrap();
    assert!(ts.run(None).unwrap().is_clean());

    assert!(!tmp.path().join("usr/bin/gone").exists());
    assert_eq!(ts.db().package_count().unwrap(), 0);

    let spool: Vec<_> = std::fs::read_dir(&config.repackage_dir)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(spool.len(), 1);
    assert!(
        spool[0]
            .file_name()
            .to_string_lossy()
            .starts_with("gone-1.0-1")
    );
}

#[test]
fn test_failed_install_rolls_back_committed_prefix() {
    let tmp = TempDir::new().unwrap();
    let mut config = EngineConfig::new(tmp.path());
    config.rollback_on_failure = true;

    let good = tool_header("good", "1.0", b"ok");
    let bad = tool_header("bad", "1.0", b"nope");

    let mut ts = Transaction::new(config).unwrap();
    ts.install(good, payload_for(&[("/usr/bin/good", b"ok")]))
        .unwrap();
    // Empty payload: the second install fails at the filesystem stage.
    ts.install(bad, Payload::new()).unwrap();

    let report = ts.run(None).unwrap();
    assert!(report.rolled_back);
    assert!(!report.committed);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "bad");

    // The successful install was undone.
    assert!(!tmp.path().join("usr/bin/good").exists());
    assert_eq!(ts.db().package_count().unwrap(), 0);
}

#[test]
fn test_rollback_restores_displaced_files() {
    let tmp = TempDir::new().unwrap();
    let mut config = EngineConfig::new(tmp.path());
    config.rollback_on_failure = true;

    // A local unowned config file the install will displace.
    std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
    std::fs::write(tmp.path().join("etc/app.conf"), b"hand written").unwrap();

    let conf = b"shipped";
    let app = HeaderBuilder::new("app", "1.0", "1")
        .file_full(
            "/etc/app.conf",
            0o100644,
            conf.len() as u32,
            FileFlags::CONFIG,
            &digest(conf),
            "",
            "",
            0,
        )
        .build();
    let bad = tool_header("bad", "1.0", b"nope");

    let mut ts = Transaction::new(config).unwrap();
    ts.install(app, payload_for(&[("/etc/app.conf", conf)]))
        .unwrap();
    ts.install(bad, Payload::new()).unwrap();

    let report = ts.run(None).unwrap();
    assert!(report.rolled_back);

    // The displaced local file is back under its own name.
    assert_eq!(
        std::fs::read(tmp.path().join("etc/app.conf")).unwrap(),
        b"hand written"
    );
    assert!(!tmp.path().join("etc/app.conf.rpmorig").exists());
    assert_eq!(ts.db().package_count().unwrap(), 0);
}

#[test]
fn test_blocked_reinstall_stops_before_transaction_scripts() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::new(tmp.path());

    let h = tool_header("tool", "1.0", b"bits");
    let mut ts = Transaction::new(config.clone()).unwrap();
    ts.install(h, payload_for(&[("/usr/bin/tool", b"bits")]))
        .unwrap();
    assert!(ts.run(None).unwrap().is_clean());
    drop(ts);

    // Reinstalling the exact version blocks before any transaction-wide
    // scriptlet runs; the run ends cleanly without committing.
    let again = HeaderBuilder::new("tool", "1.0", "1")
        .arch("x86_64")
        .file_full(
            "/usr/bin/tool",
            0o100755,
            4,
            FileFlags::empty(),
            &digest(b"bits"),
            "",
            "",
            0,
        )
        .scriptlet(Tag::Pretrans, "exit 1")
        .build();
    let mut ts = Transaction::new(config).unwrap();
    ts.install(again, payload_for(&[("/usr/bin/tool", b"bits")]))
        .unwrap();

    let report = ts.run(None).unwrap();
    assert!(!report.committed);
    assert!(
        report
            .problems
            .iter()
            .any(|p| matches!(p.kind, ProblemKind::PackageInstalled))
    );
}

#[test]
fn test_erase_keeps_file_shared_with_installed_package() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::new(tmp.path());

    let shared = b"common data";
    let make = |name: &str| {
        HeaderBuilder::new(name, "1.0", "1")
            .file_full(
                "/usr/share/common.dat",
                0o100644,
                shared.len() as u32,
                FileFlags::empty(),
                &digest(shared),
                "",
                "",
                0,
            )
            .build()
    };

    let mut ts = Transaction::new(config.clone()).unwrap();
    ts.install(make("keeper"), payload_for(&[("/usr/share/common.dat", shared)]))
        .unwrap();
    ts.install(make("leaver"), payload_for(&[("/usr/share/common.dat", shared)]))
        .unwrap();
    let report = ts.run(None).unwrap();
    // Identical content: claimed twice without conflict.
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    drop(ts);

    let mut ts = Transaction::new(config).unwrap();
    ts.erase("leaver").unwrap();
    assert!(ts.run(None).unwrap().is_clean());

    // The survivor still owns the file.
    assert!(tmp.path().join("usr/share/common.dat").exists());
    assert_eq!(ts.db().find_by_name("keeper").unwrap().len(), 1);
}

#[test]
fn test_conflicting_installs_block_without_filter() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::new(tmp.path());

    let a = HeaderBuilder::new("alpha", "1.0", "1")
        .file_full(
            "/usr/bin/clash",
            0o100755,
            1,
            FileFlags::empty(),
            &digest(b"a"),
            "",
            "",
            0,
        )
        .build();
    let b = HeaderBuilder::new("beta", "1.0", "1")
        .file_full(
            "/usr/bin/clash",
            0o100755,
            1,
            FileFlags::empty(),
            &digest(b"b"),
            "",
            "",
            0,
        )
        .build();

    let mut ts = Transaction::new(config).unwrap();
    ts.install(a, payload_for(&[("/usr/bin/clash", b"a")]))
        .unwrap();
    ts.install(b, payload_for(&[("/usr/bin/clash", b"b")]))
        .unwrap();

    let report = ts.run(None).unwrap();
    assert!(!report.committed);
    assert!(report.problems.iter().any(|p| matches!(
        p.kind,
        ProblemKind::NewFileConflict { .. }
    )));
    assert!(!tmp.path().join("usr/bin/clash").exists());
}

#[test]
fn test_verify_after_install() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig::new(tmp.path());

    let h = tool_header("checked", "1.0", b"verified bits");
    let mut ts = Transaction::new(config.clone()).unwrap();
    ts.install(h, payload_for(&[("/usr/bin/checked", b"verified bits")]))
        .unwrap();
    assert!(ts.run(None).unwrap().is_clean());

    let reports = rpmtxn::verify_all(ts.db(), &config).unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_clean());

    // Tamper with the file and verify again.
    std::fs::write(tmp.path().join("usr/bin/checked"), b"tampered").unwrap();
    let reports = rpmtxn::verify_all(ts.db(), &config).unwrap();
    assert!(!reports[0].is_clean());
}
