//! Integration tests for building and reconciling the index against a mail store.

mod common;

use std::collections::HashMap;
use std::fs::File;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use assert_fs::prelude::*;
use predicates::prelude::*;

use common::{message_with_attachment, text_message, MailStore, ACCOUNT, OTHER_ACCOUNT};
use mailindex::index::Storage;
use mailindex::manager::ProgressFn;
use mailindex::parser::emlx::MAX_MESSAGE_SIZE;
use mailindex::parser::parse_message_file;
use mailindex::{Identity, IndexError, IndexManager, SearchRequest, SearchScope};

const DATE: &str = "Mon, 08 Jan 2024 09:30:00 +0000";

fn seed_inbox(store: &MailStore) {
    store.write(
        ACCOUNT,
        "INBOX",
        101,
        &text_message("Alice <alice@example.com>", "Lunch on Friday", DATE, "Shall we try the new ramen place?"),
        300,
    );
    store.write(
        ACCOUNT,
        "INBOX",
        102,
        &text_message("Bob <bob@example.com>", "Quarterly numbers", DATE, "The quarterly report is ready."),
        200,
    );
    store.write(
        ACCOUNT,
        "INBOX",
        103,
        &text_message("Carol <carol@example.com>", "Offsite agenda", DATE, "Agenda for the offsite attached below."),
        100,
    );
}

// ─── Full build ─────────────────────────────────────────────────────

#[test]
fn test_build_indexes_every_message() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();

    let report = manager.build_index(None).unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.skipped, 0);
    assert!(!report.cancelled);

    let stats = manager.get_stats().unwrap();
    assert_eq!(stats.email_count, 3);
    assert_eq!(stats.per_mailbox.len(), 1);
    assert_eq!(stats.per_mailbox[0].mailbox, "INBOX");
    assert!(stats.last_sync_at.is_some());
    assert!(!manager.is_stale(24.0).unwrap());
    assert!(manager.is_index_available());
}

#[test]
fn test_index_file_is_created() {
    let store = MailStore::new();
    seed_inbox(&store);
    store.manager().build_index(None).unwrap();

    let db = assert_fs::fixture::ChildPath::new(store.db_path());
    db.assert(predicate::path::is_file());
}

#[test]
fn test_sync_after_build_is_a_no_op() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();
    manager.build_index(None).unwrap();

    let counts = manager.sync_updates(None).unwrap();
    assert_eq!(counts.total(), 0);
    assert_eq!(counts.errors, 0);
}

#[test]
fn test_progress_reports_total() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();

    let seen = std::sync::Mutex::new(Vec::new());
    manager
        .build_index(Some(&|done, total| {
            seen.lock().unwrap().push((done, total));
            true
        }))
        .unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.last(), Some(&(3, 3)));
}

/// Progress callback that parks the run after its first file until `resume` fires.
fn pause_after_first(started: mpsc::Sender<()>, resume: mpsc::Receiver<()>) -> ProgressFn {
    Box::new(move |done, _total| {
        if done == 1 {
            let _ = started.send(());
            let _ = resume.recv();
        }
        true
    })
}

#[test]
fn test_cancel_while_idle_does_not_stop_next_run() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();

    manager.cancel();
    let report = manager.build_index(None).unwrap();
    assert_eq!(report.indexed, 3);
    assert!(!report.cancelled);

    store.write(ACCOUNT, "INBOX", 104, &text_message("d@example.com", "Late", DATE, "x"), 0);
    manager.cancel();
    let counts = manager.sync_updates(None).unwrap();
    assert_eq!(counts.added, 1);
    assert!(!counts.cancelled);
}

#[test]
fn test_spawned_build_stops_when_cancelled() {
    let store = MailStore::new();
    for id in 1..=6 {
        store.write(
            ACCOUNT,
            "INBOX",
            id,
            &text_message("a@example.com", &format!("Notebook {id}"), DATE, "Margin notes."),
            600 - id as u64 * 10,
        );
    }
    let manager = Arc::new(store.manager());

    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let build = manager
        .spawn_build(Some(pause_after_first(started_tx, resume_rx)))
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    manager.cancel();
    resume_tx.send(()).unwrap();

    let report = build.join().unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.indexed, 1);
    assert_eq!(manager.get_stats().unwrap().email_count, 1);
    let hits = manager
        .search(&SearchRequest::new("notebook", SearchScope::All))
        .unwrap();
    assert_eq!(hits.len(), 1);

    let counts = manager.spawn_sync(None).unwrap().join().unwrap().unwrap();
    assert_eq!(counts.added, 5);
    assert!(!counts.cancelled);
    assert_eq!(manager.get_stats().unwrap().email_count, 6);
}

#[test]
fn test_sync_waiting_on_a_build_scans_after_it() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = Arc::new(store.manager());

    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let build = manager
        .spawn_build(Some(pause_after_first(started_tx, resume_rx)))
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // The build holds the writer; this sync queues behind it.
    let sync = manager.spawn_sync(None).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    std::fs::remove_file(store.path_of(ACCOUNT, "INBOX", 101)).unwrap();
    resume_tx.send(()).unwrap();

    let report = build.join().unwrap().unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.skipped, 1);

    let counts = sync.join().unwrap().unwrap();
    assert_eq!(counts.total(), 0);
    assert_eq!(counts.errors, 0);
    assert_eq!(manager.get_stats().unwrap().email_count, 2);
}

// ─── Reconciliation ─────────────────────────────────────────────────

#[test]
fn test_added_and_deleted_files_are_reconciled() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();
    manager.build_index(None).unwrap();

    std::fs::remove_file(store.path_of(ACCOUNT, "INBOX", 101)).unwrap();
    store.write(
        ACCOUNT,
        "INBOX",
        104,
        &text_message("Dan <dan@example.com>", "Ramen review", DATE, "Five stars."),
        10,
    );

    let counts = manager.sync_updates(None).unwrap();
    assert_eq!(counts.added, 1);
    assert_eq!(counts.deleted, 1);
    assert_eq!(manager.get_stats().unwrap().email_count, 3);
}

#[test]
fn test_partial_replaced_by_full_file_is_a_move() {
    let store = MailStore::new();
    let mime = text_message("Eve <eve@example.com>", "Large download", DATE, "Body arrives later.");
    let partial = store.write_partial(ACCOUNT, "INBOX", 500, &mime);
    let manager = store.manager();
    manager.build_index(None).unwrap();

    std::fs::remove_file(&partial).unwrap();
    let full = store.write(ACCOUNT, "INBOX", 500, &mime, 0);

    let counts = manager.sync_updates(None).unwrap();
    assert_eq!(counts.moved, 1);
    assert_eq!(counts.added, 0);

    let storage = Storage::open_read_only(store.db_path()).unwrap();
    let path = storage
        .message_path(&Identity::new(ACCOUNT, "INBOX", 500))
        .unwrap();
    assert_eq!(path, Some(full));
}

#[test]
fn test_full_file_wins_over_partial() {
    let store = MailStore::new();
    let mime = text_message("Eve <eve@example.com>", "Both variants", DATE, "x");
    store.write_partial(ACCOUNT, "INBOX", 7, &mime);
    let full = store.write(ACCOUNT, "INBOX", 7, &mime, 0);
    let manager = store.manager();

    assert_eq!(manager.build_index(None).unwrap().indexed, 1);
    let storage = Storage::open_read_only(store.db_path()).unwrap();
    assert_eq!(
        storage.message_path(&Identity::new(ACCOUNT, "INBOX", 7)).unwrap(),
        Some(full)
    );
}

#[test]
fn test_message_moved_between_mailboxes_changes_identity() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();
    manager.build_index(None).unwrap();

    let from = store.path_of(ACCOUNT, "INBOX", 102);
    let to = store.path_of(ACCOUNT, "Archive", 102);
    std::fs::create_dir_all(to.parent().unwrap()).unwrap();
    std::fs::rename(&from, &to).unwrap();

    let counts = manager.sync_updates(None).unwrap();
    assert_eq!(counts.deleted, 1);
    assert_eq!(counts.added, 1);

    let hits = manager
        .search(&SearchRequest::new("quarterly", SearchScope::All).mailbox("Archive"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].identity, Identity::new(ACCOUNT, "Archive", 102));
}

#[test]
fn test_same_id_in_two_mailboxes_is_kept_apart() {
    let store = MailStore::new();
    store.write(ACCOUNT, "INBOX", 1, &text_message("a@example.com", "In inbox", DATE, "first"), 0);
    store.write(ACCOUNT, "Work/Projects", 1, &text_message("b@example.com", "In projects", DATE, "second"), 0);
    store.write(OTHER_ACCOUNT, "INBOX", 1, &text_message("c@example.com", "Other account", DATE, "third"), 0);
    let manager = store.manager();

    assert_eq!(manager.build_index(None).unwrap().indexed, 3);
    let mailboxes: Vec<String> = manager
        .get_stats()
        .unwrap()
        .per_mailbox
        .into_iter()
        .map(|m| format!("{}/{}", m.account_id, m.mailbox))
        .collect();
    assert!(mailboxes.contains(&format!("{ACCOUNT}/Work/Projects")));
    assert!(mailboxes.contains(&format!("{OTHER_ACCOUNT}/INBOX")));
}

#[test]
fn test_mailbox_cap_keeps_newest() {
    let store = MailStore::new();
    seed_inbox(&store);
    let mut settings = store.settings();
    settings.max_per_mailbox = 2;
    let manager = IndexManager::open(settings).unwrap();

    let report = manager.build_index(None).unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.excluded_by_cap, 1);

    // 101 is the oldest file.
    let storage = Storage::open_read_only(store.db_path()).unwrap();
    let inventory = storage.query_inventory().unwrap();
    assert!(!inventory.contains(&Identity::new(ACCOUNT, "INBOX", 101)));
    assert!(inventory.contains(&Identity::new(ACCOUNT, "INBOX", 103)));
}

#[test]
fn test_malformed_file_is_skipped() {
    let store = MailStore::new();
    seed_inbox(&store);
    store.write_raw(ACCOUNT, "INBOX", "900.emlx", b"not-a-number\ngarbage");
    let manager = store.manager();

    let report = manager.build_index(None).unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.skipped, 1);
}

#[test]
fn test_oversized_file_is_skipped() {
    let store = MailStore::new();
    seed_inbox(&store);
    let path = store.write_raw(ACCOUNT, "INBOX", "950.emlx", b"");
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(MAX_MESSAGE_SIZE + 1)
        .unwrap();

    assert!(matches!(
        parse_message_file(&path),
        Err(IndexError::OversizedFile { size, .. }) if size == MAX_MESSAGE_SIZE + 1
    ));

    let manager = store.manager();
    let report = manager.build_index(None).unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(report.skipped, 1);

    let reader = Storage::open_read_only(store.db_path()).unwrap();
    assert_eq!(
        reader.message_path(&Identity::new(ACCOUNT, "INBOX", 950)).unwrap(),
        None
    );
}

#[test]
fn test_excluded_mailbox_is_not_indexed() {
    let store = MailStore::new();
    seed_inbox(&store);
    store.write(ACCOUNT, "Drafts", 1, &text_message("me@example.com", "Unsent", DATE, "draft"), 0);
    let manager = store.manager();

    assert_eq!(manager.build_index(None).unwrap().indexed, 3);
}

#[test]
fn test_deleting_message_removes_its_attachments() {
    let store = MailStore::new();
    store.write(
        ACCOUNT,
        "INBOX",
        42,
        &message_with_attachment("Invoice", DATE, "invoice-2024.pdf", "SGVsbG8gUERG"),
        0,
    );
    let manager = store.manager();
    manager.build_index(None).unwrap();

    let by_name = SearchRequest::new("invoice-2024", SearchScope::Attachments);
    assert_eq!(manager.search(&by_name).unwrap().len(), 1);

    std::fs::remove_file(store.path_of(ACCOUNT, "INBOX", 42)).unwrap();
    manager.sync_updates(None).unwrap();
    assert!(manager.search(&by_name).unwrap().is_empty());

    let storage = Storage::open_read_only(store.db_path()).unwrap();
    let orphans: i64 = storage
        .conn()
        .query_row("SELECT count(*) FROM attachments", [], |row| row.get(0))
        .unwrap();
    assert_eq!(orphans, 0);
}

// ─── Incremental changes ────────────────────────────────────────────

#[test]
fn test_apply_changes_handles_touched_identities() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();
    manager.build_index(None).unwrap();

    let new_path = store.write(
        ACCOUNT,
        "INBOX",
        200,
        &text_message("Frank <frank@example.com>", "Gardening tips", DATE, "Tomatoes need sun."),
        0,
    );
    let edited_path = store.write(
        ACCOUNT,
        "INBOX",
        103,
        &text_message("Carol <carol@example.com>", "Offsite agenda v2", DATE, "Revised: kayaking."),
        0,
    );
    let removed_path = store.path_of(ACCOUNT, "INBOX", 101);
    std::fs::remove_file(&removed_path).unwrap();

    let touched = HashMap::from([
        (Identity::new(ACCOUNT, "INBOX", 200), vec![new_path]),
        (Identity::new(ACCOUNT, "INBOX", 103), vec![edited_path]),
        (Identity::new(ACCOUNT, "INBOX", 101), vec![removed_path]),
    ]);
    let counts = manager.apply_changes(&touched).unwrap();
    assert_eq!(counts.added, 1);
    assert_eq!(counts.updated, 1);
    assert_eq!(counts.deleted, 1);

    let hits = manager
        .search(&SearchRequest::new("kayaking", SearchScope::All))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].subject, "Offsite agenda v2");
    assert!(manager
        .search(&SearchRequest::new("ramen", SearchScope::All))
        .unwrap()
        .is_empty());
}

#[test]
fn test_apply_changes_ignores_excluded_mailboxes() {
    let store = MailStore::new();
    let manager = store.manager();
    let path = store.write(ACCOUNT, "Drafts", 5, &text_message("me@example.com", "wip", DATE, "x"), 0);

    let touched = HashMap::from([(Identity::new(ACCOUNT, "Drafts", 5), vec![path])]);
    let counts = manager.apply_changes(&touched).unwrap();
    assert_eq!(counts.total(), 0);
}

// ─── Rebuild and schema ─────────────────────────────────────────────

#[test]
fn test_rebuild_from_scratch() {
    let store = MailStore::new();
    seed_inbox(&store);
    let manager = store.manager();
    manager.build_index(None).unwrap();

    let report = manager.rebuild_from_scratch(None).unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(manager.get_stats().unwrap().email_count, 3);
}

#[test]
fn test_newer_schema_is_rejected() {
    let store = MailStore::new();
    drop(store.manager());
    {
        let conn = rusqlite::Connection::open(store.db_path()).unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
    }

    match IndexManager::open(store.settings()) {
        Err(IndexError::SchemaMismatch { found, .. }) => assert_eq!(found, 99),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("opened an index with a newer schema"),
    }
}

#[test]
fn test_interrupted_bulk_load_is_repaired_on_open() {
    let store = MailStore::new();
    seed_inbox(&store);
    store.manager().build_index(None).unwrap();
    {
        // State left when a bulk load dies before the triggers come back.
        let conn = rusqlite::Connection::open(store.db_path()).unwrap();
        conn.execute_batch(
            "DROP TRIGGER messages_ai;
             DROP TRIGGER messages_ad;
             DROP TRIGGER messages_au;
             INSERT INTO messages_fts(messages_fts) VALUES ('delete-all');",
        )
        .unwrap();
    }

    let manager = store.manager();
    let ramen = SearchRequest::new("ramen", SearchScope::All);
    assert_eq!(manager.search(&ramen).unwrap().len(), 1);

    store.write(
        ACCOUNT,
        "INBOX",
        104,
        &text_message("Dan <dan@example.com>", "Zeppelin tour", DATE, "Boarding at noon."),
        0,
    );
    assert_eq!(manager.sync_updates(None).unwrap().added, 1);
    let zeppelin = SearchRequest::new("zeppelin", SearchScope::All);
    assert_eq!(manager.search(&zeppelin).unwrap().len(), 1);
}

#[test]
fn test_missing_mail_store_is_reported() {
    let store = MailStore::new();
    let mut settings = store.settings();
    settings.mail_root = store.root().join("does-not-exist");
    let manager = IndexManager::open(settings).unwrap();

    assert!(matches!(
        manager.build_index(None),
        Err(IndexError::MailStoreNotFound(_))
    ));
}

// ─── Attachments ────────────────────────────────────────────────────

#[test]
fn test_get_attachment_decodes_content() {
    let store = MailStore::new();
    store.write(
        ACCOUNT,
        "INBOX",
        42,
        &message_with_attachment("Invoice", DATE, "invoice.pdf", "SGVsbG8gUERG"),
        0,
    );
    let manager = store.manager();
    manager.build_index(None).unwrap();

    let attachment = manager
        .get_attachment(&Identity::new(ACCOUNT, "INBOX", 42), "invoice.pdf")
        .unwrap();
    assert_eq!(attachment.metadata.mime_type, "application/pdf");
    assert_eq!(attachment.content.as_deref(), Some(&b"Hello PDF"[..]));
    assert!(!attachment.truncated);
}

#[test]
fn test_get_attachment_of_partial_message_reads_external_file() {
    let store = MailStore::new();
    store.write_partial(
        ACCOUNT,
        "INBOX",
        43,
        &message_with_attachment("Scans", DATE, "scan.pdf", ""),
    );
    let external = store
        .messages_dir(ACCOUNT, "INBOX")
        .parent()
        .unwrap()
        .join("Attachments/43/2/scan.pdf");
    std::fs::create_dir_all(external.parent().unwrap()).unwrap();
    std::fs::write(&external, b"scanned pages").unwrap();

    let manager = store.manager();
    manager.build_index(None).unwrap();

    let attachment = manager
        .get_attachment(&Identity::new(ACCOUNT, "INBOX", 43), "scan.pdf")
        .unwrap();
    assert_eq!(attachment.metadata.size, 13);
    assert_eq!(attachment.content.as_deref(), Some(&b"scanned pages"[..]));
    assert!(!attachment.truncated);
}

#[test]
fn test_get_attachment_of_unknown_message() {
    let store = MailStore::new();
    let manager = store.manager();

    assert!(matches!(
        manager.get_attachment(&Identity::new(ACCOUNT, "INBOX", 1), "a.pdf"),
        Err(IndexError::NotFound(_))
    ));
}
