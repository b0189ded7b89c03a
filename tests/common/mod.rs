//! Fixture mail store for integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use assert_fs::prelude::*;
use assert_fs::TempDir;

use mailindex::{IndexManager, IndexSettings};

pub const ACCOUNT: &str = "8F2C1E0A-ACC1";
pub const OTHER_ACCOUNT: &str = "77D0B3B2-ACC2";

const TRAILER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<plist version=\"1.0\">\n<dict>\n\t<key>flags</key>\n\t<integer>8590195713</integer>\n</dict>\n</plist>\n";

/// A temporary `V10`-style mail store plus a place for the index file.
pub struct MailStore {
    dir: TempDir,
}

impl MailStore {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        dir.child("Mail").create_dir_all().unwrap();
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.child("Mail").path().to_path_buf()
    }

    /// Index file, outside the watched root.
    pub fn db_path(&self) -> PathBuf {
        self.dir.child("index.db").path().to_path_buf()
    }

    pub fn settings(&self) -> IndexSettings {
        let mut settings = IndexSettings::new(self.db_path(), self.root());
        settings.debounce = Duration::from_millis(100);
        settings
    }

    pub fn manager(&self) -> IndexManager {
        IndexManager::open(self.settings()).unwrap()
    }

    /// `Messages` directory of a mailbox; nested names use `/`.
    pub fn messages_dir(&self, account: &str, mailbox: &str) -> PathBuf {
        let mut dir = self.root().join(account);
        for segment in mailbox.split('/') {
            dir.push(format!("{segment}.mbox"));
        }
        dir.join("Data").join("3").join("Messages")
    }

    pub fn path_of(&self, account: &str, mailbox: &str, id: i64) -> PathBuf {
        self.messages_dir(account, mailbox).join(format!("{id}.emlx"))
    }

    /// Write `mime` as `<id>.emlx`, aged `age_secs` seconds.
    pub fn write(&self, account: &str, mailbox: &str, id: i64, mime: &str, age_secs: u64) -> PathBuf {
        let path = self.path_of(account, mailbox, id);
        write_emlx(&path, mime, age_secs);
        path
    }

    /// Write `mime` as `<id>.partial.emlx`.
    pub fn write_partial(&self, account: &str, mailbox: &str, id: i64, mime: &str) -> PathBuf {
        let path = self
            .messages_dir(account, mailbox)
            .join(format!("{id}.partial.emlx"));
        write_emlx(&path, mime, 0);
        path
    }

    pub fn write_raw(&self, account: &str, mailbox: &str, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.messages_dir(account, mailbox).join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

pub fn write_emlx(path: &Path, mime: &str, age_secs: u64) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut data = format!("{}\n", mime.len()).into_bytes();
    data.extend_from_slice(mime.as_bytes());
    data.extend_from_slice(TRAILER.as_bytes());
    std::fs::write(path, data).unwrap();
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .unwrap();
}

/// Plain text message.
pub fn text_message(from: &str, subject: &str, date: &str, body: &str) -> String {
    format!(
        "From: {from}\r\nTo: me@example.com\r\nSubject: {subject}\r\nDate: {date}\r\n\
Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
    )
}

/// Message with one base64 attachment.
pub fn message_with_attachment(subject: &str, date: &str, filename: &str, base64: &str) -> String {
    format!(
        "From: Billing <billing@example.com>\r\nSubject: {subject}\r\nDate: {date}\r\n\
Content-Type: multipart/mixed; boundary=\"BOUNDARY\"\r\n\r\n\
--BOUNDARY\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nSee attached.\r\n\
--BOUNDARY\r\nContent-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"{filename}\"\r\n\
Content-Transfer-Encoding: base64\r\n\r\n{base64}\r\n\
--BOUNDARY--\r\n"
    )
}
