//! Mail store access: directory layout and the fast inventory scan.

pub mod layout;
pub mod scanner;

pub use layout::find_mail_directory;
pub use scanner::{scan, Scan};
