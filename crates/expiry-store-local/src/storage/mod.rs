mod durable;
mod read;

pub use durable::{BackupInfo, BackupRetention, DurableWriter, StagedWrite};
pub use read::{digest, read_document};
