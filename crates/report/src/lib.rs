pub mod vault;

pub use vault::{build_report, VaultPaths};
