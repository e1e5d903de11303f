mod scanner;

pub use scanner::{RecoveryReport, RecoveryScanner, RecoveryTarget, DEFAULT_GRACE_WINDOW};
