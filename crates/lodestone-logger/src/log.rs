use crate::severity::LogSeverity;
use crate::time::now;
use once_cell::sync::OnceCell;

static MIN_SEVERITY: OnceCell<LogSeverity> = OnceCell::new();

/// Sets the process-wide minimum severity. May only be set once; later
/// calls are ignored. Defaults to Info when never set.
pub fn set_min_severity(severity: LogSeverity) {
    let _ = MIN_SEVERITY.set(severity);
}

pub fn log(msg: String, log_severity: LogSeverity) {
    let min = *MIN_SEVERITY.get_or_init(|| LogSeverity::Info);
    if log_severity < min {
        return;
    }
    println!("[{}] {} {}", log_severity, now(), msg);
}
