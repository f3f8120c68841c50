use std::path::Path;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

fn log_file_stem(now: OffsetDateTime) -> String {
    let stamp = now
        .format(format_description!("[day]_[month]_[year]_[hour]_[minute]"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("pepper_{}", stamp)
}

/// `pepper_<dd_mm_YYYY_HH_MM>.log`
pub fn log_file_name(now: OffsetDateTime) -> String {
    format!("{}.log", log_file_stem(now))
}

/// Local start time; UTC when the local offset cannot be determined.
fn start_time() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// One file per run, named after the start time. No rotation, so the name on
/// disk is exactly [`log_file_name`].
fn file_appender(log_dir: &Path, now: OffsetDateTime) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(log_file_stem(now))
        .filename_suffix("log")
        .build(log_dir)
}

/// Console logging always; with `debug` also a per-run file in `log_dir`.
/// The returned guard flushes the file writer and must outlive the program.
pub fn init_logging(debug: bool, log_dir: &Path) -> Option<WorkerGuard> {
    let console_level = if debug { LevelFilter::INFO } else { LevelFilter::WARN };
    let console = fmt::layer().with_filter(console_level);

    if !debug {
        tracing_subscriber::registry().with(console).init();
        return None;
    }

    match file_appender(log_dir, start_time()) {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            tracing_subscriber::registry().with(console).with(file).init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(console).init();
            warn!("Log file in {} unavailable, logging to console only: {}", log_dir.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use time::macros::datetime;

    #[test]
    fn log_file_is_named_after_start_time() {
        assert_eq!(
            log_file_name(datetime!(2024-03-05 14:07 UTC)),
            "pepper_05_03_2024_14_07.log"
        );
    }

    #[test]
    fn log_file_on_disk_has_the_run_name() {
        let dir = tempfile::tempdir().unwrap();
        let now = datetime!(2026-10-18 07:25 UTC);

        let mut appender = file_appender(dir.path(), now).unwrap();
        appender.write_all(b"started\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pepper_18_10_2026_07_25.log".to_string()]);
    }
}
