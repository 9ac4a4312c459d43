//! Logging initialization using `log` + `log4rs`: console on stderr plus an
//! optional rolling file appender.

use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy},
            RollingFileAppender,
        },
    },
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
    Config,
};
use std::path::PathBuf;

const CONSOLE_APPENDER: &str = "stderr";
const LOG_FILE_APPENDER: &str = "log_file";

const LOG_FILE_NAME: &str = "tideway.log";
const LOG_FILE_MAX_SIZE: u64 = 64 * 1024 * 1024;
const LOG_FILE_MAX_ROLLS: u32 = 8;

const LOG_LINE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{h({l})}] {t}: {m}{n}";

/// Initializes the global logger. Third-party crates stay at `Warn`; this
/// crate logs at `level`. Repeated calls are ignored.
pub fn init_logger(level: LevelFilter, log_dir: Option<&str>) {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_LINE_PATTERN)))
        .build();

    let mut config_builder = Config::builder().appender(Appender::builder().build(CONSOLE_APPENDER, Box::new(console)));
    let mut appender_names = vec![CONSOLE_APPENDER.to_string()];

    if let Some(dir) = log_dir.filter(|dir| !dir.trim().is_empty()) {
        let dir = dir.trim();
        let log_path = PathBuf::from(dir).join(LOG_FILE_NAME);
        let archive_pattern = PathBuf::from(dir).join(format!("{LOG_FILE_NAME}.{{}}.gz"));

        let roller_result = FixedWindowRoller::builder()
            .base(1)
            .build(archive_pattern.to_str().unwrap_or("tideway.log.{}.gz"), LOG_FILE_MAX_ROLLS);

        if let Ok(roller) = roller_result {
            let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(LOG_FILE_MAX_SIZE)), Box::new(roller));
            if let Ok(file_appender) = RollingFileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_LINE_PATTERN)))
                .build(log_path, Box::new(policy))
            {
                config_builder = config_builder.appender(Appender::builder().build(LOG_FILE_APPENDER, Box::new(file_appender)));
                appender_names.push(LOG_FILE_APPENDER.to_string());
            }
        }
    }

    config_builder = config_builder.logger(
        Logger::builder()
            .appenders(appender_names.clone())
            .additive(false)
            .build("tideway", level),
    );

    let root = Root::builder().appenders(appender_names).build(LevelFilter::Warn);
    if let Ok(config) = config_builder.build(root) {
        let _ = log4rs::init_config(config);
    }
}
