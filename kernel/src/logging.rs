use log::{self, Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

/// 日志输出的去处，由使用者在启动时提供（串口、SBI 控制台或宿主机的 stderr）
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);
}

struct SimpleLogger;

static LOGGER: SimpleLogger = SimpleLogger;

static CONSOLE: Once<&'static dyn Console> = Once::new();

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(console) = CONSOLE.get() else {
            return;
        };

        let color = match record.level() {
            Level::Error => 31, // 红色
            Level::Warn => 93,  // 黄色
            Level::Info => 34,  // 蓝色
            Level::Debug => 32, // 绿色
            Level::Trace => 36, // 青色
        };

        let line = alloc::format!(
            "\u{1B}[{}m[{:>5}] {}:{} {}\u{1B}[0m\n",
            color,
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args(),
        );
        console.write_str(&line);
    }

    fn flush(&self) {}
}

/// 安装日志后端，重复调用不会产生影响
pub fn init(console: &'static dyn Console) {
    CONSOLE.call_once(|| console);
    if log::set_logger(&LOGGER).is_err() {
        return;
    }

    log::set_max_level(level_from_env(option_env!("RUST_LOG")));
}

fn level_from_env(value: Option<&str>) -> LevelFilter {
    match value {
        Some(log_level) => match log_level {
            "ERROR" | "error" => LevelFilter::Error,
            "WARN" | "warn" => LevelFilter::Warn,
            "INFO" | "info" => LevelFilter::Info,
            "DEBUG" | "debug" => LevelFilter::Debug,
            "TRACE" | "trace" => LevelFilter::Trace,
            _ => LevelFilter::Off,
        },
        None => LevelFilter::Info,
    }
}
