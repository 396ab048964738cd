use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use once_cell::sync::OnceCell;

fn debug_enabled() -> bool {
    static FLAG: OnceCell<bool> = OnceCell::new();
    *FLAG.get_or_init(|| {
        std::env::var("THREADLOOM_DEBUG")
            .map(|val| {
                let trimmed = val.trim();
                !(trimmed.is_empty()
                    || trimmed.eq_ignore_ascii_case("0")
                    || trimmed.eq_ignore_ascii_case("false")
                    || trimmed.eq_ignore_ascii_case("no")
                    || trimmed.eq_ignore_ascii_case("off"))
            })
            .unwrap_or(false)
    })
}

fn debug_writer() -> Option<&'static Mutex<std::fs::File>> {
    static WRITER: OnceCell<Option<Mutex<std::fs::File>>> = OnceCell::new();
    WRITER
        .get_or_init(|| {
            std::env::var("THREADLOOM_DEBUG_LOG")
                .ok()
                .and_then(|path| {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map(Mutex::new)
                        .ok()
                })
        })
        .as_ref()
}

pub fn debug_log(message: impl AsRef<str>) {
    if !debug_enabled() {
        return;
    }
    if let Some(writer) = debug_writer() {
        if let Ok(mut file) = writer.lock() {
            let _ = writeln!(file, "{}", message.as_ref());
            return;
        }
    }
    eprintln!("{}", message.as_ref());
}
