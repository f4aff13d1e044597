//! Command output as it reaches the log

mod common;

use common::{executor, ScriptedShell};
use log::{LevelFilter, Log, Metadata, Record};
use std::sync::Mutex;

struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.0.lock().unwrap().push(record.args().to_string());
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

#[test]
fn test_completing_line_is_logged_once() {
    log::set_logger(&CAPTURE).unwrap();
    log::set_max_level(LevelFilter::Info);

    let shell = ScriptedShell::new("/home/ci");
    let mut exec = executor(&shell);
    CAPTURE.0.lock().unwrap().clear();

    // Prompt on a terminated line, then on the unterminated one
    exec.run("eolprompt").unwrap();
    exec.run("say hello").unwrap();

    let logged = CAPTURE.0.lock().unwrap().clone();
    let prompts = logged.iter().filter(|line| line.starts_with("fake ")).count();
    assert_eq!(prompts, 2, "{:?}", logged);
    assert_eq!(logged.iter().filter(|line| *line == "hello").count(), 1);
    assert_eq!(logged.iter().filter(|line| *line == "eolprompt").count(), 1);
}
