use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::info;

/// Logs `task` start and, on drop, its wall-clock time as `elapsed_ms`.
pub struct Timer {
    task: &'static str,
    start: Instant,
}

impl Timer {
    pub fn start(task: &'static str) -> Self {
        info!(task, "Started");
        Self {
            task,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(task = self.task, elapsed_ms = self.elapsed().as_millis() as u64, "Finished");
    }
}

/// Group digits with `.` the way es-AR writes counts: `12345` → `12.345`.
pub fn fmt_number(n: impl Display) -> String {
    let s = n.to_string();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s.as_str()),
    };
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("{}{}", sign, grouped)
}
