use std::time::Instant;

pub trait TimeSource: Send + Sync {
    // Monotonic instant, used for elapsed-time decisions
    fn now(&self) -> Instant;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
