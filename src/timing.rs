/// Millisecond tick source.
pub trait TickSource {
    /// Monotonic milliseconds, allowed to wrap around.
    fn now_millis(&self) -> u32;

    /// Called on every iteration of a busy wait, a place to yield on a multitasking host.
    fn relax(&self) {}
}

/// Point in time a wait gives up at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub fn start<Ticks: TickSource>(ticks: &Ticks, timeout_ms: u32) -> Self {
        Deadline {
            start: ticks.now_millis(),
            timeout_ms,
        }
    }

    pub fn expired<Ticks: TickSource>(&self, ticks: &Ticks) -> bool {
        ticks.now_millis().wrapping_sub(self.start) >= self.timeout_ms
    }

    /// Runs `attempt` until it yields a value or the deadline passes, at least once.
    pub fn poll<Ticks, T, E, F>(&self, ticks: &Ticks, mut attempt: F) -> Result<Option<T>, E>
    where
        Ticks: TickSource,
        F: FnMut() -> Result<Option<T>, E>,
    {
        loop {
            if let Some(value) = attempt()? {
                return Ok(Some(value));
            }

            if self.expired(ticks) {
                return Ok(None);
            }

            ticks.relax();
        }
    }
}

/// [`Deadline::poll`] with a deadline starting now.
pub(crate) fn poll_until<Ticks, T, E, F>(
    ticks: &Ticks,
    timeout_ms: u32,
    attempt: F,
) -> Result<Option<T>, E>
where
    Ticks: TickSource,
    F: FnMut() -> Result<Option<T>, E>,
{
    Deadline::start(ticks, timeout_ms).poll(ticks, attempt)
}

/// Busy wait.
pub(crate) fn pause<Ticks: TickSource>(ticks: &Ticks, ms: u32) {
    let deadline = Deadline::start(ticks, ms);

    while !deadline.expired(ticks) {
        ticks.relax();
    }
}
