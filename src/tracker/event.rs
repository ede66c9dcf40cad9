//! Announce events.

/// What the client tells the tracker about its own lifecycle. `None` is the
/// periodic progress report and is omitted from the query string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Event {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::None => "",
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}
