use keel_core::Result;
use keel_core::events::Event;

/// Receives events from the bus.
///
/// Listeners run on the publishing thread and may be invoked concurrently by
/// independent publishers, so any shared state needs its own locking.
/// Handlers must not block on network I/O; start async work and report its
/// outcome as a new event instead.
pub trait EventListener: Send + Sync {
    fn handle_event(&self, event: &Event) -> Result<()>;

    /// Name used when recording failures.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Adapts a closure into a listener.
pub struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    fn handle_event(&self, event: &Event) -> Result<()> {
        (self.f)(event)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
