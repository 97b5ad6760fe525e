use std::sync::Arc;

/// Direction of a readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Target of a readiness notification.
///
/// Implementors embed their own dispatch state; the `Arc` passed by value is
/// the caller's reference, released when the handler returns. This lets a
/// notification be queued without any per-event allocation: cloning the `Arc`
/// is the only cost.
pub trait Notify: Send + Sync {
    fn ready(self: Arc<Self>, dir: Direction);
}

/// An event queued on a task.
pub struct Event {
    kind: EventKind,
}

enum EventKind {
    Call(Box<dyn FnOnce() + Send + 'static>),
    Ready {
        target: Arc<dyn Notify>,
        dir: Direction,
    },
}

impl Event {
    /// A one-shot callback event.
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Event {
            kind: EventKind::Call(Box::new(f)),
        }
    }

    /// A readiness notification for `target`.
    pub fn ready(target: Arc<dyn Notify>, dir: Direction) -> Self {
        Event {
            kind: EventKind::Ready { target, dir },
        }
    }

    pub(crate) fn run(self) {
        match self.kind {
            EventKind::Call(f) => f(),
            EventKind::Ready { target, dir } => target.ready(dir),
        }
    }
}
