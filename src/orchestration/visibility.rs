use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Foreground,
    Background,
}

/// Host signal telling the scheduler whether the application is on screen.
pub trait VisibilitySource: Send + Sync {
    fn current(&self) -> Visibility;

    /// Receiver that observes every later visibility change.
    fn changes(&self) -> watch::Receiver<Visibility>;

    fn is_foreground(&self) -> bool {
        self.current() == Visibility::Foreground
    }
}

/// Visibility driven by explicit calls, for hosts that push their own
/// focus/minimize events and for tests.
#[derive(Debug)]
pub struct ManualVisibility {
    tx: watch::Sender<Visibility>,
}

impl Default for ManualVisibility {
    fn default() -> Self {
        Self::new(Visibility::Foreground)
    }
}

impl ManualVisibility {
    #[must_use]
    pub fn new(initial: Visibility) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Returns true when the visibility actually changed.
    pub fn set(&self, visibility: Visibility) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == visibility {
                false
            } else {
                *current = visibility;
                true
            }
        });
        if changed {
            debug!("👁️  Visibility changed to {:?}", visibility);
        }
        changed
    }

    pub fn foreground(&self) -> bool {
        self.set(Visibility::Foreground)
    }

    pub fn background(&self) -> bool {
        self.set(Visibility::Background)
    }
}

impl VisibilitySource for ManualVisibility {
    fn current(&self) -> Visibility {
        *self.tx.borrow()
    }

    fn changes(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}
