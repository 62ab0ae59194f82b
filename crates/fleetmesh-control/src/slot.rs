//! Atomically swappable capability holders
//!
//! Readers take a snapshot with [`CapabilitySlot::load`] and keep using it
//! for the rest of their request, even if a resync swaps the slot midway.

use arc_swap::ArcSwap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

const RETIRE_POLL: Duration = Duration::from_millis(250);

pub struct CapabilitySlot<T: ?Sized> {
    name: &'static str,
    current: ArcSwap<Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> CapabilitySlot<T> {
    pub fn new(name: &'static str, initial: Arc<T>) -> Self {
        Self {
            name,
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Current implementation; never blocks
    pub fn load(&self) -> Arc<T> {
        let guard = self.current.load();
        Arc::clone(&**guard)
    }

    /// Publish `next` and hand back the implementation it replaced
    pub fn swap(&self, next: Arc<T>) -> Arc<T> {
        let previous = self.current.swap(Arc::new(next));
        debug!(slot = self.name, "Capability swapped");
        Arc::clone(&*previous)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Close a replaced implementation once nobody else holds it, or after
/// `grace` at the latest
pub fn retire<T, F, Fut>(previous: Arc<T>, grace: Duration, close: F)
where
    T: ?Sized + Send + Sync + 'static,
    F: FnOnce(Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let deadline = Instant::now() + grace;
        while Arc::strong_count(&previous) > 1 && Instant::now() < deadline {
            sleep(RETIRE_POLL).await;
        }
        close(previous).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    struct Bonjour;
    impl Greeter for Bonjour {
        fn greet(&self) -> &'static str {
            "bonjour"
        }
    }

    #[test]
    fn test_readers_keep_their_snapshot_across_swaps() {
        let slot: CapabilitySlot<dyn Greeter> = CapabilitySlot::new("greeter", Arc::new(Hello));

        let snapshot = slot.load();
        let previous = slot.swap(Arc::new(Bonjour));

        assert_eq!(snapshot.greet(), "hello");
        assert_eq!(previous.greet(), "hello");
        assert_eq!(slot.load().greet(), "bonjour");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_waits_for_holders_until_grace() {
        let closed = Arc::new(AtomicBool::new(false));
        let previous: Arc<dyn Greeter> = Arc::new(Hello);
        let holder = Arc::clone(&previous);

        let flag = Arc::clone(&closed);
        retire(previous, Duration::from_secs(30), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!closed.load(Ordering::SeqCst));

        drop(holder);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_gives_up_after_grace() {
        let closed = Arc::new(AtomicBool::new(false));
        let previous: Arc<dyn Greeter> = Arc::new(Hello);
        let _holder = Arc::clone(&previous);

        let flag = Arc::clone(&closed);
        retire(previous, Duration::from_secs(30), move |_| async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(closed.load(Ordering::SeqCst));
    }
}
