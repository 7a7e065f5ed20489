use async_trait::async_trait;

use crate::errors::SubsystemError;

/// A service whose lifetime is scoped to exactly one widget mount.
///
/// Both calls return a completion even when the work is synchronous, so the
/// orchestrator sequences every subsystem the same way. `reset` must be safe on a
/// subsystem that was never initialized or was already reset.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;
    async fn init(&self) -> Result<(), SubsystemError>;
    async fn reset(&self) -> Result<(), SubsystemError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        active: AtomicU32,
    }

    #[async_trait]
    impl Subsystem for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        async fn init(&self) -> Result<(), SubsystemError> {
            self.active.store(1, Ordering::SeqCst);
            Ok(())
        }
        async fn reset(&self) -> Result<(), SubsystemError> {
            self.active.store(0, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn usable_as_trait_object() {
        let subsystems: Vec<Box<dyn Subsystem>> = vec![Box::new(Counter {
            active: AtomicU32::new(0),
        })];
        for s in &subsystems {
            s.init().await.unwrap();
            s.reset().await.unwrap();
            s.reset().await.unwrap();
        }
        assert_eq!(subsystems[0].name(), "counter");
    }
}
