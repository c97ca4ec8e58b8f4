use std::time::Duration;
use trait_variant::make;

/// Timer capability used between retry attempts
#[make(Send)]
pub trait Delay {
    async fn sleep(&self, duration: Duration);
}

/// Delay backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioDelay;

impl Delay for TokioDelay {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
