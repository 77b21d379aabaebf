pub mod telegram;

use async_trait::async_trait;

/// Where rendered notifications end up.
///
/// Delivery is fire-and-forget: implementations log their own failures and
/// never report them to the caller.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn deliver(&self, text: &str);
}
