use async_trait::async_trait;

use crate::error::Result;
use crate::msg::{Request, Response};

/// Carries one request to a remote member and returns its answer.
///
/// Implementations open (or borrow) a connection per call. Dropping the
/// returned future must abandon the call; [`crate::peer::Peer`] relies on
/// that to enforce its deadline.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, to: &str, request: Request) -> Result<Response>;
}
