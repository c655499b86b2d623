pub mod rate_limit;

pub use rate_limit::RateLimiter;

use crate::error::GatewayError;
use crate::routing::CompiledRoute;

/// Request-phase checks that run after route match and before instance
/// selection. Order matters: rejecting early saves upstream capacity.
///
/// 1. RateLimit
pub(crate) async fn on_request(
    limiter: &RateLimiter,
    route: &CompiledRoute,
) -> Result<(), GatewayError> {
    rate_limit::rate_limit_on_request(limiter, route).await?;
    Ok(())
}
