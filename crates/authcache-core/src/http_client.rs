use std::time::Duration;

use crate::config::AssetTuning;
use crate::error::CacheError;

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const POOL_IDLE: Duration = Duration::from_secs(90);

fn user_agent() -> String {
    format!("authcache/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with harmonized defaults. Apply per-call `.timeout(...)` as needed.
pub fn builder(connect_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(connect_timeout)
        .tcp_keepalive(TCP_KEEPALIVE)
        .pool_idle_timeout(POOL_IDLE)
}

/// Client for asset downloads. Request timeouts are applied per attempt.
pub fn asset_client(tuning: &AssetTuning) -> Result<reqwest::Client, CacheError> {
    Ok(builder(tuning.connect_timeout()).build()?)
}
