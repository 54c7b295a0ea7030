use async_trait::async_trait;
use tracing::warn;

/// DNS-SD service type under which AppleMIDI sessions are advertised.
pub const SERVICE_TYPE: &str = "_apple-midi._udp";

/// Collaborator interface for service discovery (mDNS/Bonjour). The crate
///  consumes this but does not implement it - a session is fully operable
///  without any advertisement.
#[async_trait]
pub trait ServiceAdvertiser: Send + Sync {
    /// Register the session under a human-readable name. The returned handle
    ///  keeps the advertisement alive until withdrawn.
    async fn advertise(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt_records: &[(String, String)],
    ) -> anyhow::Result<Box<dyn AdvertisedService>>;
}

#[async_trait]
pub trait AdvertisedService: Send + Sync {
    async fn withdraw(self: Box<Self>);
}

/// Advertise a session, treating failure as a non-fatal condition: the
///  session keeps running either way.
pub async fn advertise_session(
    advertiser: &dyn ServiceAdvertiser,
    name: &str,
    port: u16,
) -> Option<Box<dyn AdvertisedService>> {
    match advertiser.advertise(name, SERVICE_TYPE, port, &[]).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("advertising session [{}] on port {} failed: {}", name, port, e);
            None
        }
    }
}
