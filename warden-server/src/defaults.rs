use std::time::Duration;

pub const CA_VALIDITY_DAYS: i64 = 3650;
pub const DEV_LEAF_VALIDITY: Duration = Duration::from_secs(8 * 60 * 60);
/// Dev leaves are regenerated this long before they actually expire.
pub const DEV_LEAF_RENEW_MARGIN: Duration = Duration::from_secs(5 * 60);

pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on bytes buffered while waiting for a full ClientHello.
pub const CLIENT_HELLO_CAPTURE_LIMIT: usize = 64 * 1024;

pub const ACME_CALL_TIMEOUT: Duration = Duration::from_secs(5);
pub const ACME_ORDER_TIMEOUT: Duration = Duration::from_secs(60);
pub const ACME_RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const ACME_RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
